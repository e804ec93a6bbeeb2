//! Ingest pipeline and county query service for covtally.
//!
//! One run either refreshes from the remote source (fetch, tolerant parse,
//! percent-change enrichment, cache + history persistence) or reuses the
//! locally cached enriched set, then hands the dataset to the query
//! service as an immutable snapshot.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use covtally_core::{enrich, CountyRow};
use covtally_sources::{
    parse_lines, DatasetSource, FreshnessProbe, GitHubFreshnessProbe, GitHubRepoConfig,
    HttpDatasetSource,
};
use covtally_storage::{
    CsvRowCache, HistoryStore, HttpClientConfig, HttpFetcher, RowCache, RunHistory,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "covtally-pipeline";

const RAW_SNAPSHOT_FILE: &str = "us-counties-raw.txt";
const CACHE_FILE: &str = "us-counties-enriched.csv";
const HISTORY_FILE: &str = "run_history.json";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub dataset_url: String,
    pub github: GitHubRepoConfig,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("COVTALLY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            dataset_url: std::env::var("COVTALLY_DATASET_URL").unwrap_or_else(|_| {
                "https://raw.githubusercontent.com/nytimes/covid-19-data/master/us-counties.csv"
                    .to_string()
            }),
            github: GitHubRepoConfig {
                owner: std::env::var("COVTALLY_REPO_OWNER")
                    .unwrap_or_else(|_| "nytimes".to_string()),
                repo: std::env::var("COVTALLY_REPO_NAME")
                    .unwrap_or_else(|_| "covid-19-data".to_string()),
                branch: std::env::var("COVTALLY_REPO_BRANCH")
                    .unwrap_or_else(|_| "master".to_string()),
                tracked_path: std::env::var("COVTALLY_REPO_PATH")
                    .unwrap_or_else(|_| "us-counties.csv".to_string()),
                token: std::env::var("GITHUB_TOKEN").ok(),
            },
            user_agent: std::env::var("COVTALLY_USER_AGENT")
                .unwrap_or_else(|_| "covtally/0.1".to_string()),
            http_timeout_secs: std::env::var("COVTALLY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Diagnostics for one pipeline run. Skipped-row counts do not affect
/// control flow.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub refreshed: bool,
    pub parsed_rows: usize,
    pub skipped_rows: usize,
    pub row_count: usize,
    /// Whether the post-refresh history write succeeded; `None` when the
    /// run reused the cache and wrote no history at all.
    pub history_persisted: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub rows: Vec<CountyRow>,
    pub summary: RunSummary,
}

pub struct IngestPipeline {
    history: HistoryStore,
    cache: Box<dyn RowCache>,
    probe: Box<dyn FreshnessProbe>,
    source: Box<dyn DatasetSource>,
}

impl IngestPipeline {
    pub fn new(
        history: HistoryStore,
        cache: Box<dyn RowCache>,
        probe: Box<dyn FreshnessProbe>,
        source: Box<dyn DatasetSource>,
    ) -> Self {
        Self {
            history,
            cache,
            probe,
            source,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let probe = GitHubFreshnessProbe::new(fetcher.clone(), config.github.clone());
        let source = HttpDatasetSource::new(fetcher, &config.dataset_url)
            .with_raw_snapshot(config.data_dir.join(RAW_SNAPSHOT_FILE));

        Ok(Self::new(
            HistoryStore::new(config.data_dir.join(HISTORY_FILE)),
            Box::new(CsvRowCache::new(config.data_dir.join(CACHE_FILE))),
            Box::new(probe),
            Box::new(source),
        ))
    }

    /// Refresh from the remote source or reuse the cache.
    ///
    /// The decision compares the remote's last commit time against the
    /// local `last_run_at` clock reading, not against the previously
    /// captured remote version. That baseline is deliberate and load
    /// bearing: changing it alters refresh frequency.
    ///
    /// A cache that turns out to be missing or undecodable re-enters the
    /// decision with the force flag set instead of failing the run.
    pub async fn run(&self, force_pull: bool) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let mut force = force_pull;

        loop {
            let (history, found) = self.history.load().await?;
            if !found {
                debug!("no prior run history; stale default in effect");
            }
            let remote_latest = self
                .probe
                .latest_remote_update()
                .await
                .context("checking remote dataset freshness")?;

            if force || remote_latest > history.last_run_at {
                return self.refresh(history, remote_latest, started_at).await;
            }

            match self.cache.load().await {
                Ok(rows) => {
                    info!(rows = rows.len(), "reusing cached dataset");
                    let summary = RunSummary {
                        started_at,
                        finished_at: Utc::now(),
                        refreshed: false,
                        parsed_rows: 0,
                        skipped_rows: 0,
                        row_count: rows.len(),
                        history_persisted: None,
                    };
                    return Ok(RunOutcome { rows, summary });
                }
                Err(err) => {
                    warn!(error = %err, "cached dataset unavailable, forcing refresh");
                    force = true;
                }
            }
        }
    }

    async fn refresh(
        &self,
        mut history: RunHistory,
        remote_latest: DateTime<Utc>,
        started_at: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        let lines = self
            .source
            .fetch_lines()
            .await
            .context("fetching remote dataset")?;
        let batch = parse_lines(&lines);
        let parsed_rows = batch.rows.len();
        let skipped_rows = batch.skipped;

        let rows = enrich(batch.rows);
        self.cache
            .save(&rows)
            .await
            .context("writing dataset cache")?;

        history.remote_version_at = remote_latest;
        history.last_run_at = Utc::now();
        let history_persisted = match self.history.save(&history).await {
            Ok(()) => Some(true),
            Err(err) => {
                // The enriched data is still valid for this run.
                error!(error = %err, "failed to persist run history");
                Some(false)
            }
        };

        info!(
            rows = rows.len(),
            skipped = skipped_rows,
            %remote_latest,
            "refreshed dataset from remote"
        );

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            refreshed: true,
            parsed_rows,
            skipped_rows,
            row_count: rows.len(),
            history_persisted,
        };
        Ok(RunOutcome { rows, summary })
    }
}

/// Runs the pipeline once and keeps the dataset as an immutable snapshot
/// for county lookups.
pub struct CountyQueryService {
    rows: Vec<CountyRow>,
    summary: RunSummary,
}

impl CountyQueryService {
    pub async fn load(pipeline: &IngestPipeline) -> Result<Self> {
        let outcome = pipeline.run(false).await?;
        Ok(Self {
            rows: outcome.rows,
            summary: outcome.summary,
        })
    }

    pub fn rows(&self) -> &[CountyRow] {
        &self.rows
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Case-insensitive exact match on state and county, folded with
    /// `to_lowercase` so county names like "Doña Ana" match regardless of
    /// query casing. Rows come back in dataset order, date-ascending
    /// within the group. No match is an empty result, not an error.
    pub fn get_by_county(&self, state: &str, county: &str) -> Vec<&CountyRow> {
        let state = state.to_lowercase();
        let county = county.to_lowercase();
        self.rows
            .iter()
            .filter(|row| {
                row.state.to_lowercase() == state && row.county.to_lowercase() == county
            })
            .collect()
    }
}
