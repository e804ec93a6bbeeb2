//! Remote collaborator seams for covtally: freshness probe, dataset fetch,
//! and the tolerant line parser.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use covtally_core::CountyRow;
use covtally_storage::{FetchError, HttpFetcher};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "covtally-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("remote commit metadata: {0}")]
    Metadata(String),
    #[error("dataset body was not valid utf-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Last-modified time of the upstream dataset, per the remote's
/// version-control metadata. Failures are fatal for the run.
#[async_trait]
pub trait FreshnessProbe: Send + Sync {
    async fn latest_remote_update(&self) -> Result<DateTime<Utc>, SourceError>;
}

/// Raw newline-delimited dataset fetch.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn fetch_lines(&self) -> Result<Vec<String>, SourceError>;
}

/// Repository coordinates for the freshness probe.
#[derive(Debug, Clone)]
pub struct GitHubRepoConfig {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub tracked_path: String,
    pub token: Option<String>,
}

/// Asks the GitHub commits API for the most recent commit touching the
/// tracked dataset path on the configured branch.
pub struct GitHubFreshnessProbe {
    fetcher: HttpFetcher,
    api_base: String,
    config: GitHubRepoConfig,
}

impl GitHubFreshnessProbe {
    pub fn new(fetcher: HttpFetcher, config: GitHubRepoConfig) -> Self {
        Self {
            fetcher,
            api_base: "https://api.github.com".to_string(),
            config,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl FreshnessProbe for GitHubFreshnessProbe {
    async fn latest_remote_update(&self) -> Result<DateTime<Utc>, SourceError> {
        let url = format!(
            "{}/repos/{}/{}/commits",
            self.api_base, self.config.owner, self.config.repo
        );
        let mut request = self
            .fetcher
            .client()
            .get(&url)
            .query(&[
                ("path", self.config.tracked_path.as_str()),
                ("sha", self.config.branch.as_str()),
                ("per_page", "1"),
            ])
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(FetchError::Request)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            }
            .into());
        }

        let body = resp.bytes().await.map_err(FetchError::Request)?;
        let latest = latest_commit_timestamp(&body)?;
        debug!(%latest, path = %self.config.tracked_path, "remote freshness check");
        Ok(latest)
    }
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    author: CommitSignature,
}

#[derive(Debug, Deserialize)]
struct CommitSignature {
    date: DateTime<Utc>,
}

/// Author date of the first entry in a GitHub commit-list payload.
pub fn latest_commit_timestamp(body: &[u8]) -> Result<DateTime<Utc>, SourceError> {
    let entries: Vec<CommitEntry> = serde_json::from_slice(body)
        .map_err(|err| SourceError::Metadata(format!("parsing commit list: {err}")))?;
    entries
        .first()
        .map(|entry| entry.commit.author.date)
        .ok_or_else(|| SourceError::Metadata("no commits touch the tracked path".to_string()))
}

/// HTTP GET of the raw comma-separated dataset. The downloaded body can
/// also be kept on disk next to the cache for later inspection.
pub struct HttpDatasetSource {
    fetcher: HttpFetcher,
    url: String,
    raw_snapshot_path: Option<PathBuf>,
}

impl HttpDatasetSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
            raw_snapshot_path: None,
        }
    }

    pub fn with_raw_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.raw_snapshot_path = Some(path.into());
        self
    }
}

#[async_trait]
impl DatasetSource for HttpDatasetSource {
    async fn fetch_lines(&self) -> Result<Vec<String>, SourceError> {
        let resp = self.fetcher.fetch_bytes(&self.url).await?;

        if let Some(path) = &self.raw_snapshot_path {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
            fs::write(path, &resp.body)
                .await
                .with_context(|| format!("writing raw snapshot {}", path.display()))?;
        }

        let text = String::from_utf8(resp.body)?;
        Ok(text.lines().map(str::to_string).collect())
    }
}

/// Parse result: the rows that survived plus a count of the ones that
/// did not. The count is diagnostic only.
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    pub rows: Vec<CountyRow>,
    pub skipped: usize,
}

/// Parse every line independently; a malformed line (header included) is
/// skipped and counted, never fatal.
pub fn parse_lines(lines: &[String]) -> ParsedBatch {
    let mut batch = ParsedBatch {
        rows: Vec::with_capacity(lines.len()),
        ..Default::default()
    };
    for line in lines {
        match parse_line(line) {
            Some(row) => batch.rows.push(row),
            None => batch.skipped += 1,
        }
    }
    debug!(
        parsed = batch.rows.len(),
        skipped = batch.skipped,
        "parsed dataset lines"
    );
    batch
}

/// Fixed column order: date, county, state, fips, cases, deaths. Date and
/// both counts must parse; county and fips are taken verbatim; state
/// falls back to empty rather than failing the row.
fn parse_line(line: &str) -> Option<CountyRow> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 6 {
        return None;
    }

    let date = NaiveDate::parse_from_str(fields[0].trim(), "%Y-%m-%d").ok()?;
    let county = fields[1].to_string();
    let state = fields.get(2).map(|s| s.to_string()).unwrap_or_default();
    let fips = fields[3].to_string();
    let cases = fields[4].trim().parse::<u32>().ok()?;
    let deaths = fields[5].trim().parse::<u32>().ok()?;

    Some(CountyRow::new(
        date,
        county,
        state,
        fips,
        Some(cases),
        Some(deaths),
    ))
}
