//! Run-history store, enriched-row cache, and HTTP fetch plumbing for covtally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covtally_core::CountyRow;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const CRATE_NAME: &str = "covtally-storage";

/// Overwrite `path` through a temp file in the same directory so a crash
/// mid-write never clobbers the previous valid contents.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let temp_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err)
                .with_context(|| format!("replacing {} atomically", path.display()))
        }
    }
}

/// When this system last successfully fetched, and the remote dataset's
/// last-modified time as of that fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistory {
    pub last_run_at: DateTime<Utc>,
    pub remote_version_at: DateTime<Utc>,
}

impl RunHistory {
    /// Default for a first run: both timestamps a day in the past, so any
    /// recent remote change looks newer than the last run.
    pub fn stale() -> Self {
        let then = Utc::now() - chrono::Duration::hours(24);
        Self {
            last_run_at: then,
            remote_version_at: then,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted history and whether one was found. A missing
    /// file yields the stale default rather than an error.
    pub async fn load(&self) -> anyhow::Result<(RunHistory, bool)> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no run history found, using stale default");
                return Ok((RunHistory::stale(), false));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading run history {}", self.path.display()))
            }
        };

        let history: RunHistory = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing run history {}", self.path.display()))?;
        Ok((history, true))
    }

    pub async fn save(&self, history: &RunHistory) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(history).context("serializing run history")?;
        write_atomic(&self.path, &bytes).await
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cached dataset at {path}")]
    Missing { path: PathBuf },
    #[error("reading cached dataset {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding cached dataset {path}: {source}")]
    Codec {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Wholesale load/store of the enriched row set.
#[async_trait]
pub trait RowCache: Send + Sync {
    async fn load(&self) -> Result<Vec<CountyRow>, CacheError>;
    async fn save(&self, rows: &[CountyRow]) -> Result<(), CacheError>;
}

/// CSV file cache; column order follows [`CountyRow`] field order, one
/// header line, overwritten in full on every refresh.
#[derive(Debug, Clone)]
pub struct CsvRowCache {
    path: PathBuf,
}

impl CsvRowCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RowCache for CsvRowCache {
    async fn load(&self) -> Result<Vec<CountyRow>, CacheError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::Missing {
                    path: self.path.clone(),
                })
            }
            Err(err) => {
                return Err(CacheError::Io {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let mut rows = Vec::new();
        for record in reader.deserialize::<CountyRow>() {
            rows.push(record.map_err(|err| CacheError::Codec {
                path: self.path.clone(),
                source: err,
            })?);
        }
        debug!(rows = rows.len(), path = %self.path.display(), "loaded cached dataset");
        Ok(rows)
    }

    async fn save(&self, rows: &[CountyRow]) -> Result<(), CacheError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in rows {
            writer.serialize(row).map_err(|err| CacheError::Codec {
                path: self.path.clone(),
                source: err,
            })?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| CacheError::Other(anyhow::anyhow!("finalizing csv buffer: {err}")))?;
        write_atomic(&self.path, &bytes).await?;
        debug!(rows = rows.len(), path = %self.path.display(), "wrote cached dataset");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin GET wrapper. One attempt per call; a fetch failure is fatal for
/// the run, never retried here.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
