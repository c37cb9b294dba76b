//! Dataset CSV I/O, raw response archive and the retrying JSON HTTP client.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use brec_core::{
    BrandRecord, Dataset, DateAdded, ReviewFlag, VerificationStatus, BRAND_COLUMN,
    DATE_ADDED_COLUMN, DEPARTMENT_COLUMN, HOLDING_COLUMN, PIPELINE_COLUMNS, REVIEW_COLUMN,
    SECTOR_COLUMN, STATUS_COLUMN,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "brec-storage";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct ColumnLayout {
    holding: usize,
    brand: usize,
    date_added: Option<usize>,
    sector: Option<usize>,
    department: Option<usize>,
    status: Option<usize>,
    review: Option<usize>,
    extra: Vec<usize>,
}

impl ColumnLayout {
    fn from_headers(headers: &[String]) -> Result<Self, DatasetError> {
        let position = |name: &str| headers.iter().position(|h| h == name);
        let holding = position(HOLDING_COLUMN).ok_or(DatasetError::MissingColumn(HOLDING_COLUMN))?;
        let brand = position(BRAND_COLUMN).ok_or(DatasetError::MissingColumn(BRAND_COLUMN))?;
        let extra = (0..headers.len())
            .filter(|&i| {
                let name = headers[i].as_str();
                name != HOLDING_COLUMN && name != BRAND_COLUMN && !PIPELINE_COLUMNS.contains(&name)
            })
            .collect();
        Ok(Self {
            holding,
            brand,
            date_added: position(DATE_ADDED_COLUMN),
            sector: position(SECTOR_COLUMN),
            department: position(DEPARTMENT_COLUMN),
            status: position(STATUS_COLUMN),
            review: position(REVIEW_COLUMN),
            extra,
        })
    }
}

/// Read a holdings CSV. Pipeline columns are optional and start empty when absent;
/// every other column is carried through untouched, and so are rows missing a holding
/// or a brand.
pub fn read_dataset_from<R: Read>(reader: R) -> Result<Dataset, DatasetError> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = csv
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    let layout = ColumnLayout::from_headers(&headers)?;
    let extra_columns = layout.extra.iter().map(|&i| headers[i].clone()).collect();

    let mut records = Vec::new();
    for (idx, row) in csv.records().enumerate() {
        let row = row?;
        let cell = |column: Option<usize>| column.and_then(|i| row.get(i)).unwrap_or("").trim();
        let holding = cell(Some(layout.holding));
        let brand = cell(Some(layout.brand));
        if holding.is_empty() || brand.is_empty() {
            warn!(row = idx + 2, "row without holding or brand is kept but not reconciled");
        }

        let date_added = DateAdded::from_cell(cell(layout.date_added));
        if let Some(DateAdded::Raw(text)) = &date_added {
            warn!(row = idx + 2, value = %text, "date not in YYYY-MM-DD form, kept as text");
        }

        records.push(BrandRecord {
            holding: holding.to_string(),
            brand: brand.to_string(),
            verification: VerificationStatus::from_label(cell(layout.status)),
            review: ReviewFlag::from_label(cell(layout.review)),
            date_added,
            sector: cell(layout.sector).to_string(),
            department: cell(layout.department).to_string(),
            extra: layout
                .extra
                .iter()
                .map(|&i| row.get(i).unwrap_or("").to_string())
                .collect(),
        });
    }

    Ok(Dataset::new(extra_columns, records).with_column_order(headers))
}

pub fn write_dataset_to<W: Write>(writer: W, dataset: &Dataset) -> Result<(), DatasetError> {
    let mut csv = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(writer);

    let columns = dataset.output_columns();
    csv.write_record(&columns)?;

    for record in &dataset.records {
        let date = record
            .date_added
            .as_ref()
            .map(DateAdded::render)
            .unwrap_or_default();
        // Extra values are stored in header order, so they are consumed in sequence.
        let mut extras = record.extra.iter().map(String::as_str);
        let row: Vec<&str> = columns
            .iter()
            .map(|&column| match column {
                HOLDING_COLUMN => record.holding.as_str(),
                BRAND_COLUMN => record.brand.as_str(),
                DATE_ADDED_COLUMN => date.as_str(),
                SECTOR_COLUMN => record.sector.as_str(),
                DEPARTMENT_COLUMN => record.department.as_str(),
                STATUS_COLUMN => record.verification.label(),
                REVIEW_COLUMN => record.review.label(),
                _ => extras.next().unwrap_or(""),
            })
            .collect();
        csv.write_record(&row)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn read_dataset(path: impl AsRef<Path>) -> anyhow::Result<Dataset> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening dataset {}", path.display()))?;
    read_dataset_from(file).with_context(|| format!("reading dataset {}", path.display()))
}

/// Write through a temp file in the destination directory, then rename over the target.
pub fn write_dataset(path: impl AsRef<Path>, dataset: &Dataset) -> anyhow::Result<()> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.csv.tmp", Uuid::new_v4()));
    let written = File::create(&temp_path)
        .map_err(DatasetError::from)
        .and_then(|file| write_dataset_to(BufWriter::new(file), dataset));
    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err).with_context(|| format!("writing dataset {}", temp_path.display()));
    }

    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err)
            .with_context(|| format!("renaming {} -> {}", temp_path.display(), path.display()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArchivedResponse {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed store for raw collaborator responses.
#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        &self,
        captured_at: DateTime<Utc>,
        stage: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(captured_at.format("%Y%m%d_%H%M%S").to_string())
            .join(stage)
            .join(format!("{content_hash}.txt"))
    }

    pub async fn store(
        &self,
        captured_at: DateTime<Utc>,
        stage: &str,
        text: &str,
    ) -> anyhow::Result<ArchivedResponse> {
        let bytes = text.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path_for(captured_at, stage, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let archived = |deduplicated| ArchivedResponse {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    return Ok(archived(true));
                }
                Err(err).with_context(|| {
                    format!(
                        "renaming archived response {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Rate limiting and server-side failures are worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// JSON-over-HTTP client shared by the evidence sources. Requests are issued one at a time.
#[derive(Debug, Clone)]
pub struct JsonHttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl JsonHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<JsonValue, FetchError> {
        self.post_json_with_retries(url, bearer, body)
            .instrument(info_span!("http_post", url))
            .await
    }

    async fn post_json_with_retries<B: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<JsonValue, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }
            let retryable = attempt < self.backoff.max_retries;

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let final_url = resp.url().to_string();
                    return resp.json::<JsonValue>().await.map_err(|source| FetchError::Decode {
                        url: final_url,
                        source,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if retryable && classify_status(status) == RetryDisposition::Retryable {
                        debug!(%status, attempt, "retrying after http status");
                    } else {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                }
                Err(err) => {
                    if retryable && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        debug!(error = %err, attempt, "retrying after transport error");
                    } else {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}
