//! History persistence and HTTP fetch utilities for jobwatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use jobwatch_core::{History, HistoryEntry, Status};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jobwatch-storage";

/// Raw persisted entry shape, tolerant of every legacy schema the script
/// variants produced. Canonical names decode too; legacy Portuguese field
/// names and statuses are accepted as aliases.
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default, alias = "link")]
    id: Option<String>,
    #[serde(default, alias = "titulo")]
    title: Option<String>,
    #[serde(default, alias = "local")]
    location: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "data_entrada", alias = "date_entrada")]
    opened_on: Option<String>,
    #[serde(default, alias = "data_saida", alias = "date_saida")]
    closed_on: Option<String>,
}

fn parse_status(raw: Option<&str>) -> Status {
    match raw {
        Some(s) if s.eq_ignore_ascii_case("fechada") || s.eq_ignore_ascii_case("closed") => {
            Status::Closed
        }
        Some(s) if s.eq_ignore_ascii_case("ativa") || s.eq_ignore_ascii_case("active") => {
            Status::Active
        }
        Some(other) => {
            warn!(status = other, "unknown history status, treating as active");
            Status::Active
        }
        None => Status::Active,
    }
}

fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    raw.and_then(|s| s.parse().ok())
}

/// Decodes persisted history text. Malformed content yields an empty
/// history rather than an error; entries missing optional fields are
/// filled with defaults so the reconciler never sees partial records.
pub fn decode_history(text: &str, today: NaiveDate) -> History {
    let raw_entries: Vec<RawEntry> = match serde_json::from_str(text) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "history file is malformed, starting from an empty history");
            return History::new();
        }
    };

    let mut history = History::new();
    for raw in raw_entries {
        let Some(id) = raw.id.filter(|id| !id.trim().is_empty()) else {
            warn!("skipping history entry without an id");
            continue;
        };
        let status = parse_status(raw.status.as_deref());
        let closed_on = match status {
            Status::Closed => parse_date(raw.closed_on.as_deref()).or(Some(today)),
            Status::Active => None,
        };
        let entry = HistoryEntry {
            id: id.clone(),
            title: raw.title.unwrap_or_default(),
            location: raw.location,
            status,
            opened_on: parse_date(raw.opened_on.as_deref()).unwrap_or(today),
            closed_on,
        };
        // Duplicate ids collapse to the last occurrence.
        history.insert(id, entry);
    }
    history
}

/// Loads and saves the history file. The reconciler owns the in-memory
/// history for the duration of a run; this type only touches the edges.
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

    /// Missing file and corrupt content both load as an empty history.
    pub async fn load(&self, today: NaiveDate) -> anyhow::Result<History> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(decode_history(&text, today)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no history file yet, starting empty");
                Ok(History::new())
            }
            Err(err) => {
                Err(err).with_context(|| format!("reading history {}", self.path.display()))
            }
        }
    }

    /// Writes the history as a JSON array via a temp file + rename, so a
    /// crash mid-write never leaves a truncated file behind.
    pub async fn save(&self, history: &History) -> anyhow::Result<()> {
        let entries: Vec<&HistoryEntry> = history.values().collect();
        let bytes = serde_json::to_vec_pretty(&entries).context("serializing history")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating history directory {}", parent.display()))?;
            }
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "history.json".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("creating temp history file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp history file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp history file {}", temp_path.display()))?;
        drop(file);

        fs::rename(&temp_path, &self.path).await.with_context(|| {
            format!(
                "renaming temp history {} -> {}",
                temp_path.display(),
                self.path.display()
            )
        })
    }
}

/// Whether a failed attempt is worth repeating. Rate limiting and server
/// or transport hiccups are; anything else (4xx, bad URL) is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    fn of_status(status: StatusCode) -> Self {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }

    fn of_request_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
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
    /// Delay before retrying `attempt_index` (zero-based): base delay
    /// doubled per attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
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
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Fetches page text with capped exponential backoff on transient
/// failures (5xx, 429, connect/timeout errors).
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PageFetcher {
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

    pub async fn fetch_text(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            debug!(url, attempt, "fetching page");
            let resp_result = self.client.get(url).query(query).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    let disposition = RetryDisposition::of_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = RetryDisposition::of_request_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day(s: &str) -> NaiveDate {
        s.parse().expect("date literal")
    }

    #[test]
    fn corrupt_history_decodes_as_empty() {
        let history = decode_history("{ not json", day("2024-01-01"));
        assert!(history.is_empty());
    }

    #[test]
    fn legacy_portuguese_schema_decodes_with_defaults() {
        let text = r#"[
            {
                "titulo": "Analista de Dados",
                "link": "https://carreiras.example/vaga/1",
                "status": "ativa",
                "data_entrada": "2023-11-02"
            },
            {
                "titulo": "Analista de CRM",
                "link": "https://carreiras.example/vaga/2",
                "status": "fechada",
                "data_entrada": "2023-10-01",
                "data_saida": "2023-12-05"
            },
            {
                "titulo": "Sem link"
            }
        ]"#;
        let history = decode_history(text, day("2024-01-01"));

        assert_eq!(history.len(), 2);
        let open = &history["https://carreiras.example/vaga/1"];
        assert_eq!(open.status, Status::Active);
        assert_eq!(open.opened_on, day("2023-11-02"));
        assert_eq!(open.closed_on, None);

        let closed = &history["https://carreiras.example/vaga/2"];
        assert_eq!(closed.status, Status::Closed);
        assert_eq!(closed.closed_on, Some(day("2023-12-05")));
    }

    #[test]
    fn missing_fields_default_to_active_today() {
        let text = r#"[{"title": "Vaga", "id": "https://x/1"}]"#;
        let history = decode_history(text, day("2024-06-15"));
        let entry = &history["https://x/1"];
        assert_eq!(entry.status, Status::Active);
        assert_eq!(entry.opened_on, day("2024-06-15"));
        assert_eq!(entry.closed_on, None);
    }

    #[test]
    fn closed_entry_without_date_gets_today() {
        let text = r#"[{"title": "Vaga", "id": "https://x/1", "status": "closed"}]"#;
        let history = decode_history(text, day("2024-06-15"));
        assert_eq!(history["https://x/1"].closed_on, Some(day("2024-06-15")));
    }

    #[test]
    fn duplicate_ids_collapse_to_last() {
        let text = r#"[
            {"title": "old", "id": "https://x/1", "opened_on": "2024-01-01"},
            {"title": "new", "id": "https://x/1", "opened_on": "2024-02-01"}
        ]"#;
        let history = decode_history(text, day("2024-06-15"));
        assert_eq!(history.len(), 1);
        assert_eq!(history["https://x/1"].title, "new");
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.json"));
        let history = store.load(day("2024-01-01")).await.expect("load");
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_canonical_fields() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.json"));

        let mut history = History::new();
        history.insert(
            "https://x/1".to_string(),
            HistoryEntry {
                id: "https://x/1".to_string(),
                title: "Analista de Dados".to_string(),
                location: Some("São Paulo".to_string()),
                status: Status::Active,
                opened_on: day("2024-01-01"),
                closed_on: None,
            },
        );
        history.insert(
            "https://x/2".to_string(),
            HistoryEntry {
                id: "https://x/2".to_string(),
                title: "Analista de CRM".to_string(),
                location: None,
                status: Status::Closed,
                opened_on: day("2024-01-01"),
                closed_on: Some(day("2024-02-01")),
            },
        );

        store.save(&history).await.expect("save");
        let loaded = store.load(day("2024-03-01")).await.expect("load");
        assert_eq!(loaded, history);

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn retry_delays_double_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(900),
        };

        let delays: Vec<_> = (0..5).map(|i| policy.delay_for_attempt(i)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(900),
                Duration::from_millis(900),
            ]
        );
    }

    #[test]
    fn only_rate_limits_and_server_errors_retry() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(
                RetryDisposition::of_status(status),
                RetryDisposition::Retryable
            );
        }
        for status in [StatusCode::NOT_FOUND, StatusCode::FORBIDDEN] {
            assert_eq!(
                RetryDisposition::of_status(status),
                RetryDisposition::NonRetryable
            );
        }
    }
}
