//! Per-run pipeline orchestration: load history, collect, reconcile,
//! persist, notify.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobwatch_adapters::{CareersPageCollector, Collector};
use jobwatch_core::{dedup_by_id, filter_by_keywords, reconcile, ReconcileOptions};
use jobwatch_notify::{NoopNotifier, Notifier, SmtpConfig, SmtpNotifier};
use jobwatch_storage::{HistoryStore, HttpClientConfig, PageFetcher};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-sync";

/// Immutable per-process configuration, assembled at the program edge and
/// passed in explicitly. Nothing in the pipeline reads ambient state.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub careers_url: String,
    pub search_terms: Vec<String>,
    pub terms_file: Option<PathBuf>,
    pub history_path: PathBuf,
    pub subject: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub refresh_on_reopen: bool,
    pub scheduler_enabled: bool,
    pub watch_cron: String,
    pub smtp: Option<SmtpConfig>,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let smtp = match (
            std::env::var("SENDER_EMAIL"),
            std::env::var("SENDER_PASSWORD"),
            std::env::var("RECEIVER_EMAIL"),
        ) {
            (Ok(sender), Ok(password), Ok(recipient)) => Some(SmtpConfig {
                host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".to_string()),
                port: std::env::var("SMTP_PORT").ok().and_then(|v| v.parse().ok()),
                username: sender.clone(),
                password,
                sender,
                recipient,
            }),
            _ => None,
        };

        Self {
            careers_url: std::env::var("JOBWATCH_URL")
                .unwrap_or_else(|_| "https://carreiras.ifood.com.br/".to_string()),
            search_terms: std::env::var("JOBWATCH_TERMS")
                .map(|v| {
                    v.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| {
                    [
                        "Analista de Negócios",
                        "Business Intelligence",
                        "Analista de Dados",
                        "CRM",
                        "Produto",
                    ]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
                }),
            terms_file: std::env::var("JOBWATCH_TERMS_FILE").map(PathBuf::from).ok(),
            history_path: std::env::var("JOBWATCH_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./job_history.json")),
            subject: std::env::var("JOBWATCH_SUBJECT")
                .unwrap_or_else(|_| "Novas vagas encontradas".to_string()),
            user_agent: std::env::var("JOBWATCH_USER_AGENT")
                .unwrap_or_else(|_| "jobwatch-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("JOBWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            refresh_on_reopen: env_flag("JOBWATCH_REFRESH_ON_REOPEN"),
            scheduler_enabled: env_flag("JOBWATCH_SCHEDULER_ENABLED"),
            watch_cron: std::env::var("JOBWATCH_CRON").unwrap_or_else(|_| "0 7 * * *".to_string()),
            smtp,
        }
    }
}

/// Optional YAML registry of search terms with per-term enable flags.
#[derive(Debug, Clone, Deserialize)]
pub struct TermRegistry {
    pub terms: Vec<TermConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TermConfig {
    pub term: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub terms: usize,
    pub failed_terms: usize,
    pub collected: usize,
    pub new_entries: usize,
    pub closed: usize,
    pub reopened: usize,
    pub history_size: usize,
    pub notified: bool,
}

pub struct WatchPipeline {
    config: WatchConfig,
    store: HistoryStore,
    collector: Box<dyn Collector>,
    notifier: Box<dyn Notifier>,
}

impl WatchPipeline {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let fetcher = PageFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let collector = CareersPageCollector::new(fetcher, config.careers_url.clone());
        let notifier: Box<dyn Notifier> = match &config.smtp {
            Some(smtp) => Box::new(
                SmtpNotifier::new(smtp.clone()).context("building smtp notifier")?,
            ),
            None => Box::new(NoopNotifier),
        };
        let store = HistoryStore::new(config.history_path.clone());
        Ok(Self {
            config,
            store,
            collector: Box::new(collector),
            notifier,
        })
    }

    /// Assembles a pipeline from pre-built parts. Test seam.
    pub fn with_parts(
        config: WatchConfig,
        store: HistoryStore,
        collector: Box<dyn Collector>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            store,
            collector,
            notifier,
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    async fn load_terms(&self) -> Result<Vec<String>> {
        let Some(path) = &self.config.terms_file else {
            return Ok(self.config.search_terms.clone());
        };
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading term registry {}", path.display()))?;
        let registry: TermRegistry = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing term registry {}", path.display()))?;
        Ok(registry
            .terms
            .into_iter()
            .filter(|t| t.enabled)
            .map(|t| t.term)
            .collect())
    }

    /// One full run: load → collect per term → filter → reconcile → save →
    /// notify. Per-term collection failures are recovered as zero
    /// postings; reconciler precondition violations are fatal. The
    /// history is saved before the notification attempt so a delivery
    /// failure never causes re-notification on the next run.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let today = started_at.date_naive();

        let terms = self.load_terms().await?;
        let history = self.store.load(today).await?;
        info!(%run_id, terms = terms.len(), known_postings = history.len(), "starting run");

        let mut scraped = Vec::new();
        let mut failed_terms = 0usize;
        for term in &terms {
            match self.collector.collect(term).await {
                Ok(postings) => {
                    info!(term, postings = postings.len(), "collected");
                    scraped.extend(postings);
                }
                Err(err) => {
                    warn!(term, error = %err, "collection failed, treating as zero postings");
                    failed_terms += 1;
                }
            }
        }

        let current = dedup_by_id(filter_by_keywords(scraped, &terms));
        let collected = current.len();

        let outcome = reconcile(
            history,
            &current,
            today,
            ReconcileOptions {
                refresh_on_reopen: self.config.refresh_on_reopen,
            },
        )
        .context("reconciling scraped postings against history")?;

        self.store.save(&outcome.history).await?;

        let notified = if outcome.new_entries.is_empty() {
            false
        } else {
            match self
                .notifier
                .notify(&self.config.subject, &outcome.new_entries)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "notification failed; history already saved");
                    false
                }
            }
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            terms: terms.len(),
            failed_terms,
            collected,
            new_entries: outcome.new_entries.len(),
            closed: outcome.closed_ids.len(),
            reopened: outcome.reopened_ids.len(),
            history_size: outcome.history.len(),
            notified,
        };
        info!(
            %run_id,
            new_entries = summary.new_entries,
            closed = summary.closed,
            reopened = summary.reopened,
            "run complete"
        );
        Ok(summary)
    }

    /// Builds the cron scheduler when enabled; each tick runs the full
    /// pipeline and logs the outcome.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.watch_cron.clone();
        let pipeline = self;
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        new_entries = summary.new_entries,
                        "scheduled run complete"
                    ),
                    Err(err) => warn!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_watch_once_from_env() -> Result<RunSummary> {
    let pipeline = WatchPipeline::new(WatchConfig::from_env())?;
    pipeline.run_once().await
}
