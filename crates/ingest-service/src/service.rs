use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ingest_core::{HandlerOutcome, IngestionTask};
use ingest_queue::{relay_outbox, RelayReport, TaskQueue};
use ingest_storage_sqlite::SqliteStorage;

use crate::clients::{BuildClient, ResultsClient, RunClient};
use crate::clustering::ClusteringIngestor;
use crate::config::ServiceConfig;
use crate::control::NotificationHandler;
use crate::events::EventNormalizer;
use crate::ingester::{IngestOutcome, ResultIngester};
use crate::metrics::MetricsSink;

/// The ingestion service rooted at a working directory holding
/// `.ingest/ingest.toml` and the SQLite database.
pub struct Service {
    pub root: PathBuf,
    pub cfg: ServiceConfig,
    pub storage: Arc<SqliteStorage>,
    pub metrics: Arc<dyn MetricsSink>,
}

fn default_project(root: &Path) -> String {
    root.file_name()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .filter(|s| ingest_core::is_valid_project(s))
        .unwrap_or_else(|| "chromium".to_string())
}

impl Service {
    pub fn open(root: PathBuf, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let cfg_path = ServiceConfig::config_path(&root);
        let cfg = if cfg_path.exists() {
            ServiceConfig::load_from(&cfg_path)?
        } else {
            let cfg = ServiceConfig::default_for(&default_project(&root));
            cfg.save_to(&cfg_path)?;
            cfg
        };
        let db_path = cfg.db_path(&root);
        let storage = SqliteStorage::open(&db_path).with_context(|| format!("open {}", db_path.display()))?;
        Ok(Self {
            root,
            cfg,
            storage: Arc::new(storage),
            metrics,
        })
    }

    pub fn init_root(root: &Path) -> Result<()> {
        let cfg_path = ServiceConfig::config_path(root);
        let cfg = if cfg_path.exists() {
            ServiceConfig::load_from(&cfg_path)?
        } else {
            let cfg = ServiceConfig::default_for(&default_project(root));
            cfg.save_to(&cfg_path)?;
            cfg
        };
        // create db
        let _ = SqliteStorage::open(&cfg.db_path(root))?;
        Ok(())
    }

    pub fn notification_handler(&self, runs: Arc<dyn RunClient>) -> Result<NotificationHandler> {
        let normalizer = EventNormalizer::from_config(&self.cfg)?;
        Ok(NotificationHandler::new(
            self.storage.clone(),
            normalizer,
            runs,
            self.metrics.clone(),
        ))
    }

    pub fn ingester(
        &self,
        builds: Arc<dyn BuildClient>,
        results: Arc<dyn ResultsClient>,
        clustering: Arc<dyn ClusteringIngestor>,
    ) -> ResultIngester {
        ResultIngester::new(
            self.cfg.clone(),
            builds,
            results,
            clustering,
            self.storage.clone(),
            self.metrics.clone(),
        )
    }

    pub fn handle_build(&self, body: &[u8], runs: Arc<dyn RunClient>, now: DateTime<Utc>) -> Result<HandlerOutcome> {
        Ok(self.notification_handler(runs)?.handle_build(body, now)?)
    }

    pub fn handle_run(&self, body: &[u8], runs: Arc<dyn RunClient>, now: DateTime<Utc>) -> Result<HandlerOutcome> {
        Ok(self.notification_handler(runs)?.handle_run(body, now)?)
    }

    pub fn ingest(
        &self,
        task: &IngestionTask,
        builds: Arc<dyn BuildClient>,
        results: Arc<dyn ResultsClient>,
        clustering: Arc<dyn ClusteringIngestor>,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        Ok(self.ingester(builds, results, clustering).ingest(task, now)?)
    }

    pub fn relay(&self, queue: &dyn TaskQueue, limit: usize, now: DateTime<Utc>) -> Result<RelayReport> {
        Ok(relay_outbox(self.storage.as_ref(), queue, limit, now)?)
    }
}
