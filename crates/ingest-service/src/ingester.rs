//! Result-ingestion orchestrator: runs one ingestion task end to end.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ingest_core::{
    split_realm, BuildStatus, CollectTestResults, Error, IngestionTask, PresubmitMode, Result, TaskPayload,
};
use ingest_queue::Disposition;
use ingest_storage::{Outbox, Storage};
use tracing::{debug, info, warn};

use crate::clients::{BuildClient, ResultsClient, TestVariantQuery, BUILD_FIELD_MASK};
use crate::clustering::{ClusteringIngestor, SessionOptions};
use crate::config::{IngestionConfig, ServiceConfig};
use crate::metrics::{MetricsSink, ORCHESTRATOR_OUTCOMES_TOTAL};
use crate::testvariants::{should_ingest_for_test_variants, update_analyzed_variants};

/// Why a task finished without ingesting anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestSkip {
    BuildNotFound,
    ProjectNotConfigured,
    NoInvocation,
    NotFullRun,
    InvocationNotFound,
}

impl IngestSkip {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestSkip::BuildNotFound => "build_not_found",
            IngestSkip::ProjectNotConfigured => "project_not_configured",
            IngestSkip::NoInvocation => "no_invocation",
            IngestSkip::NotFullRun => "not_full_run",
            IngestSkip::InvocationNotFound => "invocation_not_found",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub pages: usize,
    pub variants: usize,
    pub variants_written: usize,
    /// Aggregation ran for this task's realm.
    pub aggregated: bool,
    /// More pages remained after the page bound was reached.
    pub truncated: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested(IngestReport),
    Skipped(IngestSkip),
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Ingested(_) => "ingested",
            IngestOutcome::Skipped(s) => s.as_str(),
        }
    }
}

/// Rejects partition times outside `[now - retention, now + skew]`.
pub fn validate_partition_time(t: DateTime<Utc>, now: DateTime<Utc>, cfg: &IngestionConfig) -> Result<()> {
    if t < now - Duration::days(cfg.retention_days) {
        return Err(Error::Fatal(format!("partition time {t} is too long ago")));
    }
    if t > now + Duration::hours(cfg.max_clock_skew_hours) {
        return Err(Error::Fatal(format!("partition time {t} is too far in the future")));
    }
    Ok(())
}

/// A build that did not fail, or whose presubmit job was not critical,
/// could not have caused the overall outcome.
pub fn implicitly_exonerate(build_status: BuildStatus, task: &IngestionTask) -> bool {
    build_status != BuildStatus::Failure || task.presubmit_run.as_ref().is_some_and(|p| !p.critical)
}

pub struct ResultIngester {
    config: ServiceConfig,
    builds: Arc<dyn BuildClient>,
    results: Arc<dyn ResultsClient>,
    clustering: Arc<dyn ClusteringIngestor>,
    storage: Arc<dyn Storage>,
    metrics: Arc<dyn MetricsSink>,
}

impl ResultIngester {
    pub fn new(
        config: ServiceConfig,
        builds: Arc<dyn BuildClient>,
        results: Arc<dyn ResultsClient>,
        clustering: Arc<dyn ClusteringIngestor>,
        storage: Arc<dyn Storage>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            builds,
            results,
            clustering,
            storage,
            metrics,
        }
    }

    /// Runs `task`. Safe to re-run from the start after any failure.
    pub fn ingest(&self, task: &IngestionTask, now: DateTime<Utc>) -> Result<IngestOutcome> {
        let res = self.run(task, now);
        let label = match &res {
            Ok(outcome) => outcome.as_str(),
            Err(err) => Disposition::for_error(err).as_str(),
        };
        self.metrics.increment(ORCHESTRATOR_OUTCOMES_TOTAL, &[("outcome", label)]);
        res
    }

    fn run(&self, task: &IngestionTask, now: DateTime<Utc>) -> Result<IngestOutcome> {
        validate_partition_time(task.partition_time, now, &self.config.ingestion)?;
        let build = task
            .build
            .as_ref()
            .ok_or_else(|| Error::Fatal("ingestion task has no build".into()))?;

        let Some(detail) = self.builds.get_build(&build.host, build.id, &BUILD_FIELD_MASK)? else {
            info!(build = %build.build_id(), "build not found, skipping");
            return Ok(IngestOutcome::Skipped(IngestSkip::BuildNotFound));
        };
        if !self.config.is_enrolled(&detail.project) {
            debug!(build = %build.build_id(), project = %detail.project, "project not configured");
            return Ok(IngestOutcome::Skipped(IngestSkip::ProjectNotConfigured));
        }
        let Some(results_ref) = detail.results.as_ref().filter(|r| !r.invocation.is_empty()) else {
            debug!(build = %build.build_id(), "build has no results invocation");
            return Ok(IngestOutcome::Skipped(IngestSkip::NoInvocation));
        };
        if task.presubmit_run.as_ref().is_some_and(|p| p.mode != PresubmitMode::FullRun) {
            return Ok(IngestOutcome::Skipped(IngestSkip::NotFullRun));
        }

        let Some(inv) = self.results.get_invocation(&results_ref.hostname, &results_ref.invocation)? else {
            info!(invocation = %results_ref.invocation, "invocation not found, skipping");
            return Ok(IngestOutcome::Skipped(IngestSkip::InvocationNotFound));
        };
        let (project, _) = split_realm(&inv.realm)?;
        let analysis = should_ingest_for_test_variants(self.config.realm(&inv.realm), task);

        let opts = SessionOptions {
            project: project.to_string(),
            invocation: inv.name.clone(),
            partition_time: task.partition_time,
            realm: inv.realm.clone(),
            presubmit_run_id: task.presubmit_run.as_ref().map(|p| p.presubmit_run_id.clone()),
            implicitly_exonerate: implicitly_exonerate(detail.status, task),
        };
        let mut session = self.clustering.open(opts)?;

        let mut report = IngestReport {
            aggregated: analysis.is_some(),
            ..IngestReport::default()
        };
        let mut query = TestVariantQuery {
            invocation: inv.name.clone(),
            page_size: self.config.ingestion.page_size,
            page_token: None,
        };
        loop {
            let page = self.results.query_test_variants(&results_ref.hostname, &query)?;
            report.pages += 1;
            report.variants += page.variants.len();
            if let Some(cfg) = analysis {
                report.variants_written += update_analyzed_variants(
                    self.storage.as_ref(),
                    &inv.realm,
                    &detail.builder,
                    cfg,
                    &page.variants,
                    now,
                )?;
            }
            session.put(&page.variants)?;

            match page.next_page_token {
                None => break,
                Some(token) if report.pages >= self.config.ingestion.max_pages => {
                    warn!(invocation = %inv.name, pages = report.pages, next_page = %token, "page bound reached, remaining results not ingested");
                    report.truncated = true;
                    break;
                }
                Some(token) => query.page_token = Some(token),
            }
        }
        session.flush()?;

        if analysis.is_some() {
            let is_presubmit = task.presubmit_run.is_some();
            let collect = CollectTestResults {
                invocation: inv.name.clone(),
                realm: inv.realm.clone(),
                results_host: results_ref.hostname.clone(),
                builder: detail.builder.clone(),
                is_presubmit,
                contributed_to_cl_submission: task
                    .presubmit_run
                    .as_ref()
                    .is_some_and(|p| p.contributed_to_submission()),
            };
            self.storage.record_task(TaskPayload::CollectTestResults(collect), now)?;
        }

        info!(
            build = %build.build_id(),
            invocation = %inv.name,
            pages = report.pages,
            variants = report.variants,
            variants_written = report.variants_written,
            "ingested test results"
        );
        Ok(IngestOutcome::Ingested(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn partition_time_window() {
        let cfg = IngestionConfig::default();
        assert!(validate_partition_time(now() - Duration::days(91), now(), &cfg)
            .unwrap_err()
            .to_string()
            .contains("too long ago"));
        assert!(validate_partition_time(now() + Duration::hours(23), now(), &cfg).is_ok());
        assert!(validate_partition_time(now() + Duration::hours(25), now(), &cfg)
            .unwrap_err()
            .to_string()
            .contains("too far in the future"));
        assert!(validate_partition_time(now() - Duration::days(89), now(), &cfg).is_ok());
    }

    #[test]
    fn exoneration_policy() {
        let ci = IngestionTask { build: None, partition_time: now(), presubmit_run: None };
        assert!(implicitly_exonerate(BuildStatus::Success, &ci));
        assert!(implicitly_exonerate(BuildStatus::InfraFailure, &ci));
        assert!(!implicitly_exonerate(BuildStatus::Failure, &ci));
    }
}
