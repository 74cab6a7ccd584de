//! Notification handlers: normalize, then join into the control store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ingest_core::{Error, HandlerOutcome, Result};
use ingest_queue::Disposition;
use ingest_storage::ControlStore;
use tracing::{debug, error, info, warn};

use crate::clients::RunClient;
use crate::events::{EventNormalizer, InboundMessage, Normalized};
use crate::metrics::{MetricsSink, CONTROL_DUPLICATES_TOTAL, NOTIFICATIONS_TOTAL};

pub struct NotificationHandler {
    store: Arc<dyn ControlStore>,
    normalizer: EventNormalizer,
    runs: Arc<dyn RunClient>,
    metrics: Arc<dyn MetricsSink>,
}

impl NotificationHandler {
    pub fn new(
        store: Arc<dyn ControlStore>,
        normalizer: EventNormalizer,
        runs: Arc<dyn RunClient>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            normalizer,
            runs,
            metrics,
        }
    }

    /// Handles a build-completion notification body.
    pub fn handle_build(&self, body: &[u8], now: DateTime<Utc>) -> Result<HandlerOutcome> {
        let res = InboundMessage::decode_build(body).and_then(|m| self.handle(&m, now));
        self.record("build", &res);
        res
    }

    /// Handles a run-completion notification body.
    pub fn handle_run(&self, body: &[u8], now: DateTime<Utc>) -> Result<HandlerOutcome> {
        let res = InboundMessage::decode_run(body).and_then(|m| self.handle(&m, now));
        self.record("run", &res);
        res
    }

    pub fn handle(&self, msg: &InboundMessage, now: DateTime<Utc>) -> Result<HandlerOutcome> {
        match msg {
            InboundMessage::BuildCompleted(m) => {
                let ev = match self.normalizer.normalize_build(m)? {
                    Normalized::Event(ev) => ev,
                    Normalized::Skip(reason) => {
                        debug!(build_id = m.build.id, project = %m.build.project, reason = reason.as_str(), "ignoring build");
                        return Ok(HandlerOutcome::Ignored);
                    }
                };
                let outcome = self.store.join_build_result(&ev.result, ev.is_presubmit, now)?;
                if outcome.task_created() {
                    info!(build = %ev.build_id, project = %ev.project, "build ready for ingestion");
                }
                if outcome == ingest_core::JoinOutcome::Duplicate {
                    self.metrics.increment(CONTROL_DUPLICATES_TOTAL, &[("kind", "build")]);
                }
                Ok(HandlerOutcome::Processed)
            }
            InboundMessage::RunEnded(m) => {
                let ev = match self.normalizer.normalize_run(m, self.runs.as_ref())? {
                    Normalized::Event(ev) => ev,
                    Normalized::Skip(reason) => {
                        debug!(run = %m.run_id, reason = reason.as_str(), "ignoring run");
                        return Ok(HandlerOutcome::Ignored);
                    }
                };
                if ev.results.is_empty() {
                    debug!(run = %ev.run_id, "run has no try-job builds");
                    return Ok(HandlerOutcome::Processed);
                }
                let summary = self.store.join_presubmit_results(&ev.project, &ev.results, now)?;
                for _ in 0..summary.duplicates() {
                    self.metrics.increment(CONTROL_DUPLICATES_TOTAL, &[("kind", "presubmit")]);
                }
                info!(
                    run = %ev.run_id,
                    builds = ev.results.len(),
                    tasks_created = summary.tasks_created(),
                    duplicates = summary.duplicates(),
                    "joined presubmit run"
                );
                Ok(HandlerOutcome::Processed)
            }
        }
    }

    fn record(&self, source: &'static str, res: &Result<HandlerOutcome>) {
        let disposition = Disposition::for_result(res);
        if let Err(err) = res {
            match err {
                Error::Inconsistent { .. } => error!(source, error = %err, "control entry inconsistency"),
                _ if err.is_retriable() => warn!(source, error = %err, "notification will be retried"),
                _ => error!(source, error = %err, "dropping notification"),
            }
        }
        self.metrics
            .increment(NOTIFICATIONS_TOTAL, &[("source", source), ("outcome", disposition.as_str())]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{BuildRef, FakeRunClient, RunDetail, Tryjob, TryjobResult};
    use crate::config::ServiceConfig;
    use crate::metrics::InMemoryMetrics;
    use chrono::TimeZone;
    use ingest_core::{BuildId, PresubmitMode, RunStatus, TaskPayload};
    use ingest_storage::{InMemoryStorage, Outbox};

    struct Harness {
        storage: Arc<InMemoryStorage>,
        runs: Arc<FakeRunClient>,
        metrics: Arc<InMemoryMetrics>,
        handler: NotificationHandler,
    }

    fn harness() -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        let runs = Arc::new(FakeRunClient::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let normalizer = EventNormalizer::from_config(&ServiceConfig::default_for("chromium")).unwrap();
        let handler = NotificationHandler::new(storage.clone(), normalizer, runs.clone(), metrics.clone());
        Harness { storage, runs, metrics, handler }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 1, 3, 0, 0).unwrap()
    }

    fn build_body(id: i64, presubmit: bool) -> Vec<u8> {
        let tags = if presubmit { r#"["user_agent:cq"]"# } else { "[]" };
        format!(
            r#"{{"build": {{"project": "chromium", "id": "{id}", "status": "COMPLETED",
                 "created_ts": "1764554584000000", "tags": {tags}}}, "hostname": "bb"}}"#
        )
        .into_bytes()
    }

    fn run_body() -> Vec<u8> {
        br#"{"run_id": "projects/chromium/runs/r1", "status": "SUCCEEDED", "hostname": "cv"}"#.to_vec()
    }

    fn insert_run(runs: &FakeRunClient, ids: &[i64]) {
        runs.insert(RunDetail {
            id: "projects/chromium/runs/r1".into(),
            mode: PresubmitMode::FullRun,
            status: RunStatus::Succeeded,
            create_time: Utc.with_ymd_and_hms(2025, 12, 1, 1, 0, 0).unwrap(),
            owner: "dev@chromium.org".into(),
            cls: vec![],
            tryjobs: ids
                .iter()
                .map(|id| Tryjob {
                    reuse: false,
                    critical: true,
                    result: Some(TryjobResult { build: Some(BuildRef { host: Some("bb".into()), id: *id }) }),
                })
                .collect(),
        });
    }

    fn task_builds(storage: &InMemoryStorage) -> Vec<i64> {
        storage
            .list_tasks()
            .unwrap()
            .into_iter()
            .filter_map(|t| match t.payload {
                TaskPayload::IngestTestResults(task) => task.build.map(|b| b.id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn ci_build_delivered_twice() {
        let h = harness();
        assert_eq!(h.handler.handle_build(&build_body(7, false), now()).unwrap(), HandlerOutcome::Processed);
        assert_eq!(h.handler.handle_build(&build_body(7, false), now()).unwrap(), HandlerOutcome::Processed);
        assert_eq!(task_builds(&h.storage), vec![7]);
        assert_eq!(h.metrics.get(CONTROL_DUPLICATES_TOTAL, &[("kind", "build")]), 1);
        assert_eq!(
            h.metrics.get(NOTIFICATIONS_TOTAL, &[("source", "build"), ("outcome", "processed")]),
            2
        );
    }

    #[test]
    fn run_before_builds() {
        let h = harness();
        insert_run(&h.runs, &[1, 2]);
        h.handler.handle_run(&run_body(), now()).unwrap();
        assert!(task_builds(&h.storage).is_empty());

        h.handler.handle_build(&build_body(1, true), now()).unwrap();
        assert_eq!(task_builds(&h.storage), vec![1]);
        h.handler.handle_build(&build_body(2, true), now()).unwrap();
        assert_eq!(task_builds(&h.storage), vec![1, 2]);

        let entries = h.storage.read_entries(&[BuildId::new("bb", 1)]).unwrap();
        assert_eq!(entries[0].as_ref().unwrap().project, "chromium");
    }

    #[test]
    fn malformed_body_is_dropped_and_counted() {
        let h = harness();
        let err = h.handler.handle_build(b"not json", now()).unwrap_err();
        assert_eq!(Disposition::for_error(&err), Disposition::Drop);
        assert_eq!(
            h.metrics.get(NOTIFICATIONS_TOTAL, &[("source", "build"), ("outcome", "permanent_failure")]),
            1
        );
    }

    #[test]
    fn missing_run_is_retried() {
        let h = harness();
        let err = h.handler.handle_run(&run_body(), now()).unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(
            h.metrics.get(NOTIFICATIONS_TOTAL, &[("source", "run"), ("outcome", "transient_failure")]),
            1
        );
    }

    #[test]
    fn presubmit_flag_conflict_is_permanent() {
        let h = harness();
        h.handler.handle_build(&build_body(1, false), now()).unwrap();
        insert_run(&h.runs, &[1]);
        let err = h.handler.handle_run(&run_body(), now()).unwrap_err();
        assert!(matches!(err, Error::Inconsistent { .. }));
        assert_eq!(Disposition::for_error(&err), Disposition::Drop);
    }
}
