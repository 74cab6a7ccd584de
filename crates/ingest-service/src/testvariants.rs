//! Variant status aggregation over ingested result pages.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use ingest_core::{
    derived_status, updated_status, AnalyzedTestVariant, IngestionTask, PresubmitMode, Result, StringPair,
    TestResult, TestVariant, TestVariantKey, TestVariantStatus, UpdateTestVariant,
};
use ingest_storage::{VariantStore, VariantWrite};
use tracing::{debug, error};

use crate::config::{RealmConfig, TestVariantAnalysisConfig};

/// Result tags copied onto analyzed variant rows.
pub const TAG_KEYS: [&str; 5] = ["monorail_component", "os", "team_email", "test_name", "target_platform"];

/// A variant contributes nothing if it was unexpectedly skipped or none of
/// its results is an unexpected failure.
pub fn should_skip(tv: &TestVariant) -> bool {
    tv.status == TestVariantStatus::UnexpectedlySkipped || !tv.results.iter().any(TestResult::is_unexpected_failure)
}

/// Allow-listed tags, each taken from the first result carrying its key,
/// sorted by key.
pub fn extract_tags(results: &[TestResult]) -> Vec<StringPair> {
    let mut found: BTreeMap<&str, &str> = BTreeMap::new();
    for r in results {
        for t in &r.tags {
            if TAG_KEYS.contains(&t.key.as_str()) {
                found.entry(t.key.as_str()).or_insert(t.value.as_str());
            }
        }
    }
    found.into_iter().map(|(k, v)| StringPair::new(k, v)).collect()
}

/// Merges newly observed tags into stored ones; new values win per key.
/// `None` means the stored tags need no update.
pub fn merge_tags(new: &[StringPair], old: &[StringPair]) -> Option<Vec<StringPair>> {
    if new.is_empty() {
        return None;
    }
    let new_set: BTreeSet<&StringPair> = new.iter().collect();
    let old_set: BTreeSet<&StringPair> = old.iter().collect();
    if new_set == old_set {
        return None;
    }
    let mut merged: BTreeMap<&str, &str> = old.iter().map(|t| (t.key.as_str(), t.value.as_str())).collect();
    for t in new {
        merged.insert(t.key.as_str(), t.value.as_str());
    }
    let merged: Vec<StringPair> = merged.into_iter().map(|(k, v)| StringPair::new(k, v)).collect();
    if merged.iter().collect::<BTreeSet<_>>() == old_set {
        return None;
    }
    Some(merged)
}

/// Returns the aggregation config if variant statuses should be updated
/// for this task: the realm must enable it, and presubmit builds only count
/// when their run succeeded in full-run mode.
pub fn should_ingest_for_test_variants<'a>(
    realm: Option<&'a RealmConfig>,
    task: &IngestionTask,
) -> Option<&'a TestVariantAnalysisConfig> {
    let cfg = realm?.test_variant_analysis.as_ref()?;
    match &task.presubmit_run {
        None => Some(cfg),
        Some(p) if p.succeeded && p.mode == PresubmitMode::FullRun => Some(cfg),
        Some(_) => None,
    }
}

fn update_task(row: &AnalyzedTestVariant, cfg: &TestVariantAnalysisConfig, now: DateTime<Utc>) -> UpdateTestVariant {
    UpdateTestVariant {
        realm: row.realm.clone(),
        test_id: row.test_id.clone(),
        variant_hash: row.variant_hash.clone(),
        interval_secs: cfg.update_interval_secs,
        enqueue_time: now,
    }
}

fn plan_variant(
    realm: &str,
    builder: &str,
    cfg: &TestVariantAnalysisConfig,
    tv: &TestVariant,
    existing: Option<&AnalyzedTestVariant>,
    now: DateTime<Utc>,
) -> Result<Option<VariantWrite>> {
    let derived = derived_status(tv.status)?;
    let tags = extract_tags(&tv.results);
    let Some(old) = existing else {
        let row = AnalyzedTestVariant {
            realm: realm.to_string(),
            test_id: tv.test_id.clone(),
            variant_hash: tv.variant_hash.clone(),
            status: derived,
            variant: tv.variant.clone(),
            tags,
            test_metadata: tv.test_metadata.clone(),
            builder: Some(builder.to_string()),
            next_update_task_enqueue_time: Some(now),
            created_at: now,
            status_updated_at: now,
        };
        let task = update_task(&row, cfg, now);
        return Ok(Some(VariantWrite { row, update_task: Some(task) }));
    };

    let status = updated_status(old.status, derived)?;
    let merged = merge_tags(&tags, &old.tags);
    if status == old.status && merged.is_none() {
        return Ok(None);
    }
    let mut row = old.clone();
    let mut task = None;
    if status != old.status {
        row.status = status;
        row.status_updated_at = now;
        row.next_update_task_enqueue_time = Some(now);
        task = Some(update_task(&row, cfg, now));
    }
    if let Some(t) = merged {
        row.tags = t;
    }
    Ok(Some(VariantWrite { row, update_task: task }))
}

/// Folds one page of variants into the analyzed rows of `realm`, in a single
/// store transaction. Returns the number of rows written.
///
/// A variant whose outcome cannot be mapped to a status is logged and left
/// alone; the rest of the page still applies.
pub fn update_analyzed_variants<S: VariantStore + ?Sized>(
    store: &S,
    realm: &str,
    builder: &str,
    cfg: &TestVariantAnalysisConfig,
    variants: &[TestVariant],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut by_key: BTreeMap<TestVariantKey, &TestVariant> = BTreeMap::new();
    for tv in variants.iter().filter(|tv| !should_skip(tv)) {
        by_key.entry(tv.key()).or_insert(tv);
    }
    if by_key.is_empty() {
        return Ok(0);
    }
    let keys: Vec<TestVariantKey> = by_key.keys().cloned().collect();

    let written = store.update_variants(realm, &keys, &mut |found: &BTreeMap<TestVariantKey, AnalyzedTestVariant>| {
        let mut writes = Vec::new();
        for (key, tv) in &by_key {
            match plan_variant(realm, builder, cfg, tv, found.get(key), now) {
                Ok(Some(w)) => writes.push(w),
                Ok(None) => {}
                Err(err) => error!(realm, test_id = %key.test_id, variant_hash = %key.variant_hash, error = %err, "skipping test variant"),
            }
        }
        Ok(writes)
    })?;
    debug!(realm, candidates = keys.len(), written, "updated analyzed test variants");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ingest_core::{AnalyzedStatus, PresubmitResult, PresubmitRunId, RunOwner, TaskPayload, TestStatus};
    use ingest_storage::{InMemoryStorage, Outbox};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap()
    }

    fn cfg() -> TestVariantAnalysisConfig {
        TestVariantAnalysisConfig { update_interval_secs: 3600, status_update_duration_secs: 86400 }
    }

    fn result(expected: bool, status: TestStatus, tags: &[(&str, &str)]) -> TestResult {
        TestResult {
            result_id: "r".into(),
            expected,
            status,
            tags: tags.iter().map(|(k, v)| StringPair::new(*k, *v)).collect(),
            failure_reason: None,
            start_time: None,
        }
    }

    fn tv(test_id: &str, status: TestVariantStatus, results: Vec<TestResult>) -> TestVariant {
        TestVariant {
            test_id: test_id.into(),
            variant_hash: "h".into(),
            variant: BTreeMap::from([("builder".to_string(), "linux-rel".to_string())]),
            status,
            results,
            exonerations: vec![],
            test_metadata: None,
        }
    }

    fn unexpected(test_id: &str) -> TestVariant {
        tv(test_id, TestVariantStatus::Unexpected, vec![result(false, TestStatus::Fail, &[])])
    }

    fn flaky(test_id: &str) -> TestVariant {
        tv(
            test_id,
            TestVariantStatus::Flaky,
            vec![result(false, TestStatus::Fail, &[]), result(true, TestStatus::Pass, &[])],
        )
    }

    fn seeded(test_id: &str, status: AnalyzedStatus) -> AnalyzedTestVariant {
        AnalyzedTestVariant {
            realm: "chromium:ci".into(),
            test_id: test_id.into(),
            variant_hash: "h".into(),
            status,
            variant: BTreeMap::new(),
            tags: vec![],
            test_metadata: None,
            builder: Some("linux-rel".into()),
            next_update_task_enqueue_time: None,
            created_at: t0() - Duration::days(3),
            status_updated_at: t0() - Duration::days(3),
        }
    }

    fn status_of(s: &InMemoryStorage, test_id: &str) -> AnalyzedStatus {
        s.read_variants("chromium:ci", &[TestVariantKey::new(test_id, "h")]).unwrap()[0].status
    }

    fn update_tasks(s: &InMemoryStorage) -> usize {
        s.list_tasks()
            .unwrap()
            .iter()
            .filter(|t| matches!(t.payload, TaskPayload::UpdateTestVariant(_)))
            .count()
    }

    #[test]
    fn skip_rules() {
        assert!(!should_skip(&unexpected("a")));
        assert!(should_skip(&tv(
            "a",
            TestVariantStatus::UnexpectedlySkipped,
            vec![result(false, TestStatus::Fail, &[])]
        )));
        assert!(should_skip(&tv(
            "a",
            TestVariantStatus::Unexpected,
            vec![result(false, TestStatus::Skip, &[]), result(true, TestStatus::Fail, &[])]
        )));
    }

    #[test]
    fn tags_come_from_first_result_carrying_each_key() {
        let results = vec![
            result(false, TestStatus::Fail, &[("os", "linux"), ("random", "x")]),
            result(false, TestStatus::Fail, &[("os", "mac"), ("team_email", "team@example.com")]),
        ];
        assert_eq!(
            extract_tags(&results),
            vec![StringPair::new("os", "linux"), StringPair::new("team_email", "team@example.com")]
        );
    }

    #[test]
    fn tag_merge() {
        let old = vec![StringPair::new("os", "linux"), StringPair::new("team_email", "a@x")];
        assert_eq!(merge_tags(&[], &old), None);
        assert_eq!(merge_tags(&old, &old), None);
        assert_eq!(merge_tags(&old, &[]), Some(old.clone()));
        assert_eq!(
            merge_tags(&[StringPair::new("os", "mac"), StringPair::new("monorail_component", "Blink")], &old),
            Some(vec![
                StringPair::new("monorail_component", "Blink"),
                StringPair::new("os", "mac"),
                StringPair::new("team_email", "a@x"),
            ])
        );
        assert_eq!(merge_tags(&[StringPair::new("os", "linux")], &old), None);
    }

    #[test]
    fn inserts_and_transitions() {
        let s = InMemoryStorage::new();
        s.insert_variant(seeded("expected", AnalyzedStatus::ConsistentlyExpected)).unwrap();
        s.insert_variant(seeded("flaky", AnalyzedStatus::Flaky)).unwrap();
        s.insert_variant(seeded("consistent", AnalyzedStatus::ConsistentlyUnexpected)).unwrap();
        s.insert_variant(seeded("quiet", AnalyzedStatus::NoNewResults)).unwrap();

        let page = vec![
            unexpected("new"),
            unexpected("expected"),
            unexpected("flaky"),
            unexpected("consistent"),
            flaky("quiet"),
        ];
        let n = update_analyzed_variants(&s, "chromium:ci", "linux-rel", &cfg(), &page, t0()).unwrap();
        assert_eq!(n, 3);

        assert_eq!(status_of(&s, "new"), AnalyzedStatus::HasUnexpectedResults);
        assert_eq!(status_of(&s, "expected"), AnalyzedStatus::HasUnexpectedResults);
        assert_eq!(status_of(&s, "flaky"), AnalyzedStatus::Flaky);
        assert_eq!(status_of(&s, "consistent"), AnalyzedStatus::ConsistentlyUnexpected);
        assert_eq!(status_of(&s, "quiet"), AnalyzedStatus::Flaky);
        assert_eq!(update_tasks(&s), 3);

        let row = &s.read_variants("chromium:ci", &[TestVariantKey::new("expected", "h")]).unwrap()[0];
        assert_eq!(row.next_update_task_enqueue_time, Some(t0()));
        assert_eq!(row.status_updated_at, t0());
    }

    #[test]
    fn flaky_never_leaves() {
        let s = InMemoryStorage::new();
        let mut now = t0();
        update_analyzed_variants(&s, "chromium:ci", "b", &cfg(), &[flaky("t")], now).unwrap();
        for _ in 0..3 {
            now += Duration::hours(1);
            update_analyzed_variants(&s, "chromium:ci", "b", &cfg(), &[unexpected("t")], now).unwrap();
            assert_eq!(status_of(&s, "t"), AnalyzedStatus::Flaky);
        }
        assert_eq!(update_tasks(&s), 1);
    }

    #[test]
    fn tag_only_change_keeps_status() {
        let s = InMemoryStorage::new();
        update_analyzed_variants(&s, "chromium:ci", "b", &cfg(), &[unexpected("t")], t0()).unwrap();
        let mut later = unexpected("t");
        later.results[0].tags.push(StringPair::new("os", "linux"));
        let n = update_analyzed_variants(&s, "chromium:ci", "b", &cfg(), &[later], t0() + Duration::hours(1)).unwrap();
        assert_eq!(n, 1);
        let row = &s.read_variants("chromium:ci", &[TestVariantKey::new("t", "h")]).unwrap()[0];
        assert_eq!(row.status, AnalyzedStatus::HasUnexpectedResults);
        assert_eq!(row.tags, vec![StringPair::new("os", "linux")]);
        assert_eq!(row.status_updated_at, t0());
        assert_eq!(update_tasks(&s), 1);
    }

    #[test]
    fn unsupported_outcome_skips_only_that_variant() {
        let s = InMemoryStorage::new();
        let odd = tv("odd", TestVariantStatus::Expected, vec![result(false, TestStatus::Fail, &[])]);
        let n = update_analyzed_variants(&s, "chromium:ci", "b", &cfg(), &[odd, unexpected("ok")], t0()).unwrap();
        assert_eq!(n, 1);
        assert!(s.read_variants("chromium:ci", &[TestVariantKey::new("odd", "h")]).unwrap().is_empty());
    }

    #[test]
    fn aggregation_gate() {
        let with = RealmConfig { name: "ci".into(), test_variant_analysis: Some(cfg()) };
        let without = RealmConfig { name: "ci".into(), test_variant_analysis: None };
        let mut task = IngestionTask { build: None, partition_time: t0(), presubmit_run: None };
        assert!(should_ingest_for_test_variants(Some(&with), &task).is_some());
        assert!(should_ingest_for_test_variants(Some(&without), &task).is_none());
        assert!(should_ingest_for_test_variants(None, &task).is_none());

        let mut run = PresubmitResult {
            presubmit_run_id: PresubmitRunId::cv("chromium", "r"),
            succeeded: true,
            owner: RunOwner::User,
            mode: PresubmitMode::FullRun,
            cls: vec![],
            creation_time: t0(),
            critical: true,
        };
        task.presubmit_run = Some(run.clone());
        assert!(should_ingest_for_test_variants(Some(&with), &task).is_some());
        run.succeeded = false;
        task.presubmit_run = Some(run);
        assert!(should_ingest_for_test_variants(Some(&with), &task).is_none());
    }
}
