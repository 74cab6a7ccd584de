use chrono::{TimeZone, Utc};
use ingest_core::{
    AnalyzedStatus, BuildId, BuildResult, Changelist, IngestionTask, JoinOutcome, JoinSummary, PresubmitMode,
    PresubmitResult, PresubmitRunId, RunOwner, TaskId, TaskPayload, TestResult, TestStatus,
};

#[test]
fn test_task_id_new() {
    let a = TaskId::new();
    let b = TaskId::new();
    assert_ne!(a, b);
}

#[test]
fn test_build_id_display() {
    assert_eq!(BuildId::new("cr-buildbucket.appspot.com", 42).to_string(), "cr-buildbucket.appspot.com/42");
}

#[test]
fn test_changelists_order_by_host_change_patchset() {
    let mut cls = vec![
        Changelist { host: "host2".into(), change: 100, patchset: 1 },
        Changelist { host: "host1".into(), change: 201, patchset: 2 },
        Changelist { host: "host1".into(), change: 200, patchset: 4 },
        Changelist { host: "host1".into(), change: 200, patchset: 3 },
    ];
    cls.sort();
    let order: Vec<(String, i64, i32)> = cls.into_iter().map(|c| (c.host, c.change, c.patchset)).collect();
    assert_eq!(
        order,
        vec![
            ("host1".to_string(), 200, 3),
            ("host1".to_string(), 200, 4),
            ("host1".to_string(), 201, 2),
            ("host2".to_string(), 100, 1),
        ]
    );
}

#[test]
fn test_contributed_to_submission() {
    let mut p = PresubmitResult {
        presubmit_run_id: PresubmitRunId::cv("chromium", "run"),
        succeeded: true,
        owner: RunOwner::User,
        mode: PresubmitMode::FullRun,
        cls: vec![],
        creation_time: Utc::now(),
        critical: true,
    };
    assert!(p.contributed_to_submission());
    p.mode = PresubmitMode::DryRun;
    assert!(!p.contributed_to_submission());
    p.mode = PresubmitMode::FullRun;
    p.succeeded = false;
    assert!(!p.contributed_to_submission());
}

#[test]
fn test_unexpected_failure_excludes_pass_and_skip() {
    let mut r = TestResult {
        result_id: "r1".into(),
        expected: false,
        status: TestStatus::Fail,
        tags: vec![],
        failure_reason: None,
        start_time: None,
    };
    assert!(r.is_unexpected_failure());
    r.status = TestStatus::Skip;
    assert!(!r.is_unexpected_failure());
    r.status = TestStatus::Fail;
    r.expected = true;
    assert!(!r.is_unexpected_failure());
}

#[test]
fn test_status_strings_round_trip() {
    for st in AnalyzedStatus::ALL {
        assert_eq!(AnalyzedStatus::parse(st.as_str()), Some(st));
    }
    assert_eq!(AnalyzedStatus::parse("UNKNOWN"), None);
}

#[test]
fn test_mode_parses_unknown_as_other() {
    let m: PresubmitMode = serde_json::from_str("\"NEW_PATCHSET_RUN\"").unwrap();
    assert_eq!(m, PresubmitMode::Other);
    let m: PresubmitMode = serde_json::from_str("\"FULL_RUN\"").unwrap();
    assert_eq!(m, PresubmitMode::FullRun);
}

#[test]
fn test_summary_counts() {
    let mut s = JoinSummary::default();
    s.push(BuildId::new("h", 1), JoinOutcome::Written { created: true, task_created: true });
    s.push(BuildId::new("h", 2), JoinOutcome::Duplicate);
    s.push(BuildId::new("h", 3), JoinOutcome::Written { created: true, task_created: false });
    assert_eq!(s.tasks_created(), 1);
    assert_eq!(s.duplicates(), 1);
}

#[test]
fn test_task_payload_kind() {
    let task = IngestionTask::for_entry(
        &BuildResult {
            host: "h".into(),
            id: 1,
            project: "p".into(),
            creation_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        },
        None,
    );
    assert_eq!(TaskPayload::IngestTestResults(task).kind(), "ingest-test-results");
}
