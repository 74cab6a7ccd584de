use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use ingest_core::{BuildId, IngestionTask, TaskPayload};
use ingest_queue::Disposition;
use ingest_storage::{ControlStore, InMemoryStorage, Outbox};
use serde::Deserialize;
use serde_json::json;

use crate::clients::{FakeRunClient, RunDetail};
use crate::config::ServiceConfig;
use crate::control::NotificationHandler;
use crate::events::{EventNormalizer, PRESUBMIT_TAG};
use crate::metrics::{InMemoryMetrics, CONTROL_DUPLICATES_TOTAL};

const SCENARIO_BUILD_HOST: &str = "cr-buildbucket.appspot.com";

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub project: String,
    pub now: DateTime<Utc>,
    /// Run details served by the fake run service.
    #[serde(default)]
    pub runs: Vec<RunDetail>,
    pub steps: Vec<ScenarioStep>,
}

/// One delivered notification. Exactly one of `build` and `run` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioStep {
    #[serde(default)]
    pub build: Option<BuildStep>,
    /// Run resource name, `projects/{project}/runs/{run_id}`.
    #[serde(default)]
    pub run: Option<String>,
    /// Build ids that must have ingestion tasks after this step.
    #[serde(default)]
    pub expect_tasks: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildStep {
    pub id: i64,
    #[serde(default)]
    pub presubmit: bool,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_build_status")]
    pub status: String,
}

fn default_build_status() -> String {
    "COMPLETED".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ScenarioExpected {
    pub scenario_id: String,
    pub tasks: Vec<ExpectedTask>,
    pub control_entries: usize,
    #[serde(default)]
    pub duplicates: u64,
}

#[derive(Debug, Deserialize)]
pub struct ExpectedTask {
    pub build: i64,
    pub presubmit: bool,
}

#[derive(Debug)]
pub struct ScenarioResult {
    /// Disposition label of each step, in delivery order.
    pub outcomes: Vec<String>,
    pub tasks: Vec<IngestionTask>,
    pub control_entries: usize,
    pub duplicates: u64,
}

impl ScenarioResult {
    pub fn task_builds(&self) -> Vec<i64> {
        self.tasks.iter().filter_map(|t| t.build.as_ref().map(|b| b.id)).collect()
    }
}

pub fn load_scenario(dir: &Path) -> Result<Scenario> {
    let p = dir.join("scenario.yaml");
    let s = std::fs::read_to_string(&p).with_context(|| format!("read scenario.yaml: {}", p.display()))?;
    let sc: Scenario = serde_yaml::from_str(&s).with_context(|| "parse scenario.yaml")?;
    Ok(sc)
}

pub fn load_expected(dir: &Path) -> Result<ScenarioExpected> {
    let p = dir.join("expected.yaml");
    let s = std::fs::read_to_string(&p).with_context(|| format!("read expected.yaml: {}", p.display()))?;
    let exp: ScenarioExpected = serde_yaml::from_str(&s).with_context(|| "parse expected.yaml")?;
    Ok(exp)
}

pub fn simulate(dir: &Path) -> Result<ScenarioResult> {
    let sc = load_scenario(dir)?;
    replay(&sc, &sc.steps)
}

fn build_body(sc: &Scenario, b: &BuildStep) -> Vec<u8> {
    let project = b.project.as_deref().unwrap_or(&sc.project);
    let mut tags = vec![format!("builder:{project}-builder")];
    if b.presubmit {
        tags.push(PRESUBMIT_TAG.to_string());
    }
    let created = sc.now - Duration::hours(1);
    json!({
        "build": {
            "project": project,
            "bucket": format!("luci.{project}.ci"),
            "id": b.id.to_string(),
            "status": b.status,
            "created_ts": created.timestamp_micros().to_string(),
            "tags": tags,
        },
        "hostname": SCENARIO_BUILD_HOST,
    })
    .to_string()
    .into_bytes()
}

fn ingestion_tasks(storage: &InMemoryStorage) -> Result<Vec<IngestionTask>> {
    Ok(storage
        .list_tasks()?
        .into_iter()
        .filter_map(|t| match t.payload {
            TaskPayload::IngestTestResults(task) => Some(task),
            _ => None,
        })
        .collect())
}

/// Delivers `steps` in order against a fresh in-memory store, checking each
/// step's `expect_tasks` along the way.
pub fn replay(sc: &Scenario, steps: &[ScenarioStep]) -> Result<ScenarioResult> {
    let storage = Arc::new(InMemoryStorage::new());
    let runs = Arc::new(FakeRunClient::new());
    for r in &sc.runs {
        runs.insert(r.clone());
    }
    let metrics = Arc::new(InMemoryMetrics::new());
    let normalizer = EventNormalizer::from_config(&ServiceConfig::default_for(&sc.project))?;
    let handler = NotificationHandler::new(storage.clone(), normalizer, runs, metrics.clone());

    let mut outcomes = Vec::with_capacity(steps.len());
    let mut build_ids = BTreeSet::new();
    for (i, step) in steps.iter().enumerate() {
        let res = match (&step.build, &step.run) {
            (Some(b), None) => {
                build_ids.insert(BuildId::new(SCENARIO_BUILD_HOST, b.id));
                handler.handle_build(&build_body(sc, b), sc.now)
            }
            (None, Some(run)) => {
                let body = json!({"run_id": run, "status": "SUCCEEDED", "hostname": "luci-change-verifier.appspot.com"});
                handler.handle_run(body.to_string().as_bytes(), sc.now)
            }
            _ => return Err(anyhow!("step {i}: exactly one of build and run must be set")),
        };
        outcomes.push(Disposition::for_result(&res).as_str().to_string());

        if let Some(expect) = &step.expect_tasks {
            let mut got: Vec<i64> = ingestion_tasks(&storage)?
                .iter()
                .filter_map(|t| t.build.as_ref().map(|b| b.id))
                .collect();
            got.sort_unstable();
            let mut want = expect.clone();
            want.sort_unstable();
            if got != want {
                return Err(anyhow!("step {i}: expected tasks for {want:?}, found {got:?}"));
            }
        }
    }

    for r in &sc.runs {
        for job in &r.tryjobs {
            if let Some(b) = job.result.as_ref().and_then(|r| r.build.as_ref()) {
                let host = b.host.clone().unwrap_or_else(|| SCENARIO_BUILD_HOST.to_string());
                build_ids.insert(BuildId::new(host, b.id));
            }
        }
    }
    let ids: Vec<BuildId> = build_ids.into_iter().collect();
    let control_entries = storage.read_entries(&ids)?.iter().filter(|e| e.is_some()).count();

    let duplicates = metrics.get(CONTROL_DUPLICATES_TOTAL, &[("kind", "build")])
        + metrics.get(CONTROL_DUPLICATES_TOTAL, &[("kind", "presubmit")]);
    Ok(ScenarioResult {
        outcomes,
        tasks: ingestion_tasks(&storage)?,
        control_entries,
        duplicates,
    })
}
