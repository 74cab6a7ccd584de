//! External collaborators: the build service, the presubmit (run) service
//! and the results service, plus in-memory fakes.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use ingest_core::{BuildStatus, Changelist, Error, PresubmitMode, Result, RunStatus, TestVariant};
use serde::{Deserialize, Serialize};

/// Fields requested when fetching a build.
pub const BUILD_FIELD_MASK: [&str; 3] = ["builder", "infra.resultdb", "status"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsRef {
    pub hostname: String,
    /// Empty when the build has no results invocation.
    #[serde(default)]
    pub invocation: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDetail {
    pub project: String,
    pub builder: String,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ResultsRef>,
}

pub trait BuildClient: Send + Sync {
    /// `Ok(None)` if the build does not exist or is not visible.
    fn get_build(&self, host: &str, id: i64, fields: &[&str]) -> Result<Option<BuildDetail>>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryjobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tryjob {
    #[serde(default)]
    pub reuse: bool,
    #[serde(default)]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TryjobResult>,
}

/// Full detail of a presubmit run, as served by the run service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDetail {
    /// `projects/{project}/runs/{run_id}`
    pub id: String,
    pub mode: PresubmitMode,
    pub status: RunStatus,
    pub create_time: DateTime<Utc>,
    pub owner: String,
    #[serde(default)]
    pub cls: Vec<Changelist>,
    #[serde(default)]
    pub tryjobs: Vec<Tryjob>,
}

pub trait RunClient: Send + Sync {
    fn get_run(&self, host: &str, name: &str) -> Result<RunDetail>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub name: String,
    pub realm: String,
}

/// Query over the unexpected and flaky test variants of one invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestVariantQuery {
    pub invocation: String,
    pub page_size: usize,
    pub page_token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestVariantPage {
    pub variants: Vec<TestVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

pub trait ResultsClient: Send + Sync {
    /// `Ok(None)` if the invocation does not exist.
    fn get_invocation(&self, host: &str, name: &str) -> Result<Option<Invocation>>;
    fn query_test_variants(&self, host: &str, query: &TestVariantQuery) -> Result<TestVariantPage>;
}

#[derive(Debug, Default)]
pub struct FakeBuildClient {
    builds: Mutex<HashMap<(String, i64), BuildDetail>>,
    requests: Mutex<Vec<(String, i64, Vec<String>)>>,
}

impl FakeBuildClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, id: i64, build: BuildDetail) {
        if let Ok(mut builds) = self.builds.lock() {
            builds.insert((host.to_string(), id), build);
        }
    }

    /// Every `(host, id, fields)` requested so far.
    pub fn requests(&self) -> Vec<(String, i64, Vec<String>)> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl BuildClient for FakeBuildClient {
    fn get_build(&self, host: &str, id: i64, fields: &[&str]) -> Result<Option<BuildDetail>> {
        if let Ok(mut r) = self.requests.lock() {
            r.push((host.to_string(), id, fields.iter().map(|f| f.to_string()).collect()));
        }
        let builds = self
            .builds
            .lock()
            .map_err(|_| Error::Transient("fake build client poisoned".into()))?;
        Ok(builds.get(&(host.to_string(), id)).cloned())
    }
}

#[derive(Debug, Default)]
pub struct FakeRunClient {
    runs: Mutex<HashMap<String, RunDetail>>,
}

impl FakeRunClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: RunDetail) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(run.id.clone(), run);
        }
    }
}

impl RunClient for FakeRunClient {
    fn get_run(&self, _host: &str, name: &str) -> Result<RunDetail> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| Error::Transient("fake run client poisoned".into()))?;
        runs.get(name)
            .cloned()
            .ok_or_else(|| Error::Transient(format!("run {name} not available yet")))
    }
}

/// Serves invocations and fixed pages of variants. Page `n` is requested with
/// token `page-n`.
#[derive(Debug, Default)]
pub struct FakeResultsClient {
    invocations: Mutex<HashMap<String, Invocation>>,
    pages: Mutex<HashMap<String, Vec<Vec<TestVariant>>>>,
    queries: Mutex<Vec<TestVariantQuery>>,
}

impl FakeResultsClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_invocation(&self, inv: Invocation, pages: Vec<Vec<TestVariant>>) {
        if let Ok(mut p) = self.pages.lock() {
            p.insert(inv.name.clone(), pages);
        }
        if let Ok(mut i) = self.invocations.lock() {
            i.insert(inv.name.clone(), inv);
        }
    }

    pub fn queries(&self) -> Vec<TestVariantQuery> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

impl ResultsClient for FakeResultsClient {
    fn get_invocation(&self, _host: &str, name: &str) -> Result<Option<Invocation>> {
        let invs = self
            .invocations
            .lock()
            .map_err(|_| Error::Transient("fake results client poisoned".into()))?;
        Ok(invs.get(name).cloned())
    }

    fn query_test_variants(&self, _host: &str, query: &TestVariantQuery) -> Result<TestVariantPage> {
        if let Ok(mut q) = self.queries.lock() {
            q.push(query.clone());
        }
        let pages = self
            .pages
            .lock()
            .map_err(|_| Error::Transient("fake results client poisoned".into()))?;
        let all = pages.get(&query.invocation).cloned().unwrap_or_default();
        let index = match &query.page_token {
            None => 0,
            Some(t) => t
                .strip_prefix("page-")
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| Error::InvalidArgument(format!("bad page token {t:?}")))?,
        };
        let variants = all.get(index).cloned().unwrap_or_default();
        let next_page_token = (index + 1 < all.len()).then(|| format!("page-{}", index + 1));
        Ok(TestVariantPage { variants, next_page_token })
    }
}

/// Canned collaborator responses for running one ingestion task offline.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IngestFixture {
    #[serde(default)]
    pub build: Option<BuildDetail>,
    #[serde(default)]
    pub invocation: Option<Invocation>,
    #[serde(default)]
    pub pages: Vec<Vec<TestVariant>>,
}

impl IngestFixture {
    /// Loads the fixture into fakes answering for build `host/id`.
    pub fn into_fakes(self, host: &str, id: i64) -> (FakeBuildClient, FakeResultsClient) {
        let builds = FakeBuildClient::new();
        let results = FakeResultsClient::new();
        if let Some(b) = self.build {
            builds.insert(host, id, b);
        }
        if let Some(inv) = self.invocation {
            results.insert_invocation(inv, self.pages);
        }
        (builds, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::TestVariantStatus;
    use std::collections::BTreeMap;

    fn variant(test_id: &str) -> TestVariant {
        TestVariant {
            test_id: test_id.into(),
            variant_hash: "hash".into(),
            variant: BTreeMap::new(),
            status: TestVariantStatus::Unexpected,
            results: vec![],
            exonerations: vec![],
            test_metadata: None,
        }
    }

    #[test]
    fn fake_results_pages_by_token() {
        let c = FakeResultsClient::new();
        c.insert_invocation(
            Invocation { name: "invocations/build-1".into(), realm: "chromium:ci".into() },
            vec![vec![variant("a")], vec![variant("b")]],
        );
        let mut q = TestVariantQuery { invocation: "invocations/build-1".into(), page_size: 1000, page_token: None };
        let first = c.query_test_variants("results", &q).unwrap();
        assert_eq!(first.next_page_token.as_deref(), Some("page-1"));
        q.page_token = first.next_page_token;
        let second = c.query_test_variants("results", &q).unwrap();
        assert_eq!(second.variants[0].test_id, "b");
        assert!(second.next_page_token.is_none());
    }

    #[test]
    fn run_detail_parses_tryjobs() {
        let run: RunDetail = serde_json::from_str(
            r#"{
                "id": "projects/chromium/runs/8000-1-abcd",
                "mode": "FULL_RUN",
                "status": "SUCCEEDED",
                "create_time": "2025-01-01T12:00:00Z",
                "owner": "dev@chromium.org",
                "cls": [{"host": "chromium-review.googlesource.com", "change": 1, "patchset": 2}],
                "tryjobs": [
                    {"critical": true, "result": {"build": {"id": 11}}},
                    {"reuse": true, "result": {"build": {"id": 12}}},
                    {"critical": false}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(run.mode, PresubmitMode::FullRun);
        assert_eq!(run.tryjobs.len(), 3);
        assert!(run.tryjobs[1].reuse);
        assert!(run.tryjobs[2].result.is_none());
    }
}
