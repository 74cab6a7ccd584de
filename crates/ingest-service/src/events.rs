//! Normalizes raw build and run notifications into canonical events.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ingest_core::{
    BuildId, BuildResult, Changelist, Error, PresubmitMode, PresubmitResult, PresubmitRunId, Result, RunOwner,
    RunStatus,
};
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::clients::{RunClient, RunDetail};
use crate::config::ServiceConfig;

/// Build tag marking a commit-queue triggered build.
pub const PRESUBMIT_TAG: &str = "user_agent:cq";

const STATUS_COMPLETED: &str = "COMPLETED";

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

impl IntOrString {
    fn into_i64<E: serde::de::Error>(self) -> std::result::Result<i64, E> {
        match self {
            IntOrString::Int(v) => Ok(v),
            IntOrString::Str(s) => s.parse().map_err(|_| E::custom(format!("invalid integer {s:?}"))),
        }
    }
}

// The legacy build record encodes int64 fields as JSON strings.
fn de_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    IntOrString::deserialize(d)?.into_i64()
}

fn de_opt_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<i64>, D::Error> {
    Option::<IntOrString>::deserialize(d)?.map(IntOrString::into_i64).transpose()
}

#[derive(Clone, Debug, Deserialize)]
pub struct LegacyBuild {
    pub project: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(deserialize_with = "de_i64")]
    pub id: i64,
    pub status: String,
    /// Microseconds since the epoch.
    #[serde(default, deserialize_with = "de_opt_i64")]
    pub created_ts: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BuildMessage {
    pub build: LegacyBuild,
    #[serde(default)]
    pub hostname: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RunMessage {
    /// `projects/{project}/runs/{run_id}`
    pub run_id: String,
    pub status: RunStatus,
    pub hostname: String,
}

/// A decoded notification from either source.
#[derive(Clone, Debug)]
pub enum InboundMessage {
    BuildCompleted(BuildMessage),
    RunEnded(RunMessage),
}

impl InboundMessage {
    pub fn decode_build(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map(InboundMessage::BuildCompleted)
            .map_err(|e| Error::Malformed(format!("build notification: {e}")))
    }

    pub fn decode_run(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map(InboundMessage::RunEnded)
            .map_err(|e| Error::Malformed(format!("run notification: {e}")))
    }

    pub fn source(&self) -> &'static str {
        match self {
            InboundMessage::BuildCompleted(_) => "build",
            InboundMessage::RunEnded(_) => "run",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildCompletionEvent {
    pub project: String,
    pub build_id: BuildId,
    pub is_presubmit: bool,
    pub result: BuildResult,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresubmitCompletionEvent {
    pub project: String,
    pub run_id: PresubmitRunId,
    /// One result per try-job build, each carrying that job's criticality.
    pub results: Vec<(BuildId, PresubmitResult)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NotCompleted,
    NotEnrolled,
    ExcludedProject,
    NotFullRun,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotCompleted => "not_completed",
            SkipReason::NotEnrolled => "not_enrolled",
            SkipReason::ExcludedProject => "excluded_project",
            SkipReason::NotFullRun => "not_full_run",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Normalized<T> {
    Event(T),
    Skip(SkipReason),
}

pub struct EventNormalizer {
    enrolled: BTreeSet<String>,
    excluded: Vec<Regex>,
    automation: Vec<Regex>,
    default_build_host: String,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::InvalidArgument(format!("pattern {p:?}: {e}"))))
        .collect()
}

/// Splits `projects/{project}/runs/{run_id}`.
pub fn parse_run_name(name: &str) -> Result<(&str, &str)> {
    match name.split('/').collect::<Vec<_>>().as_slice() {
        ["projects", project, "runs", run] if !project.is_empty() && !run.is_empty() => Ok((*project, *run)),
        _ => Err(Error::Malformed(format!("run id {name:?} is not of the form projects/{{project}}/runs/{{run_id}}"))),
    }
}

impl EventNormalizer {
    pub fn from_config(cfg: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            enrolled: cfg.projects.keys().cloned().collect(),
            excluded: compile(&cfg.excluded_project_patterns)?,
            automation: compile(&cfg.automation_owner_patterns)?,
            default_build_host: cfg.build_host.clone(),
        })
    }

    pub fn is_enrolled(&self, project: &str) -> bool {
        self.enrolled.contains(project)
    }

    pub fn owner_of(&self, account: &str) -> RunOwner {
        if self.automation.iter().any(|re| re.is_match(account)) {
            RunOwner::Automation
        } else {
            RunOwner::User
        }
    }

    pub fn normalize_build(&self, msg: &BuildMessage) -> Result<Normalized<BuildCompletionEvent>> {
        let b = &msg.build;
        if b.status != STATUS_COMPLETED {
            return Ok(Normalized::Skip(SkipReason::NotCompleted));
        }
        let created_ts = b
            .created_ts
            .ok_or_else(|| Error::Malformed(format!("build {} has no creation timestamp", b.id)))?;
        let creation_time = DateTime::<Utc>::from_timestamp_micros(created_ts)
            .ok_or_else(|| Error::Malformed(format!("build {} creation timestamp {created_ts} out of range", b.id)))?;
        if !self.is_enrolled(&b.project) {
            return Ok(Normalized::Skip(SkipReason::NotEnrolled));
        }
        if self.excluded.iter().any(|re| re.is_match(&b.project)) {
            return Ok(Normalized::Skip(SkipReason::ExcludedProject));
        }

        let host = if msg.hostname.is_empty() {
            self.default_build_host.clone()
        } else {
            msg.hostname.clone()
        };
        let result = BuildResult {
            host,
            id: b.id,
            project: b.project.clone(),
            creation_time,
        };
        Ok(Normalized::Event(BuildCompletionEvent {
            project: b.project.clone(),
            build_id: result.build_id(),
            is_presubmit: b.tags.iter().any(|t| t == PRESUBMIT_TAG),
            result,
        }))
    }

    /// Fetches the run behind `msg` and normalizes it. The run is only fetched
    /// for enrolled projects.
    pub fn normalize_run(
        &self,
        msg: &RunMessage,
        runs: &dyn RunClient,
    ) -> Result<Normalized<PresubmitCompletionEvent>> {
        let (project, _) = parse_run_name(&msg.run_id)?;
        if !self.is_enrolled(project) {
            return Ok(Normalized::Skip(SkipReason::NotEnrolled));
        }
        let run = runs.get_run(&msg.hostname, &msg.run_id)?;
        self.normalize_run_detail(&run)
    }

    pub fn normalize_run_detail(&self, run: &RunDetail) -> Result<Normalized<PresubmitCompletionEvent>> {
        let (project, run_id) = parse_run_name(&run.id)?;
        if !self.is_enrolled(project) {
            return Ok(Normalized::Skip(SkipReason::NotEnrolled));
        }
        if run.mode != PresubmitMode::FullRun {
            return Ok(Normalized::Skip(SkipReason::NotFullRun));
        }

        let cls: Vec<Changelist> = run.cls.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let base = PresubmitResult {
            presubmit_run_id: PresubmitRunId::cv(project, run_id),
            succeeded: run.status == RunStatus::Succeeded,
            owner: self.owner_of(&run.owner),
            mode: run.mode,
            cls,
            creation_time: run.create_time,
            critical: false,
        };

        let mut results = Vec::with_capacity(run.tryjobs.len());
        let mut seen = BTreeSet::new();
        for job in &run.tryjobs {
            if job.reuse {
                continue;
            }
            let Some(build) = job.result.as_ref().and_then(|r| r.build.as_ref()) else {
                continue;
            };
            let host = build.host.clone().unwrap_or_else(|| self.default_build_host.clone());
            let id = BuildId::new(host, build.id);
            if !seen.insert(id.clone()) {
                continue;
            }
            let mut result = base.clone();
            result.critical = job.critical;
            results.push((id, result));
        }

        Ok(Normalized::Event(PresubmitCompletionEvent {
            project: project.to_string(),
            run_id: base.presubmit_run_id,
            results,
        }))
    }
}
