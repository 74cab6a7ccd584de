//! Two-source join of build and presubmit facts.
//!
//! The merge is commutative: applying a build fact and a presubmit fact in
//! either order, any number of times, yields the same state, and the state
//! crosses into "ready" exactly once. Storage backends run [`plan_join`]
//! inside their transaction and persist whatever it returns.

use chrono::{DateTime, Utc};

use crate::{
    error::{Error, Result},
    ids::BuildId,
    types::{BuildResult, ControlEntry, IngestionTask, PresubmitResult},
};

/// The join-relevant part of a control entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinState {
    pub is_presubmit: bool,
    pub build_result: Option<BuildResult>,
    pub presubmit_result: Option<PresubmitResult>,
}

impl JoinState {
    pub fn empty(is_presubmit: bool) -> Self {
        Self {
            is_presubmit,
            build_result: None,
            presubmit_result: None,
        }
    }

    pub fn of(entry: &ControlEntry) -> Self {
        Self {
            is_presubmit: entry.is_presubmit,
            build_result: entry.build_result.clone(),
            presubmit_result: entry.presubmit_result.clone(),
        }
    }
}

/// A single fact arriving from one of the two event sources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinFact {
    Build { is_presubmit: bool, result: BuildResult },
    Presubmit(PresubmitResult),
}

impl JoinFact {
    /// Presubmit facts only ever concern presubmit builds.
    pub fn is_presubmit(&self) -> bool {
        match self {
            JoinFact::Build { is_presubmit, .. } => *is_presubmit,
            JoinFact::Presubmit(_) => true,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JoinFact::Build { .. } => "build",
            JoinFact::Presubmit(_) => "presubmit",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Merge {
    /// The fact was already present; nothing changes.
    Duplicate,
    Applied(JoinState),
}

/// Ingestion may start once the build result is known and, for presubmit
/// builds, the presubmit result too.
pub fn is_ready(state: &JoinState) -> bool {
    state.build_result.is_some() && (!state.is_presubmit || state.presubmit_result.is_some())
}

/// Merges `fact` into `state`. A field that is already set is never
/// overwritten; disagreement on `is_presubmit` is an inconsistency.
pub fn merge(build: &BuildId, state: Option<&JoinState>, fact: &JoinFact) -> Result<Merge> {
    let mut next = match state {
        Some(existing) => {
            if existing.is_presubmit != fact.is_presubmit() {
                return Err(Error::Inconsistent {
                    build: build.clone(),
                    reason: format!(
                        "stored is_presubmit={} but {} fact says is_presubmit={}",
                        existing.is_presubmit,
                        fact.kind(),
                        fact.is_presubmit()
                    ),
                });
            }
            existing.clone()
        }
        None => JoinState::empty(fact.is_presubmit()),
    };

    match fact {
        JoinFact::Build { result, .. } => {
            if next.build_result.is_some() {
                return Ok(Merge::Duplicate);
            }
            next.build_result = Some(result.clone());
        }
        JoinFact::Presubmit(result) => {
            if next.presubmit_result.is_some() {
                return Ok(Merge::Duplicate);
            }
            next.presubmit_result = Some(result.clone());
        }
    }
    Ok(Merge::Applied(next))
}

/// What a backend must persist for one build identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinPlan {
    Duplicate,
    Write {
        entry: ControlEntry,
        created: bool,
        task: Option<IngestionTask>,
    },
}

/// Plans the write for `fact` against the currently stored entry.
///
/// The task is emitted only on the transition from not-ready to ready, so a
/// backend that applies the plan atomically creates at most one task per
/// entry, ever.
pub fn plan_join(
    project: &str,
    build: &BuildId,
    existing: Option<&ControlEntry>,
    fact: &JoinFact,
    now: DateTime<Utc>,
) -> Result<JoinPlan> {
    let before = existing.map(JoinState::of);
    let after = match merge(build, before.as_ref(), fact)? {
        Merge::Duplicate => return Ok(JoinPlan::Duplicate),
        Merge::Applied(state) => state,
    };

    let was_ready = before.as_ref().map(is_ready).unwrap_or(false);
    let task = if !was_ready && is_ready(&after) {
        after
            .build_result
            .as_ref()
            .map(|b| IngestionTask::for_entry(b, after.presubmit_result.as_ref()))
    } else {
        None
    };

    // The build event is authoritative for the project the results belong to.
    let project = match fact {
        JoinFact::Build { result, .. } => result.project.clone(),
        JoinFact::Presubmit(_) => existing
            .map(|e| e.project.clone())
            .unwrap_or_else(|| project.to_string()),
    };

    let entry = ControlEntry {
        project,
        build_id: build.clone(),
        is_presubmit: after.is_presubmit,
        build_result: after.build_result,
        presubmit_result: after.presubmit_result,
        created_at: existing.map(|e| e.created_at).unwrap_or(now),
        updated_at: now,
    };
    Ok(JoinPlan::Write {
        entry,
        created: existing.is_none(),
        task,
    })
}
