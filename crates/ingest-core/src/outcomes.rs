use crate::ids::BuildId;

/// Result of joining one fact into one control entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The entry was written; `task_created` says whether it became ready.
    Written { created: bool, task_created: bool },
    /// The fact was already present and was dropped.
    Duplicate,
}

impl JoinOutcome {
    pub fn task_created(&self) -> bool {
        matches!(self, JoinOutcome::Written { task_created: true, .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinReport {
    pub build_id: BuildId,
    pub outcome: JoinOutcome,
}

/// Per-build outcomes of one join call, in request order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinSummary {
    pub reports: Vec<JoinReport>,
}

impl JoinSummary {
    pub fn push(&mut self, build_id: BuildId, outcome: JoinOutcome) {
        self.reports.push(JoinReport { build_id, outcome });
    }

    pub fn tasks_created(&self) -> usize {
        self.reports.iter().filter(|r| r.outcome.task_created()).count()
    }

    pub fn duplicates(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.outcome == JoinOutcome::Duplicate)
            .count()
    }
}

/// How a notification handler disposed of its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Processed,
    Ignored,
}

impl HandlerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerOutcome::Processed => "processed",
            HandlerOutcome::Ignored => "ignored",
        }
    }
}
