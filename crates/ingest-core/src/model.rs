use serde::{Deserialize, Serialize};

/// Presubmit run mode. Only full runs can submit a change.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresubmitMode {
    FullRun,
    DryRun,
    QuickDryRun,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunOwner {
    User,
    Automation,
}

/// Terminal status of a presubmit run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
    #[serde(other)]
    Other,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Success,
    Failure,
    InfraFailure,
    Canceled,
    #[serde(other)]
    Other,
}

/// Per-variant outcome reported by the results service for one invocation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestVariantStatus {
    Unexpected,
    UnexpectedlySkipped,
    Flaky,
    Exonerated,
    Expected,
    #[serde(other)]
    Unspecified,
}

/// Status of a single test result.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Crash,
    Abort,
    Skip,
    #[serde(other)]
    Unspecified,
}

/// Aggregate status of one (realm, test, variant) across ingestions.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalyzedStatus {
    ConsistentlyExpected,
    ConsistentlyUnexpected,
    HasUnexpectedResults,
    Flaky,
    NoNewResults,
}

impl AnalyzedStatus {
    pub const ALL: [AnalyzedStatus; 5] = [
        AnalyzedStatus::ConsistentlyExpected,
        AnalyzedStatus::ConsistentlyUnexpected,
        AnalyzedStatus::HasUnexpectedResults,
        AnalyzedStatus::Flaky,
        AnalyzedStatus::NoNewResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyzedStatus::ConsistentlyExpected => "CONSISTENTLY_EXPECTED",
            AnalyzedStatus::ConsistentlyUnexpected => "CONSISTENTLY_UNEXPECTED",
            AnalyzedStatus::HasUnexpectedResults => "HAS_UNEXPECTED_RESULTS",
            AnalyzedStatus::Flaky => "FLAKY",
            AnalyzedStatus::NoNewResults => "NO_NEW_RESULTS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }
}
