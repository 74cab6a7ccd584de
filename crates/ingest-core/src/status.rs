//! Status transition rule for analyzed test variants.

use crate::{
    error::{Error, Result},
    model::{AnalyzedStatus, TestVariantStatus},
};

use AnalyzedStatus::*;

/// (old, derived) -> new. Derived statuses are only ever `Flaky` or
/// `HasUnexpectedResults`. `Flaky` is sticky in both directions;
/// `ConsistentlyUnexpected` absorbs further unexpected results; quiet rows
/// wake up on any new observation.
pub const TRANSITIONS: [(AnalyzedStatus, AnalyzedStatus, AnalyzedStatus); 10] = [
    (Flaky, Flaky, Flaky),
    (Flaky, HasUnexpectedResults, Flaky),
    (ConsistentlyUnexpected, Flaky, Flaky),
    (ConsistentlyUnexpected, HasUnexpectedResults, ConsistentlyUnexpected),
    (HasUnexpectedResults, Flaky, Flaky),
    (HasUnexpectedResults, HasUnexpectedResults, HasUnexpectedResults),
    (ConsistentlyExpected, Flaky, Flaky),
    (ConsistentlyExpected, HasUnexpectedResults, HasUnexpectedResults),
    (NoNewResults, Flaky, Flaky),
    (NoNewResults, HasUnexpectedResults, HasUnexpectedResults),
];

/// Maps the per-variant outcome in one result page to a candidate status.
pub fn derived_status(status: TestVariantStatus) -> Result<AnalyzedStatus> {
    match status {
        TestVariantStatus::Flaky => Ok(Flaky),
        TestVariantStatus::Unexpected | TestVariantStatus::Exonerated => Ok(HasUnexpectedResults),
        other => Err(Error::UnsupportedStatus(format!("{other:?}"))),
    }
}

/// Applies the transition table.
pub fn updated_status(old: AnalyzedStatus, derived: AnalyzedStatus) -> Result<AnalyzedStatus> {
    TRANSITIONS
        .iter()
        .find(|(o, d, _)| *o == old && *d == derived)
        .map(|(_, _, new)| *new)
        .ok_or_else(|| Error::UnsupportedStatus(format!("derived status {derived:?} from {old:?}")))
}
