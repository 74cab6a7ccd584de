use ingest_core::{Error, HandlerOutcome, Result};

/// What the push transport should do with a delivered message or task.
/// The transport retries on anything but 2xx.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Ack(HandlerOutcome),
    /// Permanent failure: acknowledged so it is not redelivered.
    Drop,
    Retry,
}

impl Disposition {
    pub fn for_error(err: &Error) -> Self {
        if err.is_retriable() {
            Disposition::Retry
        } else {
            Disposition::Drop
        }
    }

    pub fn for_result(res: &Result<HandlerOutcome>) -> Self {
        match res {
            Ok(outcome) => Disposition::Ack(*outcome),
            Err(err) => Self::for_error(err),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Disposition::Ack(HandlerOutcome::Processed) => 200,
            Disposition::Ack(HandlerOutcome::Ignored) => 204,
            Disposition::Drop => 202,
            Disposition::Retry => 500,
        }
    }

    /// Value of the `outcome` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack(outcome) => outcome.as_str(),
            Disposition::Drop => "permanent_failure",
            Disposition::Retry => "transient_failure",
        }
    }
}
