//! Error types for configuration, dispatch, and lifecycle failures.
//!
//! Contract violations inside the engine (consuming a slot that is not the
//! head of its sequence, consuming a policy that is not applicable) are not
//! represented here. Those are programmer errors and fail with `assert!`.

use thiserror::Error;

use crate::reporting::{CallReport, ExpectationReport, NoMatchReport};
use crate::sequence::SequenceTag;

/// Malformed configuration, raised synchronously at construction time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `max < min`.
    #[error("invalid times: min ({min}) must be less than or equal to max ({max})")]
    InvalidTimes { min: u32, max: u32 },

    /// A bound given through the untyped entry point was negative.
    #[error("invalid times: bounds must not be negative (min = {min}, max = {max})")]
    NegativeBound { min: i64, max: i64 },

    /// A bound does not fit into the engine's count type.
    #[error("invalid times: bound {0} is out of range")]
    BoundOutOfRange(i64),

    /// A sequence slot was requested with a required count of zero.
    #[error("sequence slots must require at least one consumption")]
    ZeroSlot,

    /// The same sequence was attached to one expectation more than once.
    #[error("expectation is attached to sequence {tag} more than once")]
    DuplicateSequence { tag: SequenceTag },
}

/// A call that could not be dispatched to any expectation.
///
/// Returned by [`ExpectationCollection::handle_call`](crate::ExpectationCollection::handle_call)
/// after the reporter has been notified.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// No expectation accepted the call's arguments.
    #[error("no matching expectation for {call} ({} candidate(s) rejected)", .reports.len())]
    NoMatch {
        call: CallReport,
        reports: Vec<NoMatchReport>,
    },

    /// At least one expectation accepted the arguments, but all of them were
    /// saturated or blocked by a sequence.
    #[error("no applicable expectation for {call} ({} candidate(s) blocked)", .reports.len())]
    NoApplicableMatch {
        call: CallReport,
        reports: Vec<ExpectationReport>,
    },
}

impl DispatchError {
    /// The call that failed.
    pub fn call(&self) -> &CallReport {
        match self {
            Self::NoMatch { call, .. } | Self::NoApplicableMatch { call, .. } => call,
        }
    }
}

/// An object reached the end of its life without being fulfilled.
#[derive(Error, Debug, Clone)]
pub enum LifecycleError {
    #[error("unfulfilled sequence {tag}: {satisfied} out of {total} expectation(s) are satisfied")]
    UnfulfilledSequence {
        tag: SequenceTag,
        satisfied: usize,
        total: usize,
    },

    #[error("unfulfilled expectation for `{}`: {}", .report.target, .report.control)]
    UnfulfilledExpectation { report: ExpectationReport },
}
