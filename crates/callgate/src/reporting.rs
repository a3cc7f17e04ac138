//! Structured payloads handed to the [`Reporter`](crate::Reporter).
//!
//! These are plain data. Rendering them for humans is the reporter's job.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::sequence::SequenceTag;
use crate::state::ControlState;

/// Where something was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    #[track_caller]
    pub fn caller() -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Unique id of a registered expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExpectationId(Uuid);

impl ExpectationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExpectationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExpectationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceReport {
    pub tag: SequenceTag,
    pub strategy: &'static str,
    pub from: SourceLocation,
}

/// The intercepted call.
#[derive(Debug, Clone, Serialize)]
pub struct CallReport {
    /// Name of the mocked entry point.
    pub target: String,
    /// `Debug` rendering of the call's arguments.
    pub arguments: String,
    pub at: DateTime<Utc>,
}

impl CallReport {
    pub fn new(target: impl Into<String>, call: &impl fmt::Debug) -> Self {
        Self {
            target: target.into(),
            arguments: format!("{call:?}"),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for CallReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call to `{}` with {}", self.target, self.arguments)
    }
}

/// Snapshot of one expectation.
#[derive(Debug, Clone, Serialize)]
pub struct ExpectationReport {
    pub id: ExpectationId,
    pub target: String,
    pub from: SourceLocation,
    pub control: ControlState,
    /// One entry per requirement; `None` for requirements without a description.
    pub requirements: Vec<Option<String>>,
}

impl fmt::Display for ExpectationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expectation {} for `{}` from {} ({})",
            self.id, self.target, self.from, self.control
        )
    }
}

/// Per-requirement verdicts for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequirementOutcomes {
    pub outcomes: Vec<bool>,
}

impl RequirementOutcomes {
    pub fn new(outcomes: Vec<bool>) -> Self {
        Self { outcomes }
    }

    pub fn all_matched(&self) -> bool {
        self.outcomes.iter().all(|matched| *matched)
    }

    /// Indices of the requirements that rejected the call.
    pub fn failures(&self) -> impl Iterator<Item = usize> + '_ {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, matched)| !**matched)
            .map(|(index, _)| index)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NoMatchReport {
    pub expectation: ExpectationReport,
    pub outcomes: RequirementOutcomes,
}
