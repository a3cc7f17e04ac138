//! Per-collection settings.

use serde::{Deserialize, Serialize};

/// Behavior switches of an [`ExpectationCollection`](crate::ExpectationCollection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Forward successful dispatches to
    /// [`Reporter::report_full_match`](crate::Reporter::report_full_match).
    pub report_success: bool,

    /// Isolate panics raised by user code (requirements, side effects) to the
    /// candidate that raised them. When disabled, such panics unwind through
    /// `handle_call`.
    pub catch_panics: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            report_success: false,
            catch_panics: true,
        }
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_report_success(mut self, enabled: bool) -> Self {
        self.report_success = enabled;
        self
    }

    pub fn with_catch_panics(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }
}
