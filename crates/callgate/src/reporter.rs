//! Reporting backend.
//!
//! The engine never decides on its own whether a failed call fails the test;
//! it hands a classification plus structured payloads to a [`Reporter`].
//! Failed dispatches additionally come back as [`DispatchError`](crate::DispatchError),
//! so a reporter that only logs still lets the caller observe the failure.
//!
//! Reporters are passed explicitly to collections and sequences. There is no
//! process-wide reporter.

use std::fmt;

use crate::reporting::{CallReport, ExpectationReport, NoMatchReport, SequenceReport};

pub trait Reporter: Send + Sync {
    /// A call was dispatched to `expectation`. Informational.
    ///
    /// Only invoked when [`Settings::report_success`](crate::Settings) is set.
    fn report_full_match(&self, call: &CallReport, expectation: &ExpectationReport);

    /// The call matched only saturated or sequence-blocked expectations.
    fn report_no_applicable_match(&self, call: &CallReport, blocked: &[ExpectationReport]);

    /// No expectation accepted the call's arguments.
    fn report_no_match(&self, call: &CallReport, rejected: &[NoMatchReport]);

    /// An expectation was released before it was satisfied.
    fn report_unfulfilled_expectation(&self, expectation: &ExpectationReport);

    /// A sequence was released while `satisfied < total`.
    fn report_unfulfilled_sequence(
        &self,
        sequence: &SequenceReport,
        satisfied: usize,
        total: usize,
    );

    /// User code failed while one candidate was evaluated or consumed.
    /// The candidate was excluded and dispatch went on. Informational.
    fn report_unhandled_exception(
        &self,
        call: &CallReport,
        expectation: &ExpectationReport,
        error: &anyhow::Error,
    );
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

/// Logs every event through `tracing`. Never panics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report_full_match(&self, call: &CallReport, expectation: &ExpectationReport) {
        tracing::info!(
            mock = %call.target,
            arguments = %call.arguments,
            expectation = %expectation.id,
            "call matched"
        );
    }

    fn report_no_applicable_match(&self, call: &CallReport, blocked: &[ExpectationReport]) {
        tracing::error!(
            mock = %call.target,
            arguments = %call.arguments,
            blocked = %to_json(&blocked),
            "no applicable expectation for call"
        );
    }

    fn report_no_match(&self, call: &CallReport, rejected: &[NoMatchReport]) {
        tracing::error!(
            mock = %call.target,
            arguments = %call.arguments,
            rejected = %to_json(&rejected),
            "no matching expectation for call"
        );
    }

    fn report_unfulfilled_expectation(&self, expectation: &ExpectationReport) {
        tracing::error!(
            expectation = %expectation.id,
            mock = %expectation.target,
            from = %expectation.from,
            state = %expectation.control,
            "unfulfilled expectation"
        );
    }

    fn report_unfulfilled_sequence(
        &self,
        sequence: &SequenceReport,
        satisfied: usize,
        total: usize,
    ) {
        tracing::error!(
            sequence = %sequence.tag,
            from = %sequence.from,
            satisfied,
            total,
            "unfulfilled sequence"
        );
    }

    fn report_unhandled_exception(
        &self,
        call: &CallReport,
        expectation: &ExpectationReport,
        error: &anyhow::Error,
    ) {
        tracing::warn!(
            mock = %call.target,
            expectation = %expectation.id,
            error = %format!("{error:#}"),
            "unhandled error while matching expectation"
        );
    }
}

/// Turns failures into panics, which the test harness reports as failed
/// tests.
///
/// Lifecycle failures do not panic while the thread is already unwinding, so
/// the original failure is not masked by a double panic.
#[derive(Default)]
pub struct PanicReporter {
    inner: TracingReporter,
}

impl PanicReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn fail(&self, message: fmt::Arguments<'_>) {
        if std::thread::panicking() {
            tracing::error!("{message} (suppressed while unwinding)");
            return;
        }
        panic!("{message}");
    }
}

impl Reporter for PanicReporter {
    fn report_full_match(&self, call: &CallReport, expectation: &ExpectationReport) {
        debug_assert!(
            expectation.control.is_available(),
            "full match reported for an unavailable expectation"
        );
        self.inner.report_full_match(call, expectation);
    }

    fn report_no_applicable_match(&self, call: &CallReport, blocked: &[ExpectationReport]) {
        self.inner.report_no_applicable_match(call, blocked);
        let details: Vec<String> = blocked.iter().map(ToString::to_string).collect();
        self.fail(format_args!(
            "no applicable expectation for {call}; blocked:\n  {}",
            details.join("\n  ")
        ));
    }

    fn report_no_match(&self, call: &CallReport, rejected: &[NoMatchReport]) {
        self.inner.report_no_match(call, rejected);
        let details: Vec<String> = rejected
            .iter()
            .map(|report| {
                let failed: Vec<String> = report
                    .outcomes
                    .failures()
                    .map(|index| {
                        report
                            .expectation
                            .requirements
                            .get(index)
                            .cloned()
                            .flatten()
                            .unwrap_or_else(|| format!("requirement #{index}"))
                    })
                    .collect();
                format!("{} rejected by: {}", report.expectation, failed.join(", "))
            })
            .collect();
        self.fail(format_args!(
            "no matching expectation for {call}; candidates:\n  {}",
            details.join("\n  ")
        ));
    }

    fn report_unfulfilled_expectation(&self, expectation: &ExpectationReport) {
        self.inner.report_unfulfilled_expectation(expectation);
        self.fail(format_args!("unfulfilled {expectation}"));
    }

    fn report_unfulfilled_sequence(
        &self,
        sequence: &SequenceReport,
        satisfied: usize,
        total: usize,
    ) {
        self.inner
            .report_unfulfilled_sequence(sequence, satisfied, total);
        self.fail(format_args!(
            "unfulfilled sequence from {}: {satisfied} out of {total} expectation(s) are satisfied",
            sequence.from
        ));
    }

    fn report_unhandled_exception(
        &self,
        call: &CallReport,
        expectation: &ExpectationReport,
        error: &anyhow::Error,
    ) {
        self.inner
            .report_unhandled_exception(call, expectation, error);
    }
}
