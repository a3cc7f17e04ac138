//! Testing utilities for callgate.
//!
//! - [`RecordingReporter`] captures every reporter event for later assertions.
//! - [`ScriptedExpectation`] is an [`Expectation`] whose verdicts and control
//!   state are set directly by the test, so dispatch can be exercised without
//!   real requirements or sequences.
//! - [`TestCall`] is a small argument pack.
//!
//! ```
//! use callgate_testing::{EventKind, RecordingReporter, ScriptedExpectation, TestCall};
//!
//! let reporter = RecordingReporter::new();
//! let collection = reporter.collection::<TestCall, u32>("Api::get");
//! let _exp = collection.register(ScriptedExpectation::available(&[]).returning(7));
//!
//! assert_eq!(collection.handle_call(&TestCall::new(1)).unwrap(), 7);
//! assert_eq!(reporter.kinds(), vec![EventKind::FullMatch]);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use callgate::{
    Bounds, CallReport, ControlState, Expectation, ExpectationCollection, ExpectationId,
    ExpectationReport, NoMatchReport, Rating, Ratings, Reporter, RequirementOutcomes,
    SequenceReport, SequenceTag, Settings, SourceLocation,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Recording reporter
// ============================================================================

/// Discriminant of a [`ReportedEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FullMatch,
    NoApplicableMatch,
    NoMatch,
    UnfulfilledExpectation,
    UnfulfilledSequence,
    UnhandledException,
}

/// One reporter callback with its payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportedEvent {
    FullMatch {
        call: CallReport,
        expectation: ExpectationReport,
    },
    NoApplicableMatch {
        call: CallReport,
        blocked: Vec<ExpectationReport>,
    },
    NoMatch {
        call: CallReport,
        rejected: Vec<NoMatchReport>,
    },
    UnfulfilledExpectation {
        expectation: ExpectationReport,
    },
    UnfulfilledSequence {
        sequence: SequenceReport,
        satisfied: usize,
        total: usize,
    },
    UnhandledException {
        call: CallReport,
        expectation: ExpectationReport,
        error: String,
    },
}

impl ReportedEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::FullMatch { .. } => EventKind::FullMatch,
            Self::NoApplicableMatch { .. } => EventKind::NoApplicableMatch,
            Self::NoMatch { .. } => EventKind::NoMatch,
            Self::UnfulfilledExpectation { .. } => EventKind::UnfulfilledExpectation,
            Self::UnfulfilledSequence { .. } => EventKind::UnfulfilledSequence,
            Self::UnhandledException { .. } => EventKind::UnhandledException,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub at: DateTime<Utc>,
    pub event: ReportedEvent,
}

/// Reporter that records every event and never panics.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Collection reporting here, with successful matches reported too.
    pub fn collection<C, R>(self: &Arc<Self>, target: &str) -> Arc<ExpectationCollection<C, R>> {
        ExpectationCollection::<C, R>::builder(target)
            .reporter(Arc::clone(self) as Arc<dyn Reporter>)
            .settings(Settings::default().with_report_success(true))
            .build()
    }

    pub fn as_reporter(self: &Arc<Self>) -> Arc<dyn Reporter> {
        Arc::clone(self) as Arc<dyn Reporter>
    }

    fn record(&self, event: ReportedEvent) {
        lock(&self.events).push(RecordedEvent {
            at: Utc::now(),
            event,
        });
    }

    pub fn events(&self) -> Vec<ReportedEvent> {
        lock(&self.events)
            .iter()
            .map(|recorded| recorded.event.clone())
            .collect()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        lock(&self.events)
            .iter()
            .map(|recorded| recorded.event.kind())
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        lock(&self.events)
            .iter()
            .filter(|recorded| recorded.event.kind() == kind)
            .count()
    }

    /// Drain all recorded events.
    pub fn take(&self) -> Vec<ReportedEvent> {
        lock(&self.events)
            .drain(..)
            .map(|recorded| recorded.event)
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*lock(&self.events))
    }
}

impl Reporter for RecordingReporter {
    fn report_full_match(&self, call: &CallReport, expectation: &ExpectationReport) {
        self.record(ReportedEvent::FullMatch {
            call: call.clone(),
            expectation: expectation.clone(),
        });
    }

    fn report_no_applicable_match(&self, call: &CallReport, blocked: &[ExpectationReport]) {
        self.record(ReportedEvent::NoApplicableMatch {
            call: call.clone(),
            blocked: blocked.to_vec(),
        });
    }

    fn report_no_match(&self, call: &CallReport, rejected: &[NoMatchReport]) {
        self.record(ReportedEvent::NoMatch {
            call: call.clone(),
            rejected: rejected.to_vec(),
        });
    }

    fn report_unfulfilled_expectation(&self, expectation: &ExpectationReport) {
        self.record(ReportedEvent::UnfulfilledExpectation {
            expectation: expectation.clone(),
        });
    }

    fn report_unfulfilled_sequence(
        &self,
        sequence: &SequenceReport,
        satisfied: usize,
        total: usize,
    ) {
        self.record(ReportedEvent::UnfulfilledSequence {
            sequence: sequence.clone(),
            satisfied,
            total,
        });
    }

    fn report_unhandled_exception(
        &self,
        call: &CallReport,
        expectation: &ExpectationReport,
        error: &anyhow::Error,
    ) {
        self.record(ReportedEvent::UnhandledException {
            call: call.clone(),
            expectation: expectation.clone(),
            error: format!("{error:#}"),
        });
    }
}

// ============================================================================
// Scripted expectation
// ============================================================================

/// `Bounds` of a fresh `once()` expectation.
pub const ONCE: Bounds = Bounds {
    min: 1,
    max: 1,
    count: 0,
};

/// Ratings from `(priority, tag)` pairs.
pub fn ratings(pairs: &[(i64, SequenceTag)]) -> Ratings {
    pairs
        .iter()
        .map(|&(priority, tag)| Rating::new(priority, tag))
        .collect()
}

#[derive(Debug, Clone)]
enum Failure {
    Error(String),
    Panic(String),
}

impl Failure {
    fn raise(&self) -> anyhow::Error {
        match self {
            Self::Error(message) => anyhow!("{message}"),
            Self::Panic(message) => panic!("{message}"),
        }
    }
}

#[derive(Debug)]
struct Script<R> {
    outcomes: Vec<bool>,
    state: ControlState,
    satisfied: bool,
    value: R,
    match_failure: Option<Failure>,
    consume_failure: Option<Failure>,
}

/// Expectation driven entirely by the test.
///
/// Consuming does not change the scripted state; tests update it with
/// [`set_state`](Self::set_state) when they need to.
pub struct ScriptedExpectation<R = ()> {
    id: ExpectationId,
    from: SourceLocation,
    script: Mutex<Script<R>>,
    consumed: AtomicUsize,
    finalized: AtomicUsize,
}

impl<R: Default> ScriptedExpectation<R> {
    /// Available with the given ratings; accepts every call.
    #[track_caller]
    pub fn available(ratings: &[Rating]) -> Self {
        Self::with_state(ControlState::Available {
            bounds: ONCE,
            ratings: ratings.iter().copied().collect(),
        })
    }

    /// Accepts every call but is waiting on a sequence.
    #[track_caller]
    pub fn blocked() -> Self {
        Self::with_state(ControlState::Blocked {
            bounds: ONCE,
            ratings: Ratings::new(),
            blocking: Vec::new(),
        })
    }

    #[track_caller]
    pub fn saturated() -> Self {
        Self::with_state(ControlState::Saturated {
            bounds: Bounds { count: 1, ..ONCE },
            sequences: Vec::new(),
        })
    }

    #[track_caller]
    pub fn with_state(state: ControlState) -> Self {
        Self {
            id: ExpectationId::new(),
            from: SourceLocation::caller(),
            script: Mutex::new(Script {
                outcomes: Vec::new(),
                state,
                satisfied: true,
                value: R::default(),
                match_failure: None,
                consume_failure: None,
            }),
            consumed: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
        }
    }
}

impl<R> ScriptedExpectation<R> {
    fn script(&self) -> MutexGuard<'_, Script<R>> {
        lock(&self.script)
    }

    /// Requirement verdicts reported by `matches`.
    pub fn with_outcomes(self, outcomes: &[bool]) -> Self {
        self.script().outcomes = outcomes.to_vec();
        self
    }

    /// Value produced by `finalize_call`.
    pub fn returning(self, value: R) -> Self {
        self.script().value = value;
        self
    }

    pub fn unsatisfied(self) -> Self {
        self.script().satisfied = false;
        self
    }

    pub fn failing_match(self, message: &str) -> Self {
        self.script().match_failure = Some(Failure::Error(message.to_string()));
        self
    }

    pub fn panicking_match(self, message: &str) -> Self {
        self.script().match_failure = Some(Failure::Panic(message.to_string()));
        self
    }

    pub fn failing_consume(self, message: &str) -> Self {
        self.script().consume_failure = Some(Failure::Error(message.to_string()));
        self
    }

    pub fn set_state(&self, state: ControlState) {
        self.script().state = state;
    }

    pub fn set_outcomes(&self, outcomes: &[bool]) {
        self.script().outcomes = outcomes.to_vec();
    }

    pub fn set_satisfied(&self, satisfied: bool) {
        self.script().satisfied = satisfied;
    }

    pub fn consume_count(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }

    pub fn finalize_count(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

impl<C, R> Expectation<C, R> for ScriptedExpectation<R>
where
    R: Clone + Send,
{
    fn id(&self) -> ExpectationId {
        self.id
    }

    fn target(&self) -> &str {
        "scripted"
    }

    fn from(&self) -> &SourceLocation {
        &self.from
    }

    fn describe_requirements(&self) -> Vec<Option<String>> {
        vec![None; self.script().outcomes.len()]
    }

    fn matches(&self, _call: &C) -> anyhow::Result<RequirementOutcomes> {
        let failure = self.script().match_failure.clone();
        if let Some(failure) = failure {
            return Err(failure.raise());
        }
        Ok(RequirementOutcomes::new(self.script().outcomes.clone()))
    }

    fn control_state(&self) -> ControlState {
        self.script().state.clone()
    }

    fn is_satisfied(&self) -> bool {
        self.script().satisfied
    }

    fn consume(&self, _call: &C) -> anyhow::Result<()> {
        let failure = self.script().consume_failure.clone();
        if let Some(failure) = failure {
            return Err(failure.raise());
        }
        self.consumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finalize_call(&self, _call: &C) -> R {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        self.script().value.clone()
    }
}

impl<R> fmt::Debug for ScriptedExpectation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedExpectation")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("consumed", &self.consume_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Test call
// ============================================================================

/// Argument pack for tests that do not care about the call's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCall {
    pub id: u32,
    pub label: Option<String>,
}

impl TestCall {
    pub fn new(id: u32) -> Self {
        Self { id, label: None }
    }

    pub fn labeled(id: u32, label: impl Into<String>) -> Self {
        Self {
            id,
            label: Some(label.into()),
        }
    }
}
