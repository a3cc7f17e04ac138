//! Per-signature expectation registry and call dispatch.
//!
//! ```text
//! handle_call(call)
//!     │
//!     ▼  (collection lock held)
//! newest ──► oldest: classify each candidate
//!     │
//!     ├─► FullMatch ─► best rating ─► consume ──┐
//!     ├─► Blocked                               │
//!     └─► NoMatch                               │
//!                                               ▼  (lock released)
//!                          report + on_matched + finalize_call
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::Settings;
use crate::error::{DispatchError, LifecycleError};
use crate::expectation::Expectation;
use crate::reporter::{Reporter, TracingReporter};
use crate::reporting::{CallReport, ExpectationReport, NoMatchReport};
use crate::state::{classify, find_best_match, Classification};

/// Shared handle to a registered expectation.
pub type SharedExpectation<C, R = ()> = Arc<dyn Expectation<C, R>>;

/// All live expectations of one mocked entry point.
///
/// Every operation holds the collection's lock for the duration of the list
/// scan or mutation. The winner's `on_matched` and `finalize_call` hooks and
/// all reporter callbacks run after the lock is released, so they may call
/// back into the collection.
pub struct ExpectationCollection<C, R = ()> {
    target: String,
    reporter: Arc<dyn Reporter>,
    settings: Settings,
    expectations: Mutex<Vec<SharedExpectation<C, R>>>,
}

/// Builder for [`ExpectationCollection`].
pub struct CollectionBuilder {
    target: String,
    reporter: Arc<dyn Reporter>,
    settings: Settings,
}

impl CollectionBuilder {
    pub fn reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build<C, R>(self) -> Arc<ExpectationCollection<C, R>> {
        Arc::new(ExpectationCollection {
            target: self.target,
            reporter: self.reporter,
            settings: self.settings,
            expectations: Mutex::new(Vec::new()),
        })
    }
}

struct Candidate<C, R> {
    expectation: SharedExpectation<C, R>,
    report: ExpectationReport,
}

struct Failure {
    report: ExpectationReport,
    error: anyhow::Error,
}

enum Dispatch<C, R> {
    Matched(Candidate<C, R>),
    Blocked(Vec<ExpectationReport>),
    Rejected(Vec<NoMatchReport>),
}

impl<C, R> ExpectationCollection<C, R> {
    /// Collection reporting through [`TracingReporter`] with default settings.
    pub fn new(target: impl Into<String>) -> Arc<Self> {
        Self::builder(target).build()
    }

    pub fn builder(target: impl Into<String>) -> CollectionBuilder {
        CollectionBuilder {
            target: target.into(),
            reporter: Arc::new(TracingReporter),
            settings: Settings::default(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SharedExpectation<C, R>>> {
        self.expectations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `expectation`; it becomes the first candidate for new calls.
    ///
    /// # Panics
    ///
    /// Panics if the expectation is already registered here.
    pub fn push(&self, expectation: SharedExpectation<C, R>) {
        let mut expectations = self.lock();
        let id = expectation.id();
        assert!(
            expectations.iter().all(|existing| existing.id() != id),
            "expectation {id} already belongs to `{}`",
            self.target
        );
        tracing::trace!(mock = %self.target, expectation = %id, "expectation registered");
        expectations.push(expectation);
    }

    /// Remove `expectation` and check that it was satisfied.
    ///
    /// # Panics
    ///
    /// Panics if the expectation is not registered here.
    pub fn remove(&self, expectation: &SharedExpectation<C, R>) -> Result<(), LifecycleError> {
        let id = expectation.id();
        {
            let mut expectations = self.lock();
            let index = expectations
                .iter()
                .position(|existing| existing.id() == id)
                .unwrap_or_else(|| {
                    panic!("expectation {id} does not belong to `{}`", self.target)
                });
            expectations.remove(index);
        }
        tracing::trace!(mock = %self.target, expectation = %id, "expectation removed");

        if expectation.is_satisfied() {
            return Ok(());
        }

        let report = expectation.report();
        self.reporter.report_unfulfilled_expectation(&report);
        Err(LifecycleError::UnfulfilledExpectation { report })
    }

    /// Register `expectation` for the lifetime of the returned guard.
    pub fn register(
        self: &Arc<Self>,
        expectation: impl Expectation<C, R> + 'static,
    ) -> ScopedExpectation<C, R> {
        self.register_shared(Arc::new(expectation))
    }

    pub fn register_shared(
        self: &Arc<Self>,
        expectation: SharedExpectation<C, R>,
    ) -> ScopedExpectation<C, R> {
        self.push(Arc::clone(&expectation));
        ScopedExpectation {
            collection: Arc::clone(self),
            expectation: Some(expectation),
        }
    }

    /// Dispatch `call` to the best applicable expectation and return what
    /// its finalizer produced.
    pub fn handle_call(&self, call: &C) -> Result<R, DispatchError>
    where
        C: fmt::Debug,
    {
        let span = tracing::debug_span!("handle_call", mock = %self.target);
        let _entered = span.enter();

        let call_report = CallReport::new(self.target.as_str(), call);
        let mut failures = Vec::new();
        let dispatch = {
            let expectations = self.lock();
            self.dispatch(&expectations, call, &mut failures)
        };

        for failure in &failures {
            self.reporter
                .report_unhandled_exception(&call_report, &failure.report, &failure.error);
        }

        match dispatch {
            Dispatch::Matched(winner) => {
                if self.settings.report_success {
                    self.reporter
                        .report_full_match(&call_report, &winner.report);
                }
                if let Err(error) = self.guarded(|| winner.expectation.on_matched(call)) {
                    tracing::warn!(
                        expectation = %winner.report.id,
                        error = %error,
                        "match side effects failed"
                    );
                    self.reporter
                        .report_unhandled_exception(&call_report, &winner.report, &error);
                }
                Ok(winner.expectation.finalize_call(call))
            }
            Dispatch::Blocked(reports) => {
                tracing::debug!(blocked = reports.len(), "no applicable expectation");
                self.reporter
                    .report_no_applicable_match(&call_report, &reports);
                Err(DispatchError::NoApplicableMatch {
                    call: call_report,
                    reports,
                })
            }
            Dispatch::Rejected(reports) => {
                tracing::debug!(rejected = reports.len(), "no matching expectation");
                self.reporter.report_no_match(&call_report, &reports);
                Err(DispatchError::NoMatch {
                    call: call_report,
                    reports,
                })
            }
        }
    }

    fn dispatch(
        &self,
        expectations: &[SharedExpectation<C, R>],
        call: &C,
        failures: &mut Vec<Failure>,
    ) -> Dispatch<C, R> {
        let mut full = Vec::new();
        let mut blocked = Vec::new();
        let mut rejected = Vec::new();

        for expectation in expectations.iter().rev() {
            let evaluated = self.guarded(|| {
                let outcomes = expectation.matches(call)?;
                Ok((outcomes, expectation.report()))
            });

            let (outcomes, report) = match evaluated {
                Ok(evaluated) => evaluated,
                Err(error) => {
                    tracing::warn!(
                        expectation = %expectation.id(),
                        error = %error,
                        "candidate excluded"
                    );
                    // `report` may be what failed, so no user code here.
                    failures.push(Failure {
                        report: expectation.summary(),
                        error,
                    });
                    continue;
                }
            };

            let classification = classify(&outcomes, &report.control);
            tracing::trace!(expectation = %report.id, ?classification, "candidate classified");
            match classification {
                Classification::FullMatch => full.push(Candidate {
                    expectation: Arc::clone(expectation),
                    report,
                }),
                Classification::Blocked => blocked.push(report),
                Classification::NoMatch => rejected.push(NoMatchReport {
                    expectation: report,
                    outcomes,
                }),
            }
        }

        while let Some(index) = find_best_match(full.iter().map(|c| c.report.control.ratings())) {
            let candidate = full.remove(index);
            match self.guarded(|| candidate.expectation.consume(call)) {
                Ok(()) => {
                    tracing::debug!(expectation = %candidate.report.id, "call matched");
                    return Dispatch::Matched(candidate);
                }
                Err(error) => {
                    tracing::warn!(
                        expectation = %candidate.report.id,
                        error = %error,
                        "winner failed to consume"
                    );
                    failures.push(Failure {
                        report: candidate.report,
                        error,
                    });
                }
            }
        }

        if blocked.is_empty() {
            Dispatch::Rejected(rejected)
        } else {
            Dispatch::Blocked(blocked)
        }
    }

    fn guarded<T>(&self, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
        if !self.settings.catch_panics {
            return f();
        }
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

impl<C, R> fmt::Debug for ExpectationCollection<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectationCollection")
            .field("target", &self.target)
            .field("settings", &self.settings)
            .field("expectations", &self.len())
            .finish_non_exhaustive()
    }
}

/// Keeps an expectation registered until it is closed or dropped.
///
/// On release the expectation is removed from its collection and checked for
/// satisfaction. [`close`](Self::close) returns the outcome; dropping reports
/// it and discards it.
#[must_use = "the expectation is removed as soon as the guard is dropped"]
pub struct ScopedExpectation<C, R = ()> {
    collection: Arc<ExpectationCollection<C, R>>,
    expectation: Option<SharedExpectation<C, R>>,
}

impl<C, R> ScopedExpectation<C, R> {
    pub fn expectation(&self) -> Option<&SharedExpectation<C, R>> {
        self.expectation.as_ref()
    }

    pub fn is_satisfied(&self) -> bool {
        self.expectation
            .as_ref()
            .is_some_and(|expectation| expectation.is_satisfied())
    }

    pub fn report(&self) -> Option<ExpectationReport> {
        self.expectation.as_ref().map(|expectation| expectation.report())
    }

    pub fn close(mut self) -> Result<(), LifecycleError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), LifecycleError> {
        match self.expectation.take() {
            Some(expectation) => self.collection.remove(&expectation),
            None => Ok(()),
        }
    }
}

impl<C, R> Drop for ScopedExpectation<C, R> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Type-erased release of a scoped registration.
pub(crate) trait Release {
    fn release(&mut self) -> Result<(), LifecycleError>;
}

impl<C, R> Release for ScopedExpectation<C, R> {
    fn release(&mut self) -> Result<(), LifecycleError> {
        ScopedExpectation::release(self)
    }
}
