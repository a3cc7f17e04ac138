//! The unit of dispatch: one expectation on one mocked entry point.
//!
//! The collection only relies on the [`Expectation`] trait. [`BasicExpectation`]
//! is the stock implementation that combines a [`ControlPolicy`] with
//! argument [`Requirement`]s and a finalizer.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::bail;

use crate::error::ConfigError;
use crate::policy::{ControlPolicy, Times};
use crate::reporting::{ExpectationId, ExpectationReport, RequirementOutcomes, SourceLocation};
use crate::sequence::Sequence;
use crate::state::ControlState;

/// What the collection needs from an expectation.
///
/// `C` is the call's argument pack, `R` what a matched call returns.
pub trait Expectation<C, R = ()>: Send + Sync {
    fn id(&self) -> ExpectationId;

    /// Name of the mocked entry point.
    fn target(&self) -> &str;

    fn from(&self) -> &SourceLocation;

    /// One entry per requirement. May run user code.
    fn describe_requirements(&self) -> Vec<Option<String>> {
        Vec::new()
    }

    fn report(&self) -> ExpectationReport {
        ExpectationReport {
            requirements: self.describe_requirements(),
            ..self.summary()
        }
    }

    /// Report without requirement descriptions.
    ///
    /// Must not run user code: the collection falls back to it when
    /// [`report`](Self::report) itself failed.
    fn summary(&self) -> ExpectationReport {
        ExpectationReport {
            id: self.id(),
            target: self.target().to_string(),
            from: self.from().clone(),
            control: self.control_state(),
            requirements: Vec::new(),
        }
    }

    /// Verdict of every requirement for `call`.
    ///
    /// Errors are isolated to this expectation by the collection.
    fn matches(&self, call: &C) -> anyhow::Result<RequirementOutcomes>;

    fn control_state(&self) -> ControlState;

    fn is_satisfied(&self) -> bool;

    /// Commit a match. Only called after the expectation classified as a
    /// full match during the same dispatch.
    ///
    /// Runs while the collection is locked and must not call back into it.
    /// An error leaves the expectation unchanged and hands the call to the
    /// next best candidate.
    fn consume(&self, call: &C) -> anyhow::Result<()>;

    /// Side effects of a committed match. Runs after the collection is
    /// unlocked, right before [`finalize_call`](Self::finalize_call).
    ///
    /// The match stands even if this fails; the error is reported.
    fn on_matched(&self, _call: &C) -> anyhow::Result<()> {
        Ok(())
    }

    /// Produce the call's result. Runs without the collection lock held.
    fn finalize_call(&self, call: &C) -> R;
}

/// One argument sub-policy.
pub trait Requirement<C>: Send + Sync {
    fn matches(&self, call: &C) -> anyhow::Result<bool>;

    fn describe(&self) -> Option<String> {
        None
    }

    fn is_satisfied(&self) -> bool {
        true
    }

    /// Side effect of a committed match. See [`Expectation::on_matched`].
    fn consume(&self, _call: &C) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Requirement backed by a predicate.
pub struct FnRequirement<F> {
    description: Option<String>,
    predicate: F,
}

impl<F> fmt::Debug for FnRequirement<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnRequirement")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Requirement from an infallible predicate.
pub fn from_fn<C, F>(
    description: impl Into<String>,
    predicate: F,
) -> FnRequirement<impl Fn(&C) -> anyhow::Result<bool> + Send + Sync>
where
    F: Fn(&C) -> bool + Send + Sync,
{
    FnRequirement {
        description: Some(description.into()),
        predicate: move |call: &C| Ok(predicate(call)),
    }
}

/// Requirement from a predicate that may fail.
pub fn try_from_fn<C, F>(description: impl Into<String>, predicate: F) -> FnRequirement<F>
where
    F: Fn(&C) -> anyhow::Result<bool> + Send + Sync,
{
    FnRequirement {
        description: Some(description.into()),
        predicate,
    }
}

impl<C, F> Requirement<C> for FnRequirement<F>
where
    F: Fn(&C) -> anyhow::Result<bool> + Send + Sync,
{
    fn matches(&self, call: &C) -> anyhow::Result<bool> {
        (self.predicate)(call)
    }

    fn describe(&self) -> Option<String> {
        self.description.clone()
    }
}

type Finalizer<C, R> = Box<dyn Fn(&C) -> R + Send + Sync>;

/// Control policy, requirements, and finalizer bundled into an expectation.
pub struct BasicExpectation<C, R = ()> {
    id: ExpectationId,
    target: String,
    from: SourceLocation,
    control: Mutex<ControlPolicy>,
    requirements: Vec<Box<dyn Requirement<C>>>,
    finalizer: Finalizer<C, R>,
}

impl<C> BasicExpectation<C> {
    /// Start an expectation. The result type is chosen when finishing the
    /// builder.
    #[track_caller]
    pub fn builder<'s>(target: impl Into<String>) -> ExpectationBuilder<'s, C> {
        ExpectationBuilder {
            target: target.into(),
            from: SourceLocation::caller(),
            times: Times::default(),
            sequences: Vec::new(),
            requirements: Vec::new(),
        }
    }
}

impl<C, R> BasicExpectation<C, R> {
    fn control(&self) -> MutexGuard<'_, ControlPolicy> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C, R> Expectation<C, R> for BasicExpectation<C, R> {
    fn id(&self) -> ExpectationId {
        self.id
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn from(&self) -> &SourceLocation {
        &self.from
    }

    fn describe_requirements(&self) -> Vec<Option<String>> {
        self.requirements.iter().map(|r| r.describe()).collect()
    }

    fn matches(&self, call: &C) -> anyhow::Result<RequirementOutcomes> {
        let outcomes = self
            .requirements
            .iter()
            .map(|requirement| requirement.matches(call))
            .collect::<anyhow::Result<Vec<bool>>>()?;
        Ok(RequirementOutcomes::new(outcomes))
    }

    fn control_state(&self) -> ControlState {
        self.control().state()
    }

    fn is_satisfied(&self) -> bool {
        self.control().is_satisfied() && self.requirements.iter().all(|r| r.is_satisfied())
    }

    fn consume(&self, _call: &C) -> anyhow::Result<()> {
        let mut control = self.control();
        // A sequence shared with another mock may have moved since classification.
        if !control.try_consume() {
            bail!(
                "expectation {} is no longer applicable: {}",
                self.id,
                control.describe()
            );
        }
        Ok(())
    }

    /// Every requirement hook runs, even after an earlier one failed.
    fn on_matched(&self, call: &C) -> anyhow::Result<()> {
        let failed: Vec<String> = self
            .requirements
            .iter()
            .enumerate()
            .filter_map(|(index, requirement)| {
                requirement
                    .consume(call)
                    .err()
                    .map(|error| format!("requirement {index}: {error:#}"))
            })
            .collect();
        if !failed.is_empty() {
            bail!(
                "{} of {} requirement hook(s) failed: {}",
                failed.len(),
                self.requirements.len(),
                failed.join("; ")
            );
        }
        Ok(())
    }

    fn finalize_call(&self, call: &C) -> R {
        (self.finalizer)(call)
    }
}

impl<C, R> fmt::Debug for BasicExpectation<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicExpectation")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("from", &self.from)
            .field("control", &*self.control())
            .field("requirements", &self.requirements.len())
            .finish_non_exhaustive()
    }
}

/// Collects the parts of a [`BasicExpectation`].
///
/// ```
/// use std::sync::Arc;
/// use callgate::{requirement, BasicExpectation, Sequence, Times, TracingReporter};
///
/// let seq = Sequence::lazy(Arc::new(TracingReporter));
/// let expectation = BasicExpectation::<(i32,)>::builder("Calculator::square")
///     .times(Times::twice())
///     .in_sequence(&seq)
///     .with(requirement::from_fn("x > 0", |(x,): &(i32,)| *x > 0))
///     .returning(|(x,)| x * x)
///     .unwrap();
/// # drop(expectation);
/// # drop(seq);
/// ```
pub struct ExpectationBuilder<'s, C> {
    target: String,
    from: SourceLocation,
    times: Times,
    sequences: Vec<&'s Sequence>,
    requirements: Vec<Box<dyn Requirement<C>>>,
}

impl<'s, C> ExpectationBuilder<'s, C> {
    pub fn times(mut self, times: Times) -> Self {
        self.times = times;
        self
    }

    pub fn in_sequence(mut self, sequence: &'s Sequence) -> Self {
        self.sequences.push(sequence);
        self
    }

    pub fn with(mut self, requirement: impl Requirement<C> + 'static) -> Self {
        self.requirements.push(Box::new(requirement));
        self
    }

    /// Finish with a finalizer producing the call's result.
    pub fn returning<R>(
        self,
        finalizer: impl Fn(&C) -> R + Send + Sync + 'static,
    ) -> Result<BasicExpectation<C, R>, ConfigError> {
        let control = ControlPolicy::new(self.times, &self.sequences)?;
        Ok(BasicExpectation {
            id: ExpectationId::new(),
            target: self.target,
            from: self.from,
            control: Mutex::new(control),
            requirements: self.requirements,
            finalizer: Box::new(finalizer),
        })
    }

    /// Finish with `R::default()` as the call's result.
    pub fn build<R: Default>(self) -> Result<BasicExpectation<C, R>, ConfigError> {
        self.returning(|_| R::default())
    }
}
