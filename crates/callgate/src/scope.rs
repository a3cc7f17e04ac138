//! A sequence bundled with the expectations registered through it.

use std::fmt;
use std::sync::Arc;

use crate::collection::{ExpectationCollection, Release};
use crate::error::{ConfigError, LifecycleError};
use crate::expectation::{Expectation, ExpectationBuilder};
use crate::reporter::Reporter;
use crate::reporting::ExpectationId;
use crate::sequence::Sequence;

/// Owns a [`Sequence`] together with the expectations attached through it.
///
/// On release the expectations are removed first, in registration order, and
/// the sequence's end-of-life check runs last. Every failure is forwarded to
/// the respective reporter.
///
/// ```
/// use std::sync::Arc;
/// use callgate::{BasicExpectation, ExpectationCollection, ScopedSequence, TracingReporter};
///
/// let open = ExpectationCollection::<(), ()>::new("File::open");
/// let close = ExpectationCollection::<(), ()>::new("File::close");
///
/// let mut seq = ScopedSequence::lazy(Arc::new(TracingReporter));
/// seq.expect(&open, BasicExpectation::builder("File::open")).unwrap();
/// seq.expect(&close, BasicExpectation::builder("File::close")).unwrap();
///
/// assert!(close.handle_call(&()).is_err());
/// open.handle_call(&()).unwrap();
/// close.handle_call(&()).unwrap();
/// seq.close().unwrap();
/// ```
pub struct ScopedSequence {
    // Dropped before `sequence`.
    expectations: Vec<Box<dyn Release + Send>>,
    sequence: Sequence,
}

impl ScopedSequence {
    #[track_caller]
    pub fn lazy(reporter: Arc<dyn Reporter>) -> Self {
        Self::new(Sequence::lazy(reporter))
    }

    #[track_caller]
    pub fn greedy(reporter: Arc<dyn Reporter>) -> Self {
        Self::new(Sequence::greedy(reporter))
    }

    pub fn new(sequence: Sequence) -> Self {
        Self {
            expectations: Vec::new(),
            sequence,
        }
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    /// Number of expectations registered through this scope.
    pub fn len(&self) -> usize {
        self.expectations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expectations.is_empty()
    }

    /// Attach `builder` to this sequence and register the result with
    /// `collection`. Matched calls return `R::default()`.
    pub fn expect<C, R>(
        &mut self,
        collection: &Arc<ExpectationCollection<C, R>>,
        builder: ExpectationBuilder<'_, C>,
    ) -> Result<ExpectationId, ConfigError>
    where
        C: 'static,
        R: Default + 'static,
    {
        self.expect_returning(collection, builder, |_| R::default())
    }

    /// Like [`expect`](Self::expect) with an explicit finalizer.
    pub fn expect_returning<C, R>(
        &mut self,
        collection: &Arc<ExpectationCollection<C, R>>,
        builder: ExpectationBuilder<'_, C>,
        finalizer: impl Fn(&C) -> R + Send + Sync + 'static,
    ) -> Result<ExpectationId, ConfigError>
    where
        C: 'static,
        R: 'static,
    {
        let expectation = builder.in_sequence(&self.sequence).returning(finalizer)?;
        let id = expectation.id();
        self.expectations
            .push(Box::new(collection.register(expectation)));
        Ok(id)
    }

    /// Release every expectation, then verify the sequence.
    ///
    /// Returns the first failure. All failures have been reported by then.
    pub fn close(self) -> Result<(), LifecycleError> {
        let Self {
            expectations,
            sequence,
        } = self;

        let mut first = None;
        for mut expectation in expectations {
            if let Err(error) = expectation.release() {
                first.get_or_insert(error);
            }
        }
        if let Err(error) = sequence.close() {
            first.get_or_insert(error);
        }

        match first {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ScopedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedSequence")
            .field("sequence", &self.sequence)
            .field("expectations", &self.expectations.len())
            .finish()
    }
}
