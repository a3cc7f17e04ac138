//! # Callgate
//!
//! Call arbitration for test doubles: decides which registered expectation
//! handles an incoming call, enforces repetition bounds and cross-mock
//! ordering, and reports failures through a pluggable [`Reporter`].
//!
//! ## Core Concepts
//!
//! - [`Expectation`] = one "this call should happen" rule on one mocked entry point
//! - [`ControlPolicy`] = how often it may match, and which [`Sequence`]s it belongs to
//! - [`Sequence`] = ordering constraint spanning expectations of any number of mocks
//! - [`ExpectationCollection`] = all live expectations of one entry point, plus dispatch
//!
//! The key principle: **newest expectation first, strictly better rating wins**.
//! An expectation registered later shadows an older one unless the older one
//! is preferred by a sequence both belong to.
//!
//! ## Architecture
//!
//! ```text
//! handle_call(call)
//!     │
//!     ▼
//! ExpectationCollection (newest ──► oldest)
//!     │
//!     ├─► Expectation C.matches() ─► NoMatch ───────────┐
//!     │                                                 │
//!     ├─► Expectation B.matches() ─► Blocked ───────┐   │
//!     │         (saturated / not head)              │   │
//!     └─► Expectation A.matches() ─► FullMatch ──┐  │   │
//!                                                │  │   │
//!                                                ▼  │   │
//!                                     best rating   │   │
//!                                                │  │   │
//!                         ┌──────────────────────┘  │   │
//!                         ▼                         ▼   ▼
//!                 consume + finalize_call          Reporter
//!                         │                         │
//!                         ▼                         ▼
//!                      Ok(R)               Err(DispatchError)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Bounded matches** - `min <= max`, and a policy never matches past `max`
//! 2. **Head-only consumption** - A match consumes its slot in every sequence at once,
//!    and only while each of them is the head
//! 3. **Cursor progress** - Every slot before a sequence's cursor is satisfied or saturated
//! 4. **Single winner** - At most one expectation consumes a given call
//! 5. **Isolation** - A failing candidate is excluded without aborting the dispatch
//!
//! ## Guarantees
//!
//! - **Deterministic**: The same registrations and calls always pick the same winner
//! - **Thread-safe**: Collections and sequences can be shared across threads
//! - **Reentrant hooks**: requirement side effects and `finalize_call` run without
//!   any collection lock held
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use callgate::{
//!     requirement, BasicExpectation, ExpectationCollection, Sequence, Times, TracingReporter,
//! };
//!
//! let reporter = Arc::new(TracingReporter);
//! let read = ExpectationCollection::<(u32,), Vec<u8>>::builder("Disk::read")
//!     .reporter(reporter.clone())
//!     .build();
//! let flush = ExpectationCollection::<(), ()>::builder("Disk::flush")
//!     .reporter(reporter.clone())
//!     .build();
//!
//! let seq = Sequence::lazy(reporter);
//! let _read = read.register(
//!     BasicExpectation::builder("Disk::read")
//!         .in_sequence(&seq)
//!         .times(Times::twice())
//!         .with(requirement::from_fn("block < 16", |(block,): &(u32,)| *block < 16))
//!         .returning(|(block,)| vec![*block as u8; 4])
//!         .unwrap(),
//! );
//! let _flush = flush.register(
//!     BasicExpectation::builder("Disk::flush")
//!         .in_sequence(&seq)
//!         .build::<()>()
//!         .unwrap(),
//! );
//!
//! assert!(flush.handle_call(&()).is_err());
//! assert_eq!(read.handle_call(&(3,)).unwrap(), vec![3; 4]);
//! assert_eq!(read.handle_call(&(5,)).unwrap(), vec![5; 4]);
//! flush.handle_call(&()).unwrap();
//! ```
//!
//! ## What Callgate Is Not
//!
//! - A mock generator (no macros synthesizing mock types)
//! - A matcher library (requirements are plain predicates)
//! - A test runner (failing a test is the [`Reporter`]'s decision)

// Core modules
mod collection;
mod config;
mod error;
mod expectation;
mod policy;
mod reporter;
mod reporting;
mod scope;
mod sequence;
mod state;


/// Argument requirements and predicate adapters.
pub mod requirement {
    pub use crate::expectation::{from_fn, try_from_fn, FnRequirement, Requirement};
}

// Re-export sequence types
pub use sequence::{
    GreedyStrategy, LazyStrategy, Priority, PriorityStrategy, Sequence, SequenceTag, SlotId,
};

// Re-export control types
pub use policy::{ControlPolicy, Times};
pub use state::{
    classify, find_best_match, has_better_rating, Bounds, Classification, ControlState, Rating,
    Ratings,
};

// Re-export expectation types
pub use expectation::{BasicExpectation, Expectation, ExpectationBuilder};

// Re-export collection types
pub use collection::{
    CollectionBuilder, ExpectationCollection, ScopedExpectation, SharedExpectation,
};
pub use scope::ScopedSequence;

// Re-export reporting types
pub use reporter::{PanicReporter, Reporter, TracingReporter};
pub use reporting::{
    CallReport, ExpectationId, ExpectationReport, NoMatchReport, RequirementOutcomes,
    SequenceReport, SourceLocation,
};

// Re-export configuration and error types
pub use config::Settings;
pub use error::{ConfigError, DispatchError, LifecycleError};
