//! Dispatch behavior of `ExpectationCollection`, observed through a
//! recording reporter.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;

use callgate::requirement::{self, Requirement};
use callgate::{
    BasicExpectation, DispatchError, Expectation, ExpectationCollection, Sequence, Settings, Times,
};
use callgate_testing::{
    ratings, EventKind, RecordingReporter, ReportedEvent, ScriptedExpectation, TestCall,
};

#[test]
fn unsequenced_candidate_beats_sequenced_one() {
    for unsequenced_first in [true, false] {
        let reporter = RecordingReporter::new();
        let collection = reporter.collection::<(), &'static str>("Api::ping");
        let seq = Sequence::lazy(reporter.as_reporter());

        let plain = || {
            BasicExpectation::<()>::builder("Api::ping")
                .returning(|_| "plain")
                .unwrap()
        };
        let sequenced = || {
            BasicExpectation::<()>::builder("Api::ping")
                .in_sequence(&seq)
                .returning(|_| "sequenced")
                .unwrap()
        };

        let (first, second) = if unsequenced_first {
            (collection.register(plain()), collection.register(sequenced()))
        } else {
            (collection.register(sequenced()), collection.register(plain()))
        };

        assert_eq!(collection.handle_call(&()).unwrap(), "plain");
        assert_eq!(collection.handle_call(&()).unwrap(), "sequenced");

        second.close().unwrap();
        first.close().unwrap();
        seq.close().unwrap();
        assert_eq!(
            reporter.kinds(),
            vec![EventKind::FullMatch, EventKind::FullMatch]
        );
    }
}

#[test]
fn strictly_better_rating_wins_over_newer_candidate() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<TestCall, u8>("Api::get");
    let tag = Sequence::lazy(reporter.as_reporter()).tag();

    let _older = collection.register(
        ScriptedExpectation::available(&ratings(&[(5, tag)])).returning(1),
    );
    let _newer = collection.register(
        ScriptedExpectation::available(&ratings(&[(3, tag)])).returning(2),
    );

    assert_eq!(collection.handle_call(&TestCall::new(0)).unwrap(), 1);
}

#[test]
fn ties_and_disjoint_ratings_go_to_the_newest_candidate() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<TestCall, u8>("Api::get");
    let a = Sequence::lazy(reporter.as_reporter()).tag();
    let b = Sequence::lazy(reporter.as_reporter()).tag();

    let _older = collection.register(
        ScriptedExpectation::available(&ratings(&[(9, a)])).returning(1),
    );
    let _newer = collection.register(
        ScriptedExpectation::available(&ratings(&[(1, b)])).returning(2),
    );
    assert_eq!(collection.handle_call(&TestCall::new(0)).unwrap(), 2);

    let tied = reporter.collection::<TestCall, u8>("Api::get");
    let _older = tied.register(ScriptedExpectation::available(&ratings(&[(4, a)])).returning(1));
    let _newer = tied.register(ScriptedExpectation::available(&ratings(&[(4, a)])).returning(2));
    assert_eq!(tied.handle_call(&TestCall::new(0)).unwrap(), 2);
}

#[test]
fn blocked_candidates_are_reported_when_nothing_applies() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<TestCall, ()>("Api::get");
    let _saturated = collection.register(ScriptedExpectation::saturated().with_outcomes(&[true]));
    let _blocked = collection.register(ScriptedExpectation::blocked());
    let _rejecting = collection.register(
        ScriptedExpectation::available(&[]).with_outcomes(&[true, false]),
    );

    let err = collection.handle_call(&TestCall::new(3)).unwrap_err();
    match &err {
        DispatchError::NoApplicableMatch { call, reports } => {
            assert_eq!(call.target, "Api::get");
            assert_eq!(reports.len(), 2);
            // Newest first.
            assert!(!reports[0].control.is_saturated());
            assert!(reports[1].control.is_saturated());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.call().arguments, "TestCall { id: 3, label: None }");

    match reporter.events().as_slice() {
        [ReportedEvent::NoApplicableMatch { blocked, .. }] => assert_eq!(blocked.len(), 2),
        other => panic!("unexpected events: {other:?}"),
    }
}

#[test]
fn no_match_lists_every_rejecting_candidate() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<(i32,), ()>("Math::sqrt");
    let _positive = collection.register(
        BasicExpectation::<(i32,)>::builder("Math::sqrt")
            .with(requirement::from_fn("x > 0", |(x,): &(i32,)| *x > 0))
            .build::<()>()
            .unwrap(),
    );
    let _even = collection.register(
        BasicExpectation::<(i32,)>::builder("Math::sqrt")
            .with(requirement::from_fn("x > 0", |(x,): &(i32,)| *x > 0))
            .with(requirement::from_fn("x is even", |(x,): &(i32,)| x % 2 == 0))
            .build::<()>()
            .unwrap(),
    );

    match collection.handle_call(&(-3,)) {
        Err(DispatchError::NoMatch { reports, .. }) => {
            assert_eq!(reports.len(), 2);
            assert_eq!(reports[0].outcomes.failures().collect::<Vec<_>>(), vec![0, 1]);
            assert_eq!(reports[1].outcomes.failures().collect::<Vec<_>>(), vec![0]);
            assert_eq!(
                reports[0].expectation.requirements[1].as_deref(),
                Some("x is even")
            );
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(reporter.kinds(), vec![EventKind::NoMatch]);

    // Satisfy both so the guards close cleanly.
    collection.handle_call(&(4,)).unwrap();
    collection.handle_call(&(4,)).unwrap();
}

#[test]
fn failing_candidates_are_isolated() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<TestCall, u8>("Api::get");
    let fallback = Arc::new(ScriptedExpectation::<u8>::available(&[]).returning(1));
    let _fallback = collection.register_shared(fallback.clone());
    let _erroring = collection.register(
        ScriptedExpectation::available(&[])
            .failing_match("database is gone")
            .returning(2),
    );
    let _panicking = collection.register(
        ScriptedExpectation::available(&[])
            .panicking_match("matcher bug")
            .returning(3),
    );

    assert_eq!(collection.handle_call(&TestCall::new(0)).unwrap(), 1);
    assert_eq!(fallback.consume_count(), 1);
    assert_eq!(fallback.finalize_count(), 1);

    let events = reporter.events();
    assert_eq!(
        events.iter().map(ReportedEvent::kind).collect::<Vec<_>>(),
        vec![
            EventKind::UnhandledException,
            EventKind::UnhandledException,
            EventKind::FullMatch
        ]
    );
    match &events[0] {
        ReportedEvent::UnhandledException { error, .. } => {
            assert!(error.contains("matcher bug"), "{error}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match &events[1] {
        ReportedEvent::UnhandledException { error, .. } => assert_eq!(error, "database is gone"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn consume_failure_falls_back_to_next_best_candidate() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<TestCall, u8>("Api::get");
    let older = Arc::new(ScriptedExpectation::<u8>::available(&[]).returning(1));
    let newer = Arc::new(
        ScriptedExpectation::<u8>::available(&[])
            .failing_consume("side effect failed")
            .returning(2),
    );
    let _older = collection.register_shared(older.clone());
    let _newer = collection.register_shared(newer.clone());

    assert_eq!(collection.handle_call(&TestCall::new(0)).unwrap(), 1);
    assert_eq!(newer.finalize_count(), 0);
    assert_eq!(older.consume_count(), 1);
    assert_eq!(
        reporter.kinds(),
        vec![EventKind::UnhandledException, EventKind::FullMatch]
    );
}

#[test]
fn consume_failure_without_alternatives_is_no_match() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<TestCall, ()>("Api::get");
    let _only = collection.register(ScriptedExpectation::available(&[]).failing_consume("nope"));

    assert!(matches!(
        collection.handle_call(&TestCall::new(0)),
        Err(DispatchError::NoMatch { ref reports, .. }) if reports.is_empty()
    ));
    assert_eq!(
        reporter.kinds(),
        vec![EventKind::UnhandledException, EventKind::NoMatch]
    );
}

#[test]
fn success_is_silent_unless_enabled() {
    let reporter = RecordingReporter::new();
    let collection = ExpectationCollection::<(), ()>::builder("Api::ping")
        .reporter(reporter.as_reporter())
        .build();
    let _exp = collection.register(ScriptedExpectation::<()>::available(&[]));

    collection.handle_call(&()).unwrap();
    assert!(reporter.is_empty());
    assert!(!collection.settings().report_success);
}

#[test]
fn panics_propagate_when_isolation_is_disabled() {
    let reporter = RecordingReporter::new();
    let collection = ExpectationCollection::<TestCall, ()>::builder("Api::get")
        .reporter(reporter.as_reporter())
        .settings(Settings::default().with_catch_panics(false))
        .build();
    let _exp = collection.register(ScriptedExpectation::<()>::available(&[]).panicking_match("boom"));

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        collection.handle_call(&TestCall::new(0))
    }));
    assert!(result.is_err());
    assert!(reporter.is_empty());

    // The collection stays usable after the unwind.
    assert_eq!(collection.len(), 1);
}

#[test]
fn unsatisfied_guard_reports_on_drop() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<(), ()>("Api::ping");
    {
        let _exp = collection.register(
            BasicExpectation::<()>::builder("Api::ping")
                .times(Times::at_least(2))
                .build::<()>()
                .unwrap(),
        );
        collection.handle_call(&()).unwrap();
    }

    assert!(collection.is_empty());
    match reporter.events().last() {
        Some(ReportedEvent::UnfulfilledExpectation { expectation }) => {
            assert_eq!(expectation.control.bounds().count, 1);
            assert_eq!(expectation.target, "Api::ping");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn finalizer_runs_after_the_collection_is_unlocked() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<u32, u32>("Counter::next");
    let weak = Arc::downgrade(&collection);
    let exp = collection.register(
        BasicExpectation::<u32>::builder("Counter::next")
            .times(Times::any_times())
            .returning(move |n| {
                let collection = weak.upgrade().expect("collection alive");
                if *n == 0 {
                    0
                } else {
                    collection.handle_call(&(n - 1)).unwrap() + 1
                }
            })
            .unwrap(),
    );

    assert_eq!(collection.handle_call(&3).unwrap(), 3);
    let shared = exp.expectation().unwrap();
    assert_eq!(shared.control_state().bounds().count, 4);
}

/// Records each side effect and optionally fails it.
struct Journal {
    entries: Arc<AtomicUsize>,
    refuse: bool,
}

impl Requirement<u32> for Journal {
    fn matches(&self, _call: &u32) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn consume(&self, _call: &u32) -> anyhow::Result<()> {
        self.entries.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            anyhow::bail!("journal is read-only");
        }
        Ok(())
    }
}

#[test]
fn failing_side_effect_is_reported_but_the_match_stands() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<u32, &'static str>("Ledger::post");
    let entries = Arc::new(AtomicUsize::new(0));
    let journal = |refuse| Journal {
        entries: Arc::clone(&entries),
        refuse,
    };
    let _older = collection.register(
        BasicExpectation::<u32>::builder("Ledger::post")
            .times(Times::any_times())
            .returning(|_| "older")
            .unwrap(),
    );
    let posted = collection.register(
        BasicExpectation::<u32>::builder("Ledger::post")
            .with(journal(true))
            .with(journal(false))
            .returning(|_| "posted")
            .unwrap(),
    );

    assert_eq!(collection.handle_call(&10).unwrap(), "posted");
    assert_eq!(entries.load(Ordering::SeqCst), 2);
    assert!(posted.is_satisfied());

    let events = reporter.events();
    assert_eq!(
        events.iter().map(ReportedEvent::kind).collect::<Vec<_>>(),
        vec![EventKind::FullMatch, EventKind::UnhandledException]
    );
    match &events[1] {
        ReportedEvent::UnhandledException { error, .. } => {
            assert!(error.contains("journal is read-only"), "{error}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

/// Calls back into its own collection when a match is committed.
struct Recursive {
    collection: Weak<ExpectationCollection<u32, u32>>,
}

impl Requirement<u32> for Recursive {
    fn matches(&self, _call: &u32) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn consume(&self, call: &u32) -> anyhow::Result<()> {
        let collection = self
            .collection
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("collection dropped"))?;
        if *call > 0 {
            collection.handle_call(&(call - 1))?;
        }
        Ok(())
    }
}

#[test]
fn side_effect_may_dispatch_on_the_same_collection() {
    let (done, finished) = mpsc::channel();
    let worker = thread::spawn(move || {
        let reporter = RecordingReporter::new();
        let collection = reporter.collection::<u32, u32>("Tree::walk");
        let exp = collection.register(
            BasicExpectation::<u32>::builder("Tree::walk")
                .times(Times::any_times())
                .with(Recursive {
                    collection: Arc::downgrade(&collection),
                })
                .returning(|depth| *depth)
                .unwrap(),
        );
        let result = collection.handle_call(&3).map_err(|err| err.to_string());
        let count = exp.expectation().unwrap().control_state().bounds().count;
        done.send((result, count, reporter.count(EventKind::UnhandledException)))
            .unwrap();
    });

    let (result, count, failures) = finished
        .recv_timeout(Duration::from_secs(5))
        .expect("dispatch deadlocked inside a side effect");
    assert_eq!(result, Ok(3));
    assert_eq!(count, 4);
    assert_eq!(failures, 0);
    worker.join().unwrap();
}

/// Accepts every call but cannot describe itself.
struct Opaque;

impl Requirement<TestCall> for Opaque {
    fn matches(&self, _call: &TestCall) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn describe(&self) -> Option<String> {
        panic!("description unavailable")
    }
}

#[test]
fn panicking_description_does_not_abort_dispatch() {
    let reporter = RecordingReporter::new();
    let collection = reporter.collection::<TestCall, u8>("Api::get");
    let _fallback = collection.register(ScriptedExpectation::<u8>::available(&[]).returning(1));
    let opaque = collection.register(
        BasicExpectation::<TestCall>::builder("Api::get")
            .times(Times::any_times())
            .with(Opaque)
            .returning(|_| 2_u8)
            .unwrap(),
    );

    assert_eq!(collection.handle_call(&TestCall::new(0)).unwrap(), 1);

    let events = reporter.events();
    assert_eq!(
        events.iter().map(ReportedEvent::kind).collect::<Vec<_>>(),
        vec![EventKind::UnhandledException, EventKind::FullMatch]
    );
    match &events[0] {
        ReportedEvent::UnhandledException {
            expectation, error, ..
        } => {
            assert!(error.contains("description unavailable"), "{error}");
            assert_eq!(expectation.target, "Api::get");
            assert!(expectation.requirements.is_empty());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    // Satisfied from the start, so releasing it asks for no report.
    opaque.close().unwrap();
}
