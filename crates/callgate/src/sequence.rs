//! Ordering constraints that span expectations and mocks.
//!
//! A [`Sequence`] is an ordered chain of slots. Every expectation attached to
//! a sequence owns exactly one slot, and only the *head* slot may be consumed.
//! A slot stops blocking its successors once the owning expectation reports
//! that it is satisfied, so expectations with `min == 0` can be skipped.
//!
//! ```text
//!  cursor
//!    │
//!    ▼
//! ┌───────┬───────┬───────┬───────┐
//! │ sat'd │ sat'd │ unsat │ unsat │
//! └───────┴───────┴───────┴───────┘
//!    head    head    head    (blocked)
//! ```
//!
//! Slots are stored in an arena and addressed by [`SlotId`] indices, so
//! expectations can outlive the user-facing [`Sequence`] handle (and the other
//! way round) without holding dangling state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use crate::error::{ConfigError, LifecycleError};
use crate::reporter::Reporter;
use crate::reporting::{SequenceReport, SourceLocation};

/// Relative score of a head slot. Only meaningful when compared against
/// scores of the same sequence.
pub type Priority = i64;

/// Identity of a sequence, usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SequenceTag(Uuid);

impl SequenceTag {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SequenceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Handle of one slot inside a sequence. Stable for the sequence's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Placement strategy deciding which head slot is preferred when several
/// expectations of the same sequence compete for one call.
pub trait PriorityStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Score for the slot at `index` while the cursor sits at `cursor`.
    /// Called only for head slots, so `cursor <= index` holds.
    fn priority(&self, index: usize, cursor: usize) -> Priority;
}

/// Prefers the slot nearest to the cursor: make the least possible progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct LazyStrategy;

impl PriorityStrategy for LazyStrategy {
    fn name(&self) -> &'static str {
        "lazy"
    }

    fn priority(&self, index: usize, cursor: usize) -> Priority {
        debug_assert!(cursor <= index, "cursor is ahead of a head slot");
        Priority::MAX - distance(index, cursor)
    }
}

/// Prefers the slot farthest from the cursor: skip optional slots eagerly.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyStrategy;

impl PriorityStrategy for GreedyStrategy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn priority(&self, index: usize, cursor: usize) -> Priority {
        debug_assert!(cursor <= index, "cursor is ahead of a head slot");
        distance(index, cursor)
    }
}

fn distance(index: usize, cursor: usize) -> Priority {
    Priority::try_from(index - cursor).unwrap_or(Priority::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Unsatisfied,
    Satisfied,
    Saturated,
}

#[derive(Debug)]
struct Slot {
    required: u32,
    consumed: u32,
    state: SlotState,
}

impl Slot {
    fn is_fulfilled(&self) -> bool {
        matches!(self.state, SlotState::Satisfied | SlotState::Saturated)
    }

    fn is_active(&self) -> bool {
        matches!(self.state, SlotState::Unsatisfied | SlotState::Satisfied)
    }
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Slot>,
    /// All slots before the cursor are fulfilled.
    cursor: usize,
}

impl SlotTable {
    fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        let len = self.slots.len();
        self.slots
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("slot {id} does not belong to this sequence ({len} slots)"))
    }

    fn is_head(&self, id: SlotId) -> bool {
        let index = id.0;
        assert!(index < self.slots.len(), "slot {id} does not belong to this sequence");

        index >= self.cursor
            && self.slots[self.cursor..index].iter().all(Slot::is_fulfilled)
            && self.slots[index].is_active()
    }

    fn consume(&mut self, id: SlotId) {
        assert!(self.is_head(id), "sequence slot {id} is not the head");

        let index = id.0;
        let slot = &mut self.slots[index];
        debug_assert!(slot.consumed < slot.required, "slot {id} over-consumed");
        slot.consumed += 1;
        self.cursor = index;
        if slot.consumed == slot.required {
            slot.state = SlotState::Saturated;
            self.cursor = index + 1;
        }
    }

    fn mark_satisfied(&mut self, id: SlotId) {
        let slot = self.slot_mut(id);
        if slot.state == SlotState::Unsatisfied {
            slot.state = SlotState::Satisfied;
        }
    }

    fn fulfilled_prefix(&self) -> usize {
        self.slots.iter().take_while(|slot| slot.is_fulfilled()).count()
    }
}

/// Shared state of a sequence. Owned jointly by the user handle and every
/// control policy holding a slot.
#[derive(Debug)]
pub(crate) struct SequenceCore {
    tag: SequenceTag,
    from: SourceLocation,
    strategy: Box<dyn PriorityStrategy>,
    table: Mutex<SlotTable>,
}

impl SequenceCore {
    fn table(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn tag(&self) -> SequenceTag {
        self.tag
    }

    pub(crate) fn report(&self) -> SequenceReport {
        SequenceReport {
            tag: self.tag,
            strategy: self.strategy.name(),
            from: self.from.clone(),
        }
    }

    pub(crate) fn add(&self, required: u32) -> Result<SlotId, ConfigError> {
        if required == 0 {
            return Err(ConfigError::ZeroSlot);
        }

        let mut table = self.table();
        table.slots.push(Slot {
            required,
            consumed: 0,
            state: SlotState::Unsatisfied,
        });
        Ok(SlotId(table.slots.len() - 1))
    }

    pub(crate) fn is_head(&self, id: SlotId) -> bool {
        self.table().is_head(id)
    }

    pub(crate) fn priority_of(&self, id: SlotId) -> Option<Priority> {
        let table = self.table();
        table
            .is_head(id)
            .then(|| self.strategy.priority(id.0, table.cursor))
    }

    pub(crate) fn mark_satisfied(&self, id: SlotId) {
        self.table().mark_satisfied(id);
    }

    pub(crate) fn mark_saturated(&self, id: SlotId) {
        self.table().slot_mut(id).state = SlotState::Saturated;
    }

    pub(crate) fn consume(&self, id: SlotId) {
        self.table().consume(id);
    }

    pub(crate) fn cursor(&self) -> usize {
        self.table().cursor
    }

    pub(crate) fn consumed(&self, id: SlotId) -> u32 {
        self.table().slot_mut(id).consumed
    }

    fn verify(&self) -> Result<(), LifecycleError> {
        let table = self.table();
        let satisfied = table.fulfilled_prefix();
        debug_assert!(table.cursor <= satisfied, "cursor skipped unsatisfied slots");

        if satisfied == table.slots.len() {
            return Ok(());
        }

        Err(LifecycleError::UnfulfilledSequence {
            tag: self.tag,
            satisfied,
            total: table.slots.len(),
        })
    }
}

/// Consume one slot in each of several sequences, all or nothing.
///
/// Every table is locked in tag order before the first head check, so a
/// concurrent consume on an overlapping set of sequences cannot slip in
/// between the check and the commit. With `satisfied` set, each consumed slot
/// is also marked satisfied under the same locks.
///
/// Returns `false` without touching any slot if one of them is not the head.
pub(crate) fn consume_all(slots: &[(&SequenceCore, SlotId)], satisfied: bool) -> bool {
    let mut ordered = slots.to_vec();
    ordered.sort_by_key(|(core, _)| core.tag);
    let mut tables: Vec<(MutexGuard<'_, SlotTable>, SlotId)> = ordered
        .into_iter()
        .map(|(core, id)| (core.table(), id))
        .collect();

    if !tables.iter().all(|(table, id)| table.is_head(*id)) {
        return false;
    }
    for (table, id) in &mut tables {
        table.consume(*id);
        if satisfied {
            table.mark_satisfied(*id);
        }
    }
    true
}

/// User-facing sequence handle.
///
/// The handle is deliberately not `Clone`: it is the single owner of the
/// end-of-life check. Expectations keep the underlying slot table alive on
/// their own, so dropping the handle early is fine.
///
/// Call [`Sequence::close`] to run the end-of-life check explicitly; otherwise
/// it runs on drop.
pub struct Sequence {
    core: Arc<SequenceCore>,
    reporter: Arc<dyn Reporter>,
    closed: bool,
}

impl Sequence {
    /// Sequence preferring the least possible progress per call.
    #[track_caller]
    pub fn lazy(reporter: Arc<dyn Reporter>) -> Self {
        Self::with_strategy(LazyStrategy, reporter)
    }

    /// Sequence preferring the most possible progress per call.
    #[track_caller]
    pub fn greedy(reporter: Arc<dyn Reporter>) -> Self {
        Self::with_strategy(GreedyStrategy, reporter)
    }

    #[track_caller]
    pub fn with_strategy(
        strategy: impl PriorityStrategy + 'static,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            core: Arc::new(SequenceCore {
                tag: SequenceTag::new(),
                from: SourceLocation::caller(),
                strategy: Box::new(strategy),
                table: Mutex::default(),
            }),
            reporter,
            closed: false,
        }
    }

    pub fn tag(&self) -> SequenceTag {
        self.core.tag
    }

    pub fn from(&self) -> &SourceLocation {
        &self.core.from
    }

    pub fn report(&self) -> SequenceReport {
        self.core.report()
    }

    /// Append a slot that must be consumed `required` times.
    pub fn add(&self, required: u32) -> Result<SlotId, ConfigError> {
        self.core.add(required)
    }

    pub fn is_head(&self, id: SlotId) -> bool {
        self.core.is_head(id)
    }

    /// Strategy score of `id`, or `None` if it is not a head slot.
    pub fn priority_of(&self, id: SlotId) -> Option<Priority> {
        self.core.priority_of(id)
    }

    pub fn mark_satisfied(&self, id: SlotId) {
        self.core.mark_satisfied(id);
    }

    pub fn mark_saturated(&self, id: SlotId) {
        self.core.mark_saturated(id);
    }

    /// Consume `id` once.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not the head slot.
    pub fn consume(&self, id: SlotId) {
        self.core.consume(id);
    }

    pub fn cursor(&self) -> usize {
        self.core.cursor()
    }

    pub fn len(&self) -> usize {
        self.core.table().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the end-of-life check now.
    ///
    /// Unfulfilled sequences are forwarded to the reporter and returned.
    pub fn close(mut self) -> Result<(), LifecycleError> {
        self.closed = true;
        self.finish()
    }

    pub(crate) fn core(&self) -> &Arc<SequenceCore> {
        &self.core
    }

    fn finish(&self) -> Result<(), LifecycleError> {
        let result = self.core.verify();
        if let Err(LifecycleError::UnfulfilledSequence {
            satisfied, total, ..
        }) = &result
        {
            tracing::debug!(
                tag = %self.core.tag,
                satisfied,
                total,
                "sequence closed while unfulfilled"
            );
            self.reporter
                .report_unfulfilled_sequence(&self.core.report(), *satisfied, *total);
        }
        result
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.finish();
        }
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("tag", &self.core.tag)
            .field("strategy", &self.core.strategy.name())
            .field("cursor", &self.cursor())
            .field("slots", &self.len())
            .finish()
    }
}
