//! Repetition bounds and sequence memberships of one expectation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ConfigError;
use crate::sequence::{self, Sequence, SequenceCore, SequenceTag, SlotId};
use crate::state::{Bounds, ControlState, Rating, Ratings};

/// How often an expectation must and may be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTimes")]
pub struct Times {
    min: u32,
    max: u32,
}

impl Times {
    pub fn new(min: u32, max: u32) -> Result<Self, ConfigError> {
        if max < min {
            return Err(ConfigError::InvalidTimes { min, max });
        }
        Ok(Self { min, max })
    }

    pub const fn exactly(n: u32) -> Self {
        Self { min: n, max: n }
    }

    pub const fn at_least(min: u32) -> Self {
        Self { min, max: u32::MAX }
    }

    pub const fn at_most(max: u32) -> Self {
        Self { min: 0, max }
    }

    pub const fn never() -> Self {
        Self::exactly(0)
    }

    pub const fn once() -> Self {
        Self::exactly(1)
    }

    pub const fn twice() -> Self {
        Self::exactly(2)
    }

    pub const fn any_times() -> Self {
        Self::at_least(0)
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::once()
    }
}

/// Untyped bounds, e.g. from a config file.
impl TryFrom<(i64, i64)> for Times {
    type Error = ConfigError;

    fn try_from((min, max): (i64, i64)) -> Result<Self, Self::Error> {
        if min < 0 || max < 0 {
            return Err(ConfigError::NegativeBound { min, max });
        }
        let min = u32::try_from(min).map_err(|_| ConfigError::BoundOutOfRange(min))?;
        let max = u32::try_from(max).map_err(|_| ConfigError::BoundOutOfRange(max))?;
        Self::new(min, max)
    }
}

#[derive(Deserialize)]
struct RawTimes {
    min: i64,
    max: i64,
}

impl TryFrom<RawTimes> for Times {
    type Error = ConfigError;

    fn try_from(raw: RawTimes) -> Result<Self, Self::Error> {
        Self::try_from((raw.min, raw.max))
    }
}

#[derive(Debug)]
struct Membership {
    sequence: Arc<SequenceCore>,
    slot: SlotId,
}

/// Repetition bound plus sequence memberships of one expectation.
///
/// The shape (bounds and memberships) is fixed at construction; only the
/// match count changes.
#[derive(Debug)]
pub struct ControlPolicy {
    times: Times,
    count: u32,
    memberships: SmallVec<[Membership; 2]>,
}

impl ControlPolicy {
    /// Create the policy and claim one slot in each of `sequences`.
    pub fn new(times: Times, sequences: &[&Sequence]) -> Result<Self, ConfigError> {
        let cores: Vec<Arc<SequenceCore>> = sequences
            .iter()
            .map(|sequence| Arc::clone(sequence.core()))
            .collect();
        Self::from_cores(times, cores)
    }

    pub(crate) fn from_cores(
        times: Times,
        sequences: Vec<Arc<SequenceCore>>,
    ) -> Result<Self, ConfigError> {
        let mut tags: Vec<SequenceTag> = sequences.iter().map(|seq| seq.tag()).collect();
        tags.sort_unstable();
        if let Some(pair) = tags.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::DuplicateSequence { tag: pair[0] });
        }

        // A `never()` expectation still needs a slot; it is saturated right away.
        let required = times.max.max(1);
        let mut memberships = SmallVec::new();
        for sequence in sequences {
            let slot = sequence.add(required)?;
            memberships.push(Membership { sequence, slot });
        }

        let policy = Self {
            times,
            count: 0,
            memberships,
        };
        policy.update_sequence_states();
        Ok(policy)
    }

    pub fn times(&self) -> Times {
        self.times
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn sequence_count(&self) -> usize {
        self.memberships.len()
    }

    pub fn is_satisfied(&self) -> bool {
        self.times.min <= self.count && self.count <= self.times.max
    }

    pub fn is_saturated(&self) -> bool {
        self.count == self.times.max
    }

    /// Not saturated and the head of every sequence it belongs to.
    pub fn is_applicable(&self) -> bool {
        self.count < self.times.max
            && self
                .memberships
                .iter()
                .all(|m| m.sequence.is_head(m.slot))
    }

    /// Record one match if the policy is still applicable.
    ///
    /// The head check and the slot updates happen under the locks of every
    /// member sequence at once. On `false` nothing changed.
    pub fn try_consume(&mut self) -> bool {
        if self.count >= self.times.max {
            return false;
        }

        let slots: SmallVec<[(&SequenceCore, SlotId); 2]> = self
            .memberships
            .iter()
            .map(|m| (&*m.sequence, m.slot))
            .collect();
        // Reaching `max` saturates the slots on its own.
        let satisfied = self.count + 1 == self.times.min;
        if !sequence::consume_all(&slots, satisfied) {
            return false;
        }
        self.count += 1;
        true
    }

    /// Record one match.
    ///
    /// # Panics
    ///
    /// Panics if the policy is not applicable.
    pub fn consume(&mut self) {
        assert!(self.try_consume(), "control policy is not applicable");
    }

    pub fn state(&self) -> ControlState {
        let bounds = Bounds {
            min: self.times.min,
            max: self.times.max,
            count: self.count,
        };

        if self.is_saturated() {
            return ControlState::Saturated {
                bounds,
                sequences: self.memberships.iter().map(|m| m.sequence.tag()).collect(),
            };
        }

        let mut ratings = Ratings::new();
        let mut blocking = Vec::new();
        for membership in &self.memberships {
            match membership.sequence.priority_of(membership.slot) {
                Some(priority) => ratings.push(Rating::new(priority, membership.sequence.tag())),
                None => blocking.push(membership.sequence.tag()),
            }
        }

        if blocking.is_empty() {
            ControlState::Available { bounds, ratings }
        } else {
            ControlState::Blocked {
                bounds,
                ratings,
                blocking,
            }
        }
    }

    /// Human-readable summary of the current state.
    pub fn describe(&self) -> String {
        self.state().to_string()
    }

    /// Initial slot states for a policy that starts out satisfied or saturated.
    fn update_sequence_states(&self) {
        if self.count == self.times.max {
            for membership in &self.memberships {
                membership.sequence.mark_saturated(membership.slot);
            }
        } else if self.count == self.times.min {
            for membership in &self.memberships {
                membership.sequence.mark_satisfied(membership.slot);
            }
        }
    }
}
