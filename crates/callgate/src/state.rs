//! Control-state snapshots, call classification, and the best-rating rule.

use std::fmt;

use serde::Serialize;
use smallvec::SmallVec;

use crate::reporting::RequirementOutcomes;
use crate::sequence::{Priority, SequenceTag};

/// Priority of one sequence membership that is currently head-eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rating {
    pub priority: Priority,
    pub tag: SequenceTag,
}

impl Rating {
    pub fn new(priority: Priority, tag: SequenceTag) -> Self {
        Self { priority, tag }
    }
}

/// One rating per head-eligible membership, in membership order.
pub type Ratings = SmallVec<[Rating; 2]>;

/// Repetition bounds together with the current count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bounds {
    pub min: u32,
    pub max: u32,
    pub count: u32,
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "matched {} of [{}, ", self.count, self.min)?;
        if self.max == u32::MAX {
            write!(f, "unbounded]")
        } else {
            write!(f, "{}]", self.max)
        }
    }
}

/// Snapshot of a control policy.
///
/// Saturation takes precedence over blocking: an exhausted expectation is
/// reported as saturated even if one of its sequences has moved on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ControlState {
    /// `count == max`; can never match again.
    Saturated {
        bounds: Bounds,
        sequences: Vec<SequenceTag>,
    },
    /// At least one sequence is waiting on an earlier slot.
    Blocked {
        bounds: Bounds,
        ratings: Ratings,
        blocking: Vec<SequenceTag>,
    },
    Available {
        bounds: Bounds,
        ratings: Ratings,
    },
}

impl ControlState {
    pub fn bounds(&self) -> Bounds {
        match self {
            Self::Saturated { bounds, .. }
            | Self::Blocked { bounds, .. }
            | Self::Available { bounds, .. } => *bounds,
        }
    }

    /// Ratings of head-eligible memberships. Empty when saturated.
    pub fn ratings(&self) -> &[Rating] {
        match self {
            Self::Saturated { .. } => &[],
            Self::Blocked { ratings, .. } | Self::Available { ratings, .. } => ratings,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available { .. })
    }

    pub fn is_saturated(&self) -> bool {
        matches!(self, Self::Saturated { .. })
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Saturated { bounds, sequences } => {
                write!(f, "saturated, {bounds}")?;
                if !sequences.is_empty() {
                    write!(f, "; member of {} sequence(s)", sequences.len())?;
                }
                Ok(())
            }
            Self::Blocked {
                bounds,
                ratings,
                blocking,
            } => write!(
                f,
                "blocked, {bounds}; is head of {} of {} sequence(s)",
                ratings.len(),
                ratings.len() + blocking.len()
            ),
            Self::Available { bounds, ratings } => {
                write!(f, "available, {bounds}")?;
                if !ratings.is_empty() {
                    write!(
                        f,
                        "; is head of {0} of {0} sequence(s)",
                        ratings.len()
                    )?;
                }
                Ok(())
            }
        }
    }
}

/// How one candidate relates to one incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// At least one requirement rejected the call.
    NoMatch,
    /// Every requirement accepted the call, but the expectation is saturated
    /// or waiting on a sequence.
    Blocked,
    FullMatch,
}

/// Derive the classification from the requirement verdicts and control state.
pub fn classify(outcomes: &RequirementOutcomes, state: &ControlState) -> Classification {
    if !outcomes.all_matched() {
        Classification::NoMatch
    } else if state.is_available() {
        Classification::FullMatch
    } else {
        Classification::Blocked
    }
}

/// Whether `lhs` is strictly preferable to `rhs`.
///
/// A candidate without sequence memberships beats one with memberships.
/// Otherwise `lhs` must not lose on any shared sequence and must win on at
/// least one. Ties and disjoint memberships are never "better", which leaves
/// the decision to iteration order.
pub fn has_better_rating(lhs: &[Rating], rhs: &[Rating]) -> bool {
    match (lhs.is_empty(), rhs.is_empty()) {
        (true, rhs_empty) => !rhs_empty,
        (false, true) => false,
        (false, false) => {
            let mut wins = 0usize;
            for left in lhs {
                let Some(right) = rhs.iter().find(|right| right.tag == left.tag) else {
                    continue;
                };
                if left.priority < right.priority {
                    return false;
                }
                if left.priority > right.priority {
                    wins += 1;
                }
            }
            wins > 0
        }
    }
}

/// Index of the preferred candidate, scanning in iteration order.
///
/// A later candidate only displaces the current best if it has a strictly
/// better rating, so the earliest candidate wins every tie.
pub fn find_best_match<'a, I>(candidates: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a [Rating]>,
{
    let mut iter = candidates.into_iter().enumerate();
    let (mut best, mut best_ratings) = iter.next()?;
    for (index, ratings) in iter {
        if has_better_rating(ratings, best_ratings) {
            best = index;
            best_ratings = ratings;
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn tags() -> (SequenceTag, SequenceTag) {
        let reporter: std::sync::Arc<dyn crate::Reporter> =
            std::sync::Arc::new(crate::TracingReporter);
        let a = crate::Sequence::lazy(reporter.clone());
        let b = crate::Sequence::lazy(reporter);
        (a.tag(), b.tag())
    }

    fn bounds(min: u32, max: u32, count: u32) -> Bounds {
        Bounds { min, max, count }
    }

    #[test]
    fn classify_prefers_requirement_failures() {
        let failed = RequirementOutcomes::new(vec![true, false]);
        let available = ControlState::Available {
            bounds: bounds(1, 1, 0),
            ratings: Ratings::new(),
        };
        assert_eq!(classify(&failed, &available), Classification::NoMatch);
    }

    #[test]
    fn classify_blocked_and_saturated_as_blocked() {
        let matched = RequirementOutcomes::new(vec![true]);
        let saturated = ControlState::Saturated {
            bounds: bounds(1, 1, 1),
            sequences: Vec::new(),
        };
        let blocked = ControlState::Blocked {
            bounds: bounds(1, 1, 0),
            ratings: Ratings::new(),
            blocking: vec![tags().0],
        };
        assert_eq!(classify(&matched, &saturated), Classification::Blocked);
        assert_eq!(classify(&matched, &blocked), Classification::Blocked);
    }

    #[test]
    fn classify_available_with_no_requirements_is_full_match() {
        let empty = RequirementOutcomes::default();
        let available = ControlState::Available {
            bounds: bounds(0, 3, 1),
            ratings: Ratings::new(),
        };
        assert_eq!(classify(&empty, &available), Classification::FullMatch);
    }

    #[test]
    fn unsequenced_candidate_beats_sequenced() {
        let (a, _) = tags();
        let sequenced: Ratings = smallvec![Rating::new(Priority::MAX, a)];
        assert!(has_better_rating(&[], &sequenced));
        assert!(!has_better_rating(&sequenced, &[]));
        assert!(!has_better_rating(&[], &[]));
    }

    #[test]
    fn higher_priority_on_shared_tag_wins() {
        let (a, _) = tags();
        let high: Ratings = smallvec![Rating::new(5, a)];
        let low: Ratings = smallvec![Rating::new(3, a)];
        assert!(has_better_rating(&high, &low));
        assert!(!has_better_rating(&low, &high));
        assert!(!has_better_rating(&high, &high));
    }

    #[test]
    fn losing_any_shared_tag_is_not_better() {
        let (a, b) = tags();
        let lhs: Ratings = smallvec![Rating::new(5, a), Rating::new(1, b)];
        let rhs: Ratings = smallvec![Rating::new(3, a), Rating::new(2, b)];
        assert!(!has_better_rating(&lhs, &rhs));
        assert!(!has_better_rating(&rhs, &lhs));
    }

    #[test]
    fn disjoint_tags_are_a_tie() {
        let (a, b) = tags();
        let lhs: Ratings = smallvec![Rating::new(5, a)];
        let rhs: Ratings = smallvec![Rating::new(1, b)];
        assert!(!has_better_rating(&lhs, &rhs));
        assert!(!has_better_rating(&rhs, &lhs));
    }

    #[test]
    fn find_best_match_keeps_first_on_ties() {
        let (a, _) = tags();
        let same: Ratings = smallvec![Rating::new(1, a)];
        let candidates = [same.as_slice(), same.as_slice(), same.as_slice()];
        assert_eq!(find_best_match(candidates), Some(0));
    }

    #[test]
    fn find_best_match_picks_dominating_candidate() {
        let (a, _) = tags();
        let low: Ratings = smallvec![Rating::new(1, a)];
        let high: Ratings = smallvec![Rating::new(9, a)];
        let candidates = [low.as_slice(), high.as_slice(), low.as_slice()];
        assert_eq!(find_best_match(candidates), Some(1));
    }

    #[test]
    fn find_best_match_prefers_unsequenced() {
        let (a, _) = tags();
        let sequenced: Ratings = smallvec![Rating::new(Priority::MAX, a)];
        let candidates: [&[Rating]; 2] = [sequenced.as_slice(), &[]];
        assert_eq!(find_best_match(candidates), Some(1));
    }

    #[test]
    fn find_best_match_of_nothing_is_none() {
        assert_eq!(find_best_match(std::iter::empty::<&[Rating]>()), None);
    }

    #[test]
    fn display_describes_progress() {
        let (a, b) = tags();
        let state = ControlState::Blocked {
            bounds: bounds(1, 2, 0),
            ratings: smallvec![Rating::new(0, a)],
            blocking: vec![b],
        };
        assert_eq!(
            state.to_string(),
            "blocked, matched 0 of [1, 2]; is head of 1 of 2 sequence(s)"
        );

        let unbounded = ControlState::Available {
            bounds: bounds(0, u32::MAX, 4),
            ratings: Ratings::new(),
        };
        assert_eq!(unbounded.to_string(), "available, matched 4 of [0, unbounded]");
    }
}
