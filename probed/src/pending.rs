//! Pending-event merge state machine (spec.md §4.G / "State machine —
//! pending-event merge" / §8 invariant #3 / E6). Grounded directly on the
//! original's `pendingEventKey{eventId, ktimeEnter}` /
//! `lru.New[pendingEventKey, pendingEvent](4096)` in `generickprobe.go`,
//! using the `lru` crate's `LruCache::push` to get the evicted entry back
//! for the eviction-as-MergeError bookkeeping spec.md §9 calls for.

use std::num::NonZeroUsize;

use lru::LruCache;

use probe_common::PENDING_EVENTS_LRU_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingEventKey {
    pub event_id: u64,
    pub ktime_enter: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Enter,
    Return,
}

#[derive(Debug, Clone)]
pub struct PendingEvent<T> {
    pub payload: T,
    pub direction: Direction,
}

/// Counted reasons a merge failed (spec.md "State machine — pending-event
/// merge"): either both sides arrived same-direction, or a slot was
/// evicted before its counterpart showed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeError {
    SameDirection {
        prev: Direction,
        curr: Direction,
    },
    Evicted {
        prev: Option<Direction>,
        curr: Option<Direction>,
    },
}

pub enum MergeOutcome<T> {
    /// Stored awaiting its counterpart; nothing to emit yet.
    Pending,
    /// Both sides arrived; `(enter, ret)` ready for the caller to merge
    /// into one user-facing record.
    Merged { enter: T, ret: T },
    Error(MergeError),
}

/// Bounded per-reader store for in-flight entry events awaiting their
/// return-side counterpart (spec.md §5: "LRU maps are per-probe and
/// accessed only from the reader that owns them" — not `Sync`,
/// deliberately single-owner).
pub struct PendingEvents<T> {
    cache: LruCache<PendingEventKey, PendingEvent<T>>,
}

impl<T> Default for PendingEvents<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingEvents<T> {
    pub fn new() -> Self {
        Self::with_capacity(PENDING_EVENTS_LRU_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            cache: LruCache::new(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Offers `payload` arriving from `direction` at `key`. Pairs it with
    /// any stored counterpart (removing that slot), stores it awaiting a
    /// counterpart otherwise, and reports the merge-error cases from the
    /// state machine in spec.md.
    pub fn offer(&mut self, key: PendingEventKey, direction: Direction, payload: T) -> MergeOutcome<T> {
        if let Some(prev) = self.cache.pop(&key) {
            return match (prev.direction, direction) {
                (Direction::Enter, Direction::Return) => MergeOutcome::Merged {
                    enter: prev.payload,
                    ret: payload,
                },
                (Direction::Return, Direction::Enter) => MergeOutcome::Merged {
                    enter: payload,
                    ret: prev.payload,
                },
                (same_prev, same_curr) => MergeOutcome::Error(MergeError::SameDirection {
                    prev: same_prev,
                    curr: same_curr,
                }),
            };
        }

        // `push` evicts the least-recently-inserted slot when full and
        // hands it back, so a terminal eviction can be counted as a
        // MergeError rather than silently dropped (spec.md §9).
        if let Some((evicted_key, evicted)) = self.cache.push(key, PendingEvent { payload, direction }) {
            if evicted_key != key {
                return MergeOutcome::Error(MergeError::Evicted {
                    prev: Some(evicted.direction),
                    curr: None,
                });
            }
        }
        MergeOutcome::Pending
    }

    /// A return (or enter) arriving for a key that was already evicted
    /// produces a terminal `MergeError` with no stored counterpart
    /// (spec.md E6: "a subsequent return for that evicted key produces a
    /// MergeError{prev:∅, curr:Exit} and no event"). Callers that track
    /// eviction separately call this instead of `offer` once they know
    /// the key is gone.
    pub fn merge_error_for_missing(direction: Direction) -> MergeError {
        MergeError::Evicted {
            prev: None,
            curr: Some(direction),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_then_return_merges_exactly_once() {
        let mut pending: PendingEvents<u32> = PendingEvents::new();
        let key = PendingEventKey {
            event_id: 1,
            ktime_enter: 100,
        };
        assert!(matches!(
            pending.offer(key, Direction::Enter, 10),
            MergeOutcome::Pending
        ));
        match pending.offer(key, Direction::Return, 20) {
            MergeOutcome::Merged { enter, ret } => {
                assert_eq!(enter, 10);
                assert_eq!(ret, 20);
            }
            _ => panic!("expected merge"),
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn two_enters_on_same_key_is_a_merge_error() {
        let mut pending: PendingEvents<u32> = PendingEvents::new();
        let key = PendingEventKey {
            event_id: 1,
            ktime_enter: 100,
        };
        pending.offer(key, Direction::Enter, 10);
        let outcome = pending.offer(key, Direction::Enter, 11);
        assert!(matches!(
            outcome,
            MergeOutcome::Error(MergeError::SameDirection {
                prev: Direction::Enter,
                curr: Direction::Enter
            })
        ));
    }

    #[test]
    fn holds_at_most_one_entry_per_key_and_respects_capacity() {
        let mut pending: PendingEvents<u32> = PendingEvents::with_capacity(2);
        pending.offer(
            PendingEventKey {
                event_id: 1,
                ktime_enter: 1,
            },
            Direction::Enter,
            1,
        );
        pending.offer(
            PendingEventKey {
                event_id: 2,
                ktime_enter: 2,
            },
            Direction::Enter,
            2,
        );
        assert_eq!(pending.len(), 2);
        let outcome = pending.offer(
            PendingEventKey {
                event_id: 3,
                ktime_enter: 3,
            },
            Direction::Enter,
            3,
        );
        assert!(matches!(outcome, MergeOutcome::Pending));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn eviction_of_non_terminal_state_is_reported() {
        let mut pending: PendingEvents<u32> = PendingEvents::with_capacity(1);
        pending.offer(
            PendingEventKey {
                event_id: 1,
                ktime_enter: 1,
            },
            Direction::Enter,
            1,
        );
        let outcome = pending.offer(
            PendingEventKey {
                event_id: 2,
                ktime_enter: 2,
            },
            Direction::Enter,
            2,
        );
        assert!(matches!(
            outcome,
            MergeOutcome::Error(MergeError::Evicted {
                prev: Some(Direction::Enter),
                curr: None
            })
        ));
    }
}
