/// The remembered set: per-region bookkeeping of references that leave
/// the region. Immutables and cowns are referenced, never traced, so the
/// region keeps them alive by owning one reference-count contribution per
/// distinct target. Mark registers the targets seen during a GC cycle;
/// sweep releases the contribution of every target that was not seen.
use fnv::FnvHashMap;

use crate::object::Object;
use crate::rawptr::RawPtr;

/// Whether an insert consumes the caller's reference-count contribution
/// or takes a fresh one
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Transfer {
    Yes,
    No,
}

pub struct RememberedSet {
    // target -> marked this cycle
    refs: FnvHashMap<RawPtr<Object>, bool>,
}

impl RememberedSet {
    pub fn new() -> RememberedSet {
        RememberedSet {
            refs: FnvHashMap::default(),
        }
    }

    /// Register a cross-region reference to `target`. With
    /// `Transfer::No` a fresh count is taken; with `Transfer::Yes` the
    /// caller's count is consumed (or dropped, if the target was already
    /// present).
    pub unsafe fn insert(&mut self, target: RawPtr<Object>, transfer: Transfer) {
        debug_assert!(target.as_ref().is_rc() || target.as_ref().is_cown());

        if self.refs.contains_key(&target) {
            if transfer == Transfer::Yes {
                let dead = target.as_ref().decref();
                debug_assert!(!dead);
            }
        } else {
            self.refs.insert(target, false);
            if transfer == Transfer::No {
                target.as_ref().incref();
            }
        }
    }

    /// Note that `target` was reached during the current mark phase,
    /// counting only the first sighting
    pub fn mark(&mut self, target: RawPtr<Object>, marked: &mut usize) {
        match self.refs.get_mut(&target) {
            Some(seen) => {
                if !*seen {
                    *seen = true;
                    *marked += 1;
                }
            }
            // every reachable external target must have been inserted
            None => debug_assert!(false, "marked target missing from remembered set"),
        }
    }

    /// Absorb another region's contributions. A target held by both
    /// regions keeps a single contribution; the duplicate is released.
    pub unsafe fn merge(&mut self, other: RememberedSet) {
        for (target, _) in other.refs {
            if self.refs.contains_key(&target) {
                let dead = target.as_ref().decref();
                debug_assert!(!dead);
            } else {
                self.refs.insert(target, false);
            }
        }
    }

    /// Drop every entry not marked this cycle, releasing its
    /// contribution, and reset the marks of the survivors
    pub unsafe fn sweep_set(&mut self, marked: usize) {
        if marked == self.refs.len() {
            for seen in self.refs.values_mut() {
                *seen = false;
            }
            return;
        }

        self.refs.retain(|target, seen| {
            if *seen {
                *seen = false;
                true
            } else {
                unsafe { target.as_ref().decref() };
                false
            }
        });
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn contains(&self, target: RawPtr<Object>) -> bool {
        self.refs.contains_key(&target)
    }
}
