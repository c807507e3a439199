// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Banker's algorithm safety test.
//!
//! A state is safe if the live slots can be ordered so that each one, in
//! turn, could be handed its entire remaining need out of the units left
//! over by the slots before it. The search starts from the available vector,
//! picks the lowest-indexed unfinished slot whose need fits, credits its
//! allocation back, and rescans from the beginning. Worst case is
//! O(P^2 * R).
use crate::ledger::ResourceLedger;
use crate::types::SlotId;

/// Return a completion order proving the ledger state safe, or `None` if no
/// such order exists. Terminated slots do not take part.
pub fn safe_sequence(ledger: &ResourceLedger) -> Option<Vec<SlotId>> {
    let slots: Vec<_> = ledger
        .live_slots()
        .map(|(id, e)| (id, e.need(), &e.allocated))
        .collect();

    let mut work: Vec<u64> = ledger.available().iter().map(|&a| a as u64).collect();
    let mut finish = vec![false; slots.len()];
    let mut sequence = Vec::with_capacity(slots.len());

    'scan: while sequence.len() < slots.len() {
        for (i, (id, need, allocated)) in slots.iter().enumerate() {
            if finish[i] {
                continue;
            }
            if need.iter().zip(&work).all(|(&n, &w)| n as u64 <= w) {
                for (w, &a) in work.iter_mut().zip(allocated.iter()) {
                    *w += a as u64;
                }
                finish[i] = true;
                sequence.push(*id);
                continue 'scan;
            }
        }
        return None;
    }

    Some(sequence)
}

/// Counting wrapper around [`safe_sequence`] owned by the allocator.
#[derive(Debug, Default)]
pub struct SafetyChecker {
    total_checks: u64,
}

impl SafetyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_safe(&mut self, ledger: &ResourceLedger) -> bool {
        self.total_checks += 1;
        safe_sequence(ledger).is_some()
    }

    pub fn total_checks(&self) -> u64 {
        self.total_checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceId;

    fn grant(l: &mut ResourceLedger, slot: usize, resource: usize, n: u32) {
        for _ in 0..n {
            let g = l.tentatively_grant(SlotId(slot), ResourceId(resource)).unwrap();
            l.commit(g);
        }
    }

    #[test]
    fn test_empty_ledger_is_safe() {
        let l = ResourceLedger::new(vec![1, 2, 3], 4, false);
        assert_eq!(safe_sequence(&l), Some(vec![]));
    }

    /// Classic five process, three resource example.
    #[test]
    fn test_textbook_state() {
        let mut l = ResourceLedger::new(vec![10, 5, 7], 5, false);
        let max = [[7, 5, 3], [3, 2, 2], [9, 0, 2], [2, 2, 2], [4, 3, 3]];
        let alloc = [[0, 1, 0], [2, 0, 0], [3, 0, 2], [2, 1, 1], [0, 0, 2]];
        for m in max {
            l.register(m.to_vec()).unwrap();
        }
        for (slot, a) in alloc.iter().enumerate() {
            for (r, &n) in a.iter().enumerate() {
                grant(&mut l, slot, r, n);
            }
        }
        assert_eq!(l.available(), &[3, 3, 2]);
        assert_eq!(
            safe_sequence(&l),
            Some(vec![SlotId(1), SlotId(3), SlotId(0), SlotId(2), SlotId(4)])
        );
    }

    #[test]
    fn test_unsafe_state() {
        let mut l = ResourceLedger::new(vec![2], 2, false);
        l.register(vec![2]).unwrap();
        l.register(vec![2]).unwrap();
        grant(&mut l, 0, 0, 1);
        grant(&mut l, 1, 0, 1);
        assert_eq!(safe_sequence(&l), None);
    }

    #[test]
    fn test_dead_slots_are_ignored() {
        let mut l = ResourceLedger::new(vec![2], 2, false);
        l.register(vec![2]).unwrap();
        l.register(vec![2]).unwrap();
        grant(&mut l, 0, 0, 1);
        l.retire(SlotId(0)).unwrap();
        grant(&mut l, 1, 0, 1);
        assert_eq!(safe_sequence(&l), Some(vec![SlotId(1)]));
    }

    #[test]
    fn test_checker_counts_calls() {
        let l = ResourceLedger::new(vec![1], 1, false);
        let mut checker = SafetyChecker::new();
        assert!(checker.is_safe(&l));
        assert!(checker.is_safe(&l));
        assert_eq!(checker.total_checks(), 2);
    }
}
