/*
 * heap.rs
 *
 * Timer min-heap: a dense array of event handles ordered by absolute
 * deadline, with each record's heap_idx as the inverse map so erase is
 * O(log n) instead of a linear hunt.
 *
 * The sift-down finishes with a sift-up. That combined pattern is what
 * makes erase-by-index work: the displaced last element moves the hole
 * toward the smaller subtree, and the trailing sift-up settles it even
 * when it belongs above the vacated slot.
 *
 * Capacity grows by doubling (floor 8). Reserve is exposed separately
 * so the base can pre-grow before committing any timer state.
 */

use crate::event::{EventHandle, EventTable, NO_HEAP_INDEX};

#[derive(Default)]
pub(crate) struct TimerHeap {
    elems: Vec<EventHandle>,
}

/* deadline ordering; ties keep the incumbent */
#[inline]
fn greater(table: &EventTable, a: EventHandle, b: EventHandle) -> bool {
    table.rec(a).deadline > table.rec(b).deadline
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        TimerHeap { elems: Vec::new() }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.elems.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    #[inline]
    pub(crate) fn top(&self) -> Option<EventHandle> {
        self.elems.first().copied()
    }

    /// All current entries, for the backward-clock rebase walk.
    #[inline]
    pub(crate) fn entries(&self) -> &[EventHandle] {
        &self.elems
    }

    /// Grow capacity to hold at least `n` entries: double, floor 8,
    /// jump straight to `n` if doubling falls short.
    pub(crate) fn reserve(&mut self, n: usize) {
        let cap = self.elems.capacity();
        if cap < n {
            let mut want = if cap == 0 { 8 } else { cap * 2 };
            if want < n {
                want = n;
            }
            self.elems.reserve_exact(want - self.elems.len());
        }
    }

    pub(crate) fn push(&mut self, table: &mut EventTable, ev: EventHandle) {
        self.reserve(self.elems.len() + 1);
        let hole = self.elems.len();
        self.elems.push(ev);
        self.sift_up(table, hole, ev);
    }

    pub(crate) fn pop(&mut self, table: &mut EventTable) -> Option<EventHandle> {
        let top = self.top()?;
        let last = self.elems.pop()?;
        if !self.elems.is_empty() {
            self.sift_down(table, 0, last);
        }
        table.rec_mut(top).heap_idx = NO_HEAP_INDEX;
        Some(top)
    }

    /// Remove an arbitrary entry via its stored index. Returns false if
    /// the event is not in the heap.
    pub(crate) fn erase(&mut self, table: &mut EventTable, ev: EventHandle) -> bool {
        let idx = table.rec(ev).heap_idx;
        if idx == NO_HEAP_INDEX {
            return false;
        }
        let idx = idx as usize;
        let Some(last) = self.elems.pop() else {
            return false;
        };
        if idx < self.elems.len() {
            /* refill the hole with the former last element */
            let parent = idx.saturating_sub(1) / 2;
            if idx > 0 && greater(table, self.elems[parent], last) {
                self.sift_up(table, idx, last);
            } else {
                self.sift_down(table, idx, last);
            }
        }
        table.rec_mut(ev).heap_idx = NO_HEAP_INDEX;
        true
    }

    fn sift_up(&mut self, table: &mut EventTable, hole_index: usize, ev: EventHandle) {
        let mut hole = hole_index;
        while hole > 0 {
            let parent = (hole - 1) / 2;
            if !greater(table, self.elems[parent], ev) {
                break;
            }
            self.elems[hole] = self.elems[parent];
            table.rec_mut(self.elems[hole]).heap_idx = hole as u32;
            hole = parent;
        }
        self.elems[hole] = ev;
        table.rec_mut(ev).heap_idx = hole as u32;
    }

    fn sift_down(&mut self, table: &mut EventTable, hole_index: usize, ev: EventHandle) {
        let len = self.elems.len();
        let mut hole = hole_index;
        loop {
            /* right child of hole; step back to the left one when the
             * right is missing or larger */
            let mut child = 2 * (hole + 1);
            if child > len {
                break;
            }
            if child == len || greater(table, self.elems[child], self.elems[child - 1]) {
                child -= 1;
            }
            if !greater(table, ev, self.elems[child]) {
                break;
            }
            self.elems[hole] = self.elems[child];
            table.rec_mut(self.elems[hole]).heap_idx = hole as u32;
            hole = child;
        }
        self.sift_up(table, hole, ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, EventRecord};
    use crate::time::TimeVal;

    fn timer_table(deadlines: &[(i64, i64)]) -> (EventTable, Vec<EventHandle>) {
        let mut table = EventTable::new();
        let handles = deadlines
            .iter()
            .map(|&(sec, usec)| {
                let mut rec =
                    EventRecord::new(-1, EventKind::empty(), 0, Box::new(|_, _, _| {}));
                rec.deadline = TimeVal::new(sec, usec);
                table.insert(rec)
            })
            .collect();
        (table, handles)
    }

    fn assert_heap_invariants(heap: &TimerHeap, table: &EventTable) {
        let elems = heap.entries();
        for (i, &ev) in elems.iter().enumerate() {
            assert_eq!(table.rec(ev).heap_idx, i as u32, "inverse map broken at {i}");
            if i > 0 {
                let parent = elems[(i - 1) / 2];
                assert!(
                    table.rec(parent).deadline <= table.rec(ev).deadline,
                    "heap order broken at {i}"
                );
            }
        }
    }

    #[test]
    fn test_push_pop_sorted() {
        let (mut table, hs) = timer_table(&[(30, 0), (10, 0), (20, 0), (10, 500), (5, 0)]);
        let mut heap = TimerHeap::new();
        for &h in &hs {
            heap.push(&mut table, h);
            assert_heap_invariants(&heap, &table);
        }
        let mut prev = TimeVal::ZERO;
        while let Some(top) = heap.pop(&mut table) {
            let dl = table.rec(top).deadline;
            assert!(dl >= prev);
            assert_eq!(table.rec(top).heap_idx, NO_HEAP_INDEX);
            prev = dl;
            assert_heap_invariants(&heap, &table);
        }
    }

    #[test]
    fn test_heap_of_one_pop() {
        let (mut table, hs) = timer_table(&[(1, 0)]);
        let mut heap = TimerHeap::new();
        heap.push(&mut table, hs[0]);
        assert_eq!(heap.pop(&mut table), Some(hs[0]));
        assert!(heap.is_empty());
        assert_eq!(heap.pop(&mut table), None);
    }

    #[test]
    fn test_heap_of_two_sift() {
        /* insert out of order; the smaller must surface */
        let (mut table, hs) = timer_table(&[(9, 0), (1, 0)]);
        let mut heap = TimerHeap::new();
        heap.push(&mut table, hs[0]);
        heap.push(&mut table, hs[1]);
        assert_eq!(heap.top(), Some(hs[1]));
        assert_eq!(heap.pop(&mut table), Some(hs[1]));
        assert_eq!(heap.pop(&mut table), Some(hs[0]));
    }

    #[test]
    fn test_erase_last_element() {
        let (mut table, hs) = timer_table(&[(1, 0), (2, 0), (3, 0)]);
        let mut heap = TimerHeap::new();
        for &h in &hs {
            heap.push(&mut table, h);
        }
        /* hs[2] sits at the tail of the array */
        assert!(heap.erase(&mut table, hs[2]));
        assert_eq!(heap.len(), 2);
        assert_eq!(table.rec(hs[2]).heap_idx, NO_HEAP_INDEX);
        assert_heap_invariants(&heap, &table);
    }

    #[test]
    fn test_erase_middle_and_root() {
        let (mut table, hs) = timer_table(&[(5, 0), (10, 0), (15, 0), (20, 0), (25, 0), (12, 0)]);
        let mut heap = TimerHeap::new();
        for &h in &hs {
            heap.push(&mut table, h);
        }
        assert!(heap.erase(&mut table, hs[1]));
        assert_heap_invariants(&heap, &table);
        assert!(heap.erase(&mut table, hs[0]));
        assert_heap_invariants(&heap, &table);
        assert_eq!(heap.top(), Some(hs[5]));
    }

    #[test]
    fn test_erase_not_in_heap() {
        let (mut table, hs) = timer_table(&[(1, 0)]);
        let mut heap = TimerHeap::new();
        assert!(!heap.erase(&mut table, hs[0]));
    }

    #[test]
    fn test_reserve_floor_and_doubling() {
        let mut heap = TimerHeap::new();
        heap.reserve(1);
        assert!(heap.elems.capacity() >= 8);
        let cap = heap.elems.capacity();
        heap.reserve(cap + 1);
        assert!(heap.elems.capacity() >= cap * 2);
    }

    /* randomized op sequences against a naive model */
    mod properties {
        use proptest::prelude::*;

        use crate::event::{EventHandle, EventKind, EventRecord, EventTable};
        use crate::heap::TimerHeap;
        use crate::time::TimeVal;

        #[derive(Debug, Clone)]
        enum Op {
            Push(i64, i64),
            Pop,
            /* index into whatever happens to be in the heap */
            Erase(usize),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => (0i64..1000, 0i64..1_000_000).prop_map(|(s, u)| Op::Push(s, u)),
                1 => Just(Op::Pop),
                1 => (0usize..64).prop_map(Op::Erase),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            #[test]
            fn heap_invariants_hold_under_random_ops(ops in prop::collection::vec(op_strategy(), 1..64)) {
                let mut table = EventTable::new();
                let mut heap = TimerHeap::new();
                let mut live: Vec<EventHandle> = Vec::new();

                for op in ops {
                    match op {
                        Op::Push(sec, usec) => {
                            let mut rec = EventRecord::new(
                                -1,
                                EventKind::empty(),
                                0,
                                Box::new(|_, _, _| {}),
                            );
                            rec.deadline = TimeVal::new(sec, usec);
                            let h = table.insert(rec);
                            heap.push(&mut table, h);
                            live.push(h);
                        }
                        Op::Pop => {
                            let min = live
                                .iter()
                                .map(|&h| table.rec(h).deadline)
                                .min();
                            let popped = heap.pop(&mut table);
                            match (min, popped) {
                                (None, None) => {}
                                (Some(expect), Some(got)) => {
                                    prop_assert_eq!(table.rec(got).deadline, expect);
                                    live.retain(|&h| h != got);
                                }
                                other => prop_assert!(false, "model mismatch: {:?}", other.1),
                            }
                        }
                        Op::Erase(i) => {
                            if !live.is_empty() {
                                let h = live[i % live.len()];
                                prop_assert!(heap.erase(&mut table, h));
                                live.retain(|&x| x != h);
                            }
                        }
                    }
                    prop_assert_eq!(heap.len(), live.len());
                    for (i, &ev) in heap.entries().iter().enumerate() {
                        prop_assert_eq!(table.rec(ev).heap_idx, i as u32);
                        if i > 0 {
                            let parent = heap.entries()[(i - 1) / 2];
                            prop_assert!(
                                table.rec(parent).deadline <= table.rec(ev).deadline
                            );
                        }
                    }
                }
            }
        }
    }
}
