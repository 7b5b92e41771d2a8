/*
 * proptest.rs
 *
 * property-based tests over the public API and the TimeVal arithmetic.
 * generates hundreds of inputs to find the edge cases nobody writes by
 * hand.
 */

use std::time::Duration;

use proptest::prelude::*;

use evcore::{EventBase, EventKind, LoopExit, LoopFlags, TimeVal};

/* ============================================================================
 * TimeVal Arithmetic Properties
 * ============================================================================ */

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    #[test]
    fn timeval_new_normalizes(sec in 0i64..1_000_000, usec in 0i64..100_000_000) {
        let tv = TimeVal::new(sec, usec);
        prop_assert!(tv.usec >= 0 && tv.usec < 1_000_000);
        prop_assert_eq!(tv.sec * 1_000_000 + tv.usec, sec * 1_000_000 + usec);
    }

    #[test]
    fn timeval_add_is_commutative(
        s1 in 0i64..1_000_000, u1 in 0i64..1_000_000,
        s2 in 0i64..1_000_000, u2 in 0i64..1_000_000,
    ) {
        let a = TimeVal::new(s1, u1);
        let b = TimeVal::new(s2, u2);
        prop_assert_eq!(a.add(b), b.add(a));
    }

    #[test]
    fn timeval_add_sub_round_trips(
        s1 in 0i64..1_000_000, u1 in 0i64..1_000_000,
        s2 in 0i64..1_000_000, u2 in 0i64..1_000_000,
    ) {
        let a = TimeVal::new(s1, u1);
        let b = TimeVal::new(s2, u2);
        prop_assert_eq!(a.add(b).sub(b), a);
    }

    #[test]
    fn timeval_sub_clamps_to_zero(
        s1 in 0i64..1000, u1 in 0i64..1_000_000,
        s2 in 0i64..1000, u2 in 0i64..1_000_000,
    ) {
        let a = TimeVal::new(s1, u1);
        let b = TimeVal::new(s2, u2);
        if a <= b {
            prop_assert_eq!(a.sub(b), TimeVal::ZERO);
        } else {
            prop_assert!(a.sub(b) > TimeVal::ZERO);
        }
    }

    #[test]
    fn timeval_ordering_matches_duration(
        s1 in 0u64..100_000, u1 in 0u32..1_000_000,
        s2 in 0u64..100_000, u2 in 0u32..1_000_000,
    ) {
        let da = Duration::new(s1, u1 * 1000);
        let db = Duration::new(s2, u2 * 1000);
        let a = TimeVal::from_duration(da);
        let b = TimeVal::from_duration(db);
        prop_assert_eq!(a.cmp(&b), da.cmp(&db));
    }
}

/* ============================================================================
 * Reactor Registration Properties
 * ============================================================================ */

proptest! {
    /* each case builds a real reactor (epoll fd + socketpair); keep the
     * case count civil */
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn add_del_round_trip_leaves_nothing_behind(
        timeouts in prop::collection::vec(prop::option::of(60u64..3600), 1..16)
    ) {
        let mut base = EventBase::new().unwrap();
        let mut events = Vec::new();

        for timeout in &timeouts {
            let ev = base.event_new(-1, EventKind::empty(), |_, _, _| {}).unwrap();
            base.add(ev, timeout.map(Duration::from_secs)).unwrap();
            events.push(ev);
        }

        /* every armed timer reports as pending */
        for (ev, timeout) in events.iter().zip(&timeouts) {
            let (armed, _) = base.pending(*ev, EventKind::TIMEOUT).unwrap();
            prop_assert_eq!(armed == EventKind::TIMEOUT, timeout.is_some());
        }

        for ev in &events {
            base.del(*ev).unwrap();
            /* idempotent */
            base.del(*ev).unwrap();
        }
        for ev in &events {
            let (armed, _) = base.pending(*ev, EventKind::all()).unwrap();
            prop_assert!(armed.is_empty());
        }

        /* observably identical to never having added anything */
        prop_assert_eq!(base.run(LoopFlags::NONBLOCK).unwrap(), LoopExit::Empty);
    }

    #[test]
    fn activation_reasons_coalesce(masks in prop::collection::vec(1u16..=0x0f, 1..8)) {
        let mut base = EventBase::new().unwrap();
        let ev = base.event_new(-1, EventKind::empty(), |_, _, _| {}).unwrap();

        let mut expected = EventKind::empty();
        for mask in masks {
            let kinds = EventKind::from_bits_truncate(mask);
            base.active(ev, kinds, 1).unwrap();
            expected |= kinds;
        }

        /* re-activations fold reasons in; exactly one queue entry */
        let (armed, _) = base.pending(ev, EventKind::all()).unwrap();
        prop_assert_eq!(armed & expected, expected);
        base.del(ev).unwrap();
        prop_assert_eq!(base.run(LoopFlags::NONBLOCK).unwrap(), LoopExit::Empty);
    }
}
