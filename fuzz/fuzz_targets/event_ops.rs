/*
 * event_ops.rs
 *
 * Drive random registration/activation/deletion sequences through a
 * real reactor. The interesting crashes here are bookkeeping bugs:
 * count drift, queue corruption, stale-handle mixups. No fds, no
 * signals - pure timers and forced activations keep each run
 * deterministic and fast.
 */

#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;

use evcore::{EventBase, EventKind, LoopFlags};

fuzz_target!(|data: &[u8]| {
    let Ok(mut base) = EventBase::new() else {
        return;
    };
    let mut events = Vec::new();

    let mut bytes = data.iter().copied();
    while let Some(op) = bytes.next() {
        match op % 6 {
            0 => {
                if events.len() < 64 {
                    if let Ok(ev) = base.event_new(-1, EventKind::empty(), |_, _, _| {}) {
                        events.push(ev);
                    }
                }
            }
            1 => {
                if let (Some(&ev), Some(arg)) = (events.first(), bytes.next()) {
                    /* long deadlines only - the loop below never blocks */
                    let secs = 60 + u64::from(arg);
                    let _ = base.add(ev, Some(Duration::from_secs(secs)));
                }
            }
            2 => {
                if let Some(&ev) = events.last() {
                    let _ = base.del(ev);
                }
            }
            3 => {
                if let (Some(&ev), Some(arg)) = (events.first(), bytes.next()) {
                    let kinds = EventKind::from_bits_truncate(u16::from(arg) & 0x0f);
                    let _ = base.active(ev, kinds, u16::from(arg % 4));
                }
            }
            4 => {
                if !events.is_empty() {
                    let ev = events.swap_remove(0);
                    let _ = base.event_free(ev);
                }
            }
            _ => {
                let _ = base.run(LoopFlags::NONBLOCK);
            }
        }
    }

    /* teardown must cope with whatever state the sequence left behind */
    drop(base);
});
