/*
 * event.rs
 *
 * The event data model: kind/queue/loop flag sets, the caller-facing
 * handle, the per-event record, and the generational table that owns
 * every record.
 *
 * The reactor owns all event storage. Callers hold EventHandle values -
 * an index plus a generation counter, so a handle to a freed slot is
 * detected instead of silently aliasing whatever event reused the slot.
 * Queue membership is intrusive: each record carries one link pair per
 * list family (inserted roster, active band, signal subscribers), which
 * keeps removal O(1) without back-pointer walking.
 */

use bitflags::bitflags;

use crate::base::EventBase;
use crate::time::TimeVal;

pub type RawFd = i32;

bitflags! {
    /// What an event is watching for, and how it behaves once it fires.
    ///
    /// `SIGNAL` is mutually exclusive with `READ` and `WRITE`. `PERSIST`
    /// keeps the registration alive after the callback runs; without it
    /// the event is deregistered just before its callback is invoked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventKind: u16 {
        const TIMEOUT = 0x01;
        const READ    = 0x02;
        const WRITE   = 0x04;
        const SIGNAL  = 0x08;
        const PERSIST = 0x10;
    }
}

bitflags! {
    /* Queue memberships. An event can be INSERTED, TIMEOUT and ACTIVE all
     * at once - the three queues are independent. */
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct EventFlags: u16 {
        const TIMEOUT  = 0x01;
        const INSERTED = 0x02;
        const SIGNAL   = 0x04;
        const ACTIVE   = 0x08;
        const INTERNAL = 0x10;
        const INIT     = 0x80;
    }
}

bitflags! {
    /// Dispatch-loop behavior flags for [`EventBase::run`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoopFlags: u16 {
        /// Return after one batch of callbacks has been dispatched.
        const ONCE     = 0x01;
        /// Never block waiting for readiness; poll and return.
        const NONBLOCK = 0x02;
    }
}

/// Sentinel heap index for an event that is not in the timer heap.
pub(crate) const NO_HEAP_INDEX: u32 = u32::MAX;

/// Opaque reference to an event owned by an [`EventBase`].
///
/// Handles are `Copy` and remain valid until the event is freed; using a
/// handle after [`EventBase::event_free`] yields
/// [`EventError::StaleHandle`](crate::EventError::StaleHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Callback invoked when an event fires: the reactor, the event's own
/// handle, and the reasons it became active this tick.
pub(crate) type Callback = Box<dyn FnMut(&mut EventBase, EventHandle, EventKind) + 'static>;

/* one link pair per list family */
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Links {
    pub next: Option<EventHandle>,
    pub prev: Option<EventHandle>,
}

pub(crate) const LIST_FAMILIES: usize = 3;

pub(crate) struct EventRecord {
    /// fd for READ/WRITE, signal number for SIGNAL, -1 for pure timers.
    pub fd: RawFd,
    pub kinds: EventKind,
    pub flags: EventFlags,
    pub pri: usize,
    /// Absolute deadline, valid while the TIMEOUT flag is set.
    pub deadline: TimeVal,
    /// Reasons the event was made active on this cycle.
    pub res: EventKind,
    /// Remaining callback invocations for the current activation.
    pub ncalls: u16,
    /// Cancellation token: set by `del` mid-dispatch to suppress the
    /// remaining invocations, reset on every activation.
    pub cancel_calls: bool,
    pub heap_idx: u32,
    pub links: [Links; LIST_FAMILIES],
    /// Leased out of the slot while the callback runs; `None` also means
    /// "currently in flight".
    pub callback: Option<Callback>,
}

impl EventRecord {
    pub(crate) fn new(fd: RawFd, kinds: EventKind, pri: usize, callback: Callback) -> Self {
        EventRecord {
            fd,
            kinds,
            flags: EventFlags::INIT,
            pri,
            deadline: TimeVal::ZERO,
            res: EventKind::empty(),
            ncalls: 0,
            cancel_calls: false,
            heap_idx: NO_HEAP_INDEX,
            links: [Links::default(); LIST_FAMILIES],
            callback: Some(callback),
        }
    }
}

/* slot generations start at 1 so a zeroed handle never matches */
struct Slot {
    generation: u32,
    rec: Option<EventRecord>,
}

/// Generational slab holding every event registered with a base.
#[derive(Default)]
pub(crate) struct EventTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl EventTable {
    pub(crate) fn new() -> Self {
        EventTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, rec: EventRecord) -> EventHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.rec = Some(rec);
            return EventHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            rec: Some(rec),
        });
        EventHandle {
            index,
            generation: 1,
        }
    }

    /* bumps the generation so outstanding handles go stale */
    pub(crate) fn remove(&mut self, ev: EventHandle) -> Option<EventRecord> {
        let slot = self.slots.get_mut(ev.index as usize)?;
        if slot.generation != ev.generation || slot.rec.is_none() {
            return None;
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(ev.index);
        slot.rec.take()
    }

    #[inline]
    pub(crate) fn get(&self, ev: EventHandle) -> Option<&EventRecord> {
        let slot = self.slots.get(ev.index as usize)?;
        if slot.generation != ev.generation {
            return None;
        }
        slot.rec.as_ref()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, ev: EventHandle) -> Option<&mut EventRecord> {
        let slot = self.slots.get_mut(ev.index as usize)?;
        if slot.generation != ev.generation {
            return None;
        }
        slot.rec.as_mut()
    }

    /* Infallible lookups for queue and heap internals, where the flag
     * bits guarantee liveness. A miss here is a bookkeeping bug, not a
     * caller error. */
    #[inline]
    #[track_caller]
    pub(crate) fn rec(&self, ev: EventHandle) -> &EventRecord {
        self.get(ev).expect("event table entry vanished")
    }

    #[inline]
    #[track_caller]
    pub(crate) fn rec_mut(&mut self, ev: EventHandle) -> &mut EventRecord {
        self.get_mut(ev).expect("event table entry vanished")
    }
}
