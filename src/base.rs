/*
 * base.rs
 *
 * The reactor core. All the tricky bits live here.
 *
 * One EventBase owns everything: the readiness backend, the event
 * table, the inserted roster, the priority-banded active queues, the
 * timer heap and the signal relay. Each tick of the dispatch loop:
 * compute a wait bound from the top of the timer heap, let the backend
 * wait, expire due timers, then drain the lowest non-empty priority
 * band and run callbacks.
 *
 * Callbacks get `&mut EventBase`, so they can add, delete and free
 * events - including the one currently firing. The callback is leased
 * out of its table slot for the duration of the call and put back only
 * if the slot still holds the same generation, which makes mid-callback
 * event_free safe. Deleting an event with queued invocations flips its
 * cancel token and the loop skips the rest.
 *
 * Clock discipline: one sample is taken right after the backend wait
 * and cached for the whole tick (tv_cache), so every timer comparison
 * and callback in a tick sees the same "now". Without a monotonic
 * clock, backward wall-clock jumps are detected against the previous
 * tick's sample and every pending deadline is rebased.
 */

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backend::{self, Backend, ReadyEvent};
use crate::error::{EventError, Result, errno};
use crate::event::{
    Callback, EventFlags, EventHandle, EventKind, EventRecord, EventTable, LoopFlags, RawFd,
};
use crate::heap::TimerHeap;
use crate::queue::{self, Family, ListHead};
use crate::signal::{self, SignalRelay};
use crate::time::{Clock, TimeVal};

/* Set by foreign signal handlers that want the loop to run the global
 * signal callback; drained at the top of every iteration. */
static EVENT_GOTSIG: AtomicBool = AtomicBool::new(false);

/// Ask the dispatch loop to invoke the callback installed with
/// [`EventBase::set_signal_callback`] before its next wait.
///
/// Async-signal-safe; meant to be called from signal handlers the
/// application installs outside the reactor's own relay.
pub fn request_signal_callback() {
    EVENT_GOTSIG.store(true, Ordering::SeqCst);
}

/// Why [`EventBase::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The loop terminated normally (`loopexit`, `loopbreak`, or the
    /// ONCE/NONBLOCK condition was met).
    Done,
    /// Nothing is registered; there is no work the loop could wait for.
    Empty,
}

/// A single-threaded event reactor.
///
/// Register events with [`event_new`](EventBase::event_new) +
/// [`add`](EventBase::add), then [`run`](EventBase::run) the loop.
/// Callbacks execute synchronously on the dispatching thread and must
/// not block.
pub struct EventBase {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) table: EventTable,
    /// Roster of everything registered with the backend or relay.
    pub(crate) inserted: ListHead,
    /// One FIFO per priority band, drained lowest index first.
    pub(crate) active: Vec<ListHead>,
    pub(crate) heap: TimerHeap,
    pub(crate) signals: SignalRelay,
    /// Live queue memberships, INTERNAL excluded; zero means "nothing
    /// to do" and the loop refuses to run.
    pub(crate) event_count: usize,
    pub(crate) active_count: usize,
    got_term: bool,
    pub(crate) got_break: bool,
    /// Clock sample from the previous tick, for backward-jump detection.
    pub(crate) event_tv: TimeVal,
    /// Per-tick sample; None means stale, re-sample on demand.
    pub(crate) tv_cache: Option<TimeVal>,
    pub(crate) clock: Clock,
    sigcb: Option<fn() -> i32>,
    /* reused dispatch scratch */
    ready: Vec<ReadyEvent>,
}

impl EventBase {
    /// Create a reactor on the first readiness backend that initializes.
    ///
    /// # Errors
    ///
    /// [`EventError::BackendUnavailable`] when no kernel mechanism could
    /// be set up, [`EventError::Signal`] when the relay socketpair could
    /// not be created.
    pub fn new() -> Result<EventBase> {
        let clock = Clock::detect();
        let mut base = EventBase {
            backend: backend::probe()?,
            table: EventTable::new(),
            inserted: ListHead::default(),
            active: Vec::new(),
            heap: TimerHeap::new(),
            signals: SignalRelay::new()?,
            event_count: 0,
            active_count: 0,
            got_term: false,
            got_break: false,
            event_tv: TimeVal::ZERO,
            tv_cache: None,
            clock,
            sigcb: None,
            ready: Vec::new(),
        };
        base.event_tv = base.clock.now()?;
        base.priority_init(1)?;

        /* permanent self-pipe drain; INTERNAL keeps it out of the live
         * event count */
        let internal = base.event_new(
            base.signals.pair[1],
            EventKind::READ | EventKind::PERSIST,
            |base, _ev, _what| {
                let fd = base.signals.pair[1];
                let mut buf = [0u8; 1];
                // SAFETY: buf is a live 1-byte buffer; fd is the read side
                // of the relay socketpair.
                let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), 1, 0) };
                if n == -1 {
                    log::error!("signal pipe read failed, errno = {}", errno());
                }
            },
        )?;
        base.table
            .rec_mut(internal)
            .flags
            .insert(EventFlags::INTERNAL);
        base.signals.internal = Some(internal);
        Ok(base)
    }

    /// Install the global signal callback run whenever
    /// [`request_signal_callback`] was flagged. Returning `-1` from it
    /// aborts the loop with [`EventError::Interrupted`].
    pub fn set_signal_callback(&mut self, cb: fn() -> i32) {
        self.sigcb = Some(cb);
    }

    /* ---------------------------------------------------------------
     * event lifecycle
     * --------------------------------------------------------------- */

    /// Create an event watching `fd` for `kinds`, owned by this base.
    ///
    /// For SIGNAL events `fd` is the signal number; for pure timers pass
    /// `-1` and empty (or TIMEOUT) kinds. The event starts at the middle
    /// priority band and is inert until [`add`](EventBase::add).
    ///
    /// # Errors
    ///
    /// [`EventError::KindConflict`] when SIGNAL is combined with READ or
    /// WRITE, [`EventError::SignalOutOfRange`] for a bad signal number.
    pub fn event_new<F>(&mut self, fd: RawFd, kinds: EventKind, callback: F) -> Result<EventHandle>
    where
        F: FnMut(&mut EventBase, EventHandle, EventKind) + 'static,
    {
        if kinds.contains(EventKind::SIGNAL) {
            if kinds.intersects(EventKind::READ | EventKind::WRITE) {
                return Err(EventError::KindConflict);
            }
            if fd < 1 || fd as usize >= signal::NSIG {
                return Err(EventError::SignalOutOfRange);
            }
        }
        let pri = self.active.len() / 2;
        let rec = EventRecord::new(fd, kinds, pri, Box::new(callback) as Callback);
        Ok(self.table.insert(rec))
    }

    /// Deregister `ev` everywhere and release its slot. The handle and
    /// any copies of it go stale.
    pub fn event_free(&mut self, ev: EventHandle) -> Result<()> {
        self.check(ev)?;
        let res = self.del(ev);
        self.table.remove(ev);
        res
    }

    /// Move `ev` to priority band `pri`.
    ///
    /// # Errors
    ///
    /// Refused with [`EventError::EventActive`] while the event is
    /// active (it would sit in the wrong band's queue).
    pub fn priority_set(&mut self, ev: EventHandle, pri: usize) -> Result<()> {
        self.check(ev)?;
        if self.table.rec(ev).flags.contains(EventFlags::ACTIVE) {
            return Err(EventError::EventActive);
        }
        if pri >= self.active.len() {
            return Err(EventError::InvalidPriority);
        }
        self.table.rec_mut(ev).pri = pri;
        Ok(())
    }

    /// Replace the active-queue array with `n` priority bands.
    ///
    /// # Errors
    ///
    /// Refused with [`EventError::EventActive`] while any event is
    /// active, [`EventError::InvalidPriority`] for `n == 0`.
    pub fn priority_init(&mut self, n: usize) -> Result<()> {
        if self.active_count > 0 {
            return Err(EventError::EventActive);
        }
        if n == 0 {
            return Err(EventError::InvalidPriority);
        }
        if n != self.active.len() {
            self.active = vec![ListHead::default(); n];
        }
        Ok(())
    }

    /// Register `ev`, optionally (re)arming its timeout.
    ///
    /// fd and signal events are handed to the backend or relay the first
    /// time; a supplied timeout always supersedes a previous one, and
    /// cancels the pending invocations of an event that is currently
    /// active for a timeout.
    ///
    /// # Errors
    ///
    /// Backend or relay registration failures; the timer state is left
    /// untouched when registration fails.
    pub fn add(&mut self, ev: EventHandle, timeout: Option<Duration>) -> Result<()> {
        self.check(ev)?;
        let (kinds, flags) = {
            let rec = self.table.rec(ev);
            (rec.kinds, rec.flags)
        };
        log::debug!("add: event {ev:?} {kinds:?} timeout {timeout:?}");

        /* reserve up front so a failed allocation cannot leave a timer
         * half-armed */
        if timeout.is_some() && !flags.contains(EventFlags::TIMEOUT) {
            self.heap.reserve(self.heap.len() + 1);
        }

        if kinds.intersects(EventKind::READ | EventKind::WRITE | EventKind::SIGNAL)
            && !flags.intersects(EventFlags::INSERTED | EventFlags::ACTIVE)
        {
            let fd = self.table.rec(ev).fd;
            if kinds.contains(EventKind::SIGNAL) {
                self.signal_add(ev)?;
            } else {
                self.backend.add(ev, fd, kinds)?;
            }
            self.queue_insert(ev, EventFlags::INSERTED);
        }

        if let Some(tv) = timeout {
            let flags = self.table.rec(ev).flags;
            if flags.contains(EventFlags::TIMEOUT) {
                self.queue_remove(ev, EventFlags::TIMEOUT);
            }
            /* an activation caused by the old deadline is obsolete: drop
             * it and suppress its queued invocations */
            if flags.contains(EventFlags::ACTIVE)
                && self.table.rec(ev).res.contains(EventKind::TIMEOUT)
            {
                self.table.rec_mut(ev).cancel_calls = true;
                self.queue_remove(ev, EventFlags::ACTIVE);
            }

            let now = self.gettime()?;
            let deadline = now.add(TimeVal::from_duration(tv));
            self.table.rec_mut(ev).deadline = deadline;
            log::debug!("add: timeout in {tv:?} for event {ev:?}");
            self.queue_insert(ev, EventFlags::TIMEOUT);
        }
        Ok(())
    }

    /// Deregister `ev` from whatever queues it is on. Idempotent; safe
    /// from inside the event's own callback (remaining queued
    /// invocations are suppressed).
    pub fn del(&mut self, ev: EventHandle) -> Result<()> {
        self.check(ev)?;
        log::debug!("del: event {ev:?}");

        self.table.rec_mut(ev).cancel_calls = true;

        let flags = self.table.rec(ev).flags;
        if flags.contains(EventFlags::TIMEOUT) {
            self.queue_remove(ev, EventFlags::TIMEOUT);
        }
        if flags.contains(EventFlags::ACTIVE) {
            self.queue_remove(ev, EventFlags::ACTIVE);
        }
        if flags.contains(EventFlags::INSERTED) {
            self.queue_remove(ev, EventFlags::INSERTED);
            let kinds = self.table.rec(ev).kinds;
            if kinds.contains(EventKind::SIGNAL) {
                return self.signal_del(ev);
            }
            let fd = self.table.rec(ev).fd;
            return self.backend.del(ev, fd, kinds);
        }
        Ok(())
    }

    /// Forcibly activate `ev` with the given reasons. Re-activating an
    /// already active event folds the reasons into its result mask.
    pub fn active(&mut self, ev: EventHandle, res: EventKind, ncalls: u16) -> Result<()> {
        self.check(ev)?;
        self.activate(ev, res, ncalls);
        Ok(())
    }

    pub(crate) fn activate(&mut self, ev: EventHandle, res: EventKind, ncalls: u16) {
        {
            let rec = self.table.rec_mut(ev);
            if rec.flags.contains(EventFlags::ACTIVE) {
                rec.res |= res;
                return;
            }
            rec.res = res;
            rec.ncalls = ncalls;
            rec.cancel_calls = false;
        }
        self.queue_insert(ev, EventFlags::ACTIVE);
    }

    /// Report which of the queried `kinds` are currently armed for
    /// `ev`. When TIMEOUT is queried and armed, also returns the
    /// deadline translated to wall-clock time.
    pub fn pending(
        &self,
        ev: EventHandle,
        kinds: EventKind,
    ) -> Result<(EventKind, Option<TimeVal>)> {
        self.check(ev)?;
        let rec = self.table.rec(ev);
        let mut armed = EventKind::empty();
        if rec.flags.contains(EventFlags::INSERTED) {
            armed |= rec.kinds & (EventKind::READ | EventKind::WRITE | EventKind::SIGNAL);
        }
        if rec.flags.contains(EventFlags::ACTIVE) {
            armed |= rec.res;
        }
        if rec.flags.contains(EventFlags::TIMEOUT) {
            armed |= EventKind::TIMEOUT;
        }
        let query = kinds
            & (EventKind::TIMEOUT | EventKind::READ | EventKind::WRITE | EventKind::SIGNAL);
        let hit = armed & query;

        let mut deadline = None;
        if hit.contains(EventKind::TIMEOUT) {
            /* deadlines live on the monotonic timescale; hand the caller
             * something comparable to gettimeofday */
            let now = self.gettime()?;
            let remaining = rec.deadline.sub(now);
            deadline = Some(Clock::wall()?.add(remaining));
        }
        Ok((hit, deadline))
    }

    /// One-shot convenience: register a throwaway event that fires once
    /// and frees itself. Signals are not accepted. A pure-TIMEOUT
    /// request with no timeout fires on the next tick.
    ///
    /// # Errors
    ///
    /// [`EventError::SignalDisallowed`] for SIGNAL kinds,
    /// [`EventError::KindConflict`] when neither TIMEOUT nor READ/WRITE
    /// was asked for.
    pub fn once<F>(
        &mut self,
        fd: RawFd,
        kinds: EventKind,
        callback: F,
        timeout: Option<Duration>,
    ) -> Result<()>
    where
        F: FnOnce(&mut EventBase, RawFd, EventKind) + 'static,
    {
        if kinds.contains(EventKind::SIGNAL) {
            return Err(EventError::SignalDisallowed);
        }
        let (fd, kinds, timeout) = if kinds == EventKind::TIMEOUT {
            (-1, EventKind::empty(), Some(timeout.unwrap_or(Duration::ZERO)))
        } else if kinds.intersects(EventKind::READ | EventKind::WRITE) {
            (fd, kinds & (EventKind::READ | EventKind::WRITE), timeout)
        } else {
            return Err(EventError::KindConflict);
        };

        let mut carrier = Some(callback);
        let ev = self.event_new(fd, kinds, move |base, this, what| {
            if let Some(cb) = carrier.take() {
                cb(base, fd, what);
            }
            let _ = base.event_free(this);
        })?;

        match self.add(ev, timeout) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.event_free(ev);
                Err(e)
            }
        }
    }

    /* ---------------------------------------------------------------
     * the dispatch loop
     * --------------------------------------------------------------- */

    /// Run the loop until explicitly stopped. Equivalent to
    /// `run(LoopFlags::empty())`.
    pub fn dispatch(&mut self) -> Result<LoopExit> {
        self.run(LoopFlags::empty())
    }

    /// Enter the dispatch loop.
    ///
    /// Returns [`LoopExit::Empty`] when no events are registered at all,
    /// [`LoopExit::Done`] on cooperative termination or when the ONCE /
    /// NONBLOCK condition is satisfied.
    ///
    /// # Errors
    ///
    /// A backend wait failure other than EINTR ends the loop with
    /// [`EventError::Backend`]; [`EventError::Interrupted`] when the
    /// global signal callback requested an abort.
    pub fn run(&mut self, flags: LoopFlags) -> Result<LoopExit> {
        self.tv_cache = None;
        let mut done = false;
        while !done {
            if self.got_term {
                self.got_term = false;
                break;
            }
            if self.got_break {
                self.got_break = false;
                break;
            }

            while EVENT_GOTSIG.swap(false, Ordering::SeqCst) {
                if let Some(cb) = self.sigcb
                    && cb() == -1
                {
                    return Err(EventError::Interrupted);
                }
            }

            self.timeout_correct()?;

            let timeout = if self.active_count == 0 && !flags.contains(LoopFlags::NONBLOCK) {
                self.timeout_next()?
            } else {
                Some(TimeVal::ZERO)
            };

            if !self.have_events() {
                log::debug!("no events registered");
                return Ok(LoopExit::Empty);
            }

            self.event_tv = self.gettime()?;
            self.tv_cache = None;

            self.ready.clear();
            let mut ready = core::mem::take(&mut self.ready);
            let res = self.backend.dispatch(timeout, &mut ready);
            self.ready = ready;
            res?;

            self.tv_cache = Some(self.clock.now()?);

            /* signals first: deliveries that interrupted the wait are
             * observed before this tick's fd readiness. Only the reactor
             * owning process delivery may drain the counters - another
             * base draining them would swallow the owner's signals. */
            if self.signals.owns && signal::caught() {
                self.signal_process();
            }
            let ready = core::mem::take(&mut self.ready);
            for r in &ready {
                if self.table.get(r.ev).is_some() {
                    self.activate(r.ev, r.what, 1);
                }
            }
            self.ready = ready;

            self.timeout_process()?;

            if self.active_count > 0 {
                self.process_active();
                if self.active_count == 0 && flags.contains(LoopFlags::ONCE) {
                    done = true;
                }
            } else if flags.contains(LoopFlags::NONBLOCK) {
                done = true;
            }
        }

        self.tv_cache = None;
        log::debug!("asked to terminate loop");
        Ok(LoopExit::Done)
    }

    /// Schedule cooperative loop termination after `after` (immediately
    /// on the next tick when `None`).
    pub fn loopexit(&mut self, after: Option<Duration>) -> Result<()> {
        self.once(
            -1,
            EventKind::TIMEOUT,
            |base, _fd, _what| {
                base.got_term = true;
            },
            after,
        )
    }

    /// Stop the loop after the callback currently running returns;
    /// remaining active events are not invoked this iteration.
    pub fn loopbreak(&mut self) {
        self.got_break = true;
    }

    /// This tick's cached clock sample, or a fresh one outside the loop.
    /// Monotonic when the platform provides it.
    pub fn now(&self) -> Result<TimeVal> {
        self.gettime()
    }

    /// Rebuild kernel state after `fork()`: fresh backend, fresh
    /// self-pipe, every inserted event re-registered.
    ///
    /// # Errors
    ///
    /// Backend construction or re-registration failures; re-registration
    /// continues past individual failures and reports the first error.
    pub fn reinit(&mut self) -> Result<()> {
        if !self.backend.need_reinit() {
            return Ok(());
        }

        /* the self-pipe event references kernel state that died with the
         * fork; pull it out of the queues without touching the backend */
        if self.signals.added {
            if let Some(internal) = self.signals.internal {
                let flags = self.table.rec(internal).flags;
                if flags.contains(EventFlags::INSERTED) {
                    self.queue_remove(internal, EventFlags::INSERTED);
                }
                if flags.contains(EventFlags::ACTIVE) {
                    self.queue_remove(internal, EventFlags::ACTIVE);
                }
            }
            self.signals.added = false;
        }

        self.backend = backend::probe()?;
        self.signals.reopen_pair()?;
        if let Some(internal) = self.signals.internal {
            self.table.rec_mut(internal).fd = self.signals.pair[1];
        }

        /* re-register fd interest; signal subscribers keep their
         * installed handlers and list links */
        let mut res = Ok(());
        let mut cur = self.inserted.first;
        while let Some(ev) = cur {
            cur = self.table.rec(ev).links[Family::Inserted as usize].next;
            let (fd, kinds) = {
                let rec = self.table.rec(ev);
                (rec.fd, rec.kinds)
            };
            if kinds.intersects(EventKind::READ | EventKind::WRITE)
                && let Err(e) = self.backend.add(ev, fd, kinds)
            {
                log::error!("could not re-register event {ev:?} after fork");
                res = Err(e);
            }
        }

        if self.signals.nsubscribers > 0
            && let Some(internal) = self.signals.internal
        {
            self.add(internal, None)?;
            self.signals.added = true;
        }
        res
    }

    /* ---------------------------------------------------------------
     * internals
     * --------------------------------------------------------------- */

    #[inline]
    fn check(&self, ev: EventHandle) -> Result<()> {
        if self.table.get(ev).is_some() {
            Ok(())
        } else {
            Err(EventError::StaleHandle)
        }
    }

    #[inline]
    fn have_events(&self) -> bool {
        self.event_count > 0
    }

    /* cached during a tick; fresh sample otherwise */
    pub(crate) fn gettime(&self) -> Result<TimeVal> {
        if let Some(tv) = self.tv_cache {
            return Ok(tv);
        }
        self.clock.now()
    }

    /* wait bound from the heap top: None = block, zero = already due */
    fn timeout_next(&self) -> Result<Option<TimeVal>> {
        let Some(top) = self.heap.top() else {
            return Ok(None);
        };
        let deadline = self.table.rec(top).deadline;
        let now = self.gettime()?;
        if deadline <= now {
            return Ok(Some(TimeVal::ZERO));
        }
        let tv = deadline.sub(now);
        log::trace!("timeout_next: in {}.{:06}s", tv.sec, tv.usec);
        Ok(Some(tv))
    }

    /* Backward wall-clock jumps shrink every pending deadline by the
     * observed delta so relative delays are preserved. No-op with a
     * monotonic clock. */
    fn timeout_correct(&mut self) -> Result<()> {
        if self.clock.monotonic() {
            return Ok(());
        }
        let now = self.gettime()?;
        if now >= self.event_tv {
            self.event_tv = now;
            return Ok(());
        }
        log::debug!("time is running backwards, corrected");
        let off = self.event_tv.sub(now);
        for &ev in self.heap.entries() {
            let rec = self.table.rec_mut(ev);
            rec.deadline = rec.deadline.sub(off);
        }
        self.event_tv = now;
        Ok(())
    }

    /* expire everything at or past now */
    fn timeout_process(&mut self) -> Result<()> {
        if self.heap.is_empty() {
            return Ok(());
        }
        let now = self.gettime()?;
        while let Some(top) = self.heap.top() {
            if self.table.rec(top).deadline > now {
                break;
            }
            let _ = self.del(top);
            log::trace!("timeout_process: activating {top:?}");
            self.activate(top, EventKind::TIMEOUT, 1);
        }
        Ok(())
    }

    /* Drain the lowest-indexed non-empty band. Non-PERSIST events are
     * fully deregistered before their callback runs; PERSIST events are
     * only pulled off the active queue. */
    fn process_active(&mut self) {
        let Some(band) = (0..self.active.len()).find(|&i| !self.active[i].is_empty()) else {
            return;
        };

        loop {
            /* re-fetch each round: callbacks may mutate the queues */
            let Some(ev) = self.active.get(band).and_then(|head| head.first) else {
                break;
            };
            if self.table.rec(ev).kinds.contains(EventKind::PERSIST) {
                self.queue_remove(ev, EventFlags::ACTIVE);
            } else {
                let _ = self.del(ev);
            }

            let mut remaining = self.table.rec(ev).ncalls;
            /* del() flips the token; fresh activations reset it */
            self.table.rec_mut(ev).cancel_calls = false;

            while remaining > 0 {
                remaining -= 1;
                let Some(rec) = self.table.get_mut(ev) else {
                    break;
                };
                rec.ncalls = remaining;
                let res = rec.res;
                /* lease the callback out of its slot for the call */
                let Some(mut cb) = rec.callback.take() else {
                    break;
                };
                cb(self, ev, res);
                /* put it back unless the event was freed (or replaced -
                 * the generation check inside get_mut covers both) */
                if let Some(rec) = self.table.get_mut(ev)
                    && rec.callback.is_none()
                {
                    rec.callback = Some(cb);
                }

                if EVENT_GOTSIG.load(Ordering::SeqCst) || self.got_break {
                    return;
                }
                if self.table.get(ev).is_none_or(|r| r.cancel_calls) {
                    break;
                }
            }
        }
    }

    /* one insert primitive per queue family, with membership policing */
    pub(crate) fn queue_insert(&mut self, ev: EventHandle, q: EventFlags) {
        let (flags, fd, pri) = {
            let rec = self.table.rec(ev);
            (rec.flags, rec.fd, rec.pri)
        };
        if flags.contains(q) {
            /* double activation is legal - the result mask was already
             * coalesced in activate() */
            if q == EventFlags::ACTIVE {
                return;
            }
            log::error!("event {ev:?} (fd {fd}) already on queue {q:?}");
            return;
        }
        if !flags.contains(EventFlags::INTERNAL) {
            self.event_count += 1;
        }
        self.table.rec_mut(ev).flags.insert(q);

        if q == EventFlags::INSERTED {
            queue::push_back(&mut self.inserted, &mut self.table, ev, Family::Inserted);
        } else if q == EventFlags::ACTIVE {
            self.active_count += 1;
            let band = pri.min(self.active.len() - 1);
            queue::push_back(&mut self.active[band], &mut self.table, ev, Family::Active);
        } else if q == EventFlags::TIMEOUT {
            self.heap.push(&mut self.table, ev);
        } else {
            log::error!("unknown queue {q:?}");
        }
    }

    pub(crate) fn queue_remove(&mut self, ev: EventHandle, q: EventFlags) {
        let (flags, fd, pri) = {
            let rec = self.table.rec(ev);
            (rec.flags, rec.fd, rec.pri)
        };
        if !flags.contains(q) {
            log::error!("event {ev:?} (fd {fd}) not on queue {q:?}");
            return;
        }
        if !flags.contains(EventFlags::INTERNAL) {
            self.event_count -= 1;
        }
        self.table.rec_mut(ev).flags.remove(q);

        if q == EventFlags::INSERTED {
            queue::remove(&mut self.inserted, &mut self.table, ev, Family::Inserted);
        } else if q == EventFlags::ACTIVE {
            self.active_count -= 1;
            let band = pri.min(self.active.len() - 1);
            queue::remove(&mut self.active[band], &mut self.table, ev, Family::Active);
        } else if q == EventFlags::TIMEOUT {
            self.heap.erase(&mut self.table, ev);
        } else {
            log::error!("unknown queue {q:?}");
        }
    }
}

impl Drop for EventBase {
    /* base_free: deregister everything non-internal, tear down the
     * relay, let the backend close its fd */
    fn drop(&mut self) {
        /* snapshot the rosters before deleting anything: removing a
         * signal subscriber can disarm the internal self-pipe event,
         * which would rewrite the lists under a live traversal */
        let mut doomed = Vec::new();
        let mut cur = self.inserted.first;
        while let Some(ev) = cur {
            cur = self.table.rec(ev).links[Family::Inserted as usize].next;
            if !self.table.rec(ev).flags.contains(EventFlags::INTERNAL) {
                doomed.push(ev);
            }
        }
        for band in 0..self.active.len() {
            let mut cur = self.active[band].first;
            while let Some(ev) = cur {
                cur = self.table.rec(ev).links[Family::Active as usize].next;
                if !self.table.rec(ev).flags.contains(EventFlags::INTERNAL) {
                    doomed.push(ev);
                }
            }
        }

        let mut n_deleted = 0usize;
        let on_queues = EventFlags::INSERTED | EventFlags::ACTIVE | EventFlags::TIMEOUT;
        for ev in doomed {
            if self.table.get(ev).is_some_and(|rec| rec.flags.intersects(on_queues)) {
                let _ = self.del(ev);
                n_deleted += 1;
            }
        }
        while let Some(top) = self.heap.top() {
            let _ = self.del(top);
            n_deleted += 1;
        }
        if n_deleted > 0 {
            log::debug!("{n_deleted} events were still set in base");
        }

        self.signal_teardown();
        debug_assert!(self.heap.is_empty());
        debug_assert_eq!(self.active_count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn base() -> EventBase {
        EventBase::new().expect("reactor should initialize")
    }

    #[test]
    fn test_empty_base_counts() {
        let b = base();
        assert_eq!(b.event_count, 0);
        assert_eq!(b.active_count, 0);
        assert!(!b.have_events());
    }

    #[test]
    fn test_run_with_empty_registry_returns_empty() {
        let mut b = base();
        assert_eq!(b.run(LoopFlags::ONCE).unwrap(), LoopExit::Empty);
    }

    #[test]
    fn test_add_del_round_trip_restores_state() {
        let mut b = base();
        let ev = b
            .event_new(-1, EventKind::empty(), |_, _, _| {})
            .unwrap();
        b.add(ev, Some(Duration::from_secs(60))).unwrap();
        assert_eq!(b.event_count, 1);
        assert_eq!(b.heap.len(), 1);
        b.del(ev).unwrap();
        assert_eq!(b.event_count, 0);
        assert_eq!(b.heap.len(), 0);
        /* del of an event on no queue is a no-op success */
        b.del(ev).unwrap();
        assert_eq!(b.event_count, 0);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut b = base();
        let ev = b.event_new(-1, EventKind::empty(), |_, _, _| {}).unwrap();
        b.event_free(ev).unwrap();
        assert_eq!(b.add(ev, None).unwrap_err(), EventError::StaleHandle);
        assert_eq!(b.del(ev).unwrap_err(), EventError::StaleHandle);
    }

    #[test]
    fn test_active_coalesces_reasons() {
        let mut b = base();
        let ev = b.event_new(-1, EventKind::empty(), |_, _, _| {}).unwrap();
        b.active(ev, EventKind::READ, 1).unwrap();
        b.active(ev, EventKind::TIMEOUT, 5).unwrap();
        let rec = b.table.rec(ev);
        assert_eq!(rec.res, EventKind::READ | EventKind::TIMEOUT);
        /* ncalls untouched by the coalesced second activation */
        assert_eq!(rec.ncalls, 1);
        assert_eq!(b.active_count, 1);
    }

    #[test]
    fn test_priority_set_refused_while_active() {
        let mut b = base();
        b.priority_init(3).unwrap();
        let ev = b.event_new(-1, EventKind::empty(), |_, _, _| {}).unwrap();
        assert_eq!(b.table.rec(ev).pri, 1);
        b.priority_set(ev, 2).unwrap();
        b.active(ev, EventKind::TIMEOUT, 1).unwrap();
        assert_eq!(b.priority_set(ev, 0).unwrap_err(), EventError::EventActive);
        assert_eq!(b.priority_init(5).unwrap_err(), EventError::EventActive);
    }

    #[test]
    fn test_pending_reports_armed_kinds() {
        let mut b = base();
        let ev = b.event_new(-1, EventKind::empty(), |_, _, _| {}).unwrap();
        let (armed, tv) = b.pending(ev, EventKind::all()).unwrap();
        assert!(armed.is_empty());
        assert!(tv.is_none());

        b.add(ev, Some(Duration::from_secs(30))).unwrap();
        let (armed, tv) = b.pending(ev, EventKind::TIMEOUT).unwrap();
        assert_eq!(armed, EventKind::TIMEOUT);
        /* the reported deadline is a wall-clock instant roughly 30s out */
        let wall = Clock::wall().unwrap();
        let deadline = tv.unwrap();
        assert!(deadline > wall);
        assert!(deadline.sub(wall).sec <= 30);
    }

    #[test]
    fn test_timer_rebase_on_backward_clock() {
        let mut b = base();
        b.clock.force_wall();

        let ev = b.event_new(-1, EventKind::empty(), |_, _, _| {}).unwrap();
        b.add(ev, Some(Duration::from_millis(100))).unwrap();
        let before = b.table.rec(ev).deadline;

        /* pretend the last observed time was one second ahead of now -
         * exactly what a backward wall-clock jump looks like */
        let now = b.clock.now().unwrap();
        b.event_tv = now.add(TimeVal::new(1, 0));
        b.timeout_correct().unwrap();

        let after = b.table.rec(ev).deadline;
        let shrunk = before.sub(after);
        /* deadline moved back by the jump, within clock-sampling slop */
        assert!(shrunk >= TimeVal::new(0, 900_000), "shrunk {shrunk:?}");
        assert!(shrunk <= TimeVal::new(1, 100_000), "shrunk {shrunk:?}");
        assert!(b.event_tv <= b.clock.now().unwrap());
    }

    #[test]
    fn test_timeout_next_zero_when_due() {
        let mut b = base();
        let ev = b.event_new(-1, EventKind::empty(), |_, _, _| {}).unwrap();
        b.add(ev, Some(Duration::ZERO)).unwrap();
        assert_eq!(b.timeout_next().unwrap(), Some(TimeVal::ZERO));
    }

    #[test]
    fn test_once_self_frees() {
        let mut b = base();
        let fired = Rc::new(RefCell::new(0u32));
        let f = fired.clone();
        b.once(
            -1,
            EventKind::TIMEOUT,
            move |_base, fd, what| {
                assert_eq!(fd, -1);
                assert!(what.contains(EventKind::TIMEOUT));
                *f.borrow_mut() += 1;
            },
            Some(Duration::from_millis(1)),
        )
        .unwrap();
        assert_eq!(b.run(LoopFlags::ONCE).unwrap(), LoopExit::Done);
        assert_eq!(*fired.borrow(), 1);
        /* the carrier freed itself: nothing is registered anymore */
        assert!(!b.have_events());
    }

    #[test]
    fn test_once_rejects_signals() {
        let mut b = base();
        assert_eq!(
            b.once(libc::SIGUSR1, EventKind::SIGNAL, |_, _, _| {}, None)
                .unwrap_err(),
            EventError::SignalDisallowed
        );
    }

    #[test]
    fn test_del_mid_dispatch_cancels_remaining_calls() {
        let mut b = base();
        let fired = Rc::new(RefCell::new(0u32));
        let f = fired.clone();
        let ev = b
            .event_new(-1, EventKind::empty(), move |base, this, _what| {
                *f.borrow_mut() += 1;
                let _ = base.del(this);
            })
            .unwrap();
        /* five queued invocations; the first one deletes the event */
        b.active(ev, EventKind::TIMEOUT, 5).unwrap();
        b.run(LoopFlags::ONCE).unwrap();
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn test_new_timeout_supersedes_pending_activation() {
        let mut b = base();
        let fired = Rc::new(RefCell::new(0u32));
        let f = fired.clone();
        let ev = b
            .event_new(-1, EventKind::empty(), move |_, _, _| {
                *f.borrow_mut() += 1;
            })
            .unwrap();
        b.active(ev, EventKind::TIMEOUT, 3).unwrap();
        /* re-arming for the future drops the queued activation */
        b.add(ev, Some(Duration::from_secs(300))).unwrap();
        assert_eq!(b.active_count, 0);
        assert!(b.run(LoopFlags::NONBLOCK).is_ok());
        assert_eq!(*fired.borrow(), 0);
        b.del(ev).unwrap();
    }
}
