/*
 * signal.rs
 *
 * The signal relay: async-signal-safe handler -> self-pipe -> in-loop
 * dispatch.
 *
 * Problem: we're blocked in epoll_wait. A signal arrives. Signal
 * handlers can do almost nothing safely, and certainly can't run user
 * callbacks. Fix: the handler bumps an atomic per-signal counter, sets
 * a caught flag, and sends one byte down a socketpair the reactor
 * watches with an ordinary READ|PERSIST event. The wait wakes up, the
 * loop drains the counters on its own thread, and subscribers are
 * activated like any other event.
 *
 * signalfd would work but binds us to Linux semantics the backend
 * abstraction is trying to avoid. The pipe works everywhere.
 *
 * POSIX signal delivery is process-wide, so the handler-visible state
 * (counters, caught flag, write fd) is process-global by necessity.
 * Exactly one reactor may own it at a time; a second reactor asking for
 * signal events gets SignalOwnerBusy instead of silently stealing
 * delivery.
 */

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::base::EventBase;
use crate::error::{EventError, Result, errno};
use crate::event::{EventFlags, EventHandle, EventKind, RawFd};
use crate::queue::{self, Family, ListHead};

/* Linux _NSIG: valid signal numbers are 1..=64 */
pub(crate) const NSIG: usize = 65;

/* Everything the handler touches. Nothing else in the crate runs in an
 * async-signal context. */
static SIG_CAUGHT: AtomicBool = AtomicBool::new(false);
static SIG_PENDING: [AtomicU32; NSIG] = [const { AtomicU32::new(0) }; NSIG];
static SIG_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/* One reactor at a time may route process signals. */
static SIGNAL_OWNER: AtomicBool = AtomicBool::new(false);

#[inline]
pub(crate) fn caught() -> bool {
    SIG_CAUGHT.load(Ordering::SeqCst)
}

#[inline]
fn set_errno(e: i32) {
    // SAFETY: __errno_location always returns a valid pointer on Linux.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        *libc::__errno_location() = e;
    }
}

/* The relay handler. Legal operations in here: atomic ops, reinstalling
 * ourselves, one non-blocking send, restoring errno. No allocation, no
 * locks, no formatting. */
extern "C" fn relay_handler(sig: libc::c_int) {
    let saved_errno = errno();
    if sig >= 0 && (sig as usize) < NSIG {
        SIG_PENDING[sig as usize].fetch_add(1, Ordering::SeqCst);
        SIG_CAUGHT.store(true, Ordering::SeqCst);

        /* reinstall - harmless under POSIX sigaction, required on systems
         * with one-shot signal() semantics */
        // SAFETY: re-registering the running handler is async-signal-safe.
        unsafe {
            libc::signal(sig, relay_handler as *const () as libc::sighandler_t);
        }

        let fd = SIG_WRITE_FD.load(Ordering::SeqCst);
        if fd >= 0 {
            let byte: u8 = 1;
            // SAFETY: fd is the non-blocking write end of our socketpair;
            // a one-byte send is async-signal-safe. Failure is tolerated:
            // EAGAIN means the pipe already holds enough bytes to wake the
            // loop, and the counters carry the real tally.
            let _ = unsafe { libc::send(fd, (&raw const byte).cast(), 1, 0) };
        }
    }
    set_errno(saved_errno);
}

/* mark an fd close-on-exec and non-blocking */
fn prepare_fd(fd: RawFd) -> Result<()> {
    // SAFETY: fd is a valid descriptor just returned by socketpair().
    // fcntl with F_GETFL/F_SETFL/F_SETFD is safe on valid fds; the ops
    // share the same invariant (fd validity).
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        /* non-blocking is required - the signal handler must not block */
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(EventError::Signal(errno()));
        }
        /* CLOEXEC is best-effort - a leak into an exec'd child is harmless */
        let _ = libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    Ok(())
}

/// Per-reactor relay state. The handler-visible globals above are the
/// only process-wide pieces.
pub(crate) struct SignalRelay {
    /// Self-pipe: `pair[0]` is the handler's send side, `pair[1]` the
    /// reactor's read side.
    pub(crate) pair: [RawFd; 2],
    /// The permanent internal READ|PERSIST event draining the pipe.
    pub(crate) internal: Option<EventHandle>,
    /// Whether the internal event is currently registered.
    pub(crate) added: bool,
    /// Subscriber list per signal number.
    pub(crate) subscribers: Vec<ListHead>,
    /// Total subscribers across all signals.
    pub(crate) nsubscribers: usize,
    /// Previous dispositions, restored on last unsubscribe per signal.
    saved: Vec<Option<libc::sigaction>>,
    /// Whether this reactor holds the process-wide owner slot.
    pub(crate) owns: bool,
}

impl SignalRelay {
    pub(crate) fn new() -> Result<SignalRelay> {
        Ok(SignalRelay {
            pair: make_pair()?,
            internal: None,
            added: false,
            subscribers: vec![ListHead::default(); NSIG],
            nsubscribers: 0,
            saved: Vec::new(),
            owns: false,
        })
    }

    /// Replace the self-pipe (fork recovery: the old pair is shared with
    /// the parent and must not be reused).
    pub(crate) fn reopen_pair(&mut self) -> Result<()> {
        self.close_pair();
        self.pair = make_pair()?;
        if self.owns {
            SIG_WRITE_FD.store(self.pair[0], Ordering::SeqCst);
        }
        Ok(())
    }

    pub(crate) fn close_pair(&mut self) {
        for fd in &mut self.pair {
            if *fd >= 0 {
                // SAFETY: fd came from socketpair() and is closed once.
                unsafe {
                    libc::close(*fd);
                }
                *fd = -1;
            }
        }
    }

    fn install_handler(&mut self, signo: RawFd) -> Result<()> {
        let s = signo as usize;
        if self.saved.len() <= s {
            self.saved.resize_with(s + 1, || None);
        }

        // SAFETY: libc::sigaction has no invalid bit patterns; zeroing is
        // a valid initial state.
        let mut sa: libc::sigaction = unsafe { core::mem::zeroed() };
        sa.sa_sigaction = relay_handler as *const () as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESTART;
        // SAFETY: sa.sa_mask is a valid sigset_t owned by this frame.
        unsafe {
            libc::sigfillset(&raw mut sa.sa_mask);
        }

        // SAFETY: same zeroed-struct argument as above.
        let mut old: libc::sigaction = unsafe { core::mem::zeroed() };
        // SAFETY: signo was range-checked by the caller; sa and old are
        // valid sigaction structs.
        if unsafe { libc::sigaction(signo, &raw const sa, &raw mut old) } == -1 {
            let e = errno();
            log::error!("sigaction failed for signal {signo}, errno = {e}");
            return Err(EventError::Signal(e));
        }
        self.saved[s] = Some(old);
        Ok(())
    }

    fn restore_handler(&mut self, signo: RawFd) -> Result<()> {
        let s = signo as usize;
        let Some(old) = self.saved.get_mut(s).and_then(Option::take) else {
            return Ok(());
        };
        // SAFETY: old is the sigaction previously returned by the kernel
        // for this signal; restoring it is always valid.
        if unsafe { libc::sigaction(signo, &raw const old, core::ptr::null_mut()) } == -1 {
            let e = errno();
            log::error!("sigaction restore failed for signal {signo}, errno = {e}");
            return Err(EventError::Signal(e));
        }
        Ok(())
    }

    fn any_saved(&self) -> bool {
        self.saved.iter().any(Option::is_some)
    }
}

fn make_pair() -> Result<[RawFd; 2]> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is a valid 2-element array; socketpair writes exactly 2 fds.
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } == -1 {
        let e = errno();
        log::error!("socketpair failed, errno = {e}");
        return Err(EventError::Signal(e));
    }
    for fd in fds {
        if let Err(e) = prepare_fd(fd) {
            // SAFETY: both fds come from socketpair() above, closed once.
            #[allow(clippy::multiple_unsafe_ops_per_block)]
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(e);
        }
    }
    Ok(fds)
}

impl EventBase {
    /* Registering a signal event. First subscriber to this signal takes
     * the handler; first subscriber anywhere takes the process owner
     * slot and arms the self-pipe event. */
    pub(crate) fn signal_add(&mut self, ev: EventHandle) -> Result<()> {
        let (signo, kinds) = {
            let rec = self.table.rec(ev);
            (rec.fd, rec.kinds)
        };
        if kinds.intersects(EventKind::READ | EventKind::WRITE) {
            log::error!("signal event also asks for read/write, kinds = {kinds:?}");
            return Err(EventError::KindConflict);
        }
        if signo < 1 || signo as usize >= NSIG {
            return Err(EventError::SignalOutOfRange);
        }
        let s = signo as usize;

        if self.signals.subscribers[s].is_empty() {
            let newly_claimed = if self.signals.owns {
                false
            } else {
                if SIGNAL_OWNER.swap(true, Ordering::SeqCst) {
                    return Err(EventError::SignalOwnerBusy);
                }
                self.signals.owns = true;
                /* publish the write fd before installing any handler; a
                 * signal landing between sigaction and the store would
                 * otherwise see -1 and go unrelayed */
                SIG_WRITE_FD.store(self.signals.pair[0], Ordering::SeqCst);
                true
            };

            log::debug!("installing relay handler for signal {signo}");
            if let Err(e) = self.signals.install_handler(signo) {
                if newly_claimed && !self.signals.any_saved() {
                    SIG_WRITE_FD.store(-1, Ordering::SeqCst);
                    SIGNAL_OWNER.store(false, Ordering::SeqCst);
                    self.signals.owns = false;
                }
                return Err(e);
            }

            if !self.signals.added
                && let Some(internal) = self.signals.internal
            {
                self.add(internal, None)?;
                self.signals.added = true;
            }
        }

        /* append unless already linked (reinit re-walks inserted events) */
        if !self.table.rec(ev).flags.contains(EventFlags::SIGNAL) {
            queue::push_back(
                &mut self.signals.subscribers[s],
                &mut self.table,
                ev,
                Family::Signal,
            );
            self.table.rec_mut(ev).flags.insert(EventFlags::SIGNAL);
            self.signals.nsubscribers += 1;
        }
        Ok(())
    }

    pub(crate) fn signal_del(&mut self, ev: EventHandle) -> Result<()> {
        let signo = self.table.rec(ev).fd;
        if signo < 1 || signo as usize >= NSIG {
            return Err(EventError::SignalOutOfRange);
        }
        let s = signo as usize;

        if self.table.rec(ev).flags.contains(EventFlags::SIGNAL) {
            queue::remove(
                &mut self.signals.subscribers[s],
                &mut self.table,
                ev,
                Family::Signal,
            );
            self.table.rec_mut(ev).flags.remove(EventFlags::SIGNAL);
            self.signals.nsubscribers -= 1;
        }

        let mut res = Ok(());
        if self.signals.subscribers[s].is_empty() {
            log::debug!("restoring previous disposition for signal {signo}");
            res = self.signals.restore_handler(signo);
        }

        if self.signals.nsubscribers == 0 {
            /* last subscriber anywhere: disarm the self-pipe event and
             * give up process-wide delivery */
            if self.signals.added {
                self.signals.added = false;
                if let Some(internal) = self.signals.internal {
                    let _ = self.del(internal);
                }
            }
            if self.signals.owns {
                SIG_WRITE_FD.store(-1, Ordering::SeqCst);
                SIGNAL_OWNER.store(false, Ordering::SeqCst);
                self.signals.owns = false;
            }
        }
        res
    }

    /* Drain pending signal counts and activate subscribers. Runs on the
     * dispatch thread when the caught flag is up (after the wait, or on
     * an interrupted wait). */
    pub(crate) fn signal_process(&mut self) {
        SIG_CAUGHT.store(false, Ordering::SeqCst);
        for s in 1..NSIG {
            let pending = SIG_PENDING[s].load(Ordering::SeqCst);
            if pending == 0 {
                continue;
            }
            /* subtract rather than clear - a delivery landing between the
             * load and the store survives into the next pass */
            SIG_PENDING[s].fetch_sub(pending, Ordering::SeqCst);

            let ncalls = u16::try_from(pending).unwrap_or(u16::MAX);
            let mut cur = self.signals.subscribers[s].first;
            while let Some(ev) = cur {
                cur = self.table.rec(ev).links[Family::Signal as usize].next;
                if !self.table.rec(ev).kinds.contains(EventKind::PERSIST) {
                    let _ = self.del(ev);
                }
                self.activate(ev, EventKind::SIGNAL, ncalls);
            }
        }
    }

    /* Full relay teardown: disarm the internal event, restore every saved
     * disposition, close the pipe, release the owner slot. Subscriber
     * lists survive so reinit can rebuild on top of them. */
    pub(crate) fn signal_teardown(&mut self) {
        if self.signals.added {
            self.signals.added = false;
            if let Some(internal) = self.signals.internal {
                let _ = self.del(internal);
            }
        }
        for s in 1..NSIG {
            let _ = self.signals.restore_handler(s as RawFd);
        }
        self.signals.close_pair();
        if self.signals.owns {
            SIG_WRITE_FD.store(-1, Ordering::SeqCst);
            SIGNAL_OWNER.store(false, Ordering::SeqCst);
            self.signals.owns = false;
        }
    }
}
