/*
 * epoll.rs
 *
 * The epoll readiness backend.
 *
 * epoll_ctl takes one registration per fd, but the reactor hands us
 * separate READ and WRITE events. The dense fd table below remembers
 * which event owns each direction so add/del can decide between ADD,
 * MOD and DEL and always request the union of live interests.
 *
 * The wait timeout is clamped to 35 minutes - kernels on some platforms
 * have historical bugs with very long epoll waits, and a spurious early
 * wakeup costs one harmless loop iteration.
 *
 * The result buffer starts at 32 entries and doubles whenever a wait
 * fills it completely, up to 4096.
 */

use crate::backend::{Backend, ReadyEvent};
use crate::error::{EventError, Result, errno};
use crate::event::{EventHandle, EventKind, RawFd};
use crate::time::TimeVal;

const MAX_EPOLL_TIMEOUT_MS: i64 = 35 * 60 * 1000;
const INITIAL_NFILES: usize = 32;
const INITIAL_NEVENTS: usize = 32;
const MAX_NEVENTS: usize = 4096;

/* who owns each direction of an fd */
#[derive(Debug, Clone, Copy, Default)]
struct FdSlot {
    read: Option<EventHandle>,
    write: Option<EventHandle>,
}

pub(crate) struct EpollBackend {
    epfd: RawFd,
    fds: Vec<FdSlot>,
    events: Vec<libc::epoll_event>,
}

#[inline]
fn empty_epoll_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

impl EpollBackend {
    pub(crate) fn new() -> Result<EpollBackend> {
        // SAFETY: epoll_create1 takes only the flags argument.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            let e = errno();
            if e != libc::ENOSYS {
                log::error!("epoll_create1 failed, errno = {e}");
            }
            return Err(EventError::Backend(e));
        }
        Ok(EpollBackend {
            epfd,
            fds: vec![FdSlot::default(); INITIAL_NFILES],
            events: vec![empty_epoll_event(); INITIAL_NEVENTS],
        })
    }

    /* double the fd table until it covers fd */
    fn grow_fds(&mut self, fd: usize) {
        let mut nfds = self.fds.len();
        while nfds <= fd {
            nfds <<= 1;
        }
        self.fds.resize(nfds, FdSlot::default());
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: u32) -> Result<()> {
        let mut epev = empty_epoll_event();
        epev.events = interest;
        epev.u64 = fd as u64;
        // SAFETY: epfd is our live epoll fd; epev is a valid epoll_event.
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &raw mut epev) } == -1 {
            return Err(EventError::Backend(errno()));
        }
        Ok(())
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn need_reinit(&self) -> bool {
        true
    }

    fn add(&mut self, ev: EventHandle, fd: RawFd, kinds: EventKind) -> Result<()> {
        if fd < 0 {
            return Err(EventError::Backend(libc::EBADF));
        }
        let fdx = fd as usize;
        if fdx >= self.fds.len() {
            self.grow_fds(fdx);
        }

        /* a second direction on a registered fd is a MOD, not an ADD */
        let slot = self.fds[fdx];
        let mut op = libc::EPOLL_CTL_ADD;
        let mut interest: u32 = 0;
        if slot.read.is_some() {
            interest |= libc::EPOLLIN as u32;
            op = libc::EPOLL_CTL_MOD;
        }
        if slot.write.is_some() {
            interest |= libc::EPOLLOUT as u32;
            op = libc::EPOLL_CTL_MOD;
        }
        if kinds.contains(EventKind::READ) {
            interest |= libc::EPOLLIN as u32;
        }
        if kinds.contains(EventKind::WRITE) {
            interest |= libc::EPOLLOUT as u32;
        }

        self.ctl(op, fd, interest)?;

        if kinds.contains(EventKind::READ) {
            self.fds[fdx].read = Some(ev);
        }
        if kinds.contains(EventKind::WRITE) {
            self.fds[fdx].write = Some(ev);
        }
        Ok(())
    }

    fn del(&mut self, _ev: EventHandle, fd: RawFd, kinds: EventKind) -> Result<()> {
        if fd < 0 || fd as usize >= self.fds.len() {
            return Ok(());
        }
        let fdx = fd as usize;

        let mut op = libc::EPOLL_CTL_DEL;
        let mut interest: u32 = 0;
        if kinds.contains(EventKind::READ) {
            interest |= libc::EPOLLIN as u32;
        }
        if kinds.contains(EventKind::WRITE) {
            interest |= libc::EPOLLOUT as u32;
        }

        let both = (libc::EPOLLIN | libc::EPOLLOUT) as u32;
        let mut drop_read = true;
        let mut drop_write = true;
        if interest != both {
            /* keep the orthogonal direction registered */
            if interest == libc::EPOLLIN as u32 && self.fds[fdx].write.is_some() {
                drop_write = false;
                interest = libc::EPOLLOUT as u32;
                op = libc::EPOLL_CTL_MOD;
            } else if interest == libc::EPOLLOUT as u32 && self.fds[fdx].read.is_some() {
                drop_read = false;
                interest = libc::EPOLLIN as u32;
                op = libc::EPOLL_CTL_MOD;
            }
        }

        if drop_read {
            self.fds[fdx].read = None;
        }
        if drop_write {
            self.fds[fdx].write = None;
        }
        self.ctl(op, fd, interest)
    }

    fn dispatch(&mut self, timeout: Option<TimeVal>, ready: &mut Vec<ReadyEvent>) -> Result<()> {
        let mut timeout_ms: i64 = -1;
        if let Some(tv) = timeout {
            timeout_ms = tv.to_millis_ceil().min(MAX_EPOLL_TIMEOUT_MS);
        }

        let n = {
            // SAFETY: events is a live buffer of events.len() epoll_event
            // entries; epfd is our live epoll fd.
            unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    timeout_ms as libc::c_int,
                )
            }
        };

        if n == -1 {
            let e = errno();
            if e != libc::EINTR {
                log::error!("epoll_wait failed, errno = {e}");
                return Err(EventError::Backend(e));
            }
            /* interrupted wait: the reactor will run the signal relay */
            return Ok(());
        }

        let n = n as usize;
        log::trace!("epoll_wait reports {n}");

        for i in 0..n {
            let what = self.events[i].events;
            let fd = self.events[i].u64 as RawFd;
            if fd < 0 || fd as usize >= self.fds.len() {
                continue;
            }
            let slot = self.fds[fd as usize];

            /* hangup or error wakes both directions so their callbacks
             * can observe the failure from read()/write() */
            let (rd, wr) = if what & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                (slot.read, slot.write)
            } else {
                (
                    if what & libc::EPOLLIN as u32 != 0 {
                        slot.read
                    } else {
                        None
                    },
                    if what & libc::EPOLLOUT as u32 != 0 {
                        slot.write
                    } else {
                        None
                    },
                )
            };

            if let Some(ev) = rd {
                ready.push(ReadyEvent {
                    ev,
                    what: EventKind::READ,
                });
            }
            if let Some(ev) = wr {
                ready.push(ReadyEvent {
                    ev,
                    what: EventKind::WRITE,
                });
            }
        }

        /* saturated result buffer: grow for next time */
        if n == self.events.len() && self.events.len() < MAX_NEVENTS {
            let new_len = (self.events.len() * 2).min(MAX_NEVENTS);
            self.events.resize(new_len, empty_epoll_event());
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            // SAFETY: epfd is our live epoll fd, closed exactly once here.
            unsafe {
                libc::close(self.epfd);
            }
        }
    }
}
