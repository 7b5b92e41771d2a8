/*
 * backend.rs
 *
 * The pluggable readiness driver interface.
 *
 * Five operations in the classic table: construction (init), add, del,
 * dispatch, and Drop (dealloc). A backend only translates between
 * events and the kernel readiness mechanism; it never runs callbacks
 * and never touches the signal relay - dispatch reports what became
 * ready and the reactor does the activating.
 *
 * Only epoll ships. The trait exists so kqueue/event-port style drivers
 * can slot in without touching the reactor core.
 */

use crate::epoll::EpollBackend;
use crate::error::{EventError, Result};
use crate::event::{EventHandle, EventKind, RawFd};
use crate::time::TimeVal;

/// One fd that the kernel reported ready, already translated to the
/// registered event and the direction(s) that fired.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyEvent {
    pub ev: EventHandle,
    pub what: EventKind,
}

pub(crate) trait Backend {
    fn name(&self) -> &'static str;

    /// Whether kernel state is lost across fork() and must be rebuilt.
    fn need_reinit(&self) -> bool;

    fn add(&mut self, ev: EventHandle, fd: RawFd, kinds: EventKind) -> Result<()>;

    fn del(&mut self, ev: EventHandle, fd: RawFd, kinds: EventKind) -> Result<()>;

    /// Wait at most `timeout` (`None` blocks indefinitely) and append
    /// whatever became ready to `ready`. An interrupted wait is success
    /// with nothing appended; the reactor notices the relay's caught
    /// flag by itself.
    fn dispatch(&mut self, timeout: Option<TimeVal>, ready: &mut Vec<ReadyEvent>) -> Result<()>;
}

/* first mechanism that initializes wins */
pub(crate) fn probe() -> Result<Box<dyn Backend>> {
    if let Ok(ep) = EpollBackend::new() {
        log::debug!("using backend: {}", ep.name());
        return Ok(Box::new(ep));
    }
    log::error!("no event mechanism available");
    Err(EventError::BackendUnavailable)
}
