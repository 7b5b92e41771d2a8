/*
 * error.rs
 *
 * One enum for everything the reactor can report. Kernel failures carry
 * the errno so callers can branch on it; contract violations get their
 * own variants because a bare -1 tells you nothing at 3am.
 *
 * EINTR never reaches the caller - the dispatch loop eats it and runs
 * the signal relay instead. Any other errno from the backend wait ends
 * the loop with Backend(errno).
 */

use core::fmt;

/* everything that can go wrong */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    /// No readiness mechanism could be initialized on this system.
    BackendUnavailable,
    /// Kernel registration or wait failure (errno).
    Backend(i32),
    /// clock_gettime / gettimeofday failure (errno).
    Clock(i32),
    /// Signal relay setup failure - socketpair or sigaction (errno).
    Signal(i32),
    /// Priority outside `[0, nbands)`, or zero bands requested.
    InvalidPriority,
    /// Operation refused while the event (or any event) is active.
    EventActive,
    /// SIGNAL events are not accepted by this operation.
    SignalDisallowed,
    /// Signal number outside `[1, NSIG)`.
    SignalOutOfRange,
    /// Another reactor already owns process-wide signal delivery.
    SignalOwnerBusy,
    /// SIGNAL combined with READ or WRITE, or no usable kind at all.
    KindConflict,
    /// The handle does not refer to a live event (freed, or never created).
    StaleHandle,
    /// The global signal callback asked the loop to abort.
    Interrupted,
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackendUnavailable => write!(f, "no event mechanism available"),
            Self::Backend(errno) => write!(f, "backend failure: errno {errno}"),
            Self::Clock(errno) => write!(f, "clock failure: errno {errno}"),
            Self::Signal(errno) => write!(f, "signal relay failure: errno {errno}"),
            Self::InvalidPriority => write!(f, "priority out of range"),
            Self::EventActive => write!(f, "operation refused while event is active"),
            Self::SignalDisallowed => write!(f, "signal events not accepted here"),
            Self::SignalOutOfRange => write!(f, "signal number out of range"),
            Self::SignalOwnerBusy => {
                write!(f, "another reactor already handles process signals")
            }
            Self::KindConflict => write!(f, "conflicting event kinds"),
            Self::StaleHandle => write!(f, "stale event handle"),
            Self::Interrupted => write!(f, "interrupted by signal callback"),
        }
    }
}

impl std::error::Error for EventError {}

pub type Result<T> = core::result::Result<T, EventError>;

/* Get errno - on Linux a thread-local via __errno_location */
#[inline]
pub(crate) fn errno() -> i32 {
    // SAFETY: __errno_location always returns a valid pointer on Linux.
    #[allow(clippy::multiple_unsafe_ops_per_block)]
    unsafe {
        *libc::__errno_location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_errno() {
        let msg = format!("{}", EventError::Backend(libc::EBADF));
        assert!(msg.contains(&libc::EBADF.to_string()));
    }

    #[test]
    fn test_errno_reflects_failed_syscall() {
        // SAFETY: close(-1) is harmless and fails with EBADF.
        unsafe {
            libc::close(-1);
        }
        assert_eq!(errno(), libc::EBADF);
    }
}
