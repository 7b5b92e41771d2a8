/*
 * lib.rs
 *
 * Public surface and module wiring. The interesting code lives in
 * base.rs (reactor + dispatch loop), epoll.rs (readiness backend) and
 * signal.rs (the self-pipe relay).
 */

//! # evcore
//!
//! A single-threaded event notification core for Linux: one reactor
//! multiplexing fd readiness, timers and POSIX signals onto a
//! cooperative dispatch loop, epoll underneath.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use evcore::{EventBase, EventKind, LoopExit, LoopFlags};
//!
//! let mut base = EventBase::new().unwrap();
//!
//! /* one-shot timer; the event frees itself after firing */
//! base.once(
//!     -1,
//!     EventKind::TIMEOUT,
//!     |_base, _fd, what| {
//!         assert!(what.contains(EventKind::TIMEOUT));
//!     },
//!     Some(Duration::from_millis(1)),
//! )
//! .unwrap();
//!
//! assert_eq!(base.run(LoopFlags::ONCE).unwrap(), LoopExit::Done);
//! ```
//!
//! Callbacks receive `&mut EventBase` plus their own handle, so they
//! can re-arm, delete or free events - including the one currently
//! firing - without any shared-state gymnastics. The reactor is
//! single-threaded by design; callbacks must not block.

mod backend;
mod base;
mod epoll;
pub mod error;
mod event;
mod heap;
mod queue;
mod signal;
pub mod time;

pub use base::{EventBase, LoopExit, request_signal_callback};
pub use error::{EventError, Result};
pub use event::{EventHandle, EventKind, LoopFlags, RawFd};
pub use time::TimeVal;
