// SPDX-License-Identifier: Apache-2.0

//! Time primitives for the FinchDB network front-end.
//!
//! This crate provides the only mechanisms by which the service executors
//! measure themselves:
//!
//! - [`TickSource`]: a monotonic tick counter abstraction with a system
//!   implementation and a manually advanced one for tests.
//! - [`TickTimer`] / [`CumulativeTickTimer`]: elapsed-time and accumulated
//!   run-time trackers built on a tick source.
//! - [`WallClock`] / [`CoarseClock`]: wall-clock reads, including a cached
//!   clock refreshed by a background thread so hot paths never hit the OS
//!   clock directly.

pub mod coarse;
pub mod fatal;
pub mod tick;
pub mod timer;
pub mod wall;

pub use coarse::CoarseClock;
pub use tick::{ManualTickSource, SystemTickSource, TickSource};
pub use timer::{CumulativeTickTimer, TickTimer};
pub use wall::{ManualWallClock, SystemWallClock, WallClock};
