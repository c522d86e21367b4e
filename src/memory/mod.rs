//! Fixed-budget memory: one arena per run, carved into reserved fragments.
//!
//! - [`Interval`] - an offset/length range
//! - [`IntervalTracker`] - which ranges are reserved, plus parked waiters
//! - [`Arena`] / [`ArenaRegion`] - the backing bytes and the regions they are carved from
//! - [`BufferFragment`] - a move-only view over one reserved range
//! - [`SharedFragment`] - counted ownership for fan-out consumers

mod arena;
mod fragment;
mod interval;
mod shared;
mod tracker;

pub use arena::{Arena, ArenaRegion};
pub use fragment::BufferFragment;
pub use interval::Interval;
pub use shared::SharedFragment;
pub use tracker::{IntervalTracker, Reservation};
