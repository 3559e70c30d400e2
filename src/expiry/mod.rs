//! Queue expiry timers.

pub mod scheduler;

pub use scheduler::{delay_until, ExpiryScheduler, Fired};
