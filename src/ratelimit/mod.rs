//! Admission control: key derivation, the sliding-window limiter, the
//! response header mapping, and the background sweeper.

pub mod headers;
mod key;
mod limiter;
mod sweeper;

pub use key::{Identity, KeyResolver, RateLimitKey};
pub use limiter::{Decision, RateLimiter};
pub use sweeper::{SweepStats, Sweeper, SweeperHandle};
