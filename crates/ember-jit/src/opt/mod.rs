//! The mid-tier optimizer: forwarding/info model, interval tracking, CSE, heap caching,
//! virtual-object tracking, and the single-forward driver.

pub mod heap;
pub mod info;
pub mod intbound;
pub mod optimizer;
pub mod pure;
pub mod virtualize;

pub use optimizer::{OptConfig, Optimizer, PendingJump};
