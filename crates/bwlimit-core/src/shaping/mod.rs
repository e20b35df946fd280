//! Per-connection traffic shaping.
//!
//! - [`TrafficCounter`]: rolling byte counts over a fixed measurement window
//! - [`ShapingStage`]: FIFO outbound write shaper that owns one counter

mod counter;
mod stage;

pub use counter::TrafficCounter;
pub use stage::{Released, ShapingStage};
