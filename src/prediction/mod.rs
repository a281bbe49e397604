//! Burst prediction for the scheduler.

pub mod ema;

pub use ema::{BurstPredictor, BURST_SCALE};
