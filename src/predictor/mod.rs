//! Forest training, calibration and batch inference.

pub mod calibration;
pub mod dampener;
pub mod encoder;
pub mod engine;
pub mod forest;
pub mod gate;
pub mod threshold;

pub use engine::AdaptivePredictor;
