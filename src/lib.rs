//! Edge-timing jitter measurement
//!
//! Decodes sequence-mode digitizer captures of a reference and a chip
//! channel, pairs their threshold crossings into timing offsets and fits a
//! Gaussian to the offset histogram to estimate jitter.

pub mod analysis;
pub mod config;
pub mod error;
pub mod scope;
pub mod sweep;

pub use config::{Config, SweepPlan};
pub use error::{AnalysisError, DecodeError};
