//! Offset extraction and jitter estimation
//!
//! 1. Pair reference/chip crossings of one acquisition into offsets
//! 2. Accumulate offsets across acquisition loops
//! 3. Histogram the population and fit a Gaussian to get the jitter

pub mod fit;
mod histogram;
pub mod jitter;
pub mod offsets;

pub use histogram::Histogram;
pub use jitter::{fit_jitter, fwhm, reject_outliers, FitConfig, JitterEstimate};
pub use offsets::{extract_offsets, ExtractionPath, OffsetConfig, OffsetExtraction};
