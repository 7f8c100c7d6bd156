//! Error types for the decode → detect → extract → fit pipeline

use thiserror::Error;

use crate::analysis::Histogram;

/// Failure decoding a pair of channel captures
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("time axes differ after calibration: reference has {reference} samples (dt={reference_dt:e}), chip has {chip} samples (dt={chip_dt:e})")]
    TimeAxisMismatch {
        reference: usize,
        chip: usize,
        reference_dt: f64,
        chip_dt: f64,
    },
}

/// Errors surfaced by the analysis core
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("mismatch in number of detection events: reference={reference}, chip={chip}")]
    EdgeCountMismatch { reference: usize, chip: usize },

    /// The Gaussian fit did not converge; the histogram it was fitting is kept for diagnosis
    #[error("gaussian fit did not converge: {reason}")]
    FitDivergence { reason: String, histogram: Histogram },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AnalysisError {
    /// Whether the orchestration layer should discard the loop and acquire again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AnalysisError::EdgeCountMismatch { .. } | AnalysisError::Decode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
