//! Threshold crossing detection
//!
//! A crossing is reported at the last sample still on the pre-crossing side,
//! so offset resolution is one sample period. No interpolation is done.

use serde::{Deserialize, Serialize};

/// Slope of a threshold crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeDirection {
    Rising,
    Falling,
}

impl EdgeDirection {
    pub fn flipped(self) -> Self {
        match self {
            EdgeDirection::Rising => EdgeDirection::Falling,
            EdgeDirection::Falling => EdgeDirection::Rising,
        }
    }

    /// Parse the instrument-style slope names (`POS`/`NEG`) as well as `rising`/`falling`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pos" | "rising" | "rise" => Some(EdgeDirection::Rising),
            "neg" | "falling" | "fall" => Some(EdgeDirection::Falling),
            _ => None,
        }
    }
}

/// Which detector to run on each channel
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum CrossingPolicy {
    /// Stateless adjacent-pair comparison
    #[default]
    Plain,
    /// Re-arm only after the signal clears `threshold ± hysteresis`
    Hysteresis(f64),
}

/// Sample indices where a channel crosses a threshold in one direction
///
/// Indices are strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossingSet {
    pub direction: EdgeDirection,
    pub indices: Vec<usize>,
}

impl CrossingSet {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Mean index, truncated toward zero
    pub fn mean_index(&self) -> Option<usize> {
        if self.indices.is_empty() {
            return None;
        }
        let sum: f64 = self.indices.iter().map(|&i| i as f64).sum();
        Some((sum / self.indices.len() as f64) as usize)
    }
}

/// Find every adjacent pair that crosses `threshold` in `direction`
pub fn detect_crossings(
    amplitude: &[f64],
    threshold: f64,
    direction: EdgeDirection,
) -> CrossingSet {
    let indices = amplitude
        .windows(2)
        .enumerate()
        .filter_map(|(i, pair)| {
            let crossed = match direction {
                EdgeDirection::Rising => pair[0] < threshold && pair[1] >= threshold,
                EdgeDirection::Falling => pair[0] > threshold && pair[1] <= threshold,
            };
            crossed.then_some(i)
        })
        .collect();

    CrossingSet { direction, indices }
}

/// Detector state for the hysteresis variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArmState {
    /// Waiting for the next edge
    Armed,
    /// Edge seen, waiting to clear the hysteresis band
    Fired,
    /// Band cleared, waiting to return across the threshold
    Cleared,
}

/// Crossing detection with state-based hysteresis
///
/// After an edge fires, the signal has to pass `threshold + hysteresis`
/// (rising) or `threshold - hysteresis` (falling), then come back across the
/// threshold, before another edge is accepted. Ringing around the threshold
/// therefore yields a single crossing.
pub fn detect_crossings_hysteresis(
    amplitude: &[f64],
    threshold: f64,
    direction: EdgeDirection,
    hysteresis: f64,
) -> CrossingSet {
    let mut indices = Vec::new();
    let mut state = ArmState::Armed;

    for (i, pair) in amplitude.windows(2).enumerate() {
        let (prev, next) = (pair[0], pair[1]);
        match direction {
            EdgeDirection::Rising => {
                let band = threshold + hysteresis;
                match state {
                    ArmState::Armed if prev <= threshold && next > threshold => {
                        indices.push(i);
                        state = ArmState::Fired;
                    }
                    ArmState::Fired if prev <= band && next > band => state = ArmState::Cleared,
                    ArmState::Cleared if prev > threshold && next <= threshold => {
                        state = ArmState::Armed
                    }
                    _ => {}
                }
            }
            EdgeDirection::Falling => {
                let band = threshold - hysteresis;
                match state {
                    ArmState::Armed if prev >= threshold && next < threshold => {
                        indices.push(i);
                        state = ArmState::Fired;
                    }
                    ArmState::Fired if prev >= band && next < band => state = ArmState::Cleared,
                    ArmState::Cleared if prev < threshold && next >= threshold => {
                        state = ArmState::Armed
                    }
                    _ => {}
                }
            }
        }
    }

    CrossingSet { direction, indices }
}

/// Run the detector selected by `policy`
pub fn detect_with_policy(
    amplitude: &[f64],
    threshold: f64,
    direction: EdgeDirection,
    policy: CrossingPolicy,
) -> CrossingSet {
    match policy {
        CrossingPolicy::Plain => detect_crossings(amplitude, threshold, direction),
        CrossingPolicy::Hysteresis(h) => {
            detect_crossings_hysteresis(amplitude, threshold, direction, h)
        }
    }
}
