//! Pairing reference and chip crossings into timing offsets
//!
//! Fast path: when both channels report the same number of crossings over
//! the whole capture they are paired positionally. The qualified-edge trigger
//! guarantees one reference edge per chip edge, so no nearest-neighbour
//! matching is attempted.
//!
//! Recovery path: on a count mismatch the capture is split back into its
//! sequence-mode segments and each segment is analysed on its own. Segments
//! missing an edge on either channel are dropped; multiple edges in one
//! segment collapse to their mean index.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AnalysisError, Result};
use crate::scope::{detect_with_policy, CalibratedChannel, CrossingPolicy, EdgeDirection};

/// Thresholds, slopes and mismatch handling for one extraction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffsetConfig {
    /// Reference channel threshold (V)
    pub ref_threshold: f64,
    /// Chip channel threshold (V)
    pub chip_threshold: f64,
    pub ref_direction: EdgeDirection,
    pub chip_direction: EdgeDirection,
    /// Fall back to per-segment analysis instead of failing on a count mismatch
    pub mismatch_handling: bool,
    /// Samples per sequence-mode segment
    pub segment_size: usize,
    pub policy: CrossingPolicy,
}

impl OffsetConfig {
    /// Rising reference edges against falling chip edges, plain detector
    pub fn new(ref_threshold: f64, chip_threshold: f64) -> Self {
        Self {
            ref_threshold,
            chip_threshold,
            ref_direction: EdgeDirection::Rising,
            chip_direction: EdgeDirection::Falling,
            mismatch_handling: false,
            segment_size: 0,
            policy: CrossingPolicy::Plain,
        }
    }

    pub fn with_mismatch_handling(mut self, segment_size: usize) -> Self {
        self.mismatch_handling = true;
        self.segment_size = segment_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.ref_threshold.is_finite() || !self.chip_threshold.is_finite() {
            return Err(AnalysisError::InvalidConfig(
                "thresholds must be finite".into(),
            ));
        }
        if self.mismatch_handling && self.segment_size == 0 {
            return Err(AnalysisError::InvalidConfig(
                "segment size must be non-zero when mismatch handling is enabled".into(),
            ));
        }
        if let CrossingPolicy::Hysteresis(h) = self.policy {
            if !(h.is_finite() && h >= 0.0) {
                return Err(AnalysisError::InvalidConfig(format!(
                    "hysteresis must be a non-negative finite value, got {}",
                    h
                )));
            }
        }
        Ok(())
    }
}

/// Which path produced the offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionPath {
    /// Whole-capture crossing counts matched
    Matched,
    /// Per-segment recovery; `kept` of `windows` segments produced an offset
    Recovered { windows: usize, kept: usize },
}

/// Offsets from one acquisition plus how they were obtained
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetExtraction {
    /// Chip crossing time minus reference crossing time (s), in capture order
    pub offsets: Vec<f64>,
    pub path: ExtractionPath,
    pub reference_crossings: usize,
    pub chip_crossings: usize,
    /// Positionally paired offsets longer than one segment
    pub suspect_pairs: usize,
}

impl OffsetExtraction {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// Extract chip − reference crossing offsets from one acquisition
pub fn extract_offsets(
    reference: &CalibratedChannel,
    chip: &CalibratedChannel,
    config: &OffsetConfig,
) -> Result<OffsetExtraction> {
    config.validate()?;

    if !reference.same_time_axis(chip) {
        warn!(
            "Time arrays from both channels do not match (reference={}, chip={})",
            reference.len(),
            chip.len()
        );
    }

    // Offsets are read off the reference time axis
    let len = reference.len().min(chip.len()).min(reference.time.len());
    let time = &reference.time[..len];
    let ref_amp = &reference.amplitude[..len];
    let chip_amp = &chip.amplitude[..len];

    let ref_set = detect_with_policy(
        ref_amp,
        config.ref_threshold,
        config.ref_direction,
        config.policy,
    );
    let chip_set = detect_with_policy(
        chip_amp,
        config.chip_threshold,
        config.chip_direction,
        config.policy,
    );

    debug!(
        "Threshold crossings: reference={}, chip={}",
        ref_set.len(),
        chip_set.len()
    );

    if ref_set.len() == chip_set.len() {
        let offsets: Vec<f64> = ref_set
            .indices
            .iter()
            .zip(&chip_set.indices)
            .map(|(&r, &c)| time[c] - time[r])
            .collect();

        let suspect_pairs = if config.segment_size > 0 {
            let span = config.segment_size as f64 * reference.dt;
            offsets.iter().filter(|o| o.abs() > span).count()
        } else {
            0
        };
        if suspect_pairs > 0 {
            warn!(
                "{} positionally paired offsets exceed one segment; edges may be misaligned",
                suspect_pairs
            );
        }

        return Ok(OffsetExtraction {
            offsets,
            path: ExtractionPath::Matched,
            reference_crossings: ref_set.len(),
            chip_crossings: chip_set.len(),
            suspect_pairs,
        });
    }

    if !config.mismatch_handling {
        return Err(AnalysisError::EdgeCountMismatch {
            reference: ref_set.len(),
            chip: chip_set.len(),
        });
    }

    info!("Handling mismatches segment by segment");
    let (offsets, windows) = recover_by_segment(time, ref_amp, chip_amp, config);
    info!(
        "After processing, {} of {} segments yielded an offset",
        offsets.len(),
        windows
    );

    let kept = offsets.len();
    Ok(OffsetExtraction {
        offsets,
        path: ExtractionPath::Recovered { windows, kept },
        reference_crossings: ref_set.len(),
        chip_crossings: chip_set.len(),
        suspect_pairs: 0,
    })
}

/// Per-segment fallback; returns offsets and the number of windows scanned
fn recover_by_segment(
    time: &[f64],
    ref_amp: &[f64],
    chip_amp: &[f64],
    config: &OffsetConfig,
) -> (Vec<f64>, usize) {
    let size = config.segment_size;
    let mut offsets = Vec::new();
    let mut windows = 0;

    for ((seg_time, seg_ref), seg_chip) in time
        .chunks(size)
        .zip(ref_amp.chunks(size))
        .zip(chip_amp.chunks(size))
    {
        windows += 1;

        let ref_set = detect_with_policy(
            seg_ref,
            config.ref_threshold,
            config.ref_direction,
            config.policy,
        );
        let chip_set = detect_with_policy(
            seg_chip,
            config.chip_threshold,
            config.chip_direction,
            config.policy,
        );

        // Segment without an edge on one of the channels
        let (Some(ref_index), Some(chip_index)) = (ref_set.mean_index(), chip_set.mean_index())
        else {
            continue;
        };

        offsets.push(seg_time[chip_index] - seg_time[ref_index]);
    }

    (offsets, windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f64 = 1e-10;

    /// Reference ramps up through 0.5 V at `start + 1`, chip ramps down through
    /// -0.1 V at `start + delay`
    fn paired_segment(len: usize, start: usize, delay: usize) -> (Vec<f64>, Vec<f64>) {
        let mut reference = vec![0.0; len];
        let mut chip = vec![0.0; len];
        for i in start..len {
            reference[i] = ((i - start) as f64 * 0.25).min(1.0);
        }
        for i in (start + delay)..len {
            chip[i] = -((i - start - delay) as f64 * 0.25).min(1.0);
        }
        (reference, chip)
    }

    fn build(segments: &[(Vec<f64>, Vec<f64>)]) -> (CalibratedChannel, CalibratedChannel) {
        let reference: Vec<f64> = segments.iter().flat_map(|s| s.0.clone()).collect();
        let chip: Vec<f64> = segments.iter().flat_map(|s| s.1.clone()).collect();
        (
            CalibratedChannel::from_amplitudes(reference, DT),
            CalibratedChannel::from_amplitudes(chip, DT),
        )
    }

    #[test]
    fn test_ten_edges_three_nanoseconds_apart() {
        let segments: Vec<_> = (0..10).map(|_| paired_segment(500, 100, 30)).collect();
        let (reference, chip) = build(&segments);

        let extraction = extract_offsets(&reference, &chip, &OffsetConfig::new(0.5, -0.1)).unwrap();
        assert_eq!(extraction.path, ExtractionPath::Matched);
        assert_eq!(extraction.len(), 10);
        for offset in &extraction.offsets {
            assert!((offset - 3e-9).abs() <= DT + 1e-15, "offset {}", offset);
        }
    }

    #[test]
    fn test_matched_path_pairs_positionally() {
        let (reference, chip) = build(&[
            paired_segment(200, 20, 10),
            paired_segment(200, 50, 40),
            paired_segment(200, 5, 7),
        ]);
        let extraction = extract_offsets(&reference, &chip, &OffsetConfig::new(0.5, -0.1)).unwrap();

        let ref_idx = [21, 200 + 51, 400 + 6];
        let chip_idx = [30, 200 + 90, 400 + 12];
        let expected: Vec<f64> = ref_idx
            .iter()
            .zip(&chip_idx)
            .map(|(&r, &c)| reference.time[c] - reference.time[r])
            .collect();
        assert_eq!(extraction.offsets, expected);
        assert_eq!(extraction.reference_crossings, 3);
        assert_eq!(extraction.suspect_pairs, 0);

        // Identical inputs give bit-identical output
        let again = extract_offsets(&reference, &chip, &OffsetConfig::new(0.5, -0.1)).unwrap();
        assert_eq!(extraction, again);
    }

    #[test]
    fn test_mismatch_without_handling_fails() {
        let mut dead = paired_segment(200, 20, 10);
        dead.1 = vec![0.0; 200];
        let (reference, chip) = build(&[paired_segment(200, 20, 10), dead]);

        let err = extract_offsets(&reference, &chip, &OffsetConfig::new(0.5, -0.1)).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::EdgeCountMismatch { reference: 2, chip: 1 }
        ));
    }

    #[test]
    fn test_mismatch_recovery_drops_degenerate_segments() {
        let mut missing_chip = paired_segment(200, 20, 10);
        missing_chip.1 = vec![0.0; 200];
        let mut missing_ref = paired_segment(200, 20, 10);
        missing_ref.0 = vec![0.0; 200];

        let (reference, chip) = build(&[
            paired_segment(200, 20, 10),
            missing_chip.clone(),
            paired_segment(200, 60, 25),
            missing_ref,
            paired_segment(200, 30, 15),
            missing_chip,
        ]);

        let config = OffsetConfig::new(0.5, -0.1).with_mismatch_handling(200);
        let extraction = extract_offsets(&reference, &chip, &config).unwrap();

        assert_eq!(extraction.reference_crossings, 5);
        assert_eq!(extraction.chip_crossings, 4);
        assert_eq!(
            extraction.path,
            ExtractionPath::Recovered { windows: 6, kept: 3 }
        );
        assert_eq!(extraction.len(), 3);
        let expected = [9.0 * DT, 24.0 * DT, 14.0 * DT];
        for (got, want) in extraction.offsets.iter().zip(expected) {
            assert!((got - want).abs() < 1e-15, "{} vs {}", got, want);
        }
    }

    #[test]
    fn test_recovery_averages_multiple_edges_in_segment() {
        // Two reference pulses in one segment: edges at 10 and 60, mean 35
        let mut reference = vec![0.0; 100];
        for v in &mut reference[11..40] {
            *v = 1.0;
        }
        for v in &mut reference[61..90] {
            *v = 1.0;
        }
        let mut chip = vec![0.0; 100];
        for v in &mut chip[51..] {
            *v = -1.0;
        }
        // Second segment has only a chip edge, so whole-capture counts differ
        reference.extend(vec![0.0; 100]);
        let mut tail = vec![0.0; 100];
        for v in &mut tail[20..] {
            *v = -1.0;
        }
        chip.extend(tail);

        let reference = CalibratedChannel::from_amplitudes(reference, DT);
        let chip = CalibratedChannel::from_amplitudes(chip, DT);
        let config = OffsetConfig::new(0.5, -0.1).with_mismatch_handling(100);
        let extraction = extract_offsets(&reference, &chip, &config).unwrap();

        assert_eq!(extraction.reference_crossings, 2);
        assert_eq!(extraction.chip_crossings, 2);
        assert_eq!(extraction.path, ExtractionPath::Matched);

        // Break the count equality with a third chip edge to force recovery
        let mut chip_amp = chip.amplitude.clone();
        chip_amp[150] = 0.0;
        let chip = CalibratedChannel::from_amplitudes(chip_amp, DT);
        let extraction = extract_offsets(&reference, &chip, &config).unwrap();
        assert_eq!(
            extraction.path,
            ExtractionPath::Recovered { windows: 2, kept: 1 }
        );
        assert!((extraction.offsets[0] - 15.0 * DT).abs() < 1e-15);
    }

    #[test]
    fn test_recovery_output_bounded_by_windows() {
        // Irregular last window: 450 samples in windows of 200
        let mut segments = vec![paired_segment(200, 20, 10), paired_segment(200, 40, 5)];
        let mut tail = paired_segment(50, 10, 5);
        tail.1 = vec![0.0; 50];
        segments.push(tail);
        let (reference, chip) = build(&segments);

        let config = OffsetConfig::new(0.5, -0.1).with_mismatch_handling(200);
        let extraction = extract_offsets(&reference, &chip, &config).unwrap();
        match extraction.path {
            ExtractionPath::Recovered { windows, kept } => {
                assert_eq!(windows, 3);
                assert_eq!(kept, 2);
                assert!(kept <= windows);
            }
            other => panic!("unexpected path {:?}", other),
        }
    }

    #[test]
    fn test_truncates_to_shorter_channel() {
        let (reference, chip) = build(&[paired_segment(200, 20, 10), paired_segment(200, 20, 10)]);
        let short_chip =
            CalibratedChannel::from_amplitudes(chip.amplitude[..225].to_vec(), DT);

        // The second reference edge (index 221) survives truncation, the second chip edge (230) does not
        let err = extract_offsets(&reference, &short_chip, &OffsetConfig::new(0.5, -0.1)).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::EdgeCountMismatch { reference: 2, chip: 1 }
        ));
    }

    #[test]
    fn test_short_time_axis_bounds_extraction() {
        let (mut reference, chip) =
            build(&[paired_segment(200, 20, 10), paired_segment(200, 20, 10)]);
        reference.time.truncate(300);

        let extraction = extract_offsets(&reference, &chip, &OffsetConfig::new(0.5, -0.1)).unwrap();
        assert_eq!(extraction.path, ExtractionPath::Matched);
        assert_eq!(extraction.len(), 2);
        for offset in &extraction.offsets {
            assert!((offset - 9.0 * DT).abs() < 1e-15, "offset {}", offset);
        }

        reference.time.clear();
        let extraction = extract_offsets(&reference, &chip, &OffsetConfig::new(0.5, -0.1)).unwrap();
        assert!(extraction.is_empty());
    }

    #[test]
    fn test_zero_segment_size_rejected_eagerly() {
        let empty = CalibratedChannel::from_amplitudes(Vec::new(), DT);
        let config = OffsetConfig::new(0.5, -0.1).with_mismatch_handling(0);
        let err = extract_offsets(&empty, &empty, &config).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidConfig(_)));
    }

    #[test]
    fn test_empty_channels_yield_no_offsets() {
        let empty = CalibratedChannel::from_amplitudes(Vec::new(), DT);
        let extraction = extract_offsets(&empty, &empty, &OffsetConfig::new(0.5, -0.1)).unwrap();
        assert!(extraction.is_empty());
        assert_eq!(extraction.path, ExtractionPath::Matched);
    }

    #[test]
    fn test_suspect_pairs_flagged() {
        // Reference edge in segment 0 only, chip edge in segment 1 only: counts match but pair spans segments
        let mut reference = vec![0.0; 200];
        for v in &mut reference[21..100] {
            *v = 1.0;
        }
        let mut chip = vec![0.0; 200];
        for v in &mut chip[151..] {
            *v = -1.0;
        }
        let reference = CalibratedChannel::from_amplitudes(reference, DT);
        let chip = CalibratedChannel::from_amplitudes(chip, DT);

        let mut config = OffsetConfig::new(0.5, -0.1);
        config.segment_size = 100;
        let extraction = extract_offsets(&reference, &chip, &config).unwrap();
        assert_eq!(extraction.len(), 1);
        assert_eq!(extraction.suspect_pairs, 1);
    }
}
