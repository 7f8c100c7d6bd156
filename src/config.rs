//! Configuration loaded from environment variables

use anyhow::{ensure, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;

use crate::analysis::{FitConfig, OffsetConfig};
use crate::scope::{AcquisitionRequest, CrossingPolicy, EdgeDirection, SyntheticConfig};

/// Horizontal divisions spanned by one segment
const DIVISIONS_PER_SEGMENT: f64 = 10.0;

/// Application configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory receiving offsets, parameters and summaries
    pub output_dir: PathBuf,

    /// Segments per acquisition
    pub segments: usize,

    /// Samples per segment
    pub samples_per_segment: usize,

    /// Successful acquisitions per sweep point
    pub loops: usize,

    /// Discarded acquisitions tolerated per sweep point
    pub max_retries: u32,

    /// Horizontal scale (s/div); a segment spans 10 divisions
    pub div_time: f64,

    /// Reference channel delay applied by the instrument (s)
    pub deskew: f64,

    pub ref_threshold: f64,
    pub chip_threshold: f64,
    pub ref_slope: EdgeDirection,
    pub chip_slope: EdgeDirection,

    /// Hysteresis band for crossing detection; plain detection when unset
    pub hysteresis: Option<f64>,

    /// Recover offsets segment by segment on crossing count mismatch
    pub mismatch_handling: bool,

    /// Outlier cut in standard deviations; 0 disables it
    pub outlier_sigma: f64,

    pub hist_bins: usize,

    /// Keep per-loop offset files after combining them
    pub keep_loop_files: bool,

    /// Save both decoded channels of every loop
    pub keep_wave_data: bool,

    /// Longest wait for one acquisition before giving up
    pub acquisition_timeout_secs: u64,

    /// Swept parameters, measured in order
    pub sweeps: Vec<SweepPlan>,

    /// Simulated bench used when no hardware is attached
    pub synthetic: SyntheticConfig,
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|s| s.trim().to_ascii_lowercase()) {
        Some(s) if matches!(s.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(s) if matches!(s.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

/// One device parameter and the values it is swept over
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepPlan {
    pub parameter: String,
    pub values: Vec<i64>,
}

/// Parse `DCL:0..16;VRL:1..32`, each value list as in [`parse_sweep_values`]
pub fn parse_sweep_plans(s: &str) -> Option<Vec<SweepPlan>> {
    s.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (parameter, values) = part.split_once(':')?;
            Some(SweepPlan {
                parameter: parameter.trim().to_string(),
                values: parse_sweep_values(values)?,
            })
        })
        .collect()
}

/// Parse `a..b`, `a..=b` or a comma separated list
pub fn parse_sweep_values(s: &str) -> Option<Vec<i64>> {
    let s = s.trim();
    if let Some((lo, hi)) = s.split_once("..=") {
        let (lo, hi): (i64, i64) = (lo.trim().parse().ok()?, hi.trim().parse().ok()?);
        return Some((lo..=hi).collect());
    }
    if let Some((lo, hi)) = s.split_once("..") {
        let (lo, hi): (i64, i64) = (lo.trim().parse().ok()?, hi.trim().parse().ok()?);
        return Some((lo..hi).collect());
    }
    s.split(',')
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().parse().ok())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        let samples_per_segment = parsed(lookup, "SAMPLES_PER_SEGMENT", 500usize);
        let div_time = parsed(lookup, "DIV_TIME", 5e-9);

        let defaults = SyntheticConfig::default();
        let dt = DIVISIONS_PER_SEGMENT * div_time / samples_per_segment.max(1) as f64;
        let synthetic = SyntheticConfig {
            dt,
            // Edges span two samples at any horizontal scale
            rise_time: 2.0 * dt,
            edge_delay: parsed(lookup, "SYNTH_EDGE_DELAY", defaults.edge_delay),
            jitter: parsed(lookup, "SYNTH_JITTER", defaults.jitter),
            jitter_per_step: parsed(lookup, "SYNTH_JITTER_STEP", defaults.jitter_per_step),
            noise: parsed(lookup, "SYNTH_NOISE", defaults.noise),
            missing_edge_rate: parsed(lookup, "SYNTH_MISSING_RATE", defaults.missing_edge_rate),
            seed: parsed(lookup, "SYNTH_SEED", defaults.seed),
            ..defaults
        };

        Self {
            output_dir: lookup("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("scope_data")),

            segments: parsed(lookup, "SEGMENTS", 5000),
            samples_per_segment,
            loops: parsed(lookup, "NUM_LOOPS", 10),
            max_retries: parsed(lookup, "MAX_RETRIES", 20),
            div_time,
            deskew: parsed(lookup, "DESKEW_TIME", 30e-9),

            ref_threshold: parsed(lookup, "REF_THRESHOLD", 0.05),
            chip_threshold: parsed(lookup, "CHIP_THRESHOLD", 0.5),
            ref_slope: lookup("REF_EDGE_SLOPE")
                .and_then(|s| EdgeDirection::parse(&s))
                .unwrap_or(EdgeDirection::Rising),
            chip_slope: lookup("CHIP_EDGE_SLOPE")
                .and_then(|s| EdgeDirection::parse(&s))
                .unwrap_or(EdgeDirection::Falling),
            hysteresis: lookup("CROSSING_HYSTERESIS").and_then(|s| s.trim().parse().ok()),
            mismatch_handling: flag(lookup, "MISMATCH_HANDLING", true),

            outlier_sigma: parsed(lookup, "STD_CUTOFF", 3.0),
            hist_bins: parsed(lookup, "HIST_BINS", 100),
            keep_loop_files: flag(lookup, "KEEP_LOOP_FILES", false),
            keep_wave_data: flag(lookup, "KEEP_WAVE_DATA", false),
            acquisition_timeout_secs: parsed(lookup, "ACQUISITION_TIMEOUT_SECS", 60),

            // SWEEP lists every parameter; SWEEP_PARAM/SWEEP_VALUES name a single one
            sweeps: lookup("SWEEP")
                .and_then(|s| parse_sweep_plans(&s))
                .unwrap_or_else(|| {
                    vec![SweepPlan {
                        parameter: lookup("SWEEP_PARAM").unwrap_or_else(|| "DCL".to_string()),
                        values: lookup("SWEEP_VALUES")
                            .and_then(|s| parse_sweep_values(&s))
                            .unwrap_or_else(|| (0..16).collect()),
                    }]
                }),

            synthetic,
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.segments > 0, "SEGMENTS must be positive");
        ensure!(
            self.samples_per_segment >= 2,
            "SAMPLES_PER_SEGMENT must be at least 2, got {}",
            self.samples_per_segment
        );
        ensure!(self.loops > 0, "NUM_LOOPS must be positive");
        ensure!(
            self.div_time.is_finite() && self.div_time > 0.0,
            "DIV_TIME must be positive, got {}",
            self.div_time
        );
        ensure!(self.deskew.is_finite(), "DESKEW_TIME must be finite");
        ensure!(!self.sweeps.is_empty(), "No parameter to sweep");
        for (i, plan) in self.sweeps.iter().enumerate() {
            ensure!(!plan.parameter.is_empty(), "Sweep parameter name is empty");
            ensure!(
                !plan.values.is_empty(),
                "No values to sweep for {}",
                plan.parameter
            );
            // Each parameter owns one summary file
            ensure!(
                !self.sweeps[..i].iter().any(|p| p.parameter == plan.parameter),
                "{} is swept twice",
                plan.parameter
            );
        }
        self.offset_config(self.samples_per_segment).validate()?;
        self.fit_config().validate()?;
        Ok(())
    }

    /// Sample interval implied by the horizontal scale
    pub fn dt(&self) -> f64 {
        DIVISIONS_PER_SEGMENT * self.div_time / self.samples_per_segment as f64
    }

    pub fn acquisition_request(&self) -> AcquisitionRequest {
        AcquisitionRequest {
            segments: self.segments,
            samples_per_segment: self.samples_per_segment,
            deskew: self.deskew,
        }
    }

    /// Extraction settings for segments of `segment_size` samples
    pub fn offset_config(&self, segment_size: usize) -> OffsetConfig {
        OffsetConfig {
            ref_threshold: self.ref_threshold,
            chip_threshold: self.chip_threshold,
            ref_direction: self.ref_slope,
            chip_direction: self.chip_slope,
            mismatch_handling: self.mismatch_handling,
            segment_size,
            policy: match self.hysteresis {
                Some(h) => CrossingPolicy::Hysteresis(h),
                None => CrossingPolicy::Plain,
            },
        }
    }

    pub fn fit_config(&self) -> FitConfig {
        FitConfig {
            bin_count: self.hist_bins,
            outlier_sigma: self.outlier_sigma,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.segments, 5000);
        assert_eq!(config.samples_per_segment, 500);
        assert_eq!(config.loops, 10);
        assert_eq!(config.hist_bins, 100);
        assert_eq!(config.ref_slope, EdgeDirection::Rising);
        assert_eq!(config.chip_slope, EdgeDirection::Falling);
        assert!(config.mismatch_handling);
        assert!(!config.keep_wave_data);
        assert_eq!(config.sweeps.len(), 1);
        assert_eq!(config.sweeps[0].parameter, "DCL");
        assert_eq!(config.sweeps[0].values.len(), 16);
        assert!((config.dt() - 1e-10).abs() < 1e-22);
        assert!((config.synthetic.dt - 1e-10).abs() < 1e-22);
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("NUM_LOOPS", "3"),
            ("REF_EDGE_SLOPE", "NEG"),
            ("CHIP_EDGE_SLOPE", "pos"),
            ("MISMATCH_HANDLING", "off"),
            ("CROSSING_HYSTERESIS", "0.02"),
            ("SWEEP_VALUES", "1, 4, 9"),
            ("KEEP_WAVE_DATA", "yes"),
        ]);
        assert_eq!(config.loops, 3);
        assert_eq!(config.sweeps[0].values, vec![1, 4, 9]);
        assert!(config.keep_wave_data);

        let offsets = config.offset_config(250);
        assert_eq!(offsets.ref_direction, EdgeDirection::Falling);
        assert_eq!(offsets.chip_direction, EdgeDirection::Rising);
        assert!(!offsets.mismatch_handling);
        assert_eq!(offsets.segment_size, 250);
        assert_eq!(offsets.policy, CrossingPolicy::Hysteresis(0.02));
    }

    #[test]
    fn test_unparseable_values_fall_back() {
        let config = config_from(&[("SEGMENTS", "many"), ("REF_EDGE_SLOPE", "up")]);
        assert_eq!(config.segments, 5000);
        assert_eq!(config.ref_slope, EdgeDirection::Rising);
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(config_from(&[("HIST_BINS", "0")]).validate().is_err());
        assert!(config_from(&[("STD_CUTOFF", "-2")]).validate().is_err());
        assert!(config_from(&[("NUM_LOOPS", "0")]).validate().is_err());
        assert!(config_from(&[("SAMPLES_PER_SEGMENT", "1")]).validate().is_err());
        assert!(config_from(&[("CROSSING_HYSTERESIS", "-0.1")]).validate().is_err());
        assert!(config_from(&[("SWEEP", "DCL:")]).validate().is_err());
        assert!(config_from(&[("SWEEP", ":1..3")]).validate().is_err());
        assert!(config_from(&[("SWEEP", "DCL:0..2;DCL:4")]).validate().is_err());
    }

    #[test]
    fn test_parse_sweep_values() {
        assert_eq!(parse_sweep_values("0..4"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_sweep_values("2..=4"), Some(vec![2, 3, 4]));
        assert_eq!(parse_sweep_values("7"), Some(vec![7]));
        assert_eq!(parse_sweep_values("1,x"), None);
    }

    #[test]
    fn test_sweep_lists_several_parameters() {
        let config = config_from(&[
            ("SWEEP", "DCL:0..3; VRL:1..=2 ;Dcomp:5,7"),
            ("SWEEP_PARAM", "ignored"),
        ]);
        let plans: Vec<(&str, &[i64])> = config
            .sweeps
            .iter()
            .map(|p| (p.parameter.as_str(), p.values.as_slice()))
            .collect();
        assert_eq!(
            plans,
            vec![
                ("DCL", &[0, 1, 2][..]),
                ("VRL", &[1, 2][..]),
                ("Dcomp", &[5, 7][..]),
            ]
        );
        config.validate().unwrap();

        assert_eq!(parse_sweep_plans("DCL=0..3"), None);
        assert_eq!(parse_sweep_plans("DCL:0..x"), None);

        // Malformed SWEEP falls back to the single-parameter keys
        let config = config_from(&[("SWEEP", "DCL"), ("SWEEP_PARAM", "VRL"), ("SWEEP_VALUES", "4")]);
        assert_eq!(
            config.sweeps,
            vec![SweepPlan {
                parameter: "VRL".to_string(),
                values: vec![4],
            }]
        );
    }
}
