//! Simulated bench: a two-channel digitizer and a tunable device
//!
//! Each segment holds one rising reference edge and, usually, one falling
//! chip edge a fixed delay later plus Gaussian timing jitter. The swept
//! device setting scales the jitter so a sweep produces a visible trend.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::capture::{AcquisitionRequest, ChannelCapture, Instrument, RawAcquisition};
use super::decode::{encode_capture, CaptureMetadata, SequenceHeader};
use crate::sweep::DeviceControl;

/// Signal shape and noise of the simulated bench
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Sample interval (s)
    pub dt: f64,
    pub ref_volts_per_div: f64,
    pub chip_volts_per_div: f64,
    /// Reference pulse high level (V), low level is 0
    pub ref_high: f64,
    /// Chip idle level (V) before its falling edge
    pub chip_high: f64,
    /// Chip edge delay after the reference edge before deskew (s)
    pub edge_delay: f64,
    /// Timing jitter at device setting 0 (s)
    pub jitter: f64,
    /// Extra jitter per unit of device setting (s)
    pub jitter_per_step: f64,
    /// 0–100 % edge duration (s)
    pub rise_time: f64,
    /// Vertical noise (V rms)
    pub noise: f64,
    /// Probability that a segment has no chip edge
    pub missing_edge_rate: f64,
    /// Reference edge position as a fraction of the segment
    pub trigger_fraction: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            dt: 1e-10,
            ref_volts_per_div: 0.05,
            chip_volts_per_div: 0.35,
            ref_high: 0.2,
            chip_high: 1.0,
            edge_delay: 33e-9,
            jitter: 50e-12,
            jitter_per_step: 5e-12,
            rise_time: 2e-10,
            noise: 2e-3,
            missing_edge_rate: 0.0,
            trigger_fraction: 0.3,
            seed: 0x5eed,
        }
    }
}

/// Build an instrument and a device sharing one device setting
pub fn synthetic_bench(config: SyntheticConfig) -> (SyntheticInstrument, SyntheticDevice) {
    let setting = Arc::new(AtomicI64::new(0));
    let instrument = SyntheticInstrument {
        rng: StdRng::seed_from_u64(config.seed),
        config,
        setting: setting.clone(),
    };
    (instrument, SyntheticDevice { setting })
}

/// Simulated two-channel digitizer in sequence mode
pub struct SyntheticInstrument {
    config: SyntheticConfig,
    rng: StdRng,
    setting: Arc<AtomicI64>,
}

impl SyntheticInstrument {
    /// Timing jitter at the current device setting
    pub fn current_jitter(&self) -> f64 {
        let value = self.setting.load(Ordering::Relaxed) as f64;
        (self.config.jitter + self.config.jitter_per_step * value).max(0.0)
    }
}

/// Fraction of the way through an edge at time `t`
fn edge_level(t: f64, edge: f64, rise_time: f64) -> f64 {
    if rise_time > 0.0 {
        ((t - edge) / rise_time + 0.5).clamp(0.0, 1.0)
    } else if t >= edge {
        1.0
    } else {
        0.0
    }
}

impl Instrument for SyntheticInstrument {
    fn acquire(&mut self, request: &AcquisitionRequest) -> Result<RawAcquisition> {
        if request.segments == 0 || request.samples_per_segment < 2 {
            anyhow::bail!(
                "cannot acquire {} segments of {} samples",
                request.segments,
                request.samples_per_segment
            );
        }

        let cfg = &self.config;
        let samples = request.samples_per_segment;
        let jitter = self.current_jitter();
        let timing = Normal::new(0.0, jitter).context("Invalid jitter")?;
        let vertical = Normal::new(0.0, cfg.noise).context("Invalid noise level")?;

        let total = request.segments * samples;
        let mut reference = Vec::with_capacity(total);
        let mut chip = Vec::with_capacity(total);
        let mut missing = 0usize;

        for _ in 0..request.segments {
            // Trigger lands anywhere within one sample period
            let ref_edge = (cfg.trigger_fraction * samples as f64 + self.rng.gen::<f64>()) * cfg.dt;
            let chip_edge = if self.rng.gen::<f64>() < cfg.missing_edge_rate {
                missing += 1;
                None
            } else {
                Some(ref_edge + cfg.edge_delay - request.deskew + timing.sample(&mut self.rng))
            };

            for i in 0..samples {
                let t = i as f64 * cfg.dt;
                let r = cfg.ref_high * edge_level(t, ref_edge, cfg.rise_time);
                let c = match chip_edge {
                    Some(edge) => cfg.chip_high * (1.0 - edge_level(t, edge, cfg.rise_time)),
                    None => cfg.chip_high,
                };
                reference.push(r + vertical.sample(&mut self.rng));
                chip.push(c + vertical.sample(&mut self.rng));
            }
        }

        debug!(
            "Synthesised {} segments at jitter {:e} s ({} without chip edge)",
            request.segments, jitter, missing
        );

        let ref_meta = CaptureMetadata::with_layout(
            cfg.ref_volts_per_div,
            0.0,
            cfg.dt,
            &SequenceHeader,
            request.segments,
            samples,
        );
        let chip_meta = CaptureMetadata::with_layout(
            cfg.chip_volts_per_div,
            0.0,
            cfg.dt,
            &SequenceHeader,
            request.segments,
            samples,
        );

        Ok(RawAcquisition {
            sequence: 0,
            reference: ChannelCapture {
                raw: encode_capture(&reference, &ref_meta),
                metadata: ref_meta,
            },
            chip: ChannelCapture {
                raw: encode_capture(&chip, &chip_meta),
                metadata: chip_meta,
            },
            segments: request.segments,
            samples_per_segment: samples,
        })
    }

    fn name(&self) -> &str {
        "synthetic digitizer"
    }
}

/// Simulated device; its setting feeds the instrument's jitter
pub struct SyntheticDevice {
    setting: Arc<AtomicI64>,
}

impl DeviceControl for SyntheticDevice {
    fn apply(&mut self, parameter: &str, value: i64) -> Result<()> {
        info!("Setting {} = {} on synthetic device", parameter, value);
        self.setting.store(value, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "synthetic device"
    }
}
