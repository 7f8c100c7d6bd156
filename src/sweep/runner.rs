//! Sweep orchestration
//!
//! Parameters are swept one after the other. For every value of a
//! parameter: apply it, collect `loops` usable acquisitions (discarding
//! mismatched ones up to the retry budget), persist their offsets, then fit
//! the jitter of the combined population.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::device::DeviceControl;
use super::store::{load_offsets, OffsetStore};
use crate::analysis::{extract_offsets, fit_jitter, ExtractionPath, JitterEstimate, OffsetExtraction};
use crate::config::{Config, SweepPlan};
use crate::error::AnalysisError;
use crate::scope::{decode_pair, AcquisitionWorker, CalibratedChannel, Instrument, RawAcquisition};

/// How many discarded acquisitions a sweep point tolerates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Whether `used` retries are still within budget
    pub fn allows(&self, used: u32) -> bool {
        used <= self.max_retries
    }
}

/// Result of one sweep point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub parameter: String,
    pub value: i64,
    pub estimate: JitterEstimate,
    /// Fitted mean offset plus the instrument deskew (s)
    pub delay: f64,
    pub offset_count: usize,
    pub loops: usize,
    pub retries: u32,
    /// Loops whose offsets came from per-segment recovery
    pub recovered_loops: usize,
    pub elapsed_secs: f64,
    pub finished_at: DateTime<Utc>,
}

/// Per-point loop bookkeeping
#[derive(Debug, Default)]
struct LoopTally {
    loops: usize,
    retries: u32,
    recovered: usize,
    offsets: usize,
}

/// Decoded channels of one loop and the offsets between them
#[derive(Debug, Clone)]
pub struct LoopAnalysis {
    pub reference: CalibratedChannel,
    pub chip: CalibratedChannel,
    pub extraction: OffsetExtraction,
}

/// Decode both channels of an acquisition and extract its offsets
///
/// The time axis of loop `loop_index` starts where the previous loop's
/// acquisition ended.
pub fn analyze_acquisition(
    acquisition: &RawAcquisition,
    config: &Config,
    loop_index: usize,
) -> Result<LoopAnalysis, AnalysisError> {
    let (reference, chip) = decode_pair(
        &acquisition.reference.raw,
        &acquisition.reference.metadata,
        &acquisition.chip.raw,
        &acquisition.chip.metadata,
    )?;

    let span = (acquisition.segments * acquisition.samples_per_segment) as f64 * reference.dt;
    let origin = span * loop_index as f64;
    let reference = reference.shifted(origin);
    let chip = chip.shifted(origin);

    let extraction = extract_offsets(
        &reference,
        &chip,
        &config.offset_config(acquisition.samples_per_segment),
    )?;
    Ok(LoopAnalysis {
        reference,
        chip,
        extraction,
    })
}

/// Runs sweep points against one instrument
pub struct SweepRunner {
    config: Config,
    store: OffsetStore,
    worker: AcquisitionWorker,
    retry: RetryPolicy,
}

impl SweepRunner {
    pub fn new(config: Config, instrument: Box<dyn Instrument>) -> Self {
        let store = OffsetStore::new(&config.output_dir).keep_loop_files(config.keep_loop_files);
        let retry = RetryPolicy {
            max_retries: config.max_retries,
        };
        Self {
            config,
            store,
            worker: AcquisitionWorker::new(instrument),
            retry,
        }
    }

    pub fn store(&self) -> &OffsetStore {
        &self.store
    }

    /// Sweep every configured parameter in order
    ///
    /// Returns the points of all parameters; each parameter also gets its
    /// own `jitter_vs_<param>.json`.
    pub fn run_sweep(&mut self, device: &mut dyn DeviceControl) -> Result<Vec<SweepPoint>> {
        self.store
            .write_json("parameters.json", &self.config)
            .context("Failed to save run parameters")?;

        let plans = self.config.sweeps.clone();
        let started = Instant::now();
        let mut points = Vec::new();
        for plan in &plans {
            points.extend(self.sweep_parameter(device, plan)?);
        }

        info!(
            "Sweep completed: {} parameters, {} points in {:.1} s",
            plans.len(),
            points.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(points)
    }

    /// Apply every value of one parameter and measure it
    pub fn sweep_parameter(
        &mut self,
        device: &mut dyn DeviceControl,
        plan: &SweepPlan,
    ) -> Result<Vec<SweepPoint>> {
        let parameter = plan.parameter.as_str();
        info!(
            "Sweeping parameter: {} over {} values",
            parameter,
            plan.values.len()
        );
        let started = Instant::now();
        let mut points = Vec::with_capacity(plan.values.len());

        for &value in &plan.values {
            device.apply(parameter, value).with_context(|| {
                format!("Failed to set {} = {} on {}", parameter, value, device.name())
            })?;

            let point = self
                .run_point(parameter, value)
                .with_context(|| format!("Sweep point {} = {} failed", parameter, value))?;
            points.push(point);

            // Rewritten after each point so an aborted sweep keeps its results
            self.store.write_summary(parameter, &points)?;
        }

        let total = started.elapsed().as_secs_f64();
        info!("===========================================");
        info!("  {} sweep results", parameter);
        info!("===========================================");
        for p in &points {
            info!(
                "  {} = {:>4} | sigma {:8.2} ± {:.2} ps | FWHM {:8.2} ± {:.2} ps | delay {:.4} ns | {} offsets",
                parameter,
                p.value,
                p.estimate.sigma_fit * 1e12,
                p.estimate.sigma_err * 1e12,
                p.estimate.fwhm() * 1e12,
                p.estimate.fwhm_err() * 1e12,
                p.delay * 1e9,
                p.offset_count
            );
        }
        info!(
            "Summary for {}: {} points in {:.1} s ({:.2} min), {:.1} s per value",
            parameter,
            points.len(),
            total,
            total / 60.0,
            total / points.len().max(1) as f64
        );

        Ok(points)
    }

    /// Measure one sweep point with the device already configured
    pub fn run_point(&mut self, parameter: &str, value: i64) -> Result<SweepPoint> {
        let started = Instant::now();
        info!("Measuring {} = {}", parameter, value);

        self.store.prepare_point(parameter, value)?;

        let rx = self.worker.start(self.config.acquisition_request())?;
        let outcome = self.collect_loops(&rx, parameter, value);
        drop(rx);
        self.worker.stop();
        let tally = outcome?;

        let combined = self.store.combine(parameter, value)?;
        let offsets = load_offsets(&combined)?;
        info!("Total # of offsets for this measurement: {}", offsets.len());
        if offsets.len() != tally.offsets {
            warn!(
                "Combined file holds {} offsets, {} were extracted",
                offsets.len(),
                tally.offsets
            );
        }

        let fit = self.config.fit_config();
        let estimate = fit_jitter(&offsets, fit.bin_count, fit.outlier_sigma)
            .with_context(|| format!("Jitter fit failed for {} = {}", parameter, value))?;

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            "{} = {}: sigma {:.2} ps, FWHM {:.2} ps, {} loops ({} retries) in {:.1} s",
            parameter,
            value,
            estimate.sigma_fit * 1e12,
            estimate.fwhm() * 1e12,
            tally.loops,
            tally.retries,
            elapsed
        );

        Ok(SweepPoint {
            parameter: parameter.to_string(),
            value,
            delay: estimate.mean_fit + self.config.deskew,
            offset_count: offsets.len(),
            estimate,
            loops: tally.loops,
            retries: tally.retries,
            recovered_loops: tally.recovered,
            elapsed_secs: elapsed,
            finished_at: Utc::now(),
        })
    }

    fn collect_loops(
        &self,
        rx: &Receiver<RawAcquisition>,
        parameter: &str,
        value: i64,
    ) -> Result<LoopTally> {
        let timeout = Duration::from_secs(self.config.acquisition_timeout_secs);
        let mut tally = LoopTally::default();

        while tally.loops < self.config.loops {
            let acquisition = match rx.recv_timeout(timeout) {
                Ok(acquisition) => acquisition,
                Err(RecvTimeoutError::Timeout) => bail!(
                    "No acquisition within {} s (loop {} of {})",
                    timeout.as_secs(),
                    tally.loops + 1,
                    self.config.loops
                ),
                Err(RecvTimeoutError::Disconnected) => bail!(
                    "Acquisition stopped after {} of {} loops",
                    tally.loops,
                    self.config.loops
                ),
            };

            debug!(
                "Loop {}/{} from acquisition {}",
                tally.loops + 1,
                self.config.loops,
                acquisition.sequence
            );

            let analysis = match analyze_acquisition(&acquisition, &self.config, tally.loops) {
                Ok(analysis) => analysis,
                Err(e) if e.is_retryable() => {
                    tally.retries += 1;
                    warn!(
                        "Discarding acquisition {}: {} (retry {}/{})",
                        acquisition.sequence, e, tally.retries, self.retry.max_retries
                    );
                    if !self.retry.allows(tally.retries) {
                        return Err(anyhow!(e).context(format!(
                            "Giving up after {} retries",
                            self.retry.max_retries
                        )));
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            drop(acquisition);

            let extraction = &analysis.extraction;
            if extraction.is_empty() {
                warn!("Loop {} produced no offsets", tally.loops);
            }
            if let ExtractionPath::Recovered { windows, kept } = extraction.path {
                tally.recovered += 1;
                debug!("Recovered {} of {} segments", kept, windows);
            }

            self.store
                .write_loop(parameter, value, tally.loops, &extraction.offsets)?;
            if self.config.keep_wave_data {
                self.store.write_waveforms(
                    parameter,
                    value,
                    tally.loops,
                    &analysis.reference,
                    &analysis.chip,
                )?;
            }
            tally.offsets += extraction.len();
            tally.loops += 1;
        }

        Ok(tally)
    }
}
