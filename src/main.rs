//! Edge jitter sweep
//!
//! Sweeps device parameters, measures the reference-to-chip edge delay
//! distribution at every value and reports the fitted jitter.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use edge_jitter::scope::synthetic_bench;
use edge_jitter::sweep::SweepRunner;
use edge_jitter::Config;

fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   Edge Jitter Sweep");
    info!("   sequence-mode offset histogram fit");
    info!("===========================================");

    let config = Config::from_env();
    config.validate().context("Invalid configuration")?;

    info!("Configuration:");
    info!("  Output directory: {}", config.output_dir.display());
    info!(
        "  Acquisition: {} segments x {} samples, {} loops",
        config.segments, config.samples_per_segment, config.loops
    );
    info!(
        "  Sample interval: {:.1} ps, deskew {:.1} ns",
        config.dt() * 1e12,
        config.deskew * 1e9
    );
    info!(
        "  Thresholds: ref {} V ({:?}), chip {} V ({:?})",
        config.ref_threshold, config.ref_slope, config.chip_threshold, config.chip_slope
    );
    info!(
        "  Histogram: {} bins, outlier cut {} sigma",
        config.hist_bins, config.outlier_sigma
    );
    for plan in &config.sweeps {
        info!("  Sweep: {} over {:?}", plan.parameter, plan.values);
    }
    if config.keep_wave_data {
        info!("  Keeping per-loop waveforms");
    }

    // No hardware transport is linked in; the simulated bench stands in
    info!("Using synthetic digitizer and device");
    let (instrument, mut device) = synthetic_bench(config.synthetic.clone());

    let mut runner = SweepRunner::new(config, Box::new(instrument));
    let points = runner.run_sweep(&mut device).context("Sweep failed")?;

    info!(
        "Wrote {} sweep points to {}",
        points.len(),
        runner.store().root().display()
    );
    Ok(())
}
