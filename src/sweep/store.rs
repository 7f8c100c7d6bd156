//! On-disk layout of a sweep
//!
//! ```text
//! <root>/parameters.json
//! <root>/OffsetVals_<param><value>/offset_vals_<param><value>_<loop>.txt
//! <root>/offset_values_all_<param><value>.txt
//! <root>/jitter_vs_<param>.json
//! <root>/ReferenceWaveforms_<param><value>/ref_data_<loop>.txt
//! <root>/ChipWaveforms_<param><value>/chip_data_<loop>.txt
//! ```
//!
//! Offset files hold one value per line in scientific notation. Waveform
//! files are only written when requested and hold `time amplitude` rows.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::runner::SweepPoint;
use crate::scope::CalibratedChannel;

/// Writes offsets and summaries under one output directory
#[derive(Debug, Clone)]
pub struct OffsetStore {
    root: PathBuf,
    keep_loop_files: bool,
}

impl OffsetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_loop_files: false,
        }
    }

    pub fn keep_loop_files(mut self, keep: bool) -> Self {
        self.keep_loop_files = keep;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn point_dir(&self, parameter: &str, value: i64) -> PathBuf {
        self.root.join(format!("OffsetVals_{}{}", parameter, value))
    }

    pub fn loop_file(&self, parameter: &str, value: i64, loop_index: usize) -> PathBuf {
        self.point_dir(parameter, value).join(format!(
            "offset_vals_{}{}_{:03}.txt",
            parameter, value, loop_index
        ))
    }

    pub fn combined_file(&self, parameter: &str, value: i64) -> PathBuf {
        self.root
            .join(format!("offset_values_all_{}{}.txt", parameter, value))
    }

    pub fn summary_file(&self, parameter: &str) -> PathBuf {
        self.root.join(format!("jitter_vs_{}.json", parameter))
    }

    fn wave_dirs(&self, parameter: &str, value: i64) -> [PathBuf; 2] {
        [
            self.root.join(format!("ReferenceWaveforms_{}{}", parameter, value)),
            self.root.join(format!("ChipWaveforms_{}{}", parameter, value)),
        ]
    }

    pub fn reference_wave_file(&self, parameter: &str, value: i64, loop_index: usize) -> PathBuf {
        let [dir, _] = self.wave_dirs(parameter, value);
        dir.join(format!("ref_data_{:03}.txt", loop_index))
    }

    pub fn chip_wave_file(&self, parameter: &str, value: i64, loop_index: usize) -> PathBuf {
        let [_, dir] = self.wave_dirs(parameter, value);
        dir.join(format!("chip_data_{:03}.txt", loop_index))
    }

    /// Remove files left by an earlier run of the same sweep point
    pub fn prepare_point(&self, parameter: &str, value: i64) -> Result<()> {
        let dir = self.point_dir(parameter, value);
        let [ref_waves, chip_waves] = self.wave_dirs(parameter, value);
        for stale in [&dir, &ref_waves, &chip_waves] {
            if stale.exists() {
                fs::remove_dir_all(stale)
                    .with_context(|| format!("Failed to clear {}", stale.display()))?;
            }
        }
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(())
    }

    /// Save the offsets of one loop
    pub fn write_loop(
        &self,
        parameter: &str,
        value: i64,
        loop_index: usize,
        offsets: &[f64],
    ) -> Result<PathBuf> {
        let path = self.loop_file(parameter, value, loop_index);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        write_offsets(&path, offsets)?;
        debug!("Saved {} offsets to {}", offsets.len(), path.display());
        Ok(path)
    }

    /// Save the decoded channels of one loop
    pub fn write_waveforms(
        &self,
        parameter: &str,
        value: i64,
        loop_index: usize,
        reference: &CalibratedChannel,
        chip: &CalibratedChannel,
    ) -> Result<()> {
        for (path, channel) in [
            (self.reference_wave_file(parameter, value, loop_index), reference),
            (self.chip_wave_file(parameter, value, loop_index), chip),
        ] {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
            write_waveform(&path, channel)?;
            debug!("Saved {} samples to {}", channel.len(), path.display());
        }
        Ok(())
    }

    /// Concatenate the per-loop files of a sweep point in loop order
    ///
    /// Per-loop files and their directory are removed afterwards unless
    /// the store keeps them.
    pub fn combine(&self, parameter: &str, value: i64) -> Result<PathBuf> {
        let dir = self.point_dir(parameter, value);
        let mut numbered: Vec<(usize, PathBuf)> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
            .filter_map(|p| loop_number(&p).map(|n| (n, p)))
            .collect();
        // Numeric order; names stop sorting correctly past loop 999
        numbered.sort();
        let parts: Vec<PathBuf> = numbered.into_iter().map(|(_, p)| p).collect();

        let combined = self.combined_file(parameter, value);
        let mut out = BufWriter::new(
            fs::File::create(&combined)
                .with_context(|| format!("Failed to create {}", combined.display()))?,
        );
        for part in &parts {
            let text = fs::read_to_string(part)
                .with_context(|| format!("Failed to read {}", part.display()))?;
            out.write_all(text.as_bytes())?;
        }
        out.flush()?;

        if !self.keep_loop_files {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }

        info!(
            "Combined {} loop files into {}",
            parts.len(),
            combined.display()
        );
        Ok(combined)
    }

    /// Write any serializable record as pretty JSON under the root
    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, record: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create {}", self.root.display()))?;
        let path = self.root.join(name);
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn write_summary(&self, parameter: &str, points: &[SweepPoint]) -> Result<PathBuf> {
        let name = format!("jitter_vs_{}.json", parameter);
        self.write_json(&name, points)
    }
}

/// Loop index encoded after the last `_` of a per-loop file name
fn loop_number(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let (_, digits) = stem.rsplit_once('_')?;
    digits.parse().ok()
}

/// Write `time amplitude` rows
pub fn write_waveform(path: &Path, channel: &CalibratedChannel) -> Result<()> {
    let file =
        fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for (t, a) in channel.time.iter().zip(&channel.amplitude) {
        writeln!(out, "{:.18e} {:.18e}", t, a)?;
    }
    out.flush()?;
    Ok(())
}

/// Read back a file written by [`write_waveform`]
pub fn load_waveform(path: &Path) -> Result<CalibratedChannel> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut time = Vec::new();
    let mut amplitude = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut columns = line.split_whitespace().map(str::parse::<f64>);
        match (columns.next(), columns.next(), columns.next()) {
            (Some(Ok(t)), Some(Ok(a)), None) => {
                time.push(t);
                amplitude.push(a);
            }
            _ => bail!("{}:{}: expected two numbers: {:?}", path.display(), i + 1, line),
        }
    }
    let dt = match time.as_slice() {
        [first, second, ..] => second - first,
        _ => 0.0,
    };
    Ok(CalibratedChannel {
        time,
        amplitude,
        dt,
    })
}

/// Write offsets one per line
pub fn write_offsets(path: &Path, offsets: &[f64]) -> Result<()> {
    let file =
        fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for v in offsets {
        writeln!(out, "{:.18e}", v)?;
    }
    out.flush()?;
    Ok(())
}

/// Read an offsets file back; blank lines are skipped
pub fn load_offsets(path: &Path) -> Result<Vec<f64>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            line.trim().parse::<f64>().with_context(|| {
                format!("{}:{}: not a number: {:?}", path.display(), i + 1, line)
            })
        })
        .collect()
}

/// Read back the sweep summary written by [`OffsetStore::write_summary`]
pub fn load_summary(path: &Path) -> Result<Vec<SweepPoint>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Malformed summary {}", path.display()))
}
