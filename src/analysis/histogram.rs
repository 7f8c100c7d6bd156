//! Equal-width histogram of an offset population

use serde::{Deserialize, Serialize};

/// Counts over `counts.len()` equal-width bins
///
/// Bins are half-open except the last, which also includes the maximum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub counts: Vec<u64>,
    /// `counts.len() + 1` bin edges
    pub edges: Vec<f64>,
    pub centers: Vec<f64>,
    pub bin_width: f64,
}

impl Histogram {
    /// Bin `values` over their own min/max range
    ///
    /// A population with a single distinct value is binned over `value ± 0.5`.
    /// An empty population yields an all-zero histogram on `[0, 1]`.
    pub fn from_values(values: &[f64], bin_count: usize) -> Self {
        let (lo, hi) = match min_max(values) {
            Some((lo, hi)) if lo == hi => (lo - 0.5, hi + 0.5),
            Some(range) => range,
            None => (0.0, 1.0),
        };

        let bin_width = (hi - lo) / bin_count as f64;
        let edges: Vec<f64> = (0..=bin_count)
            .map(|i| lo + (hi - lo) * i as f64 / bin_count as f64)
            .collect();
        let centers: Vec<f64> = edges.windows(2).map(|e| 0.5 * (e[0] + e[1])).collect();

        let mut counts = vec![0u64; bin_count];
        if bin_count > 0 {
            for &v in values {
                if !(lo..=hi).contains(&v) {
                    continue;
                }
                let bin = (((v - lo) / bin_width) as usize).min(bin_count - 1);
                counts[bin] += 1;
            }
        }

        Self {
            counts,
            edges,
            centers,
            bin_width,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn max_count(&self) -> u64 {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    /// Number of bins holding at least one sample
    pub fn occupied_bins(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    values.iter().fold(None, |acc, &v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_last_bin_closed() {
        let values = [0.0, 0.1, 0.5, 0.9, 1.0];
        let hist = Histogram::from_values(&values, 4);
        assert_eq!(hist.counts, vec![2, 0, 1, 2]);
        assert_eq!(hist.total(), 5);
        assert!((hist.bin_width - 0.25).abs() < 1e-15);
        assert_eq!(hist.edges.len(), 5);
        assert!((hist.centers[0] - 0.125).abs() < 1e-15);
        assert_eq!(hist.max_count(), 2);
        assert_eq!(hist.occupied_bins(), 3);
    }

    #[test]
    fn test_single_value_population() {
        let hist = Histogram::from_values(&[3.0, 3.0, 3.0], 10);
        assert_eq!(hist.total(), 3);
        assert!((hist.edges[0] - 2.5).abs() < 1e-12);
        assert!((hist.edges[10] - 3.5).abs() < 1e-12);
        assert_eq!(hist.counts[5], 3);
    }

    #[test]
    fn test_empty_population() {
        let hist = Histogram::from_values(&[], 3);
        assert_eq!(hist.counts, vec![0, 0, 0]);
        assert_eq!(hist.max_count(), 0);
    }
}
