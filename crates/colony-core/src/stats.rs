//! Small statistics helpers shared by the task queue and the metrics collector.

use serde::{Deserialize, Serialize};

/// Nearest-rank percentile over an ascending-sorted sample.
///
/// The rank is `ceil(percentile / 100 * n)` (1-based). Returns `None` for an
/// empty sample.
pub fn percentile(sorted: &[u64], pct: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = ((pct / 100.0) * n as f64).ceil() as usize;
    let idx = rank.clamp(1, n) - 1;
    sorted.get(idx).copied()
}

/// p50/p95/p99 plus min, max, and mean of a latency sample, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub samples: usize,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

impl LatencyPercentiles {
    /// Compute percentiles from an unsorted sample. An empty sample yields all zeros.
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        Self {
            samples: sorted.len(),
            p50: percentile(&sorted, 50.0).unwrap_or_default(),
            p95: percentile(&sorted, 95.0).unwrap_or_default(),
            p99: percentile(&sorted, 99.0).unwrap_or_default(),
            min: sorted.first().copied().unwrap_or_default(),
            max: sorted.last().copied().unwrap_or_default(),
            mean: sum as f64 / sorted.len() as f64,
        }
    }
}

/// Population mean and standard deviation. `None` for an empty sample.
pub fn mean_std_dev(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, variance.sqrt()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50.0), Some(50));
        assert_eq!(percentile(&sorted, 95.0), Some(95));
        assert_eq!(percentile(&sorted, 99.0), Some(99));
        assert_eq!(percentile(&sorted, 100.0), Some(100));
        assert_eq!(percentile(&sorted, 0.0), Some(1));
    }

    #[test]
    fn test_small_sample() {
        // ceil(0.5 * 3) = 2 -> second value
        assert_eq!(percentile(&[10, 20, 30], 50.0), Some(20));
        // ceil(0.99 * 3) = 3 -> last value
        assert_eq!(percentile(&[10, 20, 30], 99.0), Some(30));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn test_percentiles_are_monotonic() {
        let sample = [900, 3, 47, 47, 12, 600, 5, 81, 2, 33, 1000, 7];
        let p = LatencyPercentiles::from_samples(&sample);
        assert!(p.p50 <= p.p95);
        assert!(p.p95 <= p.p99);
        assert_eq!(p.min, 2);
        assert_eq!(p.max, 1000);
        assert_eq!(p.samples, 12);
    }

    #[test]
    fn test_empty_percentiles() {
        assert_eq!(LatencyPercentiles::from_samples(&[]), LatencyPercentiles::default());
    }

    #[test]
    fn test_mean_std_dev() {
        let (mean, sd) = mean_std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((mean - 5.0).abs() < 1e-9);
        assert!((sd - 2.0).abs() < 1e-9);
        assert!(mean_std_dev(&[]).is_none());
    }
}
