// Latency statistics module
// Rolling population standard deviation per cluster used for the
// out-of-distribution verdict on probe latencies
//
// Numan Thabit 2025 Nov

use std::collections::HashMap;
use std::sync::RwLock;

/// Minimum sample count before the sigma verdict applies.
const MIN_SAMPLES: usize = 10;

/// Deviation multiple beyond which a sample counts as an outlier.
const SIGMA_MULTIPLE: f64 = 6.0;

/// Rolling collector of latency samples computing the running mean and
/// population standard deviation.
#[derive(Debug, Default)]
pub struct StandardDeviation {
    pub name: String,
    sum: f64,
    mean: f64,
    samples: Vec<f64>,
    std: f64,
}

impl StandardDeviation {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Records a sample without producing a verdict.
    pub fn add(&mut self, num: f64) {
        self.samples.push(num);
        self.sum += num;
        let counter = self.samples.len() as f64;
        self.mean = self.sum / counter;

        let variance: f64 = self
            .samples
            .iter()
            .map(|v| (v - self.mean).powi(2))
            .sum::<f64>()
            / counter;
        self.std = variance.sqrt();
    }

    /// Records a sample and returns (σ, μ, within-6σ). The sigma verdict
    /// only applies to the positive side of the bell curve and once at
    /// least ten samples have been collected.
    pub fn push(&mut self, num: f64) -> (f64, f64, bool) {
        self.add(num);
        let within = num - self.mean < SIGMA_MULTIPLE * self.std || self.samples.len() < MIN_SAMPLES;
        (self.std, self.mean, within)
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std(&self) -> f64 {
        self.std
    }
}

/// Per-cluster outlier buckets.
#[derive(Default)]
pub struct OutlierBuckets {
    buckets: RwLock<HashMap<String, StandardDeviation>>,
}

impl OutlierBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sample for the cluster without a verdict.
    pub fn add(&self, cluster: &str, num: f64) {
        let mut guard = self.buckets.write().unwrap();
        guard
            .entry(cluster.to_string())
            .or_insert_with(|| StandardDeviation::new(cluster))
            .add(num);
    }

    /// Records a sample and returns (σ, μ, within-6σ) for the cluster.
    pub fn push(&self, cluster: &str, num: f64) -> (f64, f64, bool) {
        let mut guard = self.buckets.write().unwrap();
        guard
            .entry(cluster.to_string())
            .or_insert_with(|| StandardDeviation::new(cluster))
            .push(num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_suspended_below_ten_samples() {
        let mut sd = StandardDeviation::new("unit");
        for i in 0..9 {
            let (_, _, within) = sd.push(100.0 + i as f64);
            assert!(within, "fewer than ten samples always within");
        }
    }

    #[test]
    fn tight_distribution_flags_spike() {
        // a lone spike over an n-sample constant baseline sits sqrt(n)
        // sigmas out, so 40 samples push it past the 6 sigma line
        let mut sd = StandardDeviation::new("unit");
        for _ in 0..40 {
            sd.add(100.0);
        }
        let (std, mean, within) = sd.push(100_000.0);
        assert!(!within);
        assert!(std > 0.0);
        assert!(mean > 100.0);
    }

    #[test]
    fn sample_near_mean_stays_within() {
        let mut sd = StandardDeviation::new("unit");
        for i in 0..30 {
            sd.add(90.0 + (i % 5) as f64);
        }
        let (_, _, within) = sd.push(93.0);
        assert!(within);
    }

    #[test]
    fn negative_deviation_never_outlier() {
        let mut sd = StandardDeviation::new("unit");
        for i in 0..15 {
            sd.add(1000.0 + i as f64);
        }
        // verdict applies to the right side of the curve only
        let (_, _, within) = sd.push(1.0);
        assert!(within);
    }

    #[test]
    fn buckets_keyed_by_cluster() {
        let buckets = OutlierBuckets::new();
        for _ in 0..12 {
            buckets.add("east", 50.0);
            buckets.add("west", 5000.0);
        }
        let (_, mean_east, _) = buckets.push("east", 50.0);
        let (_, mean_west, _) = buckets.push("west", 5000.0);
        assert!(mean_east < 100.0);
        assert!(mean_west > 1000.0);
    }

    #[test]
    fn running_mean_matches_population() {
        let mut sd = StandardDeviation::new("unit");
        sd.add(2.0);
        sd.add(4.0);
        sd.add(6.0);
        assert!((sd.mean() - 4.0).abs() < f64::EPSILON);
        // population σ of {2,4,6} is sqrt(8/3)
        assert!((sd.std() - (8.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }
}
