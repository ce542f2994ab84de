//! Mergeable quantile estimation.
//!
//! [`QuantileAccumulator`] wraps a t-digest so that it satisfies the reduce
//! contract: [`QuantileAccumulator::add`] is the accumulator and
//! [`QuantileAccumulator::combine`] the combiner. Merging is associative up
//! to the digest's estimation error.

use tdigest::TDigest;

/// Number of centroids kept by every digest.
pub const COMPRESSION: usize = 100;

/// Samples buffered before they are folded into the digest.
const BUFFER_LIMIT: usize = 512;

/// Streaming quantile estimator.
#[derive(Debug, Clone)]
pub struct QuantileAccumulator {
    digest: TDigest,
    buffer: Vec<f64>,
}

impl Default for QuantileAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl QuantileAccumulator {
    pub fn new() -> Self {
        Self {
            digest: TDigest::new_with_size(COMPRESSION),
            buffer: Vec::new(),
        }
    }

    /// Insert one sample. NaN is ignored.
    pub fn add(mut self, value: f64) -> Self {
        if value.is_nan() {
            return self;
        }
        self.buffer.push(value);
        if self.buffer.len() >= BUFFER_LIMIT {
            self.flush();
        }
        self
    }

    /// Merge two accumulators.
    ///
    /// An empty side is dropped and the other returned as is; otherwise a
    /// fresh digest is built from both.
    pub fn combine(a: Self, b: Self) -> Self {
        if b.is_empty() {
            return a;
        }
        if a.is_empty() {
            return b;
        }
        let (a, b) = (a.flushed(), b.flushed());
        Self {
            digest: TDigest::merge_digests(vec![a.digest, b.digest]),
            buffer: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.digest.is_empty()
    }

    /// Number of samples seen.
    pub fn count(&self) -> f64 {
        self.digest.count() + self.buffer.len() as f64
    }

    /// Estimated value at quantile `q` in `[0, 1]`; NaN when empty.
    pub fn quantile(&self, q: f64) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        self.clone().flushed().digest.estimate_quantile(q)
    }

    /// Estimated values at several quantiles.
    pub fn quantiles(&self, qs: &[f64]) -> Vec<f64> {
        if self.is_empty() {
            return vec![f64::NAN; qs.len()];
        }
        let digest = self.clone().flushed().digest;
        qs.iter().map(|q| digest.estimate_quantile(*q)).collect()
    }

    /// The underlying digest with all buffered samples folded in.
    pub fn into_digest(self) -> TDigest {
        self.flushed().digest
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.digest = self.digest.merge_unsorted(std::mem::take(&mut self.buffer));
        }
    }

    fn flushed(mut self) -> Self {
        self.flush();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(values: impl IntoIterator<Item = u32>) -> QuantileAccumulator {
        values
            .into_iter()
            .fold(QuantileAccumulator::new(), |acc, v| acc.add(v as f64))
    }

    #[test]
    fn test_median_of_uniform_samples() {
        let acc = filled(1..=1_000);
        let median = acc.quantile(0.5);
        assert!((median - 500.0).abs() < 10.0, "median was {median}");
        assert_eq!(acc.count(), 1_000.0);
    }

    #[test]
    fn test_combine_with_empty_is_identity() {
        let acc = filled(1..=10);
        let merged = QuantileAccumulator::combine(QuantileAccumulator::new(), acc.clone());
        assert_eq!(merged.count(), acc.count());
        assert_eq!(merged.quantile(0.5), acc.quantile(0.5));
        assert!(QuantileAccumulator::new().quantile(0.5).is_nan());
    }

    #[test]
    fn test_combine_partitions() {
        let whole = filled(1..=2_000);
        let merged = QuantileAccumulator::combine(filled(1..=1_000), filled(1_001..=2_000));
        assert_eq!(merged.count(), 2_000.0);
        for q in [0.1, 0.5, 0.9] {
            let (a, b) = (whole.quantile(q), merged.quantile(q));
            assert!((a - b).abs() < 40.0, "q={q}: {a} vs {b}");
        }
    }

    #[test]
    fn test_nan_ignored() {
        let acc = QuantileAccumulator::new().add(f64::NAN).add(3.0);
        assert_eq!(acc.count(), 1.0);
        assert_eq!(acc.quantiles(&[0.0, 1.0]), vec![3.0, 3.0]);
    }
}
