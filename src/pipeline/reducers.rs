//! Building blocks of the convenience reducers.

use crate::history::{Contribution, Snapshot};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// A value with a weight, input of weighted averages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedValue {
    pub value: f64,
    pub weight: f64,
}

impl WeightedValue {
    pub fn new(value: f64, weight: f64) -> Self {
        Self { value, weight }
    }
}

/// Running weighted sum and total weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeanState {
    pub sum: f64,
    pub weight: f64,
}

impl MeanState {
    pub fn add(self, item: WeightedValue) -> Self {
        Self {
            sum: self.sum + item.value * item.weight,
            weight: self.weight + item.weight,
        }
    }

    pub fn combine(a: Self, b: Self) -> Self {
        Self {
            sum: a.sum + b.sum,
            weight: a.weight + b.weight,
        }
    }

    /// The weighted mean; NaN when nothing was added.
    pub fn mean(&self) -> f64 {
        self.sum / self.weight
    }
}

/// Elements that carry a point in time.
///
/// Used by [`aggregate_by_timestamp`](super::MapReducer::aggregate_by_timestamp)
/// to key elements by the requested timestamp they fall into.
pub trait Timestamped {
    fn timestamp(&self) -> Timestamp;
}

impl Timestamped for Snapshot {
    fn timestamp(&self) -> Timestamp {
        Snapshot::timestamp(self)
    }
}

impl Timestamped for Contribution {
    fn timestamp(&self) -> Timestamp {
        Contribution::timestamp(self)
    }
}

impl Timestamped for Timestamp {
    fn timestamp(&self) -> Timestamp {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_mean() {
        let state = [(1.0, 1.0), (4.0, 3.0)]
            .into_iter()
            .map(|(v, w)| WeightedValue::new(v, w))
            .fold(MeanState::default(), MeanState::add);
        assert_eq!(state.mean(), 13.0 / 4.0);
        assert!(MeanState::default().mean().is_nan());
    }

    #[test]
    fn test_combine_matches_sequential() {
        let items: Vec<WeightedValue> = (1..=6).map(|i| WeightedValue::new(i as f64, 0.5)).collect();
        let whole = items.iter().copied().fold(MeanState::default(), MeanState::add);
        let left = items[..2].iter().copied().fold(MeanState::default(), MeanState::add);
        let right = items[2..].iter().copied().fold(MeanState::default(), MeanState::add);
        assert_eq!(MeanState::combine(left, right), whole);
    }
}
