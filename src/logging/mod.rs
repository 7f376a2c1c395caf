//! Metric accumulation and sinks.
mod tensorboard;

pub use tensorboard::TensorBoardSink;

use std::collections::BTreeMap;

/// Running sums and counts of named scalars.
///
/// Metrics accumulate between logging intervals;
/// [`pop_and_reset`](Self::pop_and_reset) yields the means and clears the
/// tracker. The raw sums and counts are exposed because early-stopping
/// criteria consume them directly.
#[derive(Debug, Clone, Default)]
pub struct ScalarMeanTracker {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, i64>,
}

impl ScalarMeanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scalar(&mut self, name: &str, value: f64) {
        *self.sums.entry(name.to_owned()).or_insert(0.0) += value;
        *self.counts.entry(name.to_owned()).or_insert(0) += 1;
    }

    pub fn add_scalars(&mut self, scalars: &BTreeMap<String, f64>) {
        for (name, value) in scalars {
            self.add_scalar(name, *value);
        }
    }

    pub const fn sums(&self) -> &BTreeMap<String, f64> {
        &self.sums
    }

    pub const fn counts(&self) -> &BTreeMap<String, i64> {
        &self.counts
    }

    /// The mean of every tracked scalar.
    #[allow(clippy::cast_precision_loss)]
    pub fn means(&self) -> BTreeMap<String, f64> {
        self.sums
            .iter()
            .map(|(name, sum)| (name.clone(), sum / self.counts[name] as f64))
            .collect()
    }

    /// The means, clearing the tracker.
    pub fn pop_and_reset(&mut self) -> BTreeMap<String, f64> {
        let means = self.means();
        self.sums.clear();
        self.counts.clear();
        means
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

/// A sink for scalar metrics keyed by global step count.
pub trait MetricsSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: i64);

    fn flush(&mut self);
}

/// Discards every metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: i64) {}

    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_averages_per_name() {
        let mut tracker = ScalarMeanTracker::new();
        tracker.add_scalar("ep_length", 10.0);
        tracker.add_scalar("ep_length", 20.0);
        tracker.add_scalar("success", 1.0);

        assert_eq!(tracker.sums()["ep_length"], 30.0);
        assert_eq!(tracker.counts()["ep_length"], 2);

        let means = tracker.pop_and_reset();
        assert_eq!(means["ep_length"], 15.0);
        assert_eq!(means["success"], 1.0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn add_scalars_merges_maps() {
        let mut tracker = ScalarMeanTracker::new();
        tracker.add_scalars(&BTreeMap::from([
            ("reward".to_owned(), 2.0),
            ("success".to_owned(), 0.0),
        ]));
        tracker.add_scalars(&BTreeMap::from([("reward".to_owned(), 4.0)]));

        let means = tracker.means();
        assert_eq!(means["reward"], 3.0);
        assert_eq!(means["success"], 0.0);
    }
}
