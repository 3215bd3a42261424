/// Running metrics accumulated over the batches of one epoch

/// Running sum and count of a streamed quantity
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMetric {
    pub sum: f64,
    pub count: usize,
}

impl RunningMetric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` with weight `weight`
    pub fn add(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight;
    }

    /// Average so far, 0.0 before anything was added
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

/// Loss and accuracy of the current epoch
///
/// Loss is averaged per batch, accuracy per example. Create a fresh value
/// at the start of every epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochMetrics {
    loss: RunningMetric,
    accuracy: RunningMetric,
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch: mean loss, fraction correct and number of examples
    pub fn update(&mut self, batch_loss: f64, batch_accuracy: f64, batch_size: usize) {
        self.loss.add(batch_loss, 1);
        self.accuracy.add(batch_accuracy, batch_size);
    }

    pub fn average_loss(&self) -> f64 {
        self.loss.average()
    }

    pub fn average_accuracy(&self) -> f64 {
        self.accuracy.average()
    }

    pub fn num_batches(&self) -> usize {
        self.loss.count
    }

    pub fn num_examples(&self) -> usize {
        self.accuracy.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average_is_zero() {
        let metrics = EpochMetrics::new();
        assert_eq!(metrics.average_loss(), 0.0);
        assert_eq!(metrics.average_accuracy(), 0.0);
        assert_eq!(RunningMetric::new().average(), 0.0);
    }

    #[test]
    fn test_repeated_update_returns_same_values() {
        let mut metrics = EpochMetrics::new();
        for _ in 0..7 {
            metrics.update(0.75, 0.5, 4);
        }
        assert!((metrics.average_loss() - 0.75).abs() < 1e-12);
        assert!((metrics.average_accuracy() - 0.5).abs() < 1e-12);
        assert_eq!(metrics.num_batches(), 7);
        assert_eq!(metrics.num_examples(), 28);
    }

    #[test]
    fn test_accuracy_weighted_by_batch_size() {
        let mut metrics = EpochMetrics::new();
        // 4/4 correct, then 0/2 correct
        metrics.update(1.0, 1.0, 4);
        metrics.update(3.0, 0.0, 2);

        assert!((metrics.average_accuracy() - 4.0 / 6.0).abs() < 1e-12);
        // Loss is a plain mean over batches
        assert!((metrics.average_loss() - 2.0).abs() < 1e-12);
    }
}
