//! Per-sample loss tracking and the per-epoch log.

use crate::error::{CurriculumError, Result};

/// Most recent loss of every sample seen during one epoch.
///
/// The buffer is sized to the full (unfiltered) dataset and addressed by the
/// original sample index, so its length never depends on the subset being
/// trained. Entries not visited during the epoch stay at zero.
///
/// # Example
///
/// ```rust
/// use curriculum_rs::metrics::SampleLossTracker;
///
/// # fn main() -> curriculum_rs::Result<()> {
/// let mut tracker = SampleLossTracker::new(5);
/// tracker.record(&[4, 1], &[0.5, 2.0])?;
/// assert_eq!(tracker.as_slice(), &[0.0, 2.0, 0.0, 0.0, 0.5]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SampleLossTracker {
    losses: Vec<f32>,
}

impl SampleLossTracker {
    /// Zeroed tracker for a dataset of `len` samples.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            losses: vec![0.0; len],
        }
    }

    /// Write one loss per index. Later writes to the same index win.
    ///
    /// # Errors
    ///
    /// Returns an error if the slices differ in length or an index is out of
    /// range.
    pub fn record(&mut self, indexes: &[usize], losses: &[f32]) -> Result<()> {
        if indexes.len() != losses.len() {
            return Err(CurriculumError::Training(format!(
                "{} indexes for {} losses",
                indexes.len(),
                losses.len()
            )));
        }
        let len = self.losses.len();
        for (&index, &loss) in indexes.iter().zip(losses) {
            let slot = self.losses.get_mut(index).ok_or_else(|| {
                CurriculumError::Training(format!("sample index {index} outside dataset of {len}"))
            })?;
            *slot = loss;
        }
        Ok(())
    }

    /// Number of slots (the full dataset size).
    #[must_use]
    pub fn len(&self) -> usize {
        self.losses.len()
    }

    /// Whether the tracker has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    /// Loss recorded for `index`, if in range.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<f32> {
        self.losses.get(index).copied()
    }

    /// All slots, ordered by original sample index.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.losses
    }

    /// Consume the tracker, returning the raw buffer.
    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.losses
    }
}

/// One completed epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    /// Epoch number as printed (starts at 1).
    pub epoch: usize,
    /// Learning rate applied during the epoch.
    pub learning_rate: f64,
    /// Running loss total divided by the full dataset size.
    pub train_loss: f64,
    /// Held-out accuracy in percent, measured before the epoch's updates.
    pub test_accuracy: f64,
}

/// Append-only log of completed epochs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochLog {
    records: Vec<EpochRecord>,
}

impl EpochLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    /// Completed epochs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no epoch has completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in epoch order.
    #[must_use]
    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    /// Training loss column.
    #[must_use]
    pub fn train_losses(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.train_loss).collect()
    }

    /// Test accuracy column.
    #[must_use]
    pub fn test_accuracies(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.test_accuracy).collect()
    }

    /// Best held-out accuracy, `None` for an empty log.
    #[must_use]
    pub fn max_test_accuracy(&self) -> Option<f64> {
        self.records
            .iter()
            .map(|r| r.test_accuracy)
            .fold(None, |best, acc| match best {
                Some(b) if b >= acc => Some(b),
                _ => Some(acc),
            })
    }
}
