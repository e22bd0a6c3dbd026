//! Batched data loading with worker-thread prefetching.
//!
//! A [`DataLoader`] turns an [`IndexedDataset`] into batches. Each call to
//! [`DataLoader::iter`] starts a new epoch: the sample order is drawn (or
//! kept, without shuffling), split into batch-sized chunks, and the chunks
//! are collated either inline or by `num_workers` background threads that
//! feed a bounded channel. Batches are always yielded in chunk order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::dataset::{IndexedDataset, Sample};
use crate::error::{CurriculumError, Result};

/// Training targets of a batch.
#[derive(Debug, Clone)]
pub enum Targets {
    /// Class indices, `i64` of shape `(B)`; `-1` is ignored.
    Hard(Tensor),
    /// Class distributions, `f32` of shape `(B, K)`.
    Soft(Tensor),
}

impl Targets {
    /// The underlying tensor.
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Hard(t) | Self::Soft(t) => t,
        }
    }
}

/// A collated batch on the compute device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Images, `f32` of shape `(B, C, H, W)`.
    pub images: Tensor,
    /// Targets for the loss.
    pub targets: Targets,
    /// Original dataset index of each row.
    pub indexes: Vec<usize>,
}

impl Batch {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

/// Turns a list of samples into a [`Batch`].
pub trait Collator: Send + Sync {
    /// Collate `samples` of shape `(C, H, W)` onto `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if `samples` is empty or tensor creation fails.
    fn collate(
        &self,
        samples: Vec<Sample>,
        shape: (usize, usize, usize),
        rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> Result<Batch>;
}

/// Stacks images and keeps integer labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCollator;

impl Collator for StandardCollator {
    fn collate(
        &self,
        samples: Vec<Sample>,
        shape: (usize, usize, usize),
        _rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> Result<Batch> {
        if samples.is_empty() {
            return Err(CurriculumError::Training("Cannot collate empty batch".into()));
        }
        let (c, h, w) = shape;
        let batch_size = samples.len();
        let mut pixels = Vec::with_capacity(batch_size * c * h * w);
        let mut labels = Vec::with_capacity(batch_size);
        let mut indexes = Vec::with_capacity(batch_size);
        for sample in samples {
            pixels.extend_from_slice(&sample.image);
            labels.push(sample.label);
            indexes.push(sample.index);
        }

        let images = Tensor::from_vec(pixels, (batch_size, c, h, w), device)?;
        let labels = Tensor::from_vec(labels, batch_size, device)?;
        Ok(Batch {
            images,
            targets: Targets::Hard(labels),
            indexes,
        })
    }
}

/// Data loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Samples per batch (the last batch may be smaller).
    pub batch_size: usize,
    /// Background collation threads; 0 collates on the calling thread.
    pub num_workers: usize,
    /// Batches buffered per worker.
    pub prefetch_factor: usize,
    /// Draw a fresh random order every epoch.
    pub shuffle: bool,
    /// Base seed for shuffling and collation randomness.
    pub seed: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            num_workers: 0,
            prefetch_factor: 2,
            shuffle: true,
            seed: 42,
        }
    }
}

/// Batched, optionally shuffled, view of a dataset.
pub struct DataLoader {
    dataset: Arc<dyn IndexedDataset>,
    collator: Arc<dyn Collator>,
    config: LoaderConfig,
    device: Device,
    epoch: AtomicU64,
}

impl DataLoader {
    /// Create a loader.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch size or prefetch factor is zero.
    pub fn new(
        dataset: Arc<dyn IndexedDataset>,
        collator: Arc<dyn Collator>,
        config: LoaderConfig,
        device: Device,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(CurriculumError::Config("batch_size must be positive".into()));
        }
        if config.prefetch_factor == 0 {
            return Err(CurriculumError::Config("prefetch_factor must be positive".into()));
        }
        Ok(Self {
            dataset,
            collator,
            config,
            device,
            epoch: AtomicU64::new(0),
        })
    }

    /// Samples in the underlying dataset.
    #[must_use]
    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// Batches per epoch.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.config.batch_size)
    }

    /// Loader configuration.
    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Start a new pass over the dataset.
    #[must_use]
    pub fn iter(&self) -> BatchIter {
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let seed = self.config.seed.wrapping_add(epoch.wrapping_mul(0x9E37_79B9));

        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            order.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        }
        let chunks: Vec<Vec<usize>> = order
            .chunks(self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect();

        let job = Arc::new(EpochJob {
            dataset: Arc::clone(&self.dataset),
            collator: Arc::clone(&self.collator),
            device: self.device.clone(),
            chunks,
        });

        if self.config.num_workers == 0 || job.chunks.len() <= 1 {
            return BatchIter::inline(job, ChaCha8Rng::seed_from_u64(seed ^ 1));
        }

        let workers = self.config.num_workers.min(job.chunks.len());
        let (sender, receiver) = mpsc::sync_channel(workers * self.config.prefetch_factor);
        let handles = (0..workers)
            .map(|worker_id| {
                let job = Arc::clone(&job);
                let sender = sender.clone();
                let rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(worker_id as u64 + 1));
                thread::spawn(move || job.run_worker(worker_id, workers, rng, &sender))
            })
            .collect();
        drop(sender);

        BatchIter {
            total: job.chunks.len(),
            next: 0,
            source: Source::Workers {
                receiver: Some(receiver),
                pending: BTreeMap::new(),
                handles,
            },
        }
    }
}

struct EpochJob {
    dataset: Arc<dyn IndexedDataset>,
    collator: Arc<dyn Collator>,
    device: Device,
    chunks: Vec<Vec<usize>>,
}

impl EpochJob {
    fn collate_chunk(&self, chunk: usize, rng: &mut ChaCha8Rng) -> Result<Batch> {
        let samples = self.chunks[chunk]
            .iter()
            .map(|&position| self.dataset.get(position))
            .collect::<Result<Vec<_>>>()?;
        self.collator
            .collate(samples, self.dataset.image_shape(), rng, &self.device)
    }

    fn run_worker(
        &self,
        worker_id: usize,
        workers: usize,
        mut rng: ChaCha8Rng,
        sender: &SyncSender<(usize, Result<Batch>)>,
    ) {
        for chunk in (worker_id..self.chunks.len()).step_by(workers) {
            let batch = self.collate_chunk(chunk, &mut rng);
            if sender.send((chunk, batch)).is_err() {
                // Receiver dropped: the epoch was abandoned.
                return;
            }
        }
    }
}

enum Source {
    Inline {
        job: Arc<EpochJob>,
        rng: ChaCha8Rng,
    },
    Workers {
        receiver: Option<Receiver<(usize, Result<Batch>)>>,
        pending: BTreeMap<usize, Result<Batch>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Iterator over the batches of one epoch.
pub struct BatchIter {
    total: usize,
    next: usize,
    source: Source,
}

impl BatchIter {
    fn inline(job: Arc<EpochJob>, rng: ChaCha8Rng) -> Self {
        Self {
            total: job.chunks.len(),
            next: 0,
            source: Source::Inline { job, rng },
        }
    }

    /// Batches in this epoch.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let chunk = self.next;
        self.next += 1;

        match &mut self.source {
            Source::Inline { job, rng } => Some(job.collate_chunk(chunk, rng)),
            Source::Workers {
                receiver, pending, ..
            } => loop {
                if let Some(batch) = pending.remove(&chunk) {
                    return Some(batch);
                }
                let received = receiver.as_ref().and_then(|r| r.recv().ok());
                match received {
                    Some((id, batch)) => {
                        pending.insert(id, batch);
                    }
                    None => {
                        self.next = self.total;
                        return Some(Err(CurriculumError::Training(format!(
                            "loader workers stopped before batch {chunk}"
                        ))));
                    }
                }
            },
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl Drop for BatchIter {
    fn drop(&mut self) {
        if let Source::Workers {
            receiver, handles, ..
        } = &mut self.source
        {
            // Closing the channel unblocks workers waiting on a full buffer.
            receiver.take();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ImageDataset;

    fn dataset(n: usize) -> Arc<dyn IndexedDataset> {
        let pixels = (0..n).map(|v| v as f32).collect();
        let labels = (0..n as i64).collect();
        Arc::new(ImageDataset::new(pixels, labels, (1, 1, 1)).unwrap())
    }

    fn loader(n: usize, batch_size: usize, num_workers: usize, shuffle: bool) -> DataLoader {
        DataLoader::new(
            dataset(n),
            Arc::new(StandardCollator),
            LoaderConfig {
                batch_size,
                num_workers,
                shuffle,
                ..Default::default()
            },
            Device::Cpu,
        )
        .unwrap()
    }

    fn epoch_indexes(loader: &DataLoader) -> Vec<Vec<usize>> {
        loader.iter().map(|b| b.unwrap().indexes).collect()
    }

    #[test]
    fn test_sequential_batches() {
        let loader = loader(7, 3, 0, false);
        assert_eq!(loader.num_batches(), 3);
        assert_eq!(
            epoch_indexes(&loader),
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]
        );
    }

    #[test]
    fn test_batch_tensors() {
        let loader = loader(4, 4, 0, false);
        let batch = loader.iter().next().unwrap().unwrap();
        assert_eq!(batch.images.dims(), &[4, 1, 1, 1]);
        match &batch.targets {
            Targets::Hard(labels) => {
                assert_eq!(labels.to_vec1::<i64>().unwrap(), vec![0, 1, 2, 3]);
            }
            Targets::Soft(_) => panic!("expected hard targets"),
        }
    }

    #[test]
    fn test_shuffle_visits_every_sample_once() {
        let loader = loader(50, 8, 0, true);
        let mut seen: Vec<usize> = epoch_indexes(&loader).into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_changes_between_epochs() {
        let loader = loader(50, 50, 0, true);
        let first = epoch_indexes(&loader);
        let second = epoch_indexes(&loader);
        assert_ne!(first, second);
    }

    #[test]
    fn test_seed_fixes_shuffle_order() {
        let seeded = |seed: u64| {
            DataLoader::new(
                dataset(50),
                Arc::new(StandardCollator),
                LoaderConfig {
                    batch_size: 50,
                    seed,
                    ..Default::default()
                },
                Device::Cpu,
            )
            .unwrap()
        };
        let (a, b, c) = (seeded(7), seeded(7), seeded(8));
        assert_eq!(epoch_indexes(&a), epoch_indexes(&b));
        assert_eq!(epoch_indexes(&a), epoch_indexes(&b));
        assert_ne!(epoch_indexes(&a), epoch_indexes(&c));
    }

    #[test]
    fn test_workers_preserve_chunk_order() {
        let inline = loader(100, 7, 0, false);
        let threaded = loader(100, 7, 4, false);
        assert_eq!(epoch_indexes(&inline), epoch_indexes(&threaded));
    }

    #[test]
    fn test_more_workers_than_batches() {
        let loader = loader(10, 4, 32, true);
        let mut seen: Vec<usize> = epoch_indexes(&loader).into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_abandoned_epoch_joins_workers() {
        let loader = loader(200, 2, 3, true);
        let mut iter = loader.iter();
        assert!(iter.next().is_some());
        drop(iter);
        assert_eq!(epoch_indexes(&loader).len(), 100);
    }

    #[test]
    fn test_empty_dataset_yields_nothing() {
        let loader = loader(0, 4, 2, true);
        assert_eq!(loader.iter().count(), 0);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = DataLoader::new(
            dataset(3),
            Arc::new(StandardCollator),
            LoaderConfig {
                batch_size: 0,
                ..Default::default()
            },
            Device::Cpu,
        );
        assert!(result.is_err());
    }
}
