//! Curriculum training stage and label correction.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, D};
use candle_nn::{ModuleT, Optimizer};
use indicatif::{ProgressBar, ProgressStyle};

use crate::augment::AugmentationMode;
use crate::config::CurriculumConfig;
use crate::dataset::{CleanSubset, FilterArtifacts, ImageDataset, IndexedDataset};
use crate::error::{CurriculumError, Result};
use crate::evaluate::evaluate;
use crate::loader::{Collator, DataLoader, LoaderConfig, StandardCollator, Targets};
use crate::loss::{CrossEntropyLoss, SampleLoss};
use crate::metrics::{EpochLog, EpochRecord, SampleLossTracker};
use crate::model::Network;
use crate::optimizer::{OptimizerConfig, SgdMomentum};
use crate::report::{self, export_to_excel};
use crate::scheduler::{adjust_learning_rate, LrPolicy, LrSchedule};

/// Epoch budget used by label correction; epochs `1..CORRECTION_BUDGET` run.
pub const CORRECTION_BUDGET: usize = 5;

/// Result of the third training stage.
#[derive(Debug)]
pub struct StageOutcome {
    /// One record per epoch.
    pub epoch_log: EpochLog,
    /// Per-sample losses of the last epoch, indexed by dataset index.
    pub sample_losses: SampleLossTracker,
    /// Written spreadsheet.
    pub report_path: PathBuf,
}

/// Result of one training epoch.
#[derive(Debug)]
pub struct EpochSummary {
    /// Epoch metrics.
    pub record: EpochRecord,
    /// Per-sample losses recorded during the epoch.
    pub sample_losses: SampleLossTracker,
}

/// Where the per-batch training targets come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Supervision {
    /// Targets produced by the loader.
    Given,
    /// The network's own arg-max predictions.
    Predicted,
}

/// Drives the third stage and the optional label correction.
///
/// # Example
///
/// ```no_run
/// use curriculum_rs::{CurriculumConfig, CurriculumTrainer};
///
/// # fn main() -> curriculum_rs::Result<()> {
/// let config = CurriculumConfig::from_file("config.yaml")?;
/// let trainer = CurriculumTrainer::new(config)?;
/// let outcome = trainer.run(false, &mut std::io::stdout())?;
/// println!("report: {}", outcome.report_path.display());
/// # Ok(())
/// # }
/// ```
pub struct CurriculumTrainer {
    config: CurriculumConfig,
    device: Device,
    policy: Box<dyn LrPolicy>,
    time_now: String,
}

impl CurriculumTrainer {
    /// Create a trainer.
    ///
    /// Validates the configuration, selects the device and fixes the run
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: CurriculumConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device();
        let policy = Box::new(LrSchedule::from_config(
            &config.stage.lr_schedule,
            config.stage.learning_rate,
        ));
        let time_now = config.time_now.clone().unwrap_or_else(report::timestamp);
        Ok(Self {
            config,
            device,
            policy,
            time_now,
        })
    }

    /// Replace the learning rate policy.
    #[must_use]
    pub fn with_lr_policy(mut self, policy: Box<dyn LrPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &CurriculumConfig {
        &self.config
    }

    /// Device tensors are placed on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Timestamp used in output file names.
    #[must_use]
    pub fn time_now(&self) -> &str {
        &self.time_now
    }

    /// Load data, build the network, run the third stage and optionally
    /// label correction.
    ///
    /// Correction runs when `correct` is set or `correction.enabled` is true.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read, the data does not match the
    /// model, or training fails.
    pub fn run(&self, correct: bool, out: &mut dyn Write) -> Result<StageOutcome> {
        let config = &self.config;
        let train = Arc::new(ImageDataset::load(&config.dataset.train_path)?);
        let test = Arc::new(ImageDataset::load(&config.dataset.test_path)?);
        let artifacts = FilterArtifacts::load(&config.dataset.filter_path)?;
        tracing::info!(
            "Loaded {} training and {} test samples",
            train.len(),
            test.len()
        );

        let expected = config.model.image_shape();
        for (name, shape) in [("train", train.image_shape()), ("test", test.image_shape())] {
            if shape != expected {
                return Err(CurriculumError::Dataset(format!(
                    "{name} images are {shape:?} but the model expects {expected:?}"
                )));
            }
        }

        let mut network = Network::new(&config.model, &self.device)?;
        if let Some(checkpoint) = &config.init_checkpoint {
            network.load_weights(checkpoint)?;
        }

        let test_loader = self.eval_loader(test)?;
        let outcome = self.third_stage(&network, train.clone(), &artifacts, &test_loader, out)?;

        if config.save_model {
            let path = Path::new(&config.output_dir)
                .join(format!("stage3_{}.safetensors", self.time_now));
            network.save_weights(path)?;
        }

        if correct || config.correction.enabled {
            self.label_correction(&network, train, out)?;
        }

        Ok(outcome)
    }

    /// Train `network` on the clean subset of `train`.
    ///
    /// Runs epochs `1..n_epoch3`. Each epoch first measures accuracy on
    /// `test_loader`, then sets the learning rate and makes one pass over the
    /// subset. The mean loss divides by the size of the full dataset. The
    /// per-epoch log is exported to a spreadsheet in the output directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifacts do not match `train`, a batch fails,
    /// or the report cannot be written.
    pub fn third_stage(
        &self,
        network: &Network,
        train: Arc<dyn IndexedDataset>,
        artifacts: &FilterArtifacts,
        test_loader: &DataLoader,
        out: &mut dyn Write,
    ) -> Result<StageOutcome> {
        let stage = &self.config.stage;
        let full_len = train.len();
        if full_len == 0 {
            return Err(CurriculumError::Dataset("training dataset is empty".into()));
        }

        let subset = CleanSubset::new(train, artifacts, stage.curriculum)?;
        tracing::info!(
            "Selected {} of {} samples (curriculum: {})",
            subset.len(),
            full_len,
            stage.curriculum
        );
        if let Some(precision) = artifacts.label_precision(subset.indices()) {
            tracing::info!("Label precision of selected samples: {:.4}", precision);
        }
        if subset.is_empty() {
            tracing::warn!("Filter mask selects no samples; epochs will not update the network");
        }

        let mode = AugmentationMode::from_flags(stage.use_ricap, stage.ricap_beta);
        let criterion = mode.criterion();
        let loader = self.stage_loader(subset, mode)?;

        let mut optimizer = OptimizerConfig::from(stage).build_sgd(network.varmap())?;
        tracing::info!(
            "Initialized SGD with lr={}, momentum={}, weight_decay={} over {} tensors ({})",
            optimizer.learning_rate(),
            stage.momentum,
            stage.weight_decay,
            optimizer.num_vars(),
            criterion.name()
        );

        // Created here; only a direct export call fails on a missing directory.
        std::fs::create_dir_all(&self.config.output_dir)?;
        writeln!(out, "----------- Start Third Stage -----------")?;

        let pb = self.progress_bar((stage.epochs() * loader.num_batches()) as u64)?;
        let mut epoch_log = EpochLog::new();
        let mut sample_losses = SampleLossTracker::new(full_len);

        for epoch in 1..stage.n_epoch3 {
            let accuracy = evaluate(test_loader, network)?;
            let lr = adjust_learning_rate(&mut optimizer, self.policy.as_ref(), epoch, stage.n_epoch3);

            let summary = self.run_epoch(
                network,
                &loader,
                &mut optimizer,
                criterion.as_ref(),
                Supervision::Given,
                EpochRecord {
                    epoch,
                    learning_rate: lr,
                    train_loss: 0.0,
                    test_accuracy: accuracy,
                },
                full_len,
                &pb,
            )?;

            let record = summary.record;
            writeln!(
                out,
                "Stage 3 - epoch:{} lr:{:.6} train_loss: {:?} test_accuarcy:{:.6}",
                record.epoch, record.learning_rate, record.train_loss, record.test_accuracy
            )?;
            tracing::debug!("Stage 3 epoch {} done", epoch);
            epoch_log.push(record);
            sample_losses = summary.sample_losses;
        }
        pb.finish_with_message("Stage 3 complete");

        let report_path = export_to_excel(
            &epoch_log.train_losses(),
            &epoch_log.test_accuracies(),
            Path::new(&self.config.output_dir),
            stage.curriculum,
            &self.time_now,
            out,
        )?;
        let best = epoch_log
            .max_test_accuracy()
            .ok_or_else(|| CurriculumError::Training("no epochs were run".into()))?;
        writeln!(out, "{}", max_accuracy_line(best))?;

        Ok(StageOutcome {
            epoch_log,
            sample_losses,
            report_path,
        })
    }

    /// Fine-tune `network` on its own predictions over `train`.
    ///
    /// Runs epochs `1..CORRECTION_BUDGET`, measuring accuracy on the training
    /// data itself before each one. The returned records are informational.
    ///
    /// # Errors
    ///
    /// Returns an error if a batch or an optimizer step fails.
    pub fn label_correction(
        &self,
        network: &Network,
        train: Arc<dyn IndexedDataset>,
        out: &mut dyn Write,
    ) -> Result<Vec<EpochRecord>> {
        let correction = &self.config.correction;
        let full_len = train.len();
        if full_len == 0 {
            return Err(CurriculumError::Dataset("training dataset is empty".into()));
        }

        let loader = DataLoader::new(
            train,
            Arc::new(StandardCollator),
            LoaderConfig {
                batch_size: correction.batch_size,
                num_workers: correction.num_workers,
                prefetch_factor: self.config.stage.prefetch_factor,
                shuffle: true,
                seed: self.config.seed,
            },
            self.device.clone(),
        )?;
        let mut optimizer = OptimizerConfig::from(&self.config.stage).build_sgd(network.varmap())?;
        let criterion = CrossEntropyLoss::default();

        let pb = self.progress_bar(((CORRECTION_BUDGET - 1) * loader.num_batches()) as u64)?;
        let mut records = Vec::with_capacity(CORRECTION_BUDGET - 1);

        for epoch in 1..CORRECTION_BUDGET {
            let accuracy = evaluate(&loader, network)?;
            let lr = adjust_learning_rate(&mut optimizer, self.policy.as_ref(), epoch, CORRECTION_BUDGET);

            let summary = self.run_epoch(
                network,
                &loader,
                &mut optimizer,
                &criterion,
                Supervision::Predicted,
                EpochRecord {
                    epoch,
                    learning_rate: lr,
                    train_loss: 0.0,
                    test_accuracy: accuracy,
                },
                full_len,
                &pb,
            )?;

            let record = summary.record;
            writeln!(
                out,
                "Correction Stage - epoch:{} lr:{:.6} train_loss: {:?} _accuarcy:{:.6}",
                record.epoch, record.learning_rate, record.train_loss, record.test_accuracy
            )?;
            records.push(record);
        }
        pb.finish_with_message("Correction complete");

        Ok(records)
    }

    /// Training loader over the clean subset.
    ///
    /// Batches follow the subset order when curriculum ordering is on and are
    /// shuffled otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch settings or the augmentation parameters
    /// are invalid.
    fn stage_loader(&self, subset: CleanSubset, mode: AugmentationMode) -> Result<DataLoader> {
        let stage = &self.config.stage;
        DataLoader::new(
            Arc::new(subset),
            mode.collator(self.config.model.num_classes)?,
            LoaderConfig {
                batch_size: stage.batch_size,
                num_workers: stage.num_workers,
                prefetch_factor: stage.prefetch_factor,
                // Never shuffled under curriculum ordering: batches keep idx_sorted order.
                shuffle: !stage.curriculum,
                seed: self.config.seed,
            },
            self.device.clone(),
        )
    }

    /// Unshuffled loader for held-out evaluation.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch settings are invalid.
    pub fn eval_loader(&self, dataset: Arc<dyn IndexedDataset>) -> Result<DataLoader> {
        let stage = &self.config.stage;
        let collator: Arc<dyn Collator> = Arc::new(StandardCollator);
        DataLoader::new(
            dataset,
            collator,
            LoaderConfig {
                batch_size: stage.batch_size,
                num_workers: stage.num_workers,
                prefetch_factor: stage.prefetch_factor,
                shuffle: false,
                seed: self.config.seed,
            },
            self.device.clone(),
        )
    }

    /// One pass over `loader`. `record` carries the epoch, learning rate and
    /// accuracy; its loss is filled in here.
    #[allow(clippy::too_many_arguments)]
    fn run_epoch(
        &self,
        network: &Network,
        loader: &DataLoader,
        optimizer: &mut SgdMomentum,
        criterion: &dyn SampleLoss,
        supervision: Supervision,
        mut record: EpochRecord,
        full_len: usize,
        pb: &ProgressBar,
    ) -> Result<EpochSummary> {
        let mut sample_losses = SampleLossTracker::new(full_len);
        let mut total_loss = 0.0f64;

        for batch in loader.iter() {
            let batch = batch?;
            let logits = network.forward_t(&batch.images, true)?;

            let losses = match supervision {
                Supervision::Given => criterion.per_sample(&logits, &batch.targets)?,
                Supervision::Predicted => {
                    let predicted = Targets::Hard(logits.detach().argmax(D::Minus1)?);
                    criterion.per_sample(&logits, &predicted)?
                }
            };

            let values = losses.detach().to_vec1::<f32>()?;
            sample_losses.record(&batch.indexes, &values)?;
            total_loss += values.iter().map(|&v| f64::from(v)).sum::<f64>();

            optimizer.step_loss(&losses.mean_all()?)?;

            pb.set_message(format!("epoch {} loss {:.4}", record.epoch, total_loss / full_len as f64));
            pb.inc(1);
        }

        record.train_loss = total_loss / full_len as f64;
        Ok(EpochSummary {
            record,
            sample_losses,
        })
    }

    fn progress_bar(&self, len: u64) -> Result<ProgressBar> {
        if !self.config.stage.progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }
}

/// Closing line of the stage. Whole numbers keep their `.0`.
fn max_accuracy_line(best: f64) -> String {
    format!("** stage 3 max test accuracy: {best:?}")
}

/// Prefer CUDA when built with it, unless `CURRICULUM_FORCE_CPU` is set.
fn select_device() -> Device {
    let force_cpu = std::env::var("CURRICULUM_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("CURRICULUM_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if !force_cpu && cfg!(feature = "cuda") {
        match Device::cuda_if_available(cuda_device) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", cuda_device);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                Device::Cpu
            }
        }
    } else {
        if force_cpu {
            tracing::info!("CPU mode forced via CURRICULUM_FORCE_CPU");
        } else {
            tracing::debug!("CUDA feature disabled; training on CPU");
        }
        Device::Cpu
    }
}
