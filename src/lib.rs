//! # curriculum-rs
//!
//! Curriculum-learning training stage for image classifiers trained on noisy
//! labels.
//!
//! Given a training set, a filter mask of samples believed to be clean and an
//! easy-to-hard ordering of them, the third training stage fine-tunes a
//! classifier on the clean subset, measures held-out accuracy every epoch and
//! exports the per-epoch results to a spreadsheet. An optional label
//! correction pass then fine-tunes the network on its own predictions.
//!
//! ## Features
//!
//! - **YAML Configuration** - One file describes data, model and stage
//! - **Curriculum Ordering** - Train in a precomputed order or shuffled
//! - **RICAP** - Optional mixed-sample augmentation with soft targets
//! - **Per-sample Losses** - Recorded by dataset index for every epoch
//! - **Spreadsheet Reports** - `acc_curr_<flag>_<time>.xlsx` per run
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting configuration
//! curriculum init config.yaml --preset cifar10
//!
//! # Validate it
//! curriculum validate config.yaml
//!
//! # Run the third stage, then label correction
//! curriculum train config.yaml --correct
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use curriculum_rs::{CurriculumConfig, CurriculumTrainer};
//!
//! # fn main() -> curriculum_rs::Result<()> {
//! let config = CurriculumConfig::from_file("config.yaml")?;
//! let trainer = CurriculumTrainer::new(config)?;
//! let outcome = trainer.run(false, &mut std::io::stdout())?;
//! println!("{} epochs", outcome.epoch_log.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use curriculum_rs::CurriculumConfig;
//!
//! # fn main() -> curriculum_rs::Result<()> {
//! let mut config = CurriculumConfig::from_preset("cifar10")?;
//! config.stage.n_epoch3 = 51;
//! config.stage.curriculum = true;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod augment;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod loader;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod report;
pub mod scheduler;
pub mod trainer;

pub use config::{CurriculumConfig, StageConfig};
pub use error::{CurriculumError, Result};
pub use trainer::{CurriculumTrainer, StageOutcome};
