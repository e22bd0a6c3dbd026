//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CurriculumError, Result};

/// Main configuration for a curriculum run.
///
/// # Example
///
/// ```rust
/// use curriculum_rs::CurriculumConfig;
///
/// # fn main() -> curriculum_rs::Result<()> {
/// let mut config = CurriculumConfig::from_preset("cifar10")?;
/// config.stage.n_epoch3 = 11;
/// config.stage.curriculum = true;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumConfig {
    /// Dataset locations.
    pub dataset: DatasetConfig,

    /// Network architecture.
    #[serde(default)]
    pub model: ModelConfig,

    /// Third-stage training hyperparameters.
    #[serde(default)]
    pub stage: StageConfig,

    /// Label correction settings.
    #[serde(default)]
    pub correction: CorrectionConfig,

    /// Directory receiving the report and saved weights.
    #[serde(default = "default_output_dir", alias = "fname")]
    pub output_dir: String,

    /// Timestamp used in output file names. Generated when absent.
    #[serde(default)]
    pub time_now: Option<String>,

    /// Weights restored into the network before the stage starts.
    #[serde(default)]
    pub init_checkpoint: Option<String>,

    /// Save the trained weights next to the report.
    #[serde(default)]
    pub save_model: bool,

    /// Random seed for shuffling and augmentation. Weight initialization is
    /// not seeded.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

/// Dataset file locations.
///
/// Each dataset file is a safetensors archive holding `images` and `labels`;
/// the filter file holds `filter_mask`, `idx_sorted` and optionally
/// `noise_or_not`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Training set.
    pub train_path: String,
    /// Held-out evaluation set.
    pub test_path: String,
    /// Filter mask and sort order produced by the earlier stages.
    pub filter_path: String,
}

/// Network architecture family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Two convolution blocks followed by a classifier head.
    #[default]
    Cnn,
    /// Single hidden layer perceptron.
    Mlp,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture family.
    #[serde(default)]
    pub arch: Architecture,

    /// Number of classes.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,

    /// Image channels.
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Image height.
    #[serde(default = "default_image_side")]
    pub height: usize,

    /// Image width.
    #[serde(default = "default_image_side")]
    pub width: usize,

    /// Width of the hidden layer.
    #[serde(default = "default_hidden")]
    pub hidden: usize,

    /// Dropout probability before the output layer.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_num_classes() -> usize {
    10
}
fn default_channels() -> usize {
    3
}
fn default_image_side() -> usize {
    32
}
fn default_hidden() -> usize {
    256
}
fn default_dropout() -> f32 {
    0.25
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            arch: Architecture::Cnn,
            num_classes: default_num_classes(),
            channels: default_channels(),
            height: default_image_side(),
            width: default_image_side(),
            hidden: default_hidden(),
            dropout: default_dropout(),
        }
    }
}

impl ModelConfig {
    /// Image shape as `(channels, height, width)`.
    #[must_use]
    pub fn image_shape(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }
}

/// Third-stage hyperparameters.
///
/// # Example
///
/// ```rust
/// use curriculum_rs::config::StageConfig;
///
/// let stage = StageConfig {
///     n_epoch3: 4,
///     batch_size: 10,
///     num_workers: 0,
///     ..Default::default()
/// };
///
/// assert_eq!(stage.epochs(), 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Epoch budget. The stage runs epochs `1..n_epoch3`.
    #[serde(default = "default_n_epoch3")]
    pub n_epoch3: usize,

    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Loader worker threads (0 collates on the training thread).
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Batches buffered per worker.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,

    /// Base learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// SGD momentum.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// L2 weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Learning rate schedule over the epoch budget.
    #[serde(default)]
    pub lr_schedule: LrScheduleConfig,

    /// Iterate the clean subset in `idx_sorted` order without shuffling.
    #[serde(default)]
    pub curriculum: bool,

    /// Train on RICAP mixed-sample batches.
    #[serde(default)]
    pub use_ricap: bool,

    /// Beta distribution parameter for RICAP patch boundaries.
    #[serde(default = "default_ricap_beta")]
    pub ricap_beta: f64,

    /// Draw a per-batch progress bar.
    #[serde(default = "default_true")]
    pub progress: bool,
}

fn default_n_epoch3() -> usize {
    200
}
fn default_batch_size() -> usize {
    128
}
fn default_num_workers() -> usize {
    32
}
fn default_prefetch_factor() -> usize {
    2
}
fn default_lr() -> f64 {
    0.01
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    5e-4
}
fn default_ricap_beta() -> f64 {
    0.3
}
fn default_true() -> bool {
    true
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            n_epoch3: default_n_epoch3(),
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            prefetch_factor: default_prefetch_factor(),
            learning_rate: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            lr_schedule: LrScheduleConfig::default(),
            curriculum: false,
            use_ricap: false,
            ricap_beta: default_ricap_beta(),
            progress: true,
        }
    }
}

impl StageConfig {
    /// Number of epochs actually run.
    #[must_use]
    pub fn epochs(&self) -> usize {
        self.n_epoch3.saturating_sub(1)
    }
}

/// Learning rate schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum LrScheduleConfig {
    /// Constant learning rate.
    Constant,
    /// Cosine annealing towards zero at the end of the budget.
    #[default]
    Cosine,
    /// Multiply by `gamma` at each milestone (fractions of the budget).
    Step {
        /// Milestones as fractions of the epoch budget.
        milestones: Vec<f64>,
        /// Decay factor.
        gamma: f64,
    },
}

/// Label correction settings. The epoch count is fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// Run label correction after the third stage.
    #[serde(default)]
    pub enabled: bool,

    /// Batch size.
    #[serde(default = "default_correction_batch_size")]
    pub batch_size: usize,

    /// Loader worker threads.
    #[serde(default = "default_correction_workers")]
    pub num_workers: usize,
}

fn default_correction_batch_size() -> usize {
    64
}
fn default_correction_workers() -> usize {
    1
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_size: default_correction_batch_size(),
            num_workers: default_correction_workers(),
        }
    }
}

impl CurriculumConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"cifar10"` - 3x32x32 images, 10 classes
    /// - `"cifar100"` - 3x32x32 images, 100 classes
    ///
    /// # Example
    ///
    /// ```rust
    /// use curriculum_rs::CurriculumConfig;
    ///
    /// # fn main() -> curriculum_rs::Result<()> {
    /// let config = CurriculumConfig::from_preset("cifar100")?;
    /// assert_eq!(config.model.num_classes, 100);
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "cifar10" => Ok(Self::cifar_preset("cifar10", 10)),
            "cifar100" => Ok(Self::cifar_preset("cifar100", 100)),
            _ => Err(CurriculumError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    fn cifar_preset(name: &str, num_classes: usize) -> Self {
        Self {
            dataset: DatasetConfig {
                train_path: format!("./data/{name}/train.safetensors"),
                test_path: format!("./data/{name}/test.safetensors"),
                filter_path: format!("./data/{name}/filter.safetensors"),
            },
            model: ModelConfig {
                num_classes,
                ..Default::default()
            },
            stage: StageConfig::default(),
            correction: CorrectionConfig::default(),
            output_dir: format!("./outputs/{name}"),
            time_now: None,
            init_checkpoint: None,
            save_model: false,
            seed: default_seed(),
        }
    }

    /// Validate the configuration.
    ///
    /// Checks for:
    /// - Required paths are set
    /// - At least one epoch runs (`n_epoch3 >= 2`)
    /// - Batch sizes, class count and image shape are non-zero
    /// - Optimizer and RICAP parameters are in range
    pub fn validate(&self) -> Result<()> {
        if self.dataset.train_path.is_empty() {
            return Err(CurriculumError::Config("dataset.train_path is required".into()));
        }
        if self.dataset.test_path.is_empty() {
            return Err(CurriculumError::Config("dataset.test_path is required".into()));
        }
        if self.dataset.filter_path.is_empty() {
            return Err(CurriculumError::Config("dataset.filter_path is required".into()));
        }
        if self.output_dir.is_empty() {
            return Err(CurriculumError::Config("output_dir is required".into()));
        }

        let stage = &self.stage;
        if stage.n_epoch3 < 2 {
            return Err(CurriculumError::Config(format!(
                "stage.n_epoch3 must be at least 2 (epochs run are 1..n_epoch3), got {}",
                stage.n_epoch3
            )));
        }
        if stage.batch_size == 0 || self.correction.batch_size == 0 {
            return Err(CurriculumError::Config("batch_size must be positive".into()));
        }
        if stage.prefetch_factor == 0 {
            return Err(CurriculumError::Config("stage.prefetch_factor must be positive".into()));
        }
        if !(stage.learning_rate > 0.0) {
            return Err(CurriculumError::Config(format!(
                "stage.learning_rate must be positive, got {}",
                stage.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&stage.momentum) {
            return Err(CurriculumError::Config(format!(
                "stage.momentum must be in [0, 1), got {}",
                stage.momentum
            )));
        }
        if stage.weight_decay < 0.0 {
            return Err(CurriculumError::Config("stage.weight_decay must not be negative".into()));
        }
        if stage.use_ricap && !(stage.ricap_beta > 0.0) {
            return Err(CurriculumError::Config(format!(
                "stage.ricap_beta must be positive, got {}",
                stage.ricap_beta
            )));
        }
        if let LrScheduleConfig::Step { milestones, gamma } = &stage.lr_schedule {
            if milestones.iter().any(|m| !(0.0..=1.0).contains(m)) {
                return Err(CurriculumError::Config(
                    "step milestones must be fractions in [0, 1]".into(),
                ));
            }
            if !(*gamma > 0.0) {
                return Err(CurriculumError::Config("step gamma must be positive".into()));
            }
        }

        let model = &self.model;
        if model.num_classes < 2 {
            return Err(CurriculumError::Config("model.num_classes must be at least 2".into()));
        }
        if model.channels == 0 || model.height == 0 || model.width == 0 || model.hidden == 0 {
            return Err(CurriculumError::Config("model dimensions must be positive".into()));
        }
        if model.arch == Architecture::Cnn && (model.height < 4 || model.width < 4) {
            return Err(CurriculumError::Config(
                "cnn architecture needs images of at least 4x4".into(),
            ));
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return Err(CurriculumError::Config("model.dropout must be in [0, 1)".into()));
        }

        Ok(())
    }
}
