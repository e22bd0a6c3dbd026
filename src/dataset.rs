//! Image datasets, filter artifacts and the clean subset view.
//!
//! Datasets are stored as safetensors archives:
//!
//! | tensor   | dtype | shape          |
//! |----------|-------|----------------|
//! | `images` | f32   | `(N, C, H, W)` |
//! | `labels` | i64   | `(N)`          |
//!
//! A label of `-1` marks a sample without a usable label; the loss ignores
//! it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};

use crate::error::{CurriculumError, Result};

/// Label value ignored by the classification loss.
pub const IGNORE_LABEL: i64 = -1;

/// One training example.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Pixels in `(C, H, W)` order.
    pub image: Vec<f32>,
    /// Class label, or [`IGNORE_LABEL`].
    pub label: i64,
    /// Index of the sample in the full dataset.
    pub index: usize,
}

/// Random-access dataset of `(image, label, original index)` triples.
pub trait IndexedDataset: Send + Sync {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Sample at `position` (`0..len()`).
    ///
    /// # Errors
    ///
    /// Returns an error if `position` is out of range.
    fn get(&self, position: usize) -> Result<Sample>;

    /// Image shape as `(channels, height, width)`.
    fn image_shape(&self) -> (usize, usize, usize);

    /// Whether the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory image classification dataset.
///
/// # Example
///
/// ```rust
/// use curriculum_rs::dataset::{ImageDataset, IndexedDataset};
///
/// # fn main() -> curriculum_rs::Result<()> {
/// let dataset = ImageDataset::new(vec![0.0; 2 * 4], vec![1, -1], (1, 2, 2))?;
/// assert_eq!(dataset.len(), 2);
/// assert_eq!(dataset.get(1)?.label, -1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ImageDataset {
    pixels: Vec<f32>,
    labels: Vec<i64>,
    shape: (usize, usize, usize),
}

impl ImageDataset {
    /// Build a dataset from a flat pixel buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer size does not match `labels.len()`
    /// images of `shape`.
    pub fn new(pixels: Vec<f32>, labels: Vec<i64>, shape: (usize, usize, usize)) -> Result<Self> {
        let (c, h, w) = shape;
        if c * h * w == 0 {
            return Err(CurriculumError::Dataset(format!("invalid image shape {shape:?}")));
        }
        if pixels.len() != labels.len() * c * h * w {
            return Err(CurriculumError::Dataset(format!(
                "{} pixels do not form {} images of shape {shape:?}",
                pixels.len(),
                labels.len()
            )));
        }
        Ok(Self {
            pixels,
            labels,
            shape,
        })
    }

    /// Load a dataset from a safetensors archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or lacks `images` /
    /// `labels` of the expected rank.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let images = take_tensor(&tensors, "images", path)?;
        let labels = take_tensor(&tensors, "labels", path)?;

        let (n, c, h, w) = images.dims4().map_err(|_| {
            CurriculumError::Dataset(format!(
                "{}: images must be (N, C, H, W), got {:?}",
                path.display(),
                images.dims()
            ))
        })?;
        let labels = labels.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        if labels.len() != n {
            return Err(CurriculumError::Dataset(format!(
                "{}: {n} images but {} labels",
                path.display(),
                labels.len()
            )));
        }
        let pixels = images.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;

        tracing::debug!("Loaded {} samples of shape {:?} from {}", n, (c, h, w), path.display());
        Self::new(pixels, labels, (c, h, w))
    }

    /// Write the dataset as a safetensors archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (c, h, w) = self.shape;
        let n = self.labels.len();
        let mut tensors = HashMap::new();
        tensors.insert(
            "images".to_string(),
            Tensor::from_slice(&self.pixels, (n, c, h, w), &Device::Cpu)?,
        );
        tensors.insert(
            "labels".to_string(),
            Tensor::from_slice(&self.labels, n, &Device::Cpu)?,
        );
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// All labels in index order.
    #[must_use]
    pub fn labels(&self) -> &[i64] {
        &self.labels
    }
}

impl IndexedDataset for ImageDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn get(&self, position: usize) -> Result<Sample> {
        let label = *self.labels.get(position).ok_or_else(|| {
            CurriculumError::Dataset(format!(
                "position {position} outside dataset of {}",
                self.labels.len()
            ))
        })?;
        let (c, h, w) = self.shape;
        let stride = c * h * w;
        Ok(Sample {
            image: self.pixels[position * stride..(position + 1) * stride].to_vec(),
            label,
            index: position,
        })
    }

    fn image_shape(&self) -> (usize, usize, usize) {
        self.shape
    }
}

/// Sample selection computed by the earlier stages.
///
/// `filter_mask` and `noise_or_not` cover the full dataset; `idx_sorted`
/// ranks dataset indices from most to least reliable.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterArtifacts {
    /// Whether each sample is considered clean.
    pub filter_mask: Vec<bool>,
    /// Dataset indices in curriculum order.
    pub idx_sorted: Vec<usize>,
    /// Ground truth of label cleanliness, when known.
    pub noise_or_not: Option<Vec<bool>>,
}

impl FilterArtifacts {
    /// Load artifacts from a safetensors archive with `filter_mask`,
    /// `idx_sorted` and optionally `noise_or_not`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a tensor is missing.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;

        let filter_mask = to_bools(take_tensor(&tensors, "filter_mask", path)?)?;
        let idx_sorted = take_tensor(&tensors, "idx_sorted", path)?
            .to_dtype(DType::I64)?
            .flatten_all()?
            .to_vec1::<i64>()?
            .into_iter()
            .map(|i| {
                usize::try_from(i).map_err(|_| {
                    CurriculumError::Dataset(format!("{}: negative index {i} in idx_sorted", path.display()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let noise_or_not = match tensors.get("noise_or_not") {
            Some(t) => Some(to_bools(t)?),
            None => None,
        };

        Ok(Self {
            filter_mask,
            idx_sorted,
            noise_or_not,
        })
    }

    /// Write the artifacts as a safetensors archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert("filter_mask".to_string(), from_bools(&self.filter_mask)?);
        let order: Vec<i64> = self.idx_sorted.iter().map(|&i| i as i64).collect();
        tensors.insert(
            "idx_sorted".to_string(),
            Tensor::from_slice(&order, order.len(), &Device::Cpu)?,
        );
        if let Some(noise) = &self.noise_or_not {
            tensors.insert("noise_or_not".to_string(), from_bools(noise)?);
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Check the artifacts against a dataset of `len` samples.
    ///
    /// # Errors
    ///
    /// Returns an error on length mismatches or out-of-range indices.
    pub fn validate(&self, len: usize) -> Result<()> {
        if self.filter_mask.len() != len {
            return Err(CurriculumError::Dataset(format!(
                "filter mask covers {} samples, dataset has {len}",
                self.filter_mask.len()
            )));
        }
        if let Some(&bad) = self.idx_sorted.iter().find(|&&i| i >= len) {
            return Err(CurriculumError::Dataset(format!(
                "idx_sorted entry {bad} outside dataset of {len}"
            )));
        }
        if let Some(noise) = &self.noise_or_not {
            if noise.len() != len {
                return Err(CurriculumError::Dataset(format!(
                    "noise_or_not covers {} samples, dataset has {len}",
                    noise.len()
                )));
            }
        }
        Ok(())
    }

    /// Fraction of `indices` whose label is clean, if the ground truth is
    /// known and `indices` is not empty.
    #[must_use]
    pub fn label_precision(&self, indices: &[usize]) -> Option<f64> {
        let noise = self.noise_or_not.as_ref()?;
        if indices.is_empty() {
            return None;
        }
        let clean = indices.iter().filter(|&&i| noise.get(i).copied().unwrap_or(false)).count();
        Some(clean as f64 / indices.len() as f64)
    }
}

/// View of the samples selected by a filter mask.
///
/// With curriculum ordering the view follows `idx_sorted`, skipping masked
/// out indices and repeated entries. Without it the view lists masked-in
/// indices in ascending order.
pub struct CleanSubset {
    inner: Arc<dyn IndexedDataset>,
    positions: Vec<usize>,
}

impl CleanSubset {
    /// Select the clean samples of `inner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifacts do not match the dataset.
    pub fn new(
        inner: Arc<dyn IndexedDataset>,
        artifacts: &FilterArtifacts,
        curriculum: bool,
    ) -> Result<Self> {
        artifacts.validate(inner.len())?;
        let mask = &artifacts.filter_mask;
        let positions = if curriculum {
            let mut seen = HashSet::new();
            artifacts
                .idx_sorted
                .iter()
                .copied()
                .filter(|&i| mask[i] && seen.insert(i))
                .collect()
        } else {
            (0..mask.len()).filter(|&i| mask[i]).collect()
        };
        Ok(Self { inner, positions })
    }

    /// Selected dataset indices in iteration order.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.positions
    }
}

impl IndexedDataset for CleanSubset {
    fn len(&self) -> usize {
        self.positions.len()
    }

    fn get(&self, position: usize) -> Result<Sample> {
        let index = *self.positions.get(position).ok_or_else(|| {
            CurriculumError::Dataset(format!(
                "position {position} outside subset of {}",
                self.positions.len()
            ))
        })?;
        self.inner.get(index)
    }

    fn image_shape(&self) -> (usize, usize, usize) {
        self.inner.image_shape()
    }
}

fn take_tensor<'a>(tensors: &'a HashMap<String, Tensor>, name: &str, path: &Path) -> Result<&'a Tensor> {
    tensors.get(name).ok_or_else(|| {
        CurriculumError::Dataset(format!("{}: missing tensor `{name}`", path.display()))
    })
}

fn to_bools(tensor: &Tensor) -> Result<Vec<bool>> {
    Ok(tensor
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?
        .into_iter()
        .map(|v| v != 0)
        .collect())
}

fn from_bools(values: &[bool]) -> Result<Tensor> {
    let bytes: Vec<u8> = values.iter().map(|&b| u8::from(b)).collect();
    Ok(Tensor::from_slice(&bytes, bytes.len(), &Device::Cpu)?)
}
