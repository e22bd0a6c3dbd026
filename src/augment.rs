//! Batch construction strategies.
//!
//! An [`AugmentationMode`] fixes both how batches are collated and which loss
//! consumes them, so the training loop never branches on the mode itself.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};

use crate::dataset::Sample;
use crate::error::{CurriculumError, Result};
use crate::loader::{Batch, Collator, StandardCollator, Targets};
use crate::loss::{CrossEntropyLoss, MixedTargetLoss, SampleLoss};

/// How training batches are built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AugmentationMode {
    /// Plain batches with integer labels.
    Standard,
    /// RICAP composites with soft labels.
    Ricap {
        /// Beta distribution parameter for patch boundaries.
        beta: f64,
    },
}

impl AugmentationMode {
    /// Mode selected by the stage flags.
    #[must_use]
    pub fn from_flags(use_ricap: bool, beta: f64) -> Self {
        if use_ricap {
            Self::Ricap { beta }
        } else {
            Self::Standard
        }
    }

    /// Collator producing this mode's batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the RICAP parameter is invalid.
    pub fn collator(&self, num_classes: usize) -> Result<Arc<dyn Collator>> {
        match *self {
            Self::Standard => Ok(Arc::new(StandardCollator)),
            Self::Ricap { beta } => Ok(Arc::new(RicapCollator::new(num_classes, beta)?)),
        }
    }

    /// Loss matching this mode's targets.
    #[must_use]
    pub fn criterion(&self) -> Box<dyn SampleLoss> {
        match self {
            Self::Standard => Box::new(CrossEntropyLoss::default()),
            Self::Ricap { .. } => Box::new(MixedTargetLoss),
        }
    }
}

/// Random image cropping and patching.
///
/// Each output image is tiled from four crops of four samples of the batch.
/// Its soft label weights each source label by the area of its crop.
#[derive(Debug, Clone)]
pub struct RicapCollator {
    num_classes: usize,
    boundary: Beta<f64>,
}

impl RicapCollator {
    /// Create a collator for `num_classes` classes.
    ///
    /// # Errors
    ///
    /// Returns an error if `beta` is not a valid Beta parameter.
    pub fn new(num_classes: usize, beta: f64) -> Result<Self> {
        let boundary = Beta::new(beta, beta)
            .map_err(|e| CurriculumError::Config(format!("invalid ricap beta {beta}: {e}")))?;
        Ok(Self {
            num_classes,
            boundary,
        })
    }
}

impl Collator for RicapCollator {
    fn collate(
        &self,
        samples: Vec<Sample>,
        shape: (usize, usize, usize),
        rng: &mut ChaCha8Rng,
        device: &Device,
    ) -> Result<Batch> {
        if samples.is_empty() {
            return Err(CurriculumError::Training("Cannot collate empty batch".into()));
        }
        let (c, h, w) = shape;
        let batch_size = samples.len();
        let classes = self.num_classes;

        // Boundary point splitting the canvas into four patches.
        let split_w = ((w as f64 * self.boundary.sample(rng)).round() as usize).min(w);
        let split_h = ((h as f64 * self.boundary.sample(rng)).round() as usize).min(h);
        let widths = [split_w, w - split_w, split_w, w - split_w];
        let heights = [split_h, split_h, h - split_h, h - split_h];
        let offsets = [(0, 0), (split_w, 0), (0, split_h), (split_w, split_h)];

        let mut pixels = vec![0.0f32; batch_size * c * h * w];
        let mut soft = vec![0.0f32; batch_size * classes];

        for k in 0..4 {
            let (pw, ph) = (widths[k], heights[k]);
            let (ox, oy) = offsets[k];
            let mut perm: Vec<usize> = (0..batch_size).collect();
            perm.shuffle(rng);
            let crop_x = rng.gen_range(0..=w - pw);
            let crop_y = rng.gen_range(0..=h - ph);
            let weight = (pw * ph) as f32 / (w * h) as f32;

            for (b, &source) in perm.iter().enumerate() {
                let src = &samples[source];
                if let Ok(label) = usize::try_from(src.label) {
                    if label < classes {
                        soft[b * classes + label] += weight;
                    }
                }
                for ch in 0..c {
                    for y in 0..ph {
                        let from = ch * h * w + (crop_y + y) * w + crop_x;
                        let to = b * c * h * w + ch * h * w + (oy + y) * w + ox;
                        pixels[to..to + pw].copy_from_slice(&src.image[from..from + pw]);
                    }
                }
            }
        }

        let indexes = samples.iter().map(|s| s.index).collect();
        Ok(Batch {
            images: Tensor::from_vec(pixels, (batch_size, c, h, w), device)?,
            targets: Targets::Soft(Tensor::from_vec(soft, (batch_size, classes), device)?),
            indexes,
        })
    }
}
