//! Per-sample classification losses.
//!
//! Losses are never reduced here: each returns one value per batch row so
//! the caller can both record per-sample losses and choose the reduction for
//! the backward pass.

use candle_core::{DType, Tensor, D};

use crate::dataset::IGNORE_LABEL;
use crate::error::{CurriculumError, Result};
use crate::loader::Targets;

/// A loss returning one value per sample.
pub trait SampleLoss: Send + Sync {
    /// Losses of shape `(B)` for `logits` of shape `(B, K)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the targets do not suit this loss or shapes
    /// disagree.
    fn per_sample(&self, logits: &Tensor, targets: &Targets) -> Result<Tensor>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Cross-entropy against class indices with an ignored label.
///
/// Rows whose label equals `ignore_index` get a loss of zero and no
/// gradient; they still count towards a later mean.
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropyLoss {
    /// Label value skipped by the loss.
    pub ignore_index: i64,
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self {
            ignore_index: IGNORE_LABEL,
        }
    }
}

impl CrossEntropyLoss {
    /// Per-sample loss for an integer label tensor of shape `(B)`.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch or a label outside `0..K` that is
    /// not the ignore index.
    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (batch_size, num_classes) = logits.dims2()?;
        let labels = labels.to_dtype(DType::I64)?.to_vec1::<i64>()?;
        if labels.len() != batch_size {
            return Err(CurriculumError::Training(format!(
                "{} labels for {batch_size} logits rows",
                labels.len()
            )));
        }

        let mut safe_labels = Vec::with_capacity(batch_size);
        let mut mask = Vec::with_capacity(batch_size);
        for &label in &labels {
            if label == self.ignore_index {
                safe_labels.push(0u32);
                mask.push(0.0f32);
            } else if label >= 0 && (label as usize) < num_classes {
                safe_labels.push(label as u32);
                mask.push(1.0);
            } else {
                return Err(CurriculumError::Training(format!(
                    "label {label} outside 0..{num_classes}"
                )));
            }
        }

        let device = logits.device();
        let targets = Tensor::from_vec(safe_labels, (batch_size, 1), device)?;
        let mask = Tensor::from_vec(mask, batch_size, device)?.to_dtype(logits.dtype())?;

        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
        let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;
        Ok(picked.neg()?.mul(&mask)?)
    }
}

impl SampleLoss for CrossEntropyLoss {
    fn per_sample(&self, logits: &Tensor, targets: &Targets) -> Result<Tensor> {
        match targets {
            Targets::Hard(labels) => self.forward(logits, labels),
            Targets::Soft(_) => Err(CurriculumError::Training(
                "cross-entropy expects integer labels".into(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "cross_entropy"
    }
}

/// Cross-entropy against class distributions: `-Σ t · log_softmax(z)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MixedTargetLoss;

impl MixedTargetLoss {
    /// Per-sample loss for soft targets of shape `(B, K)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target shape differs from the logits.
    pub fn forward(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        if logits.dims() != targets.dims() {
            return Err(CurriculumError::Training(format!(
                "soft targets {:?} do not match logits {:?}",
                targets.dims(),
                logits.dims()
            )));
        }
        let targets = targets.to_dtype(logits.dtype())?;
        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
        Ok(log_probs.mul(&targets)?.sum(D::Minus1)?.neg()?)
    }
}

impl SampleLoss for MixedTargetLoss {
    fn per_sample(&self, logits: &Tensor, targets: &Targets) -> Result<Tensor> {
        match targets {
            Targets::Soft(soft) => self.forward(logits, soft),
            Targets::Hard(_) => Err(CurriculumError::Training(
                "mixed-target loss expects class distributions".into(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "mixed_target"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits() -> Tensor {
        Tensor::new(&[[2.0f32, 0.0, 0.0], [0.0, 0.0, 0.0]], &Device::Cpu).unwrap()
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_cross_entropy_per_sample() {
        let labels = Tensor::new(&[0i64, 2], &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss::default()
            .forward(&logits(), &labels)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        let expected_first = -(2.0f32.exp() / (2.0f32.exp() + 2.0)).ln();
        assert_eq!(loss.len(), 2);
        assert!(close(loss[0], expected_first));
        assert!(close(loss[1], 3.0f32.ln()));
    }

    #[test]
    fn test_cross_entropy_ignores_minus_one() {
        let labels = Tensor::new(&[-1i64, 1], &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss::default()
            .forward(&logits(), &labels)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(loss[0], 0.0);
        assert!(close(loss[1], 3.0f32.ln()));
    }

    #[test]
    fn test_cross_entropy_rejects_out_of_range_label() {
        let labels = Tensor::new(&[3i64, 0], &Device::Cpu).unwrap();
        assert!(CrossEntropyLoss::default().forward(&logits(), &labels).is_err());
    }

    #[test]
    fn test_mixed_target_matches_cross_entropy_on_one_hot() {
        let soft = Tensor::new(&[[1.0f32, 0.0, 0.0], [0.0, 0.0, 1.0]], &Device::Cpu).unwrap();
        let hard = Tensor::new(&[0i64, 2], &Device::Cpu).unwrap();
        let mixed = MixedTargetLoss.forward(&logits(), &soft).unwrap().to_vec1::<f32>().unwrap();
        let ce = CrossEntropyLoss::default()
            .forward(&logits(), &hard)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(close(mixed[0], ce[0]));
        assert!(close(mixed[1], ce[1]));
    }

    #[test]
    fn test_mixed_target_weights_labels() {
        let soft = Tensor::new(&[[0.5f32, 0.5, 0.0], [0.25, 0.25, 0.5]], &Device::Cpu).unwrap();
        let loss = MixedTargetLoss.forward(&logits(), &soft).unwrap().to_vec1::<f32>().unwrap();
        assert!(close(loss[1], 3.0f32.ln()));
    }

    #[test]
    fn test_loss_rejects_wrong_target_kind() {
        let hard = Targets::Hard(Tensor::new(&[0i64, 1], &Device::Cpu).unwrap());
        let soft = Targets::Soft(Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap());
        assert!(MixedTargetLoss.per_sample(&logits(), &hard).is_err());
        assert!(CrossEntropyLoss::default().per_sample(&logits(), &soft).is_err());
    }

    #[test]
    fn test_cross_entropy_gradient_skips_ignored_rows() {
        let var = candle_core::Var::from_tensor(&logits()).unwrap();
        let labels = Tensor::new(&[-1i64, 1], &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss::default()
            .forward(var.as_tensor(), &labels)
            .unwrap()
            .mean_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(&var).unwrap().to_vec2::<f32>().unwrap();
        assert!(grad[0].iter().all(|&g| g == 0.0));
        assert!(grad[1].iter().any(|&g| g != 0.0));
    }
}
