//! Held-out accuracy.

use candle_core::{DType, D};
use candle_nn::ModuleT;

use crate::error::Result;
use crate::loader::{DataLoader, Targets};

/// Top-1 accuracy of `model` over `loader`, in percent.
///
/// Runs the model in evaluation mode on detached outputs. Rows with a
/// negative label and rows with soft targets are skipped. Returns 0 when no
/// row can be scored.
///
/// # Errors
///
/// Returns an error if a batch fails to load or the forward pass fails.
pub fn evaluate<M: ModuleT + ?Sized>(loader: &DataLoader, model: &M) -> Result<f64> {
    let mut correct = 0usize;
    let mut total = 0usize;

    for batch in loader.iter() {
        let batch = batch?;
        let Targets::Hard(labels) = &batch.targets else {
            continue;
        };
        let predictions = model
            .forward_t(&batch.images, false)?
            .detach()
            .argmax(D::Minus1)?
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?;
        let labels = labels.to_dtype(DType::I64)?.to_vec1::<i64>()?;

        for (prediction, label) in predictions.into_iter().zip(labels) {
            if label < 0 {
                continue;
            }
            total += 1;
            if prediction == label {
                correct += 1;
            }
        }
    }

    if total == 0 {
        return Ok(0.0);
    }
    Ok(100.0 * correct as f64 / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use candle_core::{Device, Tensor};

    use crate::dataset::ImageDataset;
    use crate::loader::{LoaderConfig, StandardCollator};

    /// Predicts the class given by the first pixel.
    struct FirstPixel {
        classes: usize,
    }

    impl ModuleT for FirstPixel {
        fn forward_t(&self, xs: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
            let first = xs.flatten_from(1)?.narrow(1, 0, 1)?.to_dtype(DType::U32)?;
            let classes = Tensor::arange(0u32, self.classes as u32, xs.device())?.unsqueeze(0)?;
            first.broadcast_eq(&classes)?.to_dtype(DType::F32)
        }
    }

    fn loader(pixels: Vec<f32>, labels: Vec<i64>) -> DataLoader {
        let dataset = ImageDataset::new(pixels, labels, (1, 1, 1)).unwrap();
        DataLoader::new(
            Arc::new(dataset),
            Arc::new(StandardCollator),
            LoaderConfig {
                batch_size: 2,
                shuffle: false,
                ..Default::default()
            },
            Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_accuracy_percent() {
        let loader = loader(vec![0.0, 1.0, 2.0, 1.0], vec![0, 1, 2, 0]);
        let acc = evaluate(&loader, &FirstPixel { classes: 3 }).unwrap();
        assert!((acc - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_ignored_labels_not_counted() {
        let loader = loader(vec![0.0, 1.0, 2.0], vec![0, -1, 0]);
        let acc = evaluate(&loader, &FirstPixel { classes: 3 }).unwrap();
        assert!((acc - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_loader() {
        let loader = loader(vec![], vec![]);
        assert_eq!(evaluate(&loader, &FirstPixel { classes: 3 }).unwrap(), 0.0);
    }
}
