//! Image classifiers built on `candle_nn`.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Linear, Module, ModuleT, VarBuilder, VarMap};

use crate::config::{Architecture, ModelConfig};
use crate::error::{CurriculumError, Result};

const CONV1_CHANNELS: usize = 32;
const CONV2_CHANNELS: usize = 64;

/// Two 3x3 convolution blocks with max-pooling and a two-layer head.
#[derive(Debug)]
struct ConvNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
}

impl ConvNet {
    fn new(config: &ModelConfig, vb: &VarBuilder) -> candle_core::Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(config.channels, CONV1_CHANNELS, 3, conv_cfg, vb.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(CONV1_CHANNELS, CONV2_CHANNELS, 3, conv_cfg, vb.pp("conv2"))?;
        let flat = CONV2_CHANNELS * (config.height / 4) * (config.width / 4);
        let fc1 = candle_nn::linear(flat, config.hidden, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(config.hidden, config.num_classes, vb.pp("fc2"))?;
        Ok(Self {
            conv1,
            conv2,
            fc1,
            fc2,
            dropout: Dropout::new(config.dropout),
        })
    }
}

impl ModuleT for ConvNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?.max_pool2d(2)?;
        let xs = self.conv2.forward(&xs)?.relu()?.max_pool2d(2)?;
        let xs = self.fc1.forward(&xs.flatten_from(1)?)?.relu()?;
        let xs = self.dropout.forward_t(&xs, train)?;
        self.fc2.forward(&xs)
    }
}

#[derive(Debug)]
struct Mlp {
    hidden: Linear,
    out: Linear,
    dropout: Dropout,
}

impl Mlp {
    fn new(config: &ModelConfig, vb: &VarBuilder) -> candle_core::Result<Self> {
        let (c, h, w) = config.image_shape();
        Ok(Self {
            hidden: candle_nn::linear(c * h * w, config.hidden, vb.pp("hidden"))?,
            out: candle_nn::linear(config.hidden, config.num_classes, vb.pp("out"))?,
            dropout: Dropout::new(config.dropout),
        })
    }
}

impl ModuleT for Mlp {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.hidden.forward(&xs.flatten_from(1)?)?.relu()?;
        let xs = self.dropout.forward_t(&xs, train)?;
        self.out.forward(&xs)
    }
}

#[derive(Debug)]
enum Body {
    Cnn(ConvNet),
    Mlp(Mlp),
}

/// A classifier together with the variables the optimizer updates.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use candle_nn::ModuleT;
/// use curriculum_rs::config::ModelConfig;
/// use curriculum_rs::model::Network;
///
/// # fn main() -> curriculum_rs::Result<()> {
/// let config = ModelConfig { height: 8, width: 8, ..Default::default() };
/// let network = Network::new(&config, &Device::Cpu)?;
/// let images = Tensor::zeros((2, 3, 8, 8), DType::F32, &Device::Cpu)?;
/// let logits = network.forward_t(&images, false)?;
/// assert_eq!(logits.dims(), &[2, 10]);
/// # Ok(())
/// # }
/// ```
pub struct Network {
    body: Body,
    varmap: VarMap,
    config: ModelConfig,
}

impl Network {
    /// Build a freshly initialized network on `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be created.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let body = match config.arch {
            Architecture::Cnn => Body::Cnn(ConvNet::new(config, &vb)?),
            Architecture::Mlp => Body::Mlp(Mlp::new(config, &vb)?),
        };
        tracing::debug!(
            "Built {:?} network with {} parameters",
            config.arch,
            parameter_count(&varmap)
        );
        Ok(Self {
            body,
            varmap,
            config: config.clone(),
        })
    }

    /// Trainable variables.
    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Architecture configuration.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        parameter_count(&self.varmap)
    }

    /// Restore weights from a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or a tensor does not fit.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap.load(path).map_err(|e| {
            CurriculumError::Model(format!("Failed to restore {}: {e}", path.display()))
        })?;
        tracing::info!("Restored model weights from {}", path.display());
        Ok(())
    }

    /// Write weights to a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap.save(path).map_err(|e| {
            CurriculumError::Model(format!("Failed to save {}: {e}", path.display()))
        })?;
        tracing::info!("Saved model weights to {}", path.display());
        Ok(())
    }
}

impl ModuleT for Network {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match &self.body {
            Body::Cnn(net) => net.forward_t(xs, train),
            Body::Mlp(net) => net.forward_t(xs, train),
        }
    }
}

fn parameter_count(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small(arch: Architecture) -> ModelConfig {
        ModelConfig {
            arch,
            num_classes: 4,
            channels: 1,
            height: 8,
            width: 8,
            hidden: 16,
            dropout: 0.0,
        }
    }

    #[test]
    fn test_cnn_output_shape() {
        let network = Network::new(&small(Architecture::Cnn), &Device::Cpu).unwrap();
        let xs = Tensor::zeros((3, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(network.forward_t(&xs, true).unwrap().dims(), &[3, 4]);
    }

    #[test]
    fn test_mlp_output_shape() {
        let network = Network::new(&small(Architecture::Mlp), &Device::Cpu).unwrap();
        let xs = Tensor::zeros((2, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(network.forward_t(&xs, false).unwrap().dims(), &[2, 4]);
    }

    #[test]
    fn test_parameter_count() {
        let network = Network::new(&small(Architecture::Mlp), &Device::Cpu).unwrap();
        // 64*16 + 16 + 16*4 + 4
        assert_eq!(network.parameter_count(), 1108);
    }

    #[test]
    fn test_weights_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("weights.safetensors");
        let xs = Tensor::ones((1, 1, 8, 8), DType::F32, &Device::Cpu).unwrap();

        let original = Network::new(&small(Architecture::Cnn), &Device::Cpu).unwrap();
        original.save_weights(&path).unwrap();
        let expected = original.forward_t(&xs, false).unwrap().to_vec2::<f32>().unwrap();

        let mut restored = Network::new(&small(Architecture::Cnn), &Device::Cpu).unwrap();
        restored.load_weights(&path).unwrap();
        let actual = restored.forward_t(&xs, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_load_missing_weights() {
        let mut network = Network::new(&small(Architecture::Mlp), &Device::Cpu).unwrap();
        assert!(matches!(
            network.load_weights("/nonexistent/weights.safetensors"),
            Err(CurriculumError::Model(_))
        ));
    }
}
