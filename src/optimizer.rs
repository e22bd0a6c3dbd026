//! SGD with momentum and weight decay over candle variables.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};

use crate::config::StageConfig;
use crate::error::{CurriculumError, Result};

/// Hyperparameters of [`SgdMomentum`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    /// Learning rate.
    pub lr: f64,
    /// Momentum factor.
    pub momentum: f64,
    /// L2 penalty added to the gradient.
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

#[derive(Debug)]
struct VarWithVelocity {
    var: Var,
    velocity: Var,
}

/// Stochastic gradient descent with heavy-ball momentum.
///
/// Per parameter: `g = grad + wd * p`, `v = momentum * v + g`, `p -= lr * v`.
/// Velocity buffers live as long as the optimizer, so momentum carries over
/// between epochs and is only reset by building a new optimizer.
#[derive(Debug)]
pub struct SgdMomentum {
    vars: Vec<VarWithVelocity>,
    params: ParamsSgd,
}

impl Optimizer for SgdMomentum {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let velocity = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarWithVelocity { var, velocity })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;
        for entry in &self.vars {
            let Some(grad) = grads.get(&entry.var) else {
                continue;
            };
            let grad = if weight_decay > 0.0 {
                (grad + (entry.var.as_tensor() * weight_decay)?)?
            } else {
                grad.clone()
            };
            let velocity = ((entry.velocity.as_tensor() * momentum)? + &grad)?;
            entry.velocity.set(&velocity)?;
            let next = entry.var.as_tensor().sub(&(velocity * lr)?)?;
            entry.var.set(&next)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

impl SgdMomentum {
    /// Number of optimized tensors.
    #[must_use]
    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// Compute gradients of `loss` and apply one update.
    ///
    /// # Errors
    ///
    /// Returns an error if the backward pass or the update fails.
    pub fn step_loss(&mut self, loss: &Tensor) -> Result<()> {
        self.backward_step(loss)
            .map_err(|e| CurriculumError::Training(format!("Optimizer step failed: {e}")))
    }
}

/// Optimizer settings taken from the stage configuration.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    /// Update hyperparameters.
    pub params: ParamsSgd,
}

impl From<&StageConfig> for OptimizerConfig {
    fn from(stage: &StageConfig) -> Self {
        Self {
            params: ParamsSgd {
                lr: stage.learning_rate,
                momentum: stage.momentum,
                weight_decay: stage.weight_decay,
            },
        }
    }
}

impl OptimizerConfig {
    /// Create an SGD optimizer over every variable of `varmap`.
    ///
    /// # Errors
    ///
    /// Returns an error if the velocity buffers cannot be allocated.
    pub fn build_sgd(&self, varmap: &VarMap) -> Result<SgdMomentum> {
        SgdMomentum::new(varmap.all_vars(), self.params)
            .map_err(|e| CurriculumError::Training(format!("Failed to create SGD: {e}")))
    }
}
