//! Learning rate schedules over an epoch budget.

use candle_nn::Optimizer;

use crate::config::LrScheduleConfig;

/// A learning rate as a pure function of the epoch and the epoch budget.
pub trait LrPolicy: Send + Sync {
    /// Learning rate for `epoch` out of `budget`.
    fn lr_at(&self, epoch: usize, budget: usize) -> f64;
}

/// Learning rate schedule with a fixed base rate.
///
/// # Example
///
/// ```rust
/// use curriculum_rs::scheduler::{LrPolicy, LrSchedule};
///
/// let schedule = LrSchedule::Step { base_lr: 0.1, milestones: vec![0.5], gamma: 0.1 };
/// assert_eq!(schedule.lr_at(1, 10), 0.1);
/// assert!((schedule.lr_at(5, 10) - 0.01).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum LrSchedule {
    /// Constant learning rate.
    Constant {
        /// Base learning rate.
        base_lr: f64,
    },
    /// Cosine annealing from `base_lr` at epoch 0 to zero at the budget.
    Cosine {
        /// Base learning rate.
        base_lr: f64,
    },
    /// Step decay at fractions of the budget.
    Step {
        /// Base learning rate.
        base_lr: f64,
        /// Milestones as fractions of the budget.
        milestones: Vec<f64>,
        /// Decay factor applied at each passed milestone.
        gamma: f64,
    },
}

impl LrSchedule {
    /// Build a schedule from its configuration.
    #[must_use]
    pub fn from_config(config: &LrScheduleConfig, base_lr: f64) -> Self {
        match config {
            LrScheduleConfig::Constant => Self::Constant { base_lr },
            LrScheduleConfig::Cosine => Self::Cosine { base_lr },
            LrScheduleConfig::Step { milestones, gamma } => Self::Step {
                base_lr,
                milestones: milestones.clone(),
                gamma: *gamma,
            },
        }
    }
}

impl LrPolicy for LrSchedule {
    fn lr_at(&self, epoch: usize, budget: usize) -> f64 {
        let progress = if budget == 0 {
            1.0
        } else {
            (epoch as f64 / budget as f64).min(1.0)
        };
        match self {
            Self::Constant { base_lr } => *base_lr,
            Self::Cosine { base_lr } => {
                base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
            }
            Self::Step {
                base_lr,
                milestones,
                gamma,
            } => {
                let passed = milestones.iter().filter(|&&m| progress >= m).count();
                base_lr * gamma.powi(passed as i32)
            }
        }
    }
}

/// Set the optimizer's learning rate for `epoch` and return it.
pub fn adjust_learning_rate<O: Optimizer>(
    optimizer: &mut O,
    policy: &dyn LrPolicy,
    epoch: usize,
    budget: usize,
) -> f64 {
    let lr = policy.lr_at(epoch, budget);
    optimizer.set_learning_rate(lr);
    lr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{ParamsSgd, SgdMomentum};

    #[test]
    fn test_constant_schedule() {
        let schedule = LrSchedule::Constant { base_lr: 1e-2 };
        assert_eq!(schedule.lr_at(1, 10), 1e-2);
        assert_eq!(schedule.lr_at(9, 10), 1e-2);
    }

    #[test]
    fn test_cosine_schedule() {
        let schedule = LrSchedule::Cosine { base_lr: 0.01 };
        assert!((schedule.lr_at(0, 100) - 0.01).abs() < 1e-12);
        assert!((schedule.lr_at(50, 100) - 0.005).abs() < 1e-12);
        assert!(schedule.lr_at(100, 100) < 1e-12);
        assert!(schedule.lr_at(10, 100) > schedule.lr_at(20, 100));
    }

    #[test]
    fn test_step_schedule() {
        let schedule = LrSchedule::Step {
            base_lr: 1.0,
            milestones: vec![0.5, 0.75],
            gamma: 0.1,
        };
        assert_eq!(schedule.lr_at(4, 10), 1.0);
        assert!((schedule.lr_at(5, 10) - 0.1).abs() < 1e-12);
        assert!((schedule.lr_at(8, 10) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_zero_budget_does_not_divide_by_zero() {
        let schedule = LrSchedule::Cosine { base_lr: 0.01 };
        assert!(schedule.lr_at(0, 0).is_finite());
    }

    #[test]
    fn test_from_config() {
        let schedule = LrSchedule::from_config(&LrScheduleConfig::Constant, 0.2);
        assert_eq!(schedule, LrSchedule::Constant { base_lr: 0.2 });
    }

    #[test]
    fn test_adjust_learning_rate_updates_optimizer() {
        let mut optimizer = SgdMomentum::new(vec![], ParamsSgd::default()).unwrap();
        let schedule = LrSchedule::Step {
            base_lr: 0.01,
            milestones: vec![0.5],
            gamma: 0.5,
        };

        let lr = adjust_learning_rate(&mut optimizer, &schedule, 3, 4);
        assert!((lr - 0.005).abs() < 1e-12);
        assert_eq!(optimizer.learning_rate(), lr);
    }
}
