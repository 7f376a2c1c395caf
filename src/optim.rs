//! Optimizers with checkpoint-exact state.
//!
//! Checkpoint resume must restore the optimizer bit-for-bit, so the Adam
//! moment estimates live in explicit named tensors rather than inside an
//! opaque torch optimizer handle.
use std::collections::BTreeMap;
use std::convert::Infallible;
use tch::{nn::VarStore, no_grad_guard, Tensor};
use thiserror::Error;

/// Configuration for the Adam optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Coefficient for the running average of the gradient
    pub beta1: f64,
    /// Coefficient for the running average of the square of the gradient
    pub beta2: f64,
    /// Weight decay (L2 penalty)
    pub weight_decay: f64,
    /// A term added to the denominator to improve numerical stability
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
        }
    }
}

/// Build an optimizer for the trainable variables in a variable store.
pub trait BuildOptimizer {
    type Optimizer;
    type Error: std::error::Error;

    fn build_optimizer(&self, vs: &VarStore) -> Result<Self::Optimizer, Self::Error>;
}

impl BuildOptimizer for AdamConfig {
    type Optimizer = Adam;
    type Error = Infallible;

    fn build_optimizer(&self, vs: &VarStore) -> Result<Adam, Infallible> {
        Ok(Adam::new(vs, self.clone()))
    }
}

/// Error restoring optimizer state from a checkpoint archive.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerStateError {
    #[error("missing state tensor `{name}` in the optimizer archive")]
    Missing { name: String },
    #[error("state tensor `{name}` has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        found: Vec<i64>,
        expected: Vec<i64>,
    },
}

/// Per-parameter Adam moment estimates.
#[derive(Debug)]
struct ParamState {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    step: i64,
}

/// Adam over a variable store's trainable variables.
///
/// Parameters are tracked by (sorted) variable name so that the moment
/// estimates can be written to and restored from a named-tensor archive.
/// The effective learning rate is mutable to support external scheduling.
#[derive(Debug)]
pub struct Adam {
    params: Vec<(String, Tensor)>,
    state: Vec<ParamState>,
    config: AdamConfig,
    learning_rate: f64,
}

impl Adam {
    pub fn new(vs: &VarStore, config: AdamConfig) -> Self {
        let mut params: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .filter(|(_, tensor)| tensor.requires_grad())
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let state = params
            .iter()
            .map(|(_, tensor)| ParamState {
                exp_avg: Tensor::zeros_like(tensor),
                exp_avg_sq: Tensor::zeros_like(tensor),
                step: 0,
            })
            .collect();

        let learning_rate = config.learning_rate;
        Self {
            params,
            state,
            config,
            learning_rate,
        }
    }

    /// The learning rate currently in effect.
    pub const fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Override the learning rate; used by external schedulers.
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Zero out the gradients of all optimized tensors.
    pub fn zero_grad(&mut self) {
        for (_, param) in &self.params {
            let mut grad = param.grad();
            if grad.defined() {
                let _ = grad.detach_();
                let _ = grad.zero_();
            }
        }
    }

    /// Apply one Adam update using the gradients currently stored with the
    /// parameters. Parameters without a defined gradient are skipped.
    pub fn step(&mut self) {
        let _guard = no_grad_guard();
        for ((_, param), state) in self.params.iter().zip(&mut self.state) {
            let grad = param.grad();
            if !grad.defined() {
                continue;
            }
            let grad = if self.config.weight_decay == 0.0 {
                grad.shallow_clone()
            } else {
                &grad + param * self.config.weight_decay
            };

            state.step += 1;
            let exp_avg =
                &state.exp_avg * self.config.beta1 + &grad * (1.0 - self.config.beta1);
            state.exp_avg.copy_(&exp_avg);
            let exp_avg_sq = &state.exp_avg_sq * self.config.beta2
                + (&grad * &grad) * (1.0 - self.config.beta2);
            state.exp_avg_sq.copy_(&exp_avg_sq);

            #[allow(clippy::cast_precision_loss)]
            let steps = state.step as f64;
            let bias_correction1 = 1.0 - self.config.beta1.powf(steps);
            let bias_correction2 = 1.0 - self.config.beta2.powf(steps);
            let denom = (&state.exp_avg_sq / bias_correction2).sqrt() + self.config.eps;
            let update = (&state.exp_avg / denom) * (self.learning_rate / bias_correction1);

            let mut target = param.shallow_clone();
            target.copy_(&(param - update));
        }
    }

    /// The optimizer state as named tensors for a checkpoint archive.
    ///
    /// Step counters ride along as scalar tensors so the whole state fits
    /// one archive.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut entries = Vec::with_capacity(3 * self.params.len());
        for ((name, _), state) in self.params.iter().zip(&self.state) {
            entries.push((format!("{}.exp_avg", name), state.exp_avg.shallow_clone()));
            entries.push((
                format!("{}.exp_avg_sq", name),
                state.exp_avg_sq.shallow_clone(),
            ));
            entries.push((format!("{}.step", name), Tensor::from(state.step)));
        }
        entries
    }

    /// Restore the state produced by [`state_tensors`](Self::state_tensors).
    ///
    /// # Errors
    /// [`OptimizerStateError`] if an entry is missing or its shape does not
    /// match the parameter it belongs to.
    pub fn load_state_tensors(
        &mut self,
        tensors: &[(String, Tensor)],
    ) -> Result<(), OptimizerStateError> {
        let archive: BTreeMap<&str, &Tensor> = tensors
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
            .collect();
        let lookup = |name: String| {
            archive
                .get(name.as_str())
                .copied()
                .ok_or(OptimizerStateError::Missing { name })
        };

        for ((name, param), state) in self.params.iter().zip(&mut self.state) {
            let exp_avg = lookup(format!("{}.exp_avg", name))?;
            let exp_avg_sq = lookup(format!("{}.exp_avg_sq", name))?;
            let step = lookup(format!("{}.step", name))?;
            for (tag, tensor) in [("exp_avg", exp_avg), ("exp_avg_sq", exp_avg_sq)] {
                if tensor.size() != param.size() {
                    return Err(OptimizerStateError::ShapeMismatch {
                        name: format!("{}.{}", name, tag),
                        found: tensor.size(),
                        expected: param.size(),
                    });
                }
            }
            if !step.size().is_empty() {
                return Err(OptimizerStateError::ShapeMismatch {
                    name: format!("{}.step", name),
                    found: step.size(),
                    expected: vec![],
                });
            }

            state.exp_avg.copy_(&exp_avg.to_device(param.device()));
            state
                .exp_avg_sq
                .copy_(&exp_avg_sq.to_device(param.device()));
            state.step = i64::from(step);
        }
        Ok(())
    }
}

/// Clip gradients so their joint infinity norm is at most `max_norm`.
pub fn clip_grad_norm_inf<'a, I>(params: I, max_norm: f64)
where
    I: IntoIterator<Item = &'a Tensor>,
{
    let grads: Vec<Tensor> = params
        .into_iter()
        .map(Tensor::grad)
        .filter(Tensor::defined)
        .collect();
    let total_norm = grads
        .iter()
        .map(|grad| f64::from(grad.abs().max()))
        .fold(0.0, f64::max);

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        let _guard = no_grad_guard();
        for grad in grads {
            let mut target = grad.shallow_clone();
            target.copy_(&(&grad * clip_coef));
        }
    }
}
