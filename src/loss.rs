//! The pluggable loss contract.
//!
//! Concrete losses (PPO surrogates, imitation cross-entropy, auxiliary
//! objectives) live with the experiment configurations that select them;
//! the engine only weights, sums, and backpropagates whatever scalar each
//! named loss produces.
use crate::policy::PolicyOutput;
use crate::storage::MiniBatch;
use std::collections::BTreeMap;
use tch::Tensor;

/// A named training objective evaluated over one mini-batch.
pub trait Loss: Send {
    /// Evaluate the loss over a mini-batch and the policy output obtained
    /// by running the model over that batch.
    ///
    /// Returns the scalar loss tensor (attached to the autograd graph) and
    /// named diagnostic scalars for logging.
    fn loss(&self, batch: &MiniBatch, output: &PolicyOutput) -> (Tensor, BTreeMap<String, f64>);
}
