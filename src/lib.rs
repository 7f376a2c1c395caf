//! An on-policy reinforcement learning engine for embodied navigation agents.
//!
//! Experiments are described by an [`ExperimentConfig`]: sensors, an
//! actor-critic model, a [`TrainingPipeline`] of stages, and a vectorized
//! task-sampler pool. The [`Engine`] drives synchronized rollout collection
//! into a [`RolloutStorage`], computes generalized advantage estimates,
//! optimizes a weighted sum of named losses, checkpoints, and evaluates
//! checkpoints on a background validation worker.
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::missing_const_for_fn)] // has some false positives
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::redundant_closure_for_method_calls)]
#![warn(clippy::use_self)]
pub mod checkpoint;
pub mod engine;
mod error;
pub mod experiment;
pub mod logging;
pub mod loss;
pub mod observation;
pub mod optim;
pub mod pipeline;
pub mod policy;
pub mod storage;
pub mod tasks;
#[cfg(test)]
pub(crate) mod testing;

pub use checkpoint::Checkpoint;
pub use engine::Engine;
pub use error::{CheckpointError, ConfigError, EngineError, TaskPoolError};
pub use experiment::{ExperimentConfig, MachineParams, Mode, OptionValue, Options};
pub use logging::{MetricsSink, NullSink, ScalarMeanTracker, TensorBoardSink};
pub use loss::Loss;
pub use observation::{ObservationTree, SensorPath};
pub use optim::{Adam, AdamConfig, BuildOptimizer};
pub use pipeline::{
    EarlyStoppingCriterion, LinearDecay, PipelineStage, StageSettings, TrainingPipeline,
};
pub use policy::{ActionDistribution, ActionSpace, ActorCritic, Categorical, PolicyOutput};
pub use storage::{MiniBatch, RolloutStorage, Transition};
pub use tasks::{
    metrics_channel, MetricsMessage, MetricsReceiver, MetricsSender, TaskStep, TeacherPackage,
    UpdatePackage, VectorTasks,
};

/// Pseudo-random number generator for all engine-side randomness.
///
/// Seed derivation (worker seed lists, teacher-forcing masks, mini-batch
/// shard order) must be reproducible across checkpoint save and load, so a
/// portable seedable generator is used rather than [`rand::rngs::ThreadRng`].
pub type Prng = rand_chacha::ChaCha8Rng;
