//! Error types
use std::path::PathBuf;
use thiserror::Error;

/// A fatal problem with the experiment configuration.
///
/// Configuration errors abort the run immediately; they are never silently
/// defaulted around.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no value for `{field}` on the stage, the pipeline, or the machine parameters")]
    MissingValue { field: &'static str },
    #[error(
        "the number of processes ({num_processes}) must be greater than or equal to \
         the number of mini batches ({num_mini_batch})"
    )]
    TooManyMiniBatches {
        num_mini_batch: i64,
        num_processes: i64,
    },
    #[error("sensor path `{path}` conflicts with an existing observation entry")]
    ConflictingSensorPath { path: String },
    #[error("observation schema mismatch at `{path}` across workers")]
    ObservationSchemaMismatch { path: String },
    #[error("stage references undefined loss `{name}`")]
    UnknownLoss { name: String },
    #[error("stage has neither a step budget nor an early-stopping criterion")]
    UnboundedStage,
    #[error("worker seeds re-derived on load do not match the stored seeds")]
    WorkerSeedMismatch,
    #[error("teacher forcing is enabled but the expert action sensor is missing")]
    TeacherForcingWithoutExpert,
}

/// Failure saving, loading, or locating a checkpoint.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("could not find checkpoint `{name}` anywhere under {root}")]
    NotFound { name: String, root: PathBuf },
    #[error("found too many candidates for checkpoint `{name}`: {candidates:?}")]
    Ambiguous {
        name: String,
        candidates: Vec<PathBuf>,
    },
    #[error("checkpoint file error")]
    Io(#[from] std::io::Error),
    #[error("checkpoint record (de)serialization error")]
    Serde(#[from] serde_cbor::Error),
    #[error("checkpoint tensor archive error")]
    Tensor(#[from] tch::TchError),
    #[error("optimizer state error")]
    Optimizer(#[from] crate::optim::OptimizerStateError),
}

/// Failure reported by the vectorized task-sampler pool.
#[derive(Error, Debug)]
pub enum TaskPoolError {
    #[error("task pool is closed")]
    Closed,
    #[error("task worker failure: {0}")]
    Worker(String),
}

/// Error from the navigation RL engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error")]
    Config(#[from] ConfigError),
    #[error("checkpoint error")]
    Checkpoint(#[from] CheckpointError),
    #[error("task pool error")]
    Tasks(#[from] TaskPoolError),
    #[error("torch error")]
    Torch(#[from] tch::TchError),
}
