//! The experiment-configuration contract consumed by the engine.
//!
//! An experiment is an immutable value describing everything the engine
//! needs: the training pipeline, per-mode machine parameters, a model
//! factory, and a task-pool factory. Workers that need the configuration
//! (the background validation worker in particular) receive their own
//! clone at spawn time; nothing is shared mutably.
use crate::error::TaskPoolError;
use crate::pipeline::TrainingPipeline;
use crate::policy::ActorCritic;
use crate::tasks::{MetricsSender, VectorTasks};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tch::nn;
use yansi::Paint;

/// What an engine instance is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Train,
    Valid,
    Test,
}

impl Mode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configuration value in an [`Options`] map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Map(Options),
}

/// A layered configuration object with named, independently overridable
/// entries.
///
/// Replaces deferred keyword-argument construction with an explicit value
/// type: defaults and overrides are both `Options`, combined with
/// [`merged`](Self::merged), where the override wins and nested maps merge
/// key-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options(BTreeMap<String, OptionValue>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: OptionValue) -> &mut Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.set(key, OptionValue::Bool(value))
    }

    pub fn set_i64(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.set(key, OptionValue::Int(value))
    }

    pub fn set_f64(&mut self, key: impl Into<String>, value: f64) -> &mut Self {
        self.set(key, OptionValue::Float(value))
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.set(key, OptionValue::Str(value.into()))
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(OptionValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(OptionValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// A float entry; integer entries are promoted.
    #[allow(clippy::cast_precision_loss)]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(OptionValue::Float(value)) => Some(*value),
            Some(OptionValue::Int(value)) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(OptionValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_map(&self, key: &str) -> Option<&Self> {
        match self.get(key) {
            Some(OptionValue::Map(value)) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// These options combined with `overrides`.
    ///
    /// An override entry replaces a default with the same key, except that
    /// two nested maps merge key-wise by the same rule.
    #[must_use]
    pub fn merged(&self, overrides: &Self) -> Self {
        let mut combined = self.0.clone();
        for (key, value) in &overrides.0 {
            match (combined.get_mut(key), value) {
                (Some(OptionValue::Map(base)), OptionValue::Map(novel)) => {
                    *base = base.merged(novel);
                }
                (_, value) => {
                    combined.insert(key.clone(), value.clone());
                }
            }
        }
        Self(combined)
    }
}

/// Per-mode machine resources and fallback configuration values.
#[derive(Debug, Clone, Default)]
pub struct MachineParams {
    /// Number of parallel task-sampling workers.
    pub nprocesses: i64,
    /// CUDA device ids; empty means CPU.
    pub gpu_ids: Vec<i64>,
    /// Last-resort values for the stage -> pipeline -> machine fallback
    /// chain.
    pub options: Options,
}

/// An experiment definition.
///
/// Implementations are plain immutable values; every method may be called
/// repeatedly and must return equivalent results each time.
pub trait ExperimentConfig: Send + Sync {
    /// Short name identifying the experiment in checkpoint and log paths.
    fn tag(&self) -> String;

    /// A fresh training pipeline for this experiment.
    fn training_pipeline(&self) -> TrainingPipeline;

    fn machine_params(&self, mode: Mode) -> MachineParams;

    /// Build the actor-critic model, registering parameters under `vs`.
    fn create_model(&self, vs: &nn::Path) -> Box<dyn ActorCritic>;

    /// Build the vectorized task pool, one worker per entry of
    /// `sampler_options`. The pool reports task metrics on `metrics`.
    fn make_task_pool(
        &self,
        mode: Mode,
        sampler_options: &[Options],
        metrics: MetricsSender,
    ) -> Result<Box<dyn VectorTasks>, TaskPoolError>;

    /// Options for one worker's task sampler.
    fn sampler_options(
        &self,
        mode: Mode,
        process_ind: usize,
        total_processes: usize,
        devices: &[i64],
        seeds: Option<&[u64]>,
    ) -> Options;
}

/// Evenly spaced, rounded cut points partitioning `[0, n]` into
/// `num_parts` contiguous, near-equal intervals.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn partition_inds(n: usize, num_parts: usize) -> Vec<usize> {
    assert!(num_parts > 0, "cannot partition into zero parts");
    (0..=num_parts)
        .map(|i| ((i as f64) * (n as f64) / (num_parts as f64)).round() as usize)
        .collect()
}

/// The slice of `scenes` assigned to worker `process_ind` of
/// `total_processes`.
///
/// When the scene count does not divide evenly, or there are more workers
/// than scenes, some scenes are oversampled; this is reported as an
/// advisory warning and the biased but valid split is used anyway.
pub fn split_scenes(
    scenes: &[String],
    process_ind: usize,
    total_processes: usize,
) -> Vec<String> {
    assert!(!scenes.is_empty(), "cannot split an empty scene list");
    assert!(process_ind < total_processes);

    if scenes.len() % total_processes != 0 {
        advise(
            "oversampling some scenes to feed all processes; \
             avoid this by making the number of workers a divisor of the number of scenes",
        );
    }

    let mut scenes = scenes.to_vec();
    if total_processes > scenes.len() {
        if total_processes % scenes.len() != 0 {
            advise(
                "oversampling some scenes to feed all processes; \
                 avoid this by making the number of workers divisible by the number of scenes",
            );
        }
        let repeats = (total_processes + scenes.len() - 1) / scenes.len();
        let base = scenes.clone();
        for _ in 1..repeats {
            scenes.extend_from_slice(&base);
        }
        scenes.truncate(total_processes * (scenes.len() / total_processes));
    }

    let inds = partition_inds(scenes.len(), total_processes);
    scenes[inds[process_ind]..inds[process_ind + 1]].to_vec()
}

pub(crate) fn advise(message: &str) {
    eprintln!("{} {}", Paint::yellow("warning:"), message);
}
