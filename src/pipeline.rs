//! Training pipelines: ordered stages of losses, budgets, and schedules.
use crate::error::ConfigError;
use crate::experiment::Options;
use crate::logging::ScalarMeanTracker;
use crate::loss::Loss;
use crate::optim::AdamConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A linearly interpolated schedule over global step counts.
///
/// Evaluates to `startp` at step 0, decays linearly to `endp` at `steps`,
/// and stays at `endp` afterwards. Used both for teacher-forcing
/// probabilities and as a learning-rate factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearDecay {
    pub steps: i64,
    pub startp: f64,
    pub endp: f64,
}

impl LinearDecay {
    /// Decay from 1.0 to 0.0 over the given number of steps.
    pub const fn new(steps: i64) -> Self {
        Self {
            steps,
            startp: 1.0,
            endp: 0.0,
        }
    }

    /// The schedule value at the given step count.
    pub fn call(&self, step: i64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let fraction = (step.clamp(0, self.steps) as f64) / (self.steps as f64);
        self.startp + (self.endp - self.startp) * fraction
    }
}

/// A predicate over accumulated training metrics that can end a stage
/// before its step budget is exhausted.
///
/// Evaluated once per logging interval, before the metric tracker is
/// flushed, so implementations see every scalar accumulated since the last
/// interval. Implementations may keep state (running means and the like)
/// across evaluations.
pub trait EarlyStoppingCriterion: Send {
    fn early_stop(
        &mut self,
        stage_steps: i64,
        total_steps: i64,
        training_metrics: &ScalarMeanTracker,
        valid_metrics: Option<&BTreeMap<String, f64>>,
    ) -> bool;
}

/// One phase of a training curriculum.
///
/// A stage activates a subset of the pipeline's named losses and runs until
/// its step budget is spent or its early-stopping criterion fires,
/// whichever happens first. Per-stage fields override the pipeline-level
/// defaults, which in turn override the machine parameters.
#[derive(Default)]
pub struct PipelineStage {
    /// Names of the losses active in this stage, resolved against
    /// [`TrainingPipeline::named_losses`].
    pub loss_names: Vec<String>,
    /// Per-loss weights, parallel to `loss_names`. Defaults to all 1.0.
    pub loss_weights: Option<Vec<f64>>,
    /// Probability of substituting the expert action, as a function of the
    /// stage step count.
    pub teacher_forcing: Option<LinearDecay>,
    /// Hard budget of task steps for this stage.
    pub max_stage_steps: Option<i64>,
    /// Metric-driven stage termination.
    pub early_stopping_criterion: Option<Box<dyn EarlyStoppingCriterion>>,

    // Overrides of the pipeline-level defaults.
    pub num_steps: Option<i64>,
    pub update_repeats: Option<i64>,
    pub num_mini_batch: Option<i64>,
    pub gamma: Option<f64>,
    pub use_gae: Option<bool>,
    pub gae_lambda: Option<f64>,
    pub max_grad_norm: Option<f64>,
}

impl fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PipelineStage")
            .field("loss_names", &self.loss_names)
            .field("loss_weights", &self.loss_weights)
            .field("teacher_forcing", &self.teacher_forcing)
            .field("max_stage_steps", &self.max_stage_steps)
            .field(
                "early_stopping_criterion",
                &self.early_stopping_criterion.as_ref().map(|_| ".."),
            )
            .finish_non_exhaustive()
    }
}

impl PipelineStage {
    /// A stage running the given losses for a fixed number of task steps.
    pub fn new<I, S>(loss_names: I, max_stage_steps: i64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            loss_names: loss_names.into_iter().map(Into::into).collect(),
            max_stage_steps: Some(max_stage_steps),
            ..Self::default()
        }
    }

    /// The stage's loss weights as a name-keyed map, defaulting to 1.0.
    pub fn loss_weights_by_name(&self) -> BTreeMap<String, f64> {
        match &self.loss_weights {
            Some(weights) => self
                .loss_names
                .iter()
                .cloned()
                .zip(weights.iter().copied())
                .collect(),
            None => self
                .loss_names
                .iter()
                .map(|name| (name.clone(), 1.0))
                .collect(),
        }
    }
}

/// Stage-level knobs after resolving the stage -> pipeline -> machine
/// parameter fallback chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSettings {
    /// Steps per rollout.
    pub num_steps: i64,
    /// Optimization epochs per rollout.
    pub update_repeats: i64,
    /// Mini-batches per epoch.
    pub num_mini_batch: i64,
    /// Reward discount.
    pub gamma: f64,
    /// Whether to use generalized advantage estimation.
    pub use_gae: bool,
    /// GAE decay.
    pub gae_lambda: f64,
    /// Infinity-norm gradient clipping threshold.
    pub max_grad_norm: f64,
    /// Task-step budget, if the stage has one.
    pub max_stage_steps: Option<i64>,
}

/// An ordered curriculum of [`PipelineStage`]s with shared defaults.
///
/// Constructed once from the experiment configuration at engine startup.
/// `current_stage` is advanced by the engine as stages complete and is part
/// of the persisted checkpoint record, so a resumed run continues exactly
/// where it stopped.
pub struct TrainingPipeline {
    pub optimizer: AdamConfig,
    /// Learning-rate factor schedule over global step counts.
    pub lr_scheduler: Option<LinearDecay>,
    /// Every loss any stage may reference, by name.
    pub named_losses: BTreeMap<String, Box<dyn Loss>>,
    pub stages: Vec<PipelineStage>,
    /// Task steps between checkpoint saves. Zero disables saving.
    pub save_interval: i64,
    /// Task steps between metric accumulation flushes.
    pub log_interval: i64,
    /// Index of the stage currently being trained.
    pub current_stage: usize,

    // Pipeline-level defaults for the per-stage knobs.
    pub num_steps: Option<i64>,
    pub update_repeats: Option<i64>,
    pub num_mini_batch: Option<i64>,
    pub gamma: Option<f64>,
    pub use_gae: Option<bool>,
    pub gae_lambda: Option<f64>,
    pub max_grad_norm: Option<f64>,
}

impl fmt::Debug for TrainingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrainingPipeline")
            .field("optimizer", &self.optimizer)
            .field("lr_scheduler", &self.lr_scheduler)
            .field(
                "named_losses",
                &self.named_losses.keys().collect::<Vec<_>>(),
            )
            .field("stages", &self.stages)
            .field("save_interval", &self.save_interval)
            .field("log_interval", &self.log_interval)
            .field("current_stage", &self.current_stage)
            .finish_non_exhaustive()
    }
}

impl TrainingPipeline {
    /// Check the pipeline for configuration errors.
    ///
    /// # Errors
    /// * [`ConfigError::UnknownLoss`] if a stage references a loss missing
    ///   from `named_losses`.
    /// * [`ConfigError::UnboundedStage`] if a stage has neither a step
    ///   budget nor an early-stopping criterion.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for stage in &self.stages {
            for name in &stage.loss_names {
                if !self.named_losses.contains_key(name) {
                    return Err(ConfigError::UnknownLoss { name: name.clone() });
                }
            }
            if stage.max_stage_steps.is_none() && stage.early_stopping_criterion.is_none() {
                return Err(ConfigError::UnboundedStage);
            }
        }
        Ok(())
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// The index of the stage currently being trained, if any remain.
    pub fn current_stage_index(&self) -> Option<usize> {
        (self.current_stage < self.stages.len()).then(|| self.current_stage)
    }

    /// Mark the current stage complete and move to the next.
    pub fn advance_stage(&mut self) {
        self.current_stage += 1;
    }

    /// Resolve every per-stage knob through the stage -> pipeline ->
    /// machine-parameter fallback chain.
    ///
    /// # Errors
    /// [`ConfigError::MissingValue`] naming the first knob unresolved
    /// anywhere in the chain.
    pub fn stage_settings(
        &self,
        stage_index: usize,
        machine_options: &Options,
    ) -> Result<StageSettings, ConfigError> {
        let stage = &self.stages[stage_index];
        Ok(StageSettings {
            num_steps: resolve(
                "num_steps",
                stage.num_steps,
                self.num_steps,
                machine_options.get_i64("num_steps"),
            )?,
            update_repeats: resolve(
                "update_repeats",
                stage.update_repeats,
                self.update_repeats,
                machine_options.get_i64("update_repeats"),
            )?,
            num_mini_batch: resolve(
                "num_mini_batch",
                stage.num_mini_batch,
                self.num_mini_batch,
                machine_options.get_i64("num_mini_batch"),
            )?,
            gamma: resolve(
                "gamma",
                stage.gamma,
                self.gamma,
                machine_options.get_f64("gamma"),
            )?,
            use_gae: resolve(
                "use_gae",
                stage.use_gae,
                self.use_gae,
                machine_options.get_bool("use_gae"),
            )?,
            gae_lambda: resolve(
                "gae_lambda",
                stage.gae_lambda,
                self.gae_lambda,
                machine_options.get_f64("gae_lambda"),
            )?,
            max_grad_norm: resolve(
                "max_grad_norm",
                stage.max_grad_norm,
                self.max_grad_norm,
                machine_options.get_f64("max_grad_norm"),
            )?,
            max_stage_steps: stage.max_stage_steps,
        })
    }
}

fn resolve<T>(
    field: &'static str,
    stage: Option<T>,
    pipeline: Option<T>,
    machine: Option<T>,
) -> Result<T, ConfigError> {
    stage
        .or(pipeline)
        .or(machine)
        .ok_or(ConfigError::MissingValue { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyOutput;
    use crate::storage::MiniBatch;
    use tch::Tensor;

    struct NullLoss;
    impl Loss for NullLoss {
        fn loss(&self, _: &MiniBatch, _: &PolicyOutput) -> (Tensor, BTreeMap<String, f64>) {
            (Tensor::from(0.0_f32), BTreeMap::new())
        }
    }

    fn pipeline() -> TrainingPipeline {
        let mut named_losses: BTreeMap<String, Box<dyn Loss>> = BTreeMap::new();
        named_losses.insert("ppo_loss".into(), Box::new(NullLoss));
        TrainingPipeline {
            optimizer: AdamConfig::default(),
            lr_scheduler: None,
            named_losses,
            stages: vec![PipelineStage::new(["ppo_loss"], 1000)],
            save_interval: 100,
            log_interval: 10,
            current_stage: 0,
            num_steps: Some(16),
            update_repeats: Some(4),
            num_mini_batch: Some(2),
            gamma: Some(0.99),
            use_gae: Some(true),
            gae_lambda: Some(0.95),
            max_grad_norm: Some(0.5),
        }
    }

    #[test]
    fn linear_decay_interpolates_and_saturates() {
        let decay = LinearDecay::new(100);
        assert_eq!(decay.call(0), 1.0);
        assert!((decay.call(50) - 0.5).abs() < 1e-10);
        assert_eq!(decay.call(100), 0.0);
        assert_eq!(decay.call(250), 0.0);

        let partial = LinearDecay {
            steps: 10,
            startp: 0.8,
            endp: 0.2,
        };
        assert!((partial.call(5) - 0.5).abs() < 1e-10);
    }

    #[test]
    fn stage_overrides_pipeline_defaults() {
        let mut pipeline = pipeline();
        pipeline.stages[0].num_steps = Some(32);
        pipeline.stages[0].gamma = Some(0.5);

        let settings = pipeline.stage_settings(0, &Options::new()).unwrap();
        assert_eq!(settings.num_steps, 32);
        assert_eq!(settings.gamma, 0.5);
        // Unset stage fields fall back to the pipeline.
        assert_eq!(settings.update_repeats, 4);
        assert_eq!(settings.max_stage_steps, Some(1000));
    }

    #[test]
    fn machine_options_are_the_last_fallback() {
        let mut pipeline = pipeline();
        pipeline.num_mini_batch = None;

        let mut options = Options::new();
        options.set_i64("num_mini_batch", 8);
        let settings = pipeline.stage_settings(0, &options).unwrap();
        assert_eq!(settings.num_mini_batch, 8);
    }

    #[test]
    fn missing_value_is_a_config_error() {
        let mut pipeline = pipeline();
        pipeline.gae_lambda = None;

        let result = pipeline.stage_settings(0, &Options::new());
        assert!(matches!(
            result,
            Err(ConfigError::MissingValue {
                field: "gae_lambda"
            })
        ));
    }

    #[test]
    fn unknown_loss_rejected() {
        let mut pipeline = pipeline();
        pipeline.stages[0].loss_names.push("aux_loss".into());
        assert!(matches!(
            pipeline.validate(),
            Err(ConfigError::UnknownLoss { .. })
        ));
    }

    #[test]
    fn unbounded_stage_rejected() {
        let mut pipeline = pipeline();
        pipeline.stages[0].max_stage_steps = None;
        assert!(matches!(
            pipeline.validate(),
            Err(ConfigError::UnboundedStage)
        ));
    }

    #[test]
    fn stage_advancement_exhausts() {
        let mut pipeline = pipeline();
        pipeline.stages.push(PipelineStage::new(["ppo_loss"], 2000));

        assert_eq!(pipeline.current_stage_index(), Some(0));
        pipeline.advance_stage();
        assert_eq!(pipeline.current_stage_index(), Some(1));
        pipeline.advance_stage();
        assert_eq!(pipeline.current_stage_index(), None);
    }

    #[test]
    fn default_loss_weights_are_unit() {
        let stage = PipelineStage::new(["a", "b"], 10);
        let weights = stage.loss_weights_by_name();
        assert_eq!(weights.len(), 2);
        assert_eq!(weights["a"], 1.0);
        assert_eq!(weights["b"], 1.0);
    }
}
