//! The training, validation, and testing controller.
mod validation;

use crate::checkpoint::{self, Checkpoint};
use crate::error::{CheckpointError, ConfigError, EngineError};
use crate::experiment::{advise, ExperimentConfig, MachineParams, Mode, Options};
use crate::logging::{MetricsSink, NullSink, ScalarMeanTracker, TensorBoardSink};
use crate::observation::{batch_observations, ObservationTree, SensorPath};
use crate::optim::{clip_grad_norm_inf, Adam};
use crate::pipeline::{LinearDecay, StageSettings, TrainingPipeline};
use crate::policy::{ActionDistribution, ActorCritic};
use crate::storage::{RolloutStorage, Transition};
use crate::tasks::{
    metrics_channel, MetricsMessage, MetricsReceiver, MetricsSender, TeacherPackage,
    UpdatePackage, VectorTasks,
};
use crate::Prng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tch::{nn, Device, Kind, Tensor};
use validation::ValidationWorker;

/// Worker seeds drawn from the trainer seed stream.
///
/// The range matches what downstream simulator seed types can represent.
fn worker_seeds(rng: &mut Prng, nprocesses: i64) -> Vec<u64> {
    (0..nprocesses)
        .map(|_| rng.gen_range(0..=i32::MAX as u64))
        .collect()
}

fn local_time_string() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn select_device(gpu_ids: &[i64]) -> Device {
    match gpu_ids.first() {
        Some(&first) if tch::Cuda::is_available() => Device::Cuda(first as usize),
        Some(_) => {
            advise("no CUDA devices available; falling back to the CPU");
            Device::Cpu
        }
        None => Device::Cpu,
    }
}

/// The loss as a finite scalar, if it is one.
fn scalar_loss_value(loss: &Tensor) -> Option<f64> {
    if !(loss.size().is_empty() || loss.size() == [1]) {
        return None;
    }
    match loss.kind() {
        Kind::Float | Kind::Double => {
            let value = f64::from(loss);
            value.is_finite().then(|| value)
        }
        _ => None,
    }
}

/// Per-stage state resolved by `setup_stage`.
#[derive(Debug)]
struct ActiveStage {
    index: usize,
    loss_names: Vec<String>,
    loss_weights: BTreeMap<String, f64>,
    settings: StageSettings,
    /// Rollouts to run before the stage's step budget is spent, if it has
    /// one.
    num_rollouts: Option<i64>,
    teacher_forcing: Option<LinearDecay>,
}

/// The reinforcement learning primary controller.
///
/// One engine handles one mode: training engines run the pipeline and
/// spawn a background validation worker, while validation and test engines
/// evaluate checkpoints deterministically. Engines are not expected to be
/// constructed directly by experiment code; a thin launcher builds one
/// from an [`ExperimentConfig`] and calls
/// [`run_pipeline`](Self::run_pipeline) or [`run_test`](Self::run_test).
pub struct Engine<C: ExperimentConfig> {
    config: C,
    mode: Mode,
    device: Device,
    output_dir: PathBuf,
    experiment_tag: String,
    machine_params: MachineParams,
    pipeline: TrainingPipeline,
    var_store: nn::VarStore,
    actor_critic: Box<dyn ActorCritic>,
    optimizer: Option<Adam>,
    lr_scheduler: Option<LinearDecay>,
    tasks: Box<dyn VectorTasks>,
    metrics_sender: MetricsSender,
    metrics_receiver: MetricsReceiver,
    scalars: ScalarMeanTracker,
    sink: Box<dyn MetricsSink>,
    validation: Option<ValidationWorker>,
    seed: Option<u64>,
    rng: Prng,
    num_processes: i64,
    save_interval: i64,
    log_interval: i64,
    deterministic_agent: bool,
    active: Option<ActiveStage>,
    last_valid_metrics: Option<BTreeMap<String, f64>>,

    total_updates: i64,
    rollout_count: i64,
    backprop_count: i64,
    /// Task steps taken within the current stage.
    step_count: i64,
    /// Task steps taken in completed stages.
    total_steps: i64,
    last_log: i64,
    last_save: i64,
    local_start_time: String,
    last_scheduler_steps: Option<i64>,
    closed: bool,
}

impl<C> Engine<C>
where
    C: ExperimentConfig + Clone + Send + 'static,
{
    /// Build an engine for the given mode.
    ///
    /// Training engines construct the optimizer and, when the experiment
    /// allocates validation processes, spawn the background validation
    /// worker. If a seed is supplied, per-worker seeds are derived from it
    /// deterministically and passed to the task samplers.
    pub fn new(
        config: C,
        output_dir: impl Into<PathBuf>,
        mode: Mode,
        seed: Option<u64>,
    ) -> Result<Self, EngineError> {
        let output_dir = output_dir.into();
        let machine_params = config.machine_params(mode);
        let device = select_device(&machine_params.gpu_ids);
        let pipeline = config.training_pipeline();
        pipeline.validate()?;

        let mut rng = seed.map_or_else(Prng::from_entropy, Prng::seed_from_u64);
        let num_processes = machine_params.nprocesses;
        let seeds = seed.map(|_| worker_seeds(&mut rng, num_processes));

        let var_store = nn::VarStore::new(device);
        let actor_critic = config.create_model(&var_store.root());
        let optimizer = match mode {
            Mode::Train => Some(Adam::new(&var_store, pipeline.optimizer.clone())),
            Mode::Valid | Mode::Test => None,
        };
        let lr_scheduler = pipeline.lr_scheduler;

        let (metrics_sender, metrics_receiver) = metrics_channel();
        #[allow(clippy::cast_sign_loss)]
        let sampler_options: Vec<Options> = (0..num_processes)
            .map(|process_ind| {
                config.sampler_options(
                    mode,
                    process_ind as usize,
                    num_processes as usize,
                    &machine_params.gpu_ids,
                    seeds.as_deref(),
                )
            })
            .collect();
        let tasks = config.make_task_pool(mode, &sampler_options, metrics_sender.clone())?;

        let validation = if mode == Mode::Train {
            if config.machine_params(Mode::Valid).nprocesses > 0 {
                Some(ValidationWorker::spawn(
                    config.clone(),
                    output_dir.clone(),
                    seed,
                    metrics_sender.clone(),
                ))
            } else {
                advise("no processes allocated to validation; validation will not be run");
                None
            }
        } else {
            None
        };

        let experiment_tag = config.tag();
        let save_interval = pipeline.save_interval;
        let log_interval = pipeline.log_interval;

        Ok(Self {
            config,
            mode,
            device,
            output_dir,
            experiment_tag,
            machine_params,
            pipeline,
            var_store,
            actor_critic,
            optimizer,
            lr_scheduler,
            tasks,
            metrics_sender,
            metrics_receiver,
            scalars: ScalarMeanTracker::new(),
            sink: Box::new(NullSink),
            validation,
            seed,
            rng,
            num_processes,
            save_interval,
            log_interval,
            deterministic_agent: mode != Mode::Train,
            active: None,
            last_valid_metrics: None,
            total_updates: 0,
            rollout_count: 0,
            backprop_count: 0,
            step_count: 0,
            total_steps: 0,
            last_log: 0,
            last_save: 0,
            local_start_time: local_time_string(),
            last_scheduler_steps: None,
            closed: false,
        })
    }
}

impl<C: ExperimentConfig> Engine<C> {
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// The experiment configuration this engine was built from.
    pub const fn config(&self) -> &C {
        &self.config
    }

    /// Task steps taken in completed stages.
    pub const fn total_steps(&self) -> i64 {
        self.total_steps
    }

    /// Task steps taken within the current stage.
    pub const fn step_count(&self) -> i64 {
        self.step_count
    }

    pub const fn pipeline(&self) -> &TrainingPipeline {
        &self.pipeline
    }

    fn optimizer_mut(&mut self) -> &mut Adam {
        self.optimizer
            .as_mut()
            .expect("the optimizer is only used by train-mode engines")
    }

    fn log_writer_path(&self) -> PathBuf {
        self.output_dir
            .join("tb")
            .join(&self.experiment_tag)
            .join(&self.local_start_time)
    }

    fn new_rollouts(&self, num_steps: i64) -> RolloutStorage {
        RolloutStorage::new(
            num_steps,
            self.num_processes,
            self.actor_critic.action_space(),
            self.actor_critic.recurrent_hidden_state_size(),
            self.actor_critic.num_recurrent_layers(),
            self.device,
        )
    }

    /// Resolve the stage's knobs and install it as the active stage.
    fn setup_stage(&mut self, stage_index: usize) -> Result<(), ConfigError> {
        let settings = self
            .pipeline
            .stage_settings(stage_index, &self.machine_params.options)?;
        let stage = &self.pipeline.stages[stage_index];
        let num_rollouts = settings
            .max_stage_steps
            .map(|budget| (budget / settings.num_steps) / self.num_processes);

        self.active = Some(ActiveStage {
            index: stage_index,
            loss_names: stage.loss_names.clone(),
            loss_weights: stage.loss_weights_by_name(),
            settings,
            num_rollouts,
            teacher_forcing: stage.teacher_forcing,
        });
        Ok(())
    }

    /// Pause every worker that signalled completion and batch the rest.
    ///
    /// Returns the number of workers paused, the indices of those kept,
    /// and their observations stacked along a new process axis (`None` if
    /// every worker finished).
    fn remove_paused(
        &mut self,
        observations: Vec<Option<ObservationTree>>,
    ) -> Result<(usize, Vec<i64>, Option<ObservationTree>), EngineError> {
        let mut paused = Vec::new();
        let mut keep = Vec::new();
        let mut running = Vec::new();
        for (index, observation) in observations.into_iter().enumerate() {
            match observation {
                None => paused.push(index),
                Some(observation) => {
                    keep.push(index as i64);
                    running.push(observation);
                }
            }
        }

        for &index in paused.iter().rev() {
            self.tasks.pause_at(index)?;
        }

        let batch = if running.is_empty() {
            None
        } else {
            let refs: Vec<&ObservationTree> = running.iter().collect();
            Some(batch_observations(&refs, self.device)?)
        };
        Ok((paused.len(), keep, batch))
    }

    /// Reset the storage to the pool's initial observations.
    fn initialize_rollouts(
        &mut self,
        rollouts: &mut RolloutStorage,
    ) -> Result<usize, EngineError> {
        let observations = self
            .tasks
            .get_observations()?
            .into_iter()
            .map(Some)
            .collect();
        let (num_paused, keep, batch) = self.remove_paused(observations)?;
        rollouts.reshape(&keep);
        if let Some(batch) = batch {
            rollouts.insert_initial_observations(&batch, 0);
        }
        Ok(num_paused)
    }

    /// Substitute the expert's action wherever a sampled Bernoulli mask and
    /// the expert-action-exists flag both allow it.
    ///
    /// The realized substitution ratio and the scheduled probability are
    /// reported on the metrics queue every step, including steps where the
    /// schedule has decayed to zero.
    fn apply_teacher_forcing(
        &mut self,
        actions: &Tensor,
        step_observation: &ObservationTree,
        schedule: LinearDecay,
    ) -> Result<Tensor, ConfigError> {
        // [N, 2]: the expert's action and whether one exists for this
        // transition.
        let expert = step_observation
            .get(&SensorPath::leaf("expert_action"))
            .ok_or(ConfigError::TeacherForcingWithoutExpert)?;
        let expert_actions = expert.narrow(1, 0, 1);
        let expert_exists = expert.narrow(1, 1, 1);

        let probability = schedule.call(self.step_count).clamp(0.0, 1.0);
        let num_workers = actions.size()[0];
        let sampled: Vec<i64> = (0..num_workers)
            .map(|_| i64::from(self.rng.gen_bool(probability)))
            .collect();
        let mask = Tensor::of_slice(&sampled)
            .reshape(&[num_workers, 1])
            .to_device(self.device)
            * expert_exists;

        #[allow(clippy::cast_precision_loss)]
        let teacher_ratio = f64::from(mask.sum(Kind::Float)) / num_workers as f64;
        let _ = self.metrics_sender.send(MetricsMessage::Teacher(TeacherPackage {
            teacher_ratio,
            teacher_enforcing: probability,
        }));

        if probability == 0.0 {
            return Ok(actions.shallow_clone());
        }
        let complement = -&mask + 1;
        Ok(&mask * expert_actions + complement * actions)
    }

    /// Sample one action per worker, step the pool, pause finished workers,
    /// and insert the transition.
    ///
    /// Returns the number of workers paused this step.
    fn collect_rollout_step(
        &mut self,
        rollouts: &mut RolloutStorage,
    ) -> Result<usize, EngineError> {
        let step = rollouts.step();
        let step_observation = rollouts.pick_observation_step(step, self.device);
        let output = {
            let _guard = tch::no_grad_guard();
            self.actor_critic.forward(
                &step_observation,
                &rollouts.recurrent_hidden_states.get(step),
                &rollouts.prev_actions.get(step),
                &rollouts.masks.get(step),
            )
        };

        let mut actions = if self.deterministic_agent {
            output.distribution.mode()
        } else {
            output.distribution.sample()
        };

        if let Some(schedule) = self.active.as_ref().and_then(|stage| stage.teacher_forcing) {
            actions = self.apply_teacher_forcing(&actions, &step_observation, schedule)?;
        }

        if self.mode == Mode::Train {
            self.step_count += actions.size().iter().product::<i64>();
        }

        let task_steps = self.tasks.step(&actions)?;
        let mut rewards = Vec::with_capacity(task_steps.len());
        let mut masks = Vec::with_capacity(task_steps.len());
        let mut observations = Vec::with_capacity(task_steps.len());
        for task_step in task_steps {
            #[allow(clippy::cast_possible_truncation)]
            rewards.push(task_step.reward as f32);
            masks.push(if task_step.done { 0.0_f32 } else { 1.0 });
            observations.push(task_step.observation);
        }
        let rewards = Tensor::of_slice(&rewards).unsqueeze(1).to_device(self.device);
        let masks = Tensor::of_slice(&masks).unsqueeze(1).to_device(self.device);

        let (num_paused, keep, batch) = self.remove_paused(observations)?;
        let batch = match batch {
            Some(batch) => batch,
            // Every worker finished at once; there is nothing to insert.
            None => return Ok(num_paused),
        };

        rollouts.reshape(&keep);

        let index = Tensor::of_slice(&keep).to_device(self.device);
        let action_log_probs = output.distribution.log_probs(&actions);
        rollouts.insert(Transition {
            observations: batch,
            recurrent_hidden_states: output.hidden_states.index_select(1, &index),
            actions: actions.index_select(0, &index),
            action_log_probs: action_log_probs.index_select(0, &index),
            value_preds: output.values.index_select(0, &index),
            rewards: rewards.index_select(0, &index),
            masks: masks.index_select(0, &index),
        });

        Ok(num_paused)
    }

    /// Optimize the active stage's weighted losses over the collected
    /// rollout.
    ///
    /// A total loss that is not a finite scalar is reported as a warning
    /// and that gradient step is skipped.
    fn update(&mut self, rollouts: &RolloutStorage) -> Result<(), EngineError> {
        let stage = self
            .active
            .as_ref()
            .expect("update requires an active stage");
        let settings = stage.settings;
        let loss_names = stage.loss_names.clone();
        let loss_weights = stage.loss_weights.clone();

        let num_steps = rollouts.num_steps();
        let advantages = rollouts.returns.narrow(0, 0, num_steps)
            - rollouts.value_preds.narrow(0, 0, num_steps);

        for _epoch in 0..settings.update_repeats {
            let batches = rollouts.recurrent_generator(
                &advantages,
                settings.num_mini_batch,
                self.device,
                &mut self.rng,
            )?;
            for batch in batches {
                let output = self.actor_critic.forward(
                    &batch.observations,
                    &batch.recurrent_hidden_states,
                    &batch.prev_actions,
                    &batch.masks,
                );

                self.optimizer_mut().zero_grad();

                let mut total_loss: Option<Tensor> = None;
                let mut losses = BTreeMap::new();
                for name in &loss_names {
                    let (value, info) = self.pipeline.named_losses[name].loss(&batch, &output);
                    let weighted = value * loss_weights[name];
                    total_loss = Some(match total_loss {
                        Some(total) => total + weighted,
                        None => weighted,
                    });
                    losses.insert(name.clone(), info);
                }
                let total_loss = total_loss.expect("no losses specified");

                let loss_value = match scalar_loss_value(&total_loss) {
                    Some(value) => value,
                    None => {
                        advise("total loss was not a finite scalar; skipping this update step");
                        continue;
                    }
                };

                let learning_rate = self
                    .lr_scheduler
                    .is_some()
                    .then(|| self.optimizer_mut().learning_rate());
                let _ = self.metrics_sender.send(MetricsMessage::Update(UpdatePackage {
                    total_loss: loss_value,
                    learning_rate,
                    losses,
                }));

                total_loss.backward();
                clip_grad_norm_inf(
                    self.var_store.trainable_variables().iter(),
                    settings.max_grad_norm,
                );
                self.optimizer_mut().step();
                self.backprop_count += 1;
            }
        }
        Ok(())
    }

    /// Collect-optimize until the active stage's budget is spent or its
    /// early-stopping criterion fires.
    fn train_stage(&mut self, rollouts: &mut RolloutStorage) -> Result<(), EngineError> {
        self.initialize_rollouts(rollouts)?;

        let stage = self
            .active
            .as_ref()
            .expect("train_stage requires an active stage");
        let num_rollouts = stage.num_rollouts;
        let settings = stage.settings;

        while num_rollouts.map_or(true, |limit| self.rollout_count < limit) {
            for _ in 0..settings.num_steps {
                self.collect_rollout_step(rollouts)?;
            }

            let next_value = {
                let _guard = tch::no_grad_guard();
                let last = rollouts.num_steps();
                let last_observation = rollouts.pick_observation_step(last, self.device);
                self.actor_critic
                    .forward(
                        &last_observation,
                        &rollouts.recurrent_hidden_states.get(last),
                        &rollouts.prev_actions.get(last),
                        &rollouts.masks.get(last),
                    )
                    .values
            };
            rollouts.compute_returns(
                &next_value,
                settings.use_gae,
                settings.gamma,
                settings.gae_lambda,
            );

            self.update(rollouts)?;
            rollouts.after_update();

            if let Some(schedule) = self.lr_scheduler {
                let scheduler_steps = self.total_steps + self.step_count;
                let learning_rate =
                    self.pipeline.optimizer.learning_rate * schedule.call(scheduler_steps);
                self.optimizer_mut().set_learning_rate(learning_rate);
                self.last_scheduler_steps = Some(scheduler_steps);
            }

            self.rollout_count += 1;
            let last_rollout = num_rollouts.map_or(false, |limit| self.rollout_count >= limit);

            let mut stop = false;
            if self.step_count - self.last_log >= self.log_interval || last_rollout {
                self.drain_metrics();
                stop = self.evaluate_early_stopping();
                self.flush_metrics();
                self.last_log = self.step_count;
            }

            if self.save_interval > 0
                && (self.step_count - self.last_save >= self.save_interval
                    || last_rollout
                    || stop)
            {
                let path = self.checkpoint_save()?;
                if let Some(validation) = &self.validation {
                    validation.notify(&path);
                }
                self.last_save = self.step_count;
            }

            if stop {
                break;
            }
        }
        Ok(())
    }

    fn evaluate_early_stopping(&mut self) -> bool {
        let stage_index = match &self.active {
            Some(stage) => stage.index,
            None => return false,
        };
        match &mut self.pipeline.stages[stage_index].early_stopping_criterion {
            Some(criterion) => criterion.early_stop(
                self.step_count,
                self.total_steps + self.step_count,
                &self.scalars,
                self.last_valid_metrics.as_ref(),
            ),
            None => false,
        }
    }

    /// Move every queued metrics payload into the tracker; evaluation
    /// metrics go straight to the sink at their recorded steps.
    fn drain_metrics(&mut self) {
        while let Ok(message) = self.metrics_receiver.try_recv() {
            match message {
                MetricsMessage::Task(scalars) => self.scalars.add_scalars(&scalars),
                MetricsMessage::Update(package) => {
                    self.scalars.add_scalar("total_loss", package.total_loss);
                    if let Some(learning_rate) = package.learning_rate {
                        self.scalars.add_scalar("lr", learning_rate);
                    }
                    for (loss_name, scalars) in &package.losses {
                        let loss_name = loss_name.strip_suffix("_loss").unwrap_or(loss_name);
                        for (name, value) in scalars {
                            self.scalars
                                .add_scalar(&format!("{}/{}", loss_name, name), *value);
                        }
                    }
                }
                MetricsMessage::Teacher(package) => {
                    self.scalars
                        .add_scalar("teacher_ratio", package.teacher_ratio);
                    self.scalars
                        .add_scalar("teacher_enforcing", package.teacher_enforcing);
                }
                MetricsMessage::Valid(metrics) => {
                    self.last_valid_metrics = Some(
                        metrics
                            .iter()
                            .map(|(name, (value, _))| (name.clone(), *value))
                            .collect(),
                    );
                    for (name, (value, at_step)) in metrics {
                        self.sink
                            .add_scalar(&format!("valid/{}", name), value, at_step);
                    }
                }
                MetricsMessage::Test(metrics) => {
                    for (name, (value, at_step)) in metrics {
                        self.sink
                            .add_scalar(&format!("test/{}", name), value, at_step);
                    }
                }
            }
        }
    }

    /// Flush accumulated means to the sink at the current global step.
    fn flush_metrics(&mut self) {
        let step = self.total_steps + self.step_count;
        for (name, value) in self.scalars.pop_and_reset() {
            self.sink.add_scalar(&format!("train/{}", name), value, step);
        }
        self.sink.flush();
    }

    /// Drain the metrics queue and flush the accumulated means.
    pub fn log(&mut self) {
        self.drain_metrics();
        self.flush_metrics();
    }

    /// Persist the full training state under the per-run checkpoint
    /// directory.
    ///
    /// When seeded, each save first rotates the trainer seed and pushes a
    /// freshly derived worker-seed list to the task pool, so the persisted
    /// seeds always describe the pool's state going forward.
    pub fn checkpoint_save(&mut self) -> Result<PathBuf, EngineError> {
        let folder = self
            .output_dir
            .join("checkpoints")
            .join(&self.local_start_time);
        fs::create_dir_all(&folder).map_err(CheckpointError::from)?;

        let mut seeds = None;
        if self.seed.is_some() {
            let trainer_seed = self.rng.gen_range(0..=i32::MAX as u64);
            self.seed = Some(trainer_seed);
            self.rng = Prng::seed_from_u64(trainer_seed);
            let worker = worker_seeds(&mut self.rng, self.num_processes);
            self.tasks.set_seeds(&worker)?;
            seeds = Some(worker);
        }

        let name = checkpoint::checkpoint_file_name(
            &self.experiment_tag,
            &self.local_start_time,
            self.pipeline.current_stage,
            self.total_steps + self.step_count,
            self.seed,
        );
        let path = folder.join(name);

        Checkpoint {
            total_updates: self.total_updates,
            total_steps: self.total_steps,
            pipeline_stage: self.pipeline.current_stage,
            rollout_count: self.rollout_count,
            backprop_count: self.backprop_count,
            step_count: self.step_count,
            local_start_time: self.local_start_time.clone(),
            trainer_seed: self.seed,
            worker_seeds: seeds,
            scheduler_steps: self.last_scheduler_steps,
        }
        .save(&path)?;

        self.var_store.save(checkpoint::model_path(&path))?;
        if let Some(optimizer) = &self.optimizer {
            Tensor::save_multi(&optimizer.state_tensors(), checkpoint::optimizer_path(&path))?;
        }
        Ok(path)
    }

    /// Restore the state saved by [`checkpoint_save`](Self::checkpoint_save).
    ///
    /// Training engines restore everything, re-derive the worker seeds from
    /// the stored trainer seed, and verify they match the stored list
    /// before re-seeding the pool. Evaluation engines restore only the
    /// model and the step accounting.
    pub fn checkpoint_load(&mut self, path: &Path) -> Result<(), EngineError> {
        let record = Checkpoint::load(path)?;
        self.var_store.load(checkpoint::model_path(path))?;
        self.step_count = record.step_count;
        self.total_steps = record.total_steps;

        if self.mode == Mode::Train {
            let named = Tensor::load_multi(checkpoint::optimizer_path(path))?;
            self.optimizer_mut()
                .load_state_tensors(&named)
                .map_err(CheckpointError::from)?;
            self.backprop_count = record.backprop_count;
            self.rollout_count = record.rollout_count;
            self.total_updates = record.total_updates;
            self.pipeline.current_stage = record.pipeline_stage;
            self.local_start_time = record.local_start_time.clone();
            self.seed = record.trainer_seed;
            if let Some(trainer_seed) = record.trainer_seed {
                self.rng = Prng::seed_from_u64(trainer_seed);
                let seeds = worker_seeds(&mut self.rng, self.num_processes);
                if record.worker_seeds.as_deref() != Some(seeds.as_slice()) {
                    return Err(ConfigError::WorkerSeedMismatch.into());
                }
                self.tasks.set_seeds(&seeds)?;
            }
            if self.lr_scheduler.is_some() {
                self.last_scheduler_steps = record.scheduler_steps;
            }
        }
        Ok(())
    }

    /// Run the training curriculum from the current stage to exhaustion,
    /// optionally resuming from a named checkpoint first.
    ///
    /// Resources are released before returning, whether the run finished or
    /// failed.
    pub fn run_pipeline(&mut self, checkpoint_file_name: Option<&str>) -> Result<(), EngineError> {
        let result = self.run_pipeline_inner(checkpoint_file_name);
        self.close();
        result
    }

    fn run_pipeline_inner(
        &mut self,
        checkpoint_file_name: Option<&str>,
    ) -> Result<(), EngineError> {
        assert_eq!(
            self.mode,
            Mode::Train,
            "run_pipeline is only for train-mode engines"
        );

        self.local_start_time = local_time_string();
        self.sink = Box::new(TensorBoardSink::new(self.log_writer_path()));
        if self.lr_scheduler.is_some() {
            self.last_scheduler_steps = Some(0);
        }

        if let Some(name) = checkpoint_file_name {
            let path = checkpoint::find_checkpoint(&self.output_dir, name)?;
            self.checkpoint_load(&path)?;
        }

        while let Some(stage_index) = self.pipeline.current_stage_index() {
            self.last_log = self.step_count - self.log_interval;
            self.last_save = self.step_count;
            self.setup_stage(stage_index)?;

            let num_steps = self
                .active
                .as_ref()
                .expect("the stage was just set up")
                .settings
                .num_steps;
            let mut rollouts = self.new_rollouts(num_steps);
            self.train_stage(&mut rollouts)?;

            self.total_updates += self.rollout_count;
            self.pipeline.advance_stage();
            self.rollout_count = 0;
            self.backprop_count = 0;
            self.total_steps += self.step_count;
            self.step_count = 0;
            self.active = None;

            // Stage boundaries return any mid-stage-paused workers.
            self.tasks.resume_all()?;
        }
        Ok(())
    }

    /// Run the policy deterministically until every worker reports
    /// completion, then resume and reset the pool.
    ///
    /// Returns aggregated scalar metrics, each paired with the
    /// checkpoint's global step count.
    pub fn run_eval(
        &mut self,
        checkpoint_path: &Path,
        rollout_steps: i64,
    ) -> Result<BTreeMap<String, (f64, i64)>, EngineError> {
        self.checkpoint_load(checkpoint_path)?;

        let mut rollouts = self.new_rollouts(rollout_steps);
        let mut num_paused = self.initialize_rollouts(&mut rollouts)? as i64;
        let mut steps = 0_i64;
        while num_paused < self.num_processes {
            num_paused += self.collect_rollout_step(&mut rollouts)? as i64;
            steps += 1;
            if steps % rollout_steps == 0 && rollouts.step() == 0 {
                rollouts.after_update();
            }
        }
        self.tasks.resume_all()?;
        self.tasks.reset_all()?;

        let at_step = self.total_steps + self.step_count;
        Ok(self
            .process_valid_metrics()
            .into_iter()
            .map(|(name, value)| (name, (value, at_step)))
            .collect())
    }

    fn process_valid_metrics(&mut self) -> BTreeMap<String, f64> {
        while let Ok(message) = self.metrics_receiver.try_recv() {
            match message {
                MetricsMessage::Task(scalars) => self.scalars.add_scalars(&scalars),
                other => advise(&format!(
                    "ignoring unexpected metrics package during evaluation: {:?}",
                    other
                )),
            }
        }
        self.scalars.pop_and_reset()
    }

    /// Evaluate a run's checkpoint series.
    ///
    /// Lists the run directory's checkpoints, strides by
    /// `skip_checkpoints` while always retaining the final one, evaluates
    /// each deterministically, and flushes its metrics before moving on.
    pub fn run_test(
        &mut self,
        experiment_date: &str,
        checkpoint_file_name: Option<&str>,
        skip_checkpoints: usize,
        rollout_steps: i64,
    ) -> Result<(), EngineError> {
        assert!(
            self.mode != Mode::Train,
            "run_test is only for valid- or test-mode engines"
        );
        self.deterministic_agent = true;

        let test_start_time = local_time_string();
        self.local_start_time = experiment_date.to_owned();

        let checkpoints = match checkpoint_file_name {
            Some(name) => vec![checkpoint::find_checkpoint(&self.output_dir, name)?],
            None => {
                let run_dir = self
                    .output_dir
                    .join("checkpoints")
                    .join(experiment_date);
                checkpoint::checkpoint_files_in(&run_dir, skip_checkpoints)?
            }
        };

        self.sink = Box::new(TensorBoardSink::new(
            self.log_writer_path()
                .join(format!("test_{}", test_start_time)),
        ));

        for checkpoint_path in checkpoints {
            let scalars = self.run_eval(&checkpoint_path, rollout_steps)?;
            let _ = self.metrics_sender.send(MetricsMessage::Test(scalars));
            self.log();
        }
        Ok(())
    }

    /// Release the task pool, the validation worker, and the metrics sink.
    ///
    /// Idempotent; also runs on drop and on the error path of
    /// [`run_pipeline`](Self::run_pipeline).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.tasks.close();
        if let Some(mut validation) = self.validation.take() {
            validation.join();
        }
        self.sink.flush();
        self.closed = true;
    }
}

impl<C: ExperimentConfig> Drop for Engine<C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ToyExperiment, EXPERT_ACTION};

    fn test_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("navrl_engine_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn run_checkpoints(engine: &Engine<ToyExperiment>, dir: &Path) -> Vec<PathBuf> {
        let run_dir = dir.join("checkpoints").join(&engine.local_start_time);
        checkpoint::checkpoint_files_in(&run_dir, 0).unwrap()
    }

    #[test]
    fn train_runs_the_full_budget() {
        let dir = test_dir("train_budget");
        let config = ToyExperiment::new(2, vec![64]);
        let mut engine = Engine::new(config, &dir, Mode::Train, Some(3)).unwrap();
        engine.run_pipeline(None).unwrap();

        // 64 steps at 4 steps per rollout over 2 workers: 8 rollouts, each
        // advancing the stage step count by 8.
        assert_eq!(engine.total_steps, 64);
        assert_eq!(engine.step_count, 0);
        assert_eq!(engine.total_updates, 8);
        assert_eq!(engine.pipeline.current_stage_index(), None);
        assert!(engine.closed);

        // The final rollout saved a checkpoint.
        assert!(!run_checkpoints(&engine, &dir).is_empty());
    }

    #[test]
    fn teacher_forcing_substitutes_expert_actions() {
        let dir = test_dir("teacher_forcing");
        let mut config = ToyExperiment::new(2, vec![32]);
        config.with_teacher_forcing = true;
        let actions_log = config.actions_log.clone();

        let mut engine = Engine::new(config, &dir, Mode::Train, Some(9)).unwrap();
        engine.run_pipeline(None).unwrap();

        // The forcing probability is pinned at 1.0, so every action the
        // pool saw is the expert's.
        let log = actions_log.lock().unwrap();
        assert_eq!(log.len(), 32);
        assert!(log.iter().all(|&action| action == EXPERT_ACTION));
    }

    #[test]
    fn nonfinite_loss_skips_updates_without_crashing() {
        let dir = test_dir("nan_loss");
        let mut config = ToyExperiment::new(2, vec![32]);
        config.nan_loss = true;
        let mut engine = Engine::new(config, &dir, Mode::Train, Some(1)).unwrap();

        let before: Vec<Tensor> = engine
            .var_store
            .trainable_variables()
            .iter()
            .map(|tensor| tensor.detach().copy())
            .collect();

        engine.run_pipeline(None).unwrap();
        assert_eq!(engine.total_steps, 32);

        // No gradient step ever ran, so the parameters are untouched.
        for (before, after) in before.iter().zip(engine.var_store.trainable_variables()) {
            assert_eq!(f64::from((before - after).abs().max()), 0.0);
        }
    }

    #[test]
    fn checkpoint_round_trip_restores_training_state() {
        let dir = test_dir("ckpt_round_trip");
        let config = ToyExperiment::new(2, vec![64]);
        let mut engine = Engine::new(config.clone(), &dir, Mode::Train, Some(11)).unwrap();
        engine.run_pipeline(None).unwrap();

        let checkpoints = run_checkpoints(&engine, &dir);
        let last = checkpoints.last().unwrap();
        let record = Checkpoint::load(last).unwrap();

        let mut restored = Engine::new(config, &dir, Mode::Train, Some(11)).unwrap();
        restored.checkpoint_load(last).unwrap();

        // The save ran before the stage-end counter reset.
        assert_eq!(restored.step_count, 64);
        assert_eq!(restored.total_steps, 0);
        assert_eq!(restored.pipeline.current_stage, 0);
        assert_eq!(restored.rollout_count, 8);
        assert_eq!(restored.seed, record.trainer_seed);
        assert_eq!(restored.last_scheduler_steps, record.scheduler_steps);

        // Model parameters match the trained engine exactly; the re-derived
        // worker seeds matched the stored list or the load would have
        // failed.
        for (trained, loaded) in engine
            .var_store
            .trainable_variables()
            .iter()
            .zip(restored.var_store.trainable_variables())
        {
            assert_eq!(f64::from((trained - loaded).abs().max()), 0.0);
        }
        restored.close();
    }

    #[test]
    fn resume_continues_the_saved_stage() {
        let dir = test_dir("resume_stage");
        let mut config = ToyExperiment::new(2, vec![32, 64]);
        config.save_interval = 16;
        let mut engine = Engine::new(config.clone(), &dir, Mode::Train, Some(5)).unwrap();
        engine.run_pipeline(None).unwrap();
        assert_eq!(engine.total_steps, 96);

        // The earliest checkpoint was taken mid-stage-0.
        let checkpoints = run_checkpoints(&engine, &dir);
        assert!(checkpoints.len() > 2);
        let first = &checkpoints[0];
        let record = Checkpoint::load(first).unwrap();
        assert_eq!(record.pipeline_stage, 0);
        assert!(record.step_count < 32);

        let mut resumed = Engine::new(config, &dir, Mode::Train, Some(5)).unwrap();
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        resumed.run_pipeline(Some(&name)).unwrap();

        // The run finished stage 0's remaining budget before stage 1.
        assert_eq!(resumed.total_steps, 96);
        assert_eq!(resumed.pipeline.current_stage_index(), None);
    }

    #[test]
    fn early_stopping_ends_the_stage_before_its_budget() {
        let dir = test_dir("early_stop");
        let mut config = ToyExperiment::new(2, vec![1024]);
        config.early_stop = true;
        let mut engine = Engine::new(config, &dir, Mode::Train, Some(21)).unwrap();
        engine.run_pipeline(None).unwrap();

        // The countdown tasks report episode metrics almost immediately, so
        // the stage ends at the first logging interval, far under budget.
        assert!(engine.total_steps > 0);
        assert!(engine.total_steps < 1024);
        assert_eq!(engine.pipeline.current_stage_index(), None);
    }

    #[test]
    fn eval_pauses_every_worker_and_aggregates_metrics() {
        let dir = test_dir("eval");
        let config = ToyExperiment::new(2, vec![32]);
        let mut engine = Engine::new(config.clone(), &dir, Mode::Train, Some(7)).unwrap();
        engine.run_pipeline(None).unwrap();
        let checkpoint = run_checkpoints(&engine, &dir).pop().unwrap();

        let mut evaluator = Engine::new(config, &dir, Mode::Test, None).unwrap();
        let scalars = evaluator.run_eval(&checkpoint, 1).unwrap();

        // Both workers completed their single episode of length 3.
        let (ep_length, at_step) = scalars["ep_length"];
        assert_eq!(ep_length, 3.0);
        assert_eq!(at_step, 32);
        assert_eq!(scalars["success"].0, 1.0);

        // The pool was resumed and reset, so a second eval works too.
        let again = evaluator.run_eval(&checkpoint, 1).unwrap();
        assert_eq!(again["ep_length"].0, 3.0);
        evaluator.close();
    }

    #[test]
    fn run_test_walks_the_checkpoint_series() {
        let dir = test_dir("run_test");
        let mut config = ToyExperiment::new(2, vec![64]);
        config.save_interval = 16;
        let mut engine = Engine::new(config.clone(), &dir, Mode::Train, Some(13)).unwrap();
        engine.run_pipeline(None).unwrap();
        assert!(run_checkpoints(&engine, &dir).len() > 1);

        let mut tester = Engine::new(config, &dir, Mode::Test, None).unwrap();
        tester
            .run_test(&engine.local_start_time, None, 1, 1)
            .unwrap();
        tester.close();
    }

    #[test]
    fn validation_worker_runs_and_joins() {
        let dir = test_dir("validation");
        let mut config = ToyExperiment::new(2, vec![32]);
        config.valid_processes = 1;
        let mut engine = Engine::new(config, &dir, Mode::Train, Some(2)).unwrap();
        engine.run_pipeline(None).unwrap();
        // close() joined the worker; reaching this point means the
        // validation engine started, consumed its notifications, and shut
        // down cleanly.
        assert!(engine.closed);
    }

    #[test]
    fn missing_checkpoint_name_fails_loudly() {
        let dir = test_dir("missing_ckpt");
        let config = ToyExperiment::new(2, vec![32]);
        let mut engine = Engine::new(config, &dir, Mode::Train, None).unwrap();
        let result = engine.run_pipeline(Some("exp_toy__time_never__stage_00.ckpt"));
        assert!(matches!(
            result,
            Err(EngineError::Checkpoint(CheckpointError::NotFound { .. }))
        ));
        // The failed run still released its resources.
        assert!(engine.closed);
    }
}
