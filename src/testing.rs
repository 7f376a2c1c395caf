//! Shared test fixtures: an in-memory serial task pool, a tiny linear
//! actor-critic, and an experiment configuration wiring them together.
use crate::error::TaskPoolError;
use crate::experiment::{ExperimentConfig, MachineParams, Mode, Options};
use crate::logging::ScalarMeanTracker;
use crate::loss::Loss;
use crate::observation::{ObservationTree, SensorPath};
use crate::optim::AdamConfig;
use crate::pipeline::{
    EarlyStoppingCriterion, LinearDecay, PipelineStage, TrainingPipeline,
};
use crate::policy::{ActionSpace, ActorCritic, Categorical, PolicyOutput};
use crate::storage::MiniBatch;
use crate::tasks::{MetricsMessage, MetricsSender, TaskStep, VectorTasks};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tch::{nn, nn::Module, Kind, Tensor};

pub(crate) const STATE_DIM: i64 = 2;
pub(crate) const NUM_ACTIONS: i64 = 3;
pub(crate) const EXPERT_ACTION: i64 = 2;

/// An in-memory serial pool of episodic countdown tasks.
///
/// Worker `i` counts down from `episode_length`; the episode ends when the
/// counter reaches zero. With a finite episode budget (the evaluation
/// modes) a worker that exhausts its budget reports `None` and waits to be
/// paused.
pub(crate) struct CountdownTasks {
    episode_length: i64,
    episode_budget: Option<i64>,
    remaining: Vec<i64>,
    episodes_left: Vec<Option<i64>>,
    paused: Vec<bool>,
    with_expert: bool,
    seeds: Vec<u64>,
    metrics: MetricsSender,
    actions_log: Arc<Mutex<Vec<i64>>>,
    closed: bool,
}

impl CountdownTasks {
    pub(crate) fn new(
        num_workers: usize,
        episode_length: i64,
        episode_budget: Option<i64>,
        with_expert: bool,
        metrics: MetricsSender,
        actions_log: Arc<Mutex<Vec<i64>>>,
    ) -> Self {
        Self {
            episode_length,
            episode_budget,
            remaining: vec![episode_length; num_workers],
            episodes_left: vec![episode_budget; num_workers],
            paused: vec![false; num_workers],
            with_expert,
            seeds: Vec::new(),
            metrics,
            actions_log,
            closed: false,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn observation(&self, worker: usize) -> ObservationTree {
        let progress = self.remaining[worker] as f32 / self.episode_length as f32;
        let mut entries = vec![
            (
                SensorPath::leaf("state"),
                Tensor::of_slice(&[progress, worker as f32]),
            ),
            (
                SensorPath::nested(["target", "distance"]),
                Tensor::of_slice(&[self.remaining[worker] as f32]),
            ),
        ];
        if self.with_expert {
            entries.push((
                SensorPath::leaf("expert_action"),
                Tensor::of_slice(&[EXPERT_ACTION, 1]),
            ));
        }
        ObservationTree::from_flattened(entries).unwrap()
    }

    fn active_indices(&self) -> Vec<usize> {
        (0..self.remaining.len())
            .filter(|&worker| !self.paused[worker])
            .collect()
    }
}

impl VectorTasks for CountdownTasks {
    fn num_tasks(&self) -> usize {
        self.active_indices().len()
    }

    fn step(&mut self, actions: &Tensor) -> Result<Vec<TaskStep>, TaskPoolError> {
        if self.closed {
            return Err(TaskPoolError::Closed);
        }
        let active = self.active_indices();
        assert_eq!(actions.size()[0], active.len() as i64);
        self.actions_log
            .lock()
            .unwrap()
            .extend(Vec::<i64>::from(actions.view([-1])));

        let mut steps = Vec::with_capacity(active.len());
        for &worker in &active {
            self.remaining[worker] -= 1;
            let done = self.remaining[worker] <= 0;
            let reward = if done { 1.0 } else { -0.1 };
            let observation = if done {
                #[allow(clippy::cast_precision_loss)]
                let _ = self.metrics.send(MetricsMessage::Task(BTreeMap::from([
                    ("ep_length".to_owned(), self.episode_length as f64),
                    ("success".to_owned(), 1.0),
                ])));
                if let Some(left) = &mut self.episodes_left[worker] {
                    *left -= 1;
                }
                if self.episodes_left[worker] == Some(0) {
                    None
                } else {
                    self.remaining[worker] = self.episode_length;
                    Some(self.observation(worker))
                }
            } else {
                Some(self.observation(worker))
            };
            steps.push(TaskStep {
                observation,
                reward,
                done,
                info: BTreeMap::new(),
            });
        }
        Ok(steps)
    }

    fn get_observations(&mut self) -> Result<Vec<ObservationTree>, TaskPoolError> {
        Ok(self
            .active_indices()
            .iter()
            .map(|&worker| self.observation(worker))
            .collect())
    }

    fn pause_at(&mut self, index: usize) -> Result<(), TaskPoolError> {
        let worker = self.active_indices()[index];
        self.paused[worker] = true;
        Ok(())
    }

    fn resume_all(&mut self) -> Result<(), TaskPoolError> {
        self.paused.fill(false);
        Ok(())
    }

    fn reset_all(&mut self) -> Result<(), TaskPoolError> {
        self.remaining.fill(self.episode_length);
        self.episodes_left.fill(self.episode_budget);
        Ok(())
    }

    fn set_seeds(&mut self, seeds: &[u64]) -> Result<(), TaskPoolError> {
        self.seeds = seeds.to_vec();
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// A linear actor-critic over the "state" sensor with a pass-through
/// recurrent state.
pub(crate) struct TinyNav {
    head: nn::Linear,
    hidden_size: i64,
}

impl TinyNav {
    pub(crate) fn new(vs: &nn::Path) -> Self {
        Self {
            head: nn::linear(
                vs / "head",
                STATE_DIM,
                NUM_ACTIONS + 1,
                nn::LinearConfig::default(),
            ),
            hidden_size: 4,
        }
    }
}

impl ActorCritic for TinyNav {
    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(NUM_ACTIONS)
    }

    fn recurrent_hidden_state_size(&self) -> i64 {
        self.hidden_size
    }

    fn num_recurrent_layers(&self) -> i64 {
        1
    }

    fn forward(
        &self,
        observations: &ObservationTree,
        hidden_states: &Tensor,
        _prev_actions: &Tensor,
        masks: &Tensor,
    ) -> PolicyOutput {
        let state = observations
            .get(&SensorPath::leaf("state"))
            .expect("the state sensor is present");
        let out = self.head.forward(state);
        let logits = out.narrow(1, 0, NUM_ACTIONS);
        let values = out.narrow(1, NUM_ACTIONS, 1);
        // Zero the carried state at episode boundaries like a real
        // recurrent model would.
        let hidden_states = hidden_states * &masks.view([1, -1, 1]);
        PolicyOutput {
            distribution: Box::new(Categorical::new(&logits)),
            values,
            hidden_states,
        }
    }
}

/// Mean squared error between predicted values and computed returns.
pub(crate) struct ValueLoss;

impl Loss for ValueLoss {
    fn loss(&self, batch: &MiniBatch, output: &PolicyOutput) -> (Tensor, BTreeMap<String, f64>) {
        let error = &output.values - &batch.returns;
        let loss = (&error * &error).mean(Kind::Float);
        let info = BTreeMap::from([("value".to_owned(), f64::from(&loss))]);
        (loss, info)
    }
}

/// Always produces a NaN total loss.
pub(crate) struct NanLoss;

impl Loss for NanLoss {
    fn loss(&self, _: &MiniBatch, _: &PolicyOutput) -> (Tensor, BTreeMap<String, f64>) {
        (Tensor::from(f32::NAN), BTreeMap::new())
    }
}

/// Stops a stage once any training metric has been observed.
pub(crate) struct StopOnAnyMetric;

impl EarlyStoppingCriterion for StopOnAnyMetric {
    fn early_stop(
        &mut self,
        _stage_steps: i64,
        _total_steps: i64,
        training_metrics: &ScalarMeanTracker,
        _valid_metrics: Option<&BTreeMap<String, f64>>,
    ) -> bool {
        !training_metrics.is_empty()
    }
}

/// An experiment over [`CountdownTasks`] and [`TinyNav`].
#[derive(Clone)]
pub(crate) struct ToyExperiment {
    pub(crate) num_processes: i64,
    pub(crate) stage_steps: Vec<i64>,
    pub(crate) valid_processes: i64,
    pub(crate) eval_episodes: i64,
    pub(crate) episode_length: i64,
    pub(crate) with_teacher_forcing: bool,
    pub(crate) nan_loss: bool,
    pub(crate) early_stop: bool,
    pub(crate) save_interval: i64,
    /// Every action the pool ever received, for assertions.
    pub(crate) actions_log: Arc<Mutex<Vec<i64>>>,
}

impl ToyExperiment {
    pub(crate) fn new(num_processes: i64, stage_steps: Vec<i64>) -> Self {
        Self {
            num_processes,
            stage_steps,
            valid_processes: 0,
            eval_episodes: 1,
            episode_length: 3,
            with_teacher_forcing: false,
            nan_loss: false,
            early_stop: false,
            save_interval: 1_000_000,
            actions_log: Arc::default(),
        }
    }
}

impl ExperimentConfig for ToyExperiment {
    fn tag(&self) -> String {
        "toy_nav".to_owned()
    }

    fn training_pipeline(&self) -> TrainingPipeline {
        let mut named_losses: BTreeMap<String, Box<dyn Loss>> = BTreeMap::new();
        if self.nan_loss {
            named_losses.insert("nav_loss".to_owned(), Box::new(NanLoss));
        } else {
            named_losses.insert("nav_loss".to_owned(), Box::new(ValueLoss));
        }

        let stages = self
            .stage_steps
            .iter()
            .map(|&budget| {
                let mut stage = PipelineStage::new(["nav_loss"], budget);
                if self.with_teacher_forcing {
                    stage.teacher_forcing = Some(LinearDecay {
                        steps: 1_000_000,
                        startp: 1.0,
                        endp: 1.0,
                    });
                }
                if self.early_stop {
                    stage.early_stopping_criterion = Some(Box::new(StopOnAnyMetric));
                }
                stage
            })
            .collect();

        TrainingPipeline {
            optimizer: AdamConfig {
                learning_rate: 1e-2,
                ..AdamConfig::default()
            },
            lr_scheduler: Some(LinearDecay {
                steps: 10_000,
                startp: 1.0,
                endp: 0.1,
            }),
            named_losses,
            stages,
            save_interval: self.save_interval,
            log_interval: 8,
            current_stage: 0,
            num_steps: Some(4),
            update_repeats: Some(1),
            num_mini_batch: Some(1),
            gamma: Some(0.99),
            use_gae: Some(true),
            gae_lambda: Some(0.95),
            max_grad_norm: Some(0.5),
        }
    }

    fn machine_params(&self, mode: Mode) -> MachineParams {
        let nprocesses = match mode {
            Mode::Train | Mode::Test => self.num_processes,
            Mode::Valid => self.valid_processes,
        };
        MachineParams {
            nprocesses,
            gpu_ids: vec![],
            options: Options::new(),
        }
    }

    fn create_model(&self, vs: &nn::Path) -> Box<dyn ActorCritic> {
        Box::new(TinyNav::new(vs))
    }

    fn make_task_pool(
        &self,
        mode: Mode,
        sampler_options: &[Options],
        metrics: MetricsSender,
    ) -> Result<Box<dyn VectorTasks>, TaskPoolError> {
        let episode_budget = match mode {
            Mode::Train => None,
            Mode::Valid | Mode::Test => Some(self.eval_episodes),
        };
        Ok(Box::new(CountdownTasks::new(
            sampler_options.len(),
            self.episode_length,
            episode_budget,
            self.with_teacher_forcing,
            metrics,
            Arc::clone(&self.actions_log),
        )))
    }

    fn sampler_options(
        &self,
        _mode: Mode,
        process_ind: usize,
        _total_processes: usize,
        _devices: &[i64],
        seeds: Option<&[u64]>,
    ) -> Options {
        let mut options = Options::new();
        if let Some(seeds) = seeds {
            #[allow(clippy::cast_possible_wrap)]
            options.set_i64("seed", seeds[process_ind] as i64);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::metrics_channel;
    use tch::Device;

    fn pool(num_workers: usize, episode_budget: Option<i64>) -> CountdownTasks {
        let (sender, _receiver) = metrics_channel();
        // The receiver is dropped; sends are allowed to fail quietly.
        CountdownTasks::new(num_workers, 2, episode_budget, false, sender, Arc::default())
    }

    fn zero_actions(num_workers: i64) -> Tensor {
        Tensor::zeros(&[num_workers, 1], (Kind::Int64, Device::Cpu))
    }

    #[test]
    fn countdown_episodes_end_and_restart() {
        let mut tasks = pool(2, None);
        let first = tasks.step(&zero_actions(2)).unwrap();
        assert!(first.iter().all(|step| !step.done));

        let second = tasks.step(&zero_actions(2)).unwrap();
        assert!(second.iter().all(|step| step.done));
        // Infinite budget: the episode restarts instead of pausing.
        assert!(second.iter().all(|step| step.observation.is_some()));
    }

    #[test]
    fn countdown_budget_exhaustion_reports_none() {
        let mut tasks = pool(2, Some(1));
        let _ = tasks.step(&zero_actions(2)).unwrap();
        let finished = tasks.step(&zero_actions(2)).unwrap();
        assert!(finished.iter().all(|step| step.observation.is_none()));

        tasks.pause_at(1).unwrap();
        tasks.pause_at(0).unwrap();
        assert_eq!(tasks.num_tasks(), 0);

        tasks.resume_all().unwrap();
        tasks.reset_all().unwrap();
        assert_eq!(tasks.num_tasks(), 2);
        assert_eq!(tasks.get_observations().unwrap().len(), 2);
    }

    #[test]
    fn set_seeds_records_one_seed_per_worker() {
        let mut tasks = pool(2, None);
        tasks.set_seeds(&[7, 11]).unwrap();
        assert_eq!(tasks.seeds, vec![7, 11]);
    }

    #[test]
    fn pause_at_indexes_the_active_ordering() {
        let mut tasks = pool(3, None);
        // Pause the middle worker; the remaining active list is [0, 2].
        tasks.pause_at(1).unwrap();
        assert_eq!(tasks.active_indices(), vec![0, 2]);
        // Active index 1 now names worker 2.
        tasks.pause_at(1).unwrap();
        assert_eq!(tasks.active_indices(), vec![0]);
    }
}
