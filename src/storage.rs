//! Rollout storage for on-policy trainers.
use crate::error::ConfigError;
use crate::observation::{ObservationTree, SensorPath};
use crate::policy::ActionSpace;
use crate::Prng;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use tch::{Device, Kind, Tensor};

/// One batched environment transition, written into the storage by
/// [`RolloutStorage::insert`].
///
/// All tensors cover the currently active workers: leading dimension `N`.
#[derive(Debug)]
pub struct Transition {
    /// Observations produced *after* taking `actions`. Leaves `[N, ..]`.
    pub observations: ObservationTree,
    /// Recurrent state after the step. `[NUM_LAYERS, N, HIDDEN_SIZE]`.
    pub recurrent_hidden_states: Tensor,
    /// Actions taken. `[N, ACTION_DIM]`.
    pub actions: Tensor,
    /// Log probabilities of `actions` under the acting policy. `[N, 1]`.
    pub action_log_probs: Tensor,
    /// Value estimates at the pre-step observations. `[N, 1]`.
    pub value_preds: Tensor,
    /// Step rewards. `[N, 1]`.
    pub rewards: Tensor,
    /// Not-done masks after the step; zero ends an episode. `[N, 1]`.
    pub masks: Tensor,
}

/// One optimization batch: a contiguous shard of workers with the time and
/// process axes flattened row-major to `[T * N_SHARD, ..]` (timestep-major,
/// index `t * n_shard + i`). Recurrent state keeps its initial-step shape
/// `[NUM_LAYERS, N_SHARD, HIDDEN_SIZE]`.
#[derive(Debug)]
pub struct MiniBatch {
    pub observations: ObservationTree,
    pub recurrent_hidden_states: Tensor,
    pub actions: Tensor,
    pub prev_actions: Tensor,
    pub values: Tensor,
    pub returns: Tensor,
    pub masks: Tensor,
    pub old_action_log_probs: Tensor,
    pub adv_targ: Tensor,
    pub norm_adv_targ: Tensor,
}

/// Full-capacity tensors set aside while the storage is narrowed.
#[derive(Debug)]
struct Unnarrowed {
    observations: BTreeMap<SensorPath, Tensor>,
    recurrent_hidden_states: Tensor,
    actions: Tensor,
    prev_actions: Tensor,
    action_log_probs: Tensor,
    value_preds: Tensor,
    returns: Tensor,
    rewards: Tensor,
    masks: Tensor,
    num_steps: i64,
}

/// Time-major storage for one rollout of `T` steps across `N` parallel
/// workers.
///
/// Observation tensors are registered lazily the first time their sensor
/// path is seen, supporting heterogeneous per-experiment schemas. All
/// tensors keep their leading dimensions in lockstep: `reshape` narrows the
/// process axis of every registered tensor whenever workers are paused.
#[derive(Debug)]
pub struct RolloutStorage {
    observations: BTreeMap<SensorPath, Tensor>,
    pub recurrent_hidden_states: Tensor,
    pub rewards: Tensor,
    pub value_preds: Tensor,
    pub returns: Tensor,
    pub action_log_probs: Tensor,
    pub actions: Tensor,
    pub prev_actions: Tensor,
    pub masks: Tensor,
    num_steps: i64,
    step: i64,
    device: Device,
    unnarrowed: Option<Unnarrowed>,
}

impl RolloutStorage {
    pub fn new(
        num_steps: i64,
        num_processes: i64,
        action_space: ActionSpace,
        recurrent_hidden_state_size: i64,
        num_recurrent_layers: i64,
        device: Device,
    ) -> Self {
        let float = (Kind::Float, device);
        let action_kind = if action_space.is_discrete() {
            Kind::Int64
        } else {
            Kind::Float
        };
        let action_dim = action_space.action_dim();

        Self {
            observations: BTreeMap::new(),
            recurrent_hidden_states: Tensor::zeros(
                &[
                    num_steps + 1,
                    num_recurrent_layers,
                    num_processes,
                    recurrent_hidden_state_size,
                ],
                float,
            ),
            rewards: Tensor::zeros(&[num_steps, num_processes, 1], float),
            value_preds: Tensor::zeros(&[num_steps + 1, num_processes, 1], float),
            returns: Tensor::zeros(&[num_steps + 1, num_processes, 1], float),
            action_log_probs: Tensor::zeros(&[num_steps, num_processes, 1], float),
            actions: Tensor::zeros(&[num_steps, num_processes, action_dim], (action_kind, device)),
            prev_actions: Tensor::zeros(
                &[num_steps + 1, num_processes, action_dim],
                (action_kind, device),
            ),
            masks: Tensor::ones(&[num_steps + 1, num_processes, 1], float),
            num_steps,
            step: 0,
            device,
            unnarrowed: None,
        }
    }

    /// Current write cursor in `[0, T)`.
    pub const fn step(&self) -> i64 {
        self.step
    }

    /// Rollout capacity `T` (the narrowed capacity while narrowed).
    pub const fn num_steps(&self) -> i64 {
        self.num_steps
    }

    /// Number of active (unpaused) workers.
    pub fn num_processes(&self) -> i64 {
        self.rewards.size()[1]
    }

    /// Copy one timestep of observations into the storage, registering a
    /// zeroed `[T + 1, ..]` tensor for any sensor path seen for the first
    /// time.
    pub fn insert_initial_observations(
        &mut self,
        observations: &ObservationTree,
        time_step: i64,
    ) {
        let num_steps = self.num_steps;
        let device = self.device;
        for (path, tensor) in observations.flattened() {
            let slot = self.observations.entry(path).or_insert_with(|| {
                let mut shape = vec![num_steps + 1];
                shape.extend(tensor.size());
                Tensor::zeros(&shape, (tensor.kind(), device))
            });
            let mut row = slot.get(time_step);
            row.copy_(tensor);
        }
    }

    /// Record one transition and advance the write cursor modulo `T`.
    ///
    /// Post-step quantities (observations, hidden states, masks, previous
    /// actions) land in slot `step + 1`; step quantities (actions,
    /// log-probs, values, rewards) land in slot `step`.
    pub fn insert(&mut self, transition: Transition) {
        let Transition {
            observations,
            recurrent_hidden_states,
            actions,
            action_log_probs,
            value_preds,
            rewards,
            masks,
        } = transition;

        self.insert_initial_observations(&observations, self.step + 1);

        let mut row = self.recurrent_hidden_states.get(self.step + 1);
        row.copy_(&recurrent_hidden_states);
        let mut row = self.actions.get(self.step);
        row.copy_(&actions);
        let mut row = self.prev_actions.get(self.step + 1);
        row.copy_(&actions);
        let mut row = self.action_log_probs.get(self.step);
        row.copy_(&action_log_probs);
        let mut row = self.value_preds.get(self.step);
        row.copy_(&value_preds);
        let mut row = self.rewards.get(self.step);
        row.copy_(&rewards);
        let mut row = self.masks.get(self.step + 1);
        row.copy_(&masks);

        self.step = (self.step + 1) % self.num_steps;
    }

    /// Narrow the process axis of every tensor to the given worker indices.
    ///
    /// Used whenever some workers finished their episodes and were paused;
    /// the remaining rollout is collected only for `keep`.
    pub fn reshape(&mut self, keep: &[i64]) {
        assert!(
            self.unnarrowed.is_none(),
            "attempting to reshape narrowed rollouts"
        );
        let index = Tensor::of_slice(keep).to_device(self.device);
        for tensor in self.observations.values_mut() {
            *tensor = tensor.index_select(1, &index);
        }
        self.recurrent_hidden_states = self.recurrent_hidden_states.index_select(2, &index);
        self.actions = self.actions.index_select(1, &index);
        self.prev_actions = self.prev_actions.index_select(1, &index);
        self.action_log_probs = self.action_log_probs.index_select(1, &index);
        self.value_preds = self.value_preds.index_select(1, &index);
        self.returns = self.returns.index_select(1, &index);
        self.rewards = self.rewards.index_select(1, &index);
        self.masks = self.masks.index_select(1, &index);
    }

    /// Truncate the storage to the partially filled prefix of an
    /// interrupted rollout.
    ///
    /// Return computation and the mini-batch generator then operate only on
    /// valid data. The full-capacity tensors are kept aside and restored by
    /// [`unnarrow`](Self::unnarrow). The truncated rollout counts as
    /// complete: the write cursor is reset to zero.
    ///
    /// # Panics
    /// If the storage is already narrowed.
    pub fn narrow(&mut self) {
        assert!(
            self.unnarrowed.is_none(),
            "attempting to narrow narrowed rollouts"
        );

        if self.step == 0 {
            // A full rollout; nothing to truncate.
            return;
        }
        let step = self.step;

        let observations = std::mem::take(&mut self.observations);
        let narrowed = observations
            .iter()
            .map(|(path, tensor)| (path.clone(), tensor.narrow(0, 0, step + 1)))
            .collect();

        let base = Unnarrowed {
            observations,
            recurrent_hidden_states: self.recurrent_hidden_states.shallow_clone(),
            actions: self.actions.shallow_clone(),
            prev_actions: self.prev_actions.shallow_clone(),
            action_log_probs: self.action_log_probs.shallow_clone(),
            value_preds: self.value_preds.shallow_clone(),
            returns: self.returns.shallow_clone(),
            rewards: self.rewards.shallow_clone(),
            masks: self.masks.shallow_clone(),
            num_steps: self.num_steps,
        };

        self.observations = narrowed;
        self.recurrent_hidden_states = base.recurrent_hidden_states.narrow(0, 0, step + 1);
        self.actions = base.actions.narrow(0, 0, step);
        self.prev_actions = base.prev_actions.narrow(0, 0, step + 1);
        self.action_log_probs = base.action_log_probs.narrow(0, 0, step);
        // Keep the bootstrap slot so `compute_returns` works on the
        // truncated data.
        self.value_preds = base.value_preds.narrow(0, 0, step + 1);
        self.returns = base.returns.narrow(0, 0, step + 1);
        self.rewards = base.rewards.narrow(0, 0, step);
        self.masks = base.masks.narrow(0, 0, step + 1);

        self.num_steps = step;
        self.step = 0;
        self.unnarrowed = Some(base);
    }

    /// Restore the full-capacity tensors set aside by
    /// [`narrow`](Self::narrow).
    ///
    /// # Panics
    /// If the storage is not narrowed.
    pub fn unnarrow(&mut self) {
        let base = self
            .unnarrowed
            .take()
            .expect("attempting to unnarrow unnarrowed rollouts");

        self.observations = base.observations;
        self.recurrent_hidden_states = base.recurrent_hidden_states;
        self.actions = base.actions;
        self.prev_actions = base.prev_actions;
        self.action_log_probs = base.action_log_probs;
        self.value_preds = base.value_preds;
        self.returns = base.returns;
        self.rewards = base.rewards;
        self.masks = base.masks;
        self.num_steps = base.num_steps;
        self.step = 0;
    }

    /// Seed the next rollout with the final timestep of this one.
    ///
    /// Copies slot `T` into slot 0 for observations, hidden states, masks,
    /// and previous actions, preserving continuity across consecutive
    /// rollouts within a stage. Restores full capacity if narrowed.
    ///
    /// # Panics
    /// If the rollout is incomplete (`step != 0`).
    pub fn after_update(&mut self) {
        assert!(
            self.step == 0,
            "wrong number of steps {} in rollout storage with capacity {}",
            self.step,
            self.num_steps,
        );

        for tensor in self.observations.values() {
            let last = tensor.get(self.num_steps);
            let mut first = tensor.get(0);
            first.copy_(&last);
        }
        let last = self.recurrent_hidden_states.get(self.num_steps);
        let mut first = self.recurrent_hidden_states.get(0);
        first.copy_(&last);
        let last = self.masks.get(self.num_steps);
        let mut first = self.masks.get(0);
        first.copy_(&last);
        let last = self.prev_actions.get(self.num_steps);
        let mut first = self.prev_actions.get(0);
        first.copy_(&last);

        if self.unnarrowed.is_some() {
            self.unnarrow();
        }
    }

    /// Fill `returns` backward through time.
    ///
    /// With `use_gae`, accumulates generalized advantage estimates
    /// `gae_t = delta_t + gamma * tau * mask_{t+1} * gae_{t+1}` where
    /// `delta_t = r_t + gamma * V(s_{t+1}) * mask_{t+1} - V(s_t)` and sets
    /// `return_t = gae_t + V(s_t)`. Otherwise a plain discounted bootstrap.
    /// Masks zero the bootstrap across episode boundaries.
    pub fn compute_returns(&mut self, next_value: &Tensor, use_gae: bool, gamma: f64, tau: f64) {
        let num_steps = self.rewards.size()[0];
        if use_gae {
            let mut row = self.value_preds.get(num_steps);
            row.copy_(next_value);

            let mut gae = Tensor::zeros_like(next_value);
            for step in (0..num_steps).rev() {
                let next_mask = self.masks.get(step + 1);
                let delta = self.rewards.get(step)
                    + self.value_preds.get(step + 1) * gamma * &next_mask
                    - self.value_preds.get(step);
                gae = delta + gae * (gamma * tau) * &next_mask;
                let mut row = self.returns.get(step);
                row.copy_(&(&gae + self.value_preds.get(step)));
            }
        } else {
            let mut row = self.returns.get(num_steps);
            row.copy_(next_value);

            for step in (0..num_steps).rev() {
                let ret = self.returns.get(step + 1) * gamma * self.masks.get(step + 1)
                    + self.rewards.get(step);
                let mut row = self.returns.get(step);
                row.copy_(&ret);
            }
        }
    }

    /// Build the recurrent optimization batches for one update epoch.
    ///
    /// The process axis is partitioned into `num_mini_batch` contiguous,
    /// near-equal shards (cut points evenly spaced over `[0, N]`); shard
    /// order is shuffled but shard membership is fixed, preserving
    /// recurrent-state locality. Advantages are normalized over the whole
    /// rollout. Timestep order within a shard is preserved by the
    /// row-major `[T, n] -> [T * n]` flattening.
    ///
    /// # Errors
    /// [`ConfigError::TooManyMiniBatches`] if fewer workers remain than
    /// mini-batches were requested.
    pub fn recurrent_generator(
        &self,
        advantages: &Tensor,
        num_mini_batch: i64,
        device: Device,
        rng: &mut Prng,
    ) -> Result<Vec<MiniBatch>, ConfigError> {
        let num_processes = self.rewards.size()[1];
        if num_processes < num_mini_batch {
            return Err(ConfigError::TooManyMiniBatches {
                num_mini_batch,
                num_processes,
            });
        }

        let normalized_advantages =
            (advantages - advantages.mean(Kind::Float)) / (advantages.std(true) + 1e-5);

        #[allow(clippy::cast_possible_truncation)]
        let cuts: Vec<i64> = (0..=num_mini_batch)
            .map(|i| {
                ((i as f64) * (num_processes as f64) / (num_mini_batch as f64)).round() as i64
            })
            .collect();
        let mut shards: Vec<(i64, i64)> = cuts.windows(2).map(|w| (w[0], w[1])).collect();
        shards.shuffle(rng);

        let t = self.num_steps;
        let batches = shards
            .into_iter()
            .map(|(start, end)| {
                let n = end - start;
                let observations = ObservationTree::from_flattened(
                    self.observations.iter().map(|(path, tensor)| {
                        let shard = tensor.narrow(0, 0, t).narrow(1, start, n);
                        (path.clone(), flatten_time(t, n, &shard).to_device(device))
                    }),
                )
                .expect("storage observation paths are consistent");

                MiniBatch {
                    observations,
                    recurrent_hidden_states: self
                        .recurrent_hidden_states
                        .get(0)
                        .narrow(1, start, n)
                        .to_device(device),
                    actions: flatten_time(t, n, &self.actions.narrow(1, start, n))
                        .to_device(device),
                    prev_actions: flatten_time(
                        t,
                        n,
                        &self.prev_actions.narrow(0, 0, t).narrow(1, start, n),
                    )
                    .to_device(device),
                    values: flatten_time(
                        t,
                        n,
                        &self.value_preds.narrow(0, 0, t).narrow(1, start, n),
                    )
                    .to_device(device),
                    returns: flatten_time(t, n, &self.returns.narrow(0, 0, t).narrow(1, start, n))
                        .to_device(device),
                    masks: flatten_time(t, n, &self.masks.narrow(0, 0, t).narrow(1, start, n))
                        .to_device(device),
                    old_action_log_probs: flatten_time(
                        t,
                        n,
                        &self.action_log_probs.narrow(1, start, n),
                    )
                    .to_device(device),
                    adv_targ: flatten_time(t, n, &advantages.narrow(1, start, n))
                        .to_device(device),
                    norm_adv_targ: flatten_time(
                        t,
                        n,
                        &normalized_advantages.narrow(1, start, n),
                    )
                    .to_device(device),
                }
            })
            .collect();

        Ok(batches)
    }

    /// One timestep's observations as a nested tree on the given device.
    pub fn pick_observation_step(&self, step: i64, device: Device) -> ObservationTree {
        ObservationTree::from_flattened(
            self.observations
                .iter()
                .map(|(path, tensor)| (path.clone(), tensor.get(step).to_device(device))),
        )
        .expect("storage observation paths are consistent")
    }
}

/// Flatten a `[t, n, ..]` tensor to `[t * n, ..]` (row-major over time).
fn flatten_time(t: i64, n: i64, tensor: &Tensor) -> Tensor {
    let mut shape = vec![t * n];
    shape.extend_from_slice(&tensor.size()[2..]);
    tensor.reshape(&shape)
}
