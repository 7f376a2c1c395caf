//! Contracts between the engine and actor-critic policy models.
use crate::observation::ObservationTree;
use tch::{Kind, Tensor};

/// The action space of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSpace {
    /// A fixed number of discrete actions.
    Discrete(i64),
    /// A real-valued action vector of the given dimension.
    Continuous(i64),
}

impl ActionSpace {
    /// Width of the per-worker action tensor.
    pub const fn action_dim(self) -> i64 {
        match self {
            Self::Discrete(_) => 1,
            Self::Continuous(dim) => dim,
        }
    }

    pub const fn is_discrete(self) -> bool {
        matches!(self, Self::Discrete(_))
    }
}

/// A batch of per-worker action distributions.
pub trait ActionDistribution {
    /// Sample one action per worker. Shape `[N, ACTION_DIM]`.
    fn sample(&self) -> Tensor;

    /// The most probable action per worker. Shape `[N, ACTION_DIM]`.
    fn mode(&self) -> Tensor;

    /// Log probabilities of the given actions. Shape `[N, 1]`.
    fn log_probs(&self, actions: &Tensor) -> Tensor;

    /// Per-worker distribution entropies. Shape `[N, 1]`.
    fn entropy(&self) -> Tensor;
}

/// Categorical distribution(s) over discrete actions.
#[derive(Debug)]
pub struct Categorical {
    /// Normalized log probability of each action.
    ///
    /// An f32 tensor of shape `[N, NUM_ACTIONS]`.
    logits: Tensor,
}

impl Categorical {
    /// Initialize from possibly unnormalized log probabilities.
    pub fn new(logits: &Tensor) -> Self {
        Self {
            logits: logits.log_softmax(-1, Kind::Float),
        }
    }

    /// The normalized log probabilities.
    pub const fn logits(&self) -> &Tensor {
        &self.logits
    }
}

/// Clamp float values to be >= the smallest finite float value.
///
/// Keeps `0 * -inf` logit terms out of entropy sums.
fn clamp_float_min(x: &Tensor) -> Tensor {
    match x.kind() {
        Kind::Double => x.clamp_min(f64::MIN),
        _ => x.clamp_min(f64::from(f32::MIN)),
    }
}

impl ActionDistribution for Categorical {
    fn sample(&self) -> Tensor {
        self.logits.exp().multinomial(1, true)
    }

    fn mode(&self) -> Tensor {
        self.logits.argmax(-1, true)
    }

    fn log_probs(&self, actions: &Tensor) -> Tensor {
        self.logits.gather(-1, actions, false)
    }

    fn entropy(&self) -> Tensor {
        -(clamp_float_min(&self.logits) * self.logits.exp()).sum1(&[-1], true, Kind::Float)
    }
}

/// Output of an actor-critic forward pass over one batch of workers.
pub struct PolicyOutput {
    /// Distributions over actions, one per worker.
    pub distribution: Box<dyn ActionDistribution>,
    /// State-value estimates. Shape `[N, 1]`.
    pub values: Tensor,
    /// Updated recurrent state. Shape `[NUM_LAYERS, N, HIDDEN_SIZE]`.
    pub hidden_states: Tensor,
}

/// An actor-critic policy network.
///
/// Models are external collaborators; the engine only relies on this
/// forward contract and the shape metadata used to allocate rollout
/// storage.
pub trait ActorCritic {
    fn action_space(&self) -> ActionSpace;

    /// Width of the recurrent hidden state.
    fn recurrent_hidden_state_size(&self) -> i64;

    /// Number of stacked recurrent layers.
    fn num_recurrent_layers(&self) -> i64;

    /// Run the policy over one timestep of observations.
    ///
    /// # Args
    /// * `observations` - Batched observation tree; leaves `[N, ..]`.
    /// * `hidden_states` - Recurrent state `[NUM_LAYERS, N, HIDDEN_SIZE]`.
    /// * `prev_actions` - Previous actions `[N, ACTION_DIM]`.
    /// * `masks` - Not-done masks `[N, 1]`; zero resets recurrent state.
    fn forward(
        &self,
        observations: &ObservationTree,
        hidden_states: &Tensor,
        prev_actions: &Tensor,
        masks: &Tensor,
    ) -> PolicyOutput;
}
