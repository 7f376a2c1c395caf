//! The vectorized task-sampler contract and the metrics queue.
//!
//! The process pool that actually runs simulators is an external
//! collaborator; the engine consumes it only through [`VectorTasks`]. Task
//! metrics flow back over a multi-producer, single-consumer channel of
//! tagged [`MetricsMessage`] payloads.
use crate::error::TaskPoolError;
use crate::observation::ObservationTree;
use std::collections::BTreeMap;
use tch::Tensor;

/// The result of stepping one worker.
#[derive(Debug)]
pub struct TaskStep {
    /// The post-step observation, or `None` if the worker has no further
    /// episodes and should be paused.
    pub observation: Option<ObservationTree>,
    pub reward: f64,
    /// Whether the step ended an episode.
    pub done: bool,
    /// Extra per-step scalars reported by the task; not consumed by the
    /// engine (task metrics arrive over the metrics queue instead).
    pub info: BTreeMap<String, f64>,
}

/// Scalar diagnostics from one optimizer step.
#[derive(Debug, Clone)]
pub struct UpdatePackage {
    pub total_loss: f64,
    /// The learning rate in effect, when a scheduler is configured.
    pub learning_rate: Option<f64>,
    /// Per-loss diagnostic scalars, keyed by loss name.
    pub losses: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Scalar diagnostics from one teacher-forced rollout step.
#[derive(Debug, Clone, Copy)]
pub struct TeacherPackage {
    /// Fraction of workers whose action was replaced by the expert's.
    pub teacher_ratio: f64,
    /// The teacher-forcing probability in effect.
    pub teacher_enforcing: f64,
}

/// A tagged payload on the metrics queue.
///
/// Task pools produce raw scalar metrics; the engine itself produces
/// update and teacher packages; the validation worker and test runs
/// produce evaluation metrics paired with the step count they were
/// evaluated at.
#[derive(Debug)]
pub enum MetricsMessage {
    /// Scalar metrics from completed tasks.
    Task(BTreeMap<String, f64>),
    Update(UpdatePackage),
    Teacher(TeacherPackage),
    Valid(BTreeMap<String, (f64, i64)>),
    Test(BTreeMap<String, (f64, i64)>),
}

pub type MetricsSender = crossbeam::channel::Sender<MetricsMessage>;
pub type MetricsReceiver = crossbeam::channel::Receiver<MetricsMessage>;

/// An unbounded metrics queue.
///
/// Senders are cloned into every producer (task pools, the validation
/// worker, the engine); the engine's logging loop is the sole consumer and
/// only ever polls non-blockingly.
pub fn metrics_channel() -> (MetricsSender, MetricsReceiver) {
    crossbeam::channel::unbounded()
}

/// A fixed-size pool of task-sampling workers stepped in lockstep.
///
/// Workers are indexed by their position among the currently active
/// (unpaused) workers, in pool order. `step` blocks until every active
/// worker replies; results are returned in that same order.
pub trait VectorTasks: Send {
    /// Number of active (unpaused) workers.
    fn num_tasks(&self) -> usize;

    /// Step every active worker with its row of `actions`
    /// (shape `[num_tasks, ACTION_DIM]`).
    fn step(&mut self, actions: &Tensor) -> Result<Vec<TaskStep>, TaskPoolError>;

    /// Initial observations of every active worker.
    fn get_observations(&mut self) -> Result<Vec<ObservationTree>, TaskPoolError>;

    /// Remove the active worker at `index` from the pool until the next
    /// [`resume_all`](Self::resume_all).
    fn pause_at(&mut self, index: usize) -> Result<(), TaskPoolError>;

    /// Return every paused worker to the active set.
    fn resume_all(&mut self) -> Result<(), TaskPoolError>;

    /// Restart every worker's task sampler from the beginning.
    fn reset_all(&mut self) -> Result<(), TaskPoolError>;

    /// Re-seed every worker, one seed per worker in pool order.
    fn set_seeds(&mut self, seeds: &[u64]) -> Result<(), TaskPoolError>;

    /// Shut the pool down. Idempotent.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_channel_is_multi_producer() {
        let (sender, receiver) = metrics_channel();
        let other = sender.clone();

        sender
            .send(MetricsMessage::Task(BTreeMap::from([(
                "ep_length".to_owned(),
                12.0,
            )])))
            .unwrap();
        other
            .send(MetricsMessage::Teacher(TeacherPackage {
                teacher_ratio: 0.5,
                teacher_enforcing: 0.5,
            }))
            .unwrap();

        assert!(matches!(
            receiver.try_recv(),
            Ok(MetricsMessage::Task(_))
        ));
        assert!(matches!(
            receiver.try_recv(),
            Ok(MetricsMessage::Teacher(_))
        ));
        assert!(receiver.try_recv().is_err());
    }
}
