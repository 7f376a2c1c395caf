//! The background validation worker.
use super::Engine;
use crate::experiment::{advise, ExperimentConfig, Mode};
use crate::tasks::{MetricsMessage, MetricsSender};
use crossbeam::channel::{self, Sender};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

/// A thread owning a validation-mode engine, fed checkpoint paths as
/// training produces them.
///
/// Validation runs fully asynchronously with training; when it lags, the
/// queued notifications are drained and only the most recent checkpoint is
/// evaluated. Results are published as validation metrics on the training
/// engine's metrics queue. Dropping the command channel ends the worker
/// after its current evaluation.
pub(super) struct ValidationWorker {
    commands: Option<Sender<PathBuf>>,
    handle: Option<JoinHandle<()>>,
}

impl ValidationWorker {
    pub(super) fn spawn<C>(
        config: C,
        output_dir: PathBuf,
        seed: Option<u64>,
        metrics: MetricsSender,
    ) -> Self
    where
        C: ExperimentConfig + Clone + Send + 'static,
    {
        let (commands, notifications) = channel::unbounded::<PathBuf>();
        let handle = thread::spawn(move || {
            let mut engine = match Engine::new(config, &output_dir, Mode::Valid, seed) {
                Ok(engine) => engine,
                Err(error) => {
                    advise(&format!("validation worker failed to start: {}", error));
                    return;
                }
            };

            while let Ok(mut checkpoint) = notifications.recv() {
                // Training may have queued several saves; keep the latest.
                while let Ok(newer) = notifications.try_recv() {
                    checkpoint = newer;
                }
                match engine.run_eval(&checkpoint, 1) {
                    Ok(scalars) => {
                        let _ = metrics.send(MetricsMessage::Valid(scalars));
                    }
                    Err(error) => advise(&format!(
                        "validation of {} failed: {}",
                        checkpoint.display(),
                        error
                    )),
                }
            }
            engine.close();
        });

        Self {
            commands: Some(commands),
            handle: Some(handle),
        }
    }

    /// Tell the worker about a freshly saved checkpoint.
    pub(super) fn notify(&self, checkpoint: &Path) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(checkpoint.to_owned());
        }
    }

    /// Disconnect and wait for the worker to finish its current
    /// evaluation, if any.
    pub(super) fn join(&mut self) {
        self.commands = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
