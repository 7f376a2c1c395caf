//! TensorBoard metrics sink.
use super::MetricsSink;
use std::fmt;
use std::path::Path;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Writes scalar metrics to a TensorBoard event file.
pub struct TensorBoardSink {
    writer: SummaryWriter,
}

impl fmt::Debug for TensorBoardSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // TODO: Output the log dir if SummaryWriter adds support for reading it.
        f.debug_struct("TensorBoardSink").finish()
    }
}

impl TensorBoardSink {
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Self {
        Self {
            writer: SummaryWriter::new(log_dir),
        }
    }
}

impl MetricsSink for TensorBoardSink {
    fn add_scalar(&mut self, tag: &str, value: f64, step: i64) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        self.writer
            .add_scalar(tag, value as f32, step.max(0) as usize);
    }

    fn flush(&mut self) {
        self.writer.flush();
    }
}
