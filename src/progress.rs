//! Training progress sinks.
//!
//! The training loop reports one `(step, cost)` pair per batch. What happens
//! to it is up to the sink: log it, append it to a loss file for plotting,
//! or collect it in memory.

use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Receives the mean per-example cost after every training batch.
pub trait ProgressSink {
    fn record(&mut self, step: usize, cost: f32);

    /// Called once when training ends.
    fn finish(&mut self) {}
}

/// Reports through the `log` facade at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn record(&mut self, step: usize, cost: f32) {
        log::debug!("step {} | cost={:.6}", step, cost);
    }
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn record(&mut self, _step: usize, _cost: f32) {}
}

/// Appends `step,cost` lines to a file.
///
/// A failed write is logged and the sink keeps going; losing a plot point
/// never aborts training.
pub struct LossFileSink {
    writer: BufWriter<File>,
}

impl LossFileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl ProgressSink for LossFileSink {
    fn record(&mut self, step: usize, cost: f32) {
        if let Err(e) = writeln!(self.writer, "{},{}", step, cost) {
            log::warn!("could not write loss record for step {}: {}", step, e);
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::warn!("could not flush loss file: {}", e);
        }
    }
}

impl Drop for LossFileSink {
    fn drop(&mut self) {
        self.writer.flush().ok();
    }
}

impl ProgressSink for Vec<(usize, f32)> {
    fn record(&mut self, step: usize, cost: f32) {
        self.push((step, cost));
    }
}
