//! Plain gradient descent.

use crate::error::Result;
use crate::optimizers::{check_lengths, Moments, Optimizer, OptimizerKind};
use crate::serialization::{ModelReader, ModelWriter};

/// `w ← w − α·g`, with no running statistics.
///
/// The state record still carries the step counter so every optimizer kind
/// shares one layout.
///
/// ```
/// use rust_neural_engine::optimizers::{Optimizer, SGD};
///
/// let mut optimizer = SGD::new(0.5);
/// let mut weights = vec![1.0, 2.0];
/// optimizer.update(&mut weights, &[0.5, -1.0]);
/// assert_eq!(weights, vec![0.75, 2.5]);
/// ```
pub struct SGD {
    alpha: f32,
    steps: usize,
}

impl SGD {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, steps: 0 }
    }
}

impl Optimizer for SGD {
    fn update(&mut self, parameters: &mut [f32], gradients: &[f32]) {
        check_lengths(parameters, gradients);
        self.steps += 1;
        let alpha = self.alpha;
        parameters
            .iter_mut()
            .zip(gradients)
            .for_each(|(w, g)| *w -= alpha * g);
    }

    fn reset(&mut self) {
        self.steps = 0;
    }

    fn learning_rate(&self) -> f32 {
        self.alpha
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.alpha = lr;
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn export_state(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        Moments {
            t: self.steps,
            ..Moments::default()
        }
        .export(writer)
    }

    fn import_state(&mut self, reader: &mut ModelReader<'_>) -> Result<()> {
        self.steps = Moments::import(reader)?.t;
        Ok(())
    }

    fn moment_len(&self) -> usize {
        0
    }
}
