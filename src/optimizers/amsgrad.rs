//! AMSGrad optimizer.

use crate::error::Result;
use crate::optimizers::{check_lengths, Moments, Optimizer, OptimizerKind};
use crate::serialization::{ModelReader, ModelWriter};

/// Adam variant whose second moment never decreases.
///
/// ```text
/// m ← β1·m + (1 − β1)·g
/// v ← max(v, β2·v + (1 − β2)·g²)
/// w ← w − α·m / (√v + ε)
/// ```
///
/// No bias correction is applied.
pub struct AmsGrad {
    alpha: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: Moments,
}

impl AmsGrad {
    pub fn new(alpha: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            alpha,
            beta1,
            beta2,
            epsilon,
            state: Moments::default(),
        }
    }

    pub fn step(&self) -> usize {
        self.state.t
    }

    pub fn second_moment(&self) -> &[f32] {
        &self.state.v
    }
}

impl Optimizer for AmsGrad {
    fn update(&mut self, parameters: &mut [f32], gradients: &[f32]) {
        check_lengths(parameters, gradients);
        self.state.advance(parameters.len());
        let (b1, b2, alpha, eps) = (self.beta1, self.beta2, self.alpha, self.epsilon);

        let Moments { m, v, .. } = &mut self.state;
        for ((w, &g), (m, v)) in parameters
            .iter_mut()
            .zip(gradients)
            .zip(m.iter_mut().zip(v.iter_mut()))
        {
            *m = b1 * *m + (1.0 - b1) * g;
            let candidate = b2 * *v + (1.0 - b2) * g * g;
            *v = v.max(candidate);
            *w -= alpha * *m / (v.sqrt() + eps);
        }
    }

    fn reset(&mut self) {
        self.state.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.alpha
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.alpha = lr;
    }

    fn kind(&self) -> OptimizerKind {
        OptimizerKind::AmsGrad
    }

    fn export_state(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        self.state.export(writer)
    }

    fn import_state(&mut self, reader: &mut ModelReader<'_>) -> Result<()> {
        self.state = Moments::import(reader)?;
        Ok(())
    }

    fn moment_len(&self) -> usize {
        self.state.m.len()
    }
}
