//! Adam with bias-corrected moment estimates.

use crate::error::Result;
use crate::optimizers::{check_lengths, Moments, Optimizer, OptimizerKind};
use crate::serialization::{ModelReader, ModelWriter};

/// Adam (Kingma & Ba, 2014).
///
/// ```text
/// m ← β1·m + (1 − β1)·g
/// v ← β2·v + (1 − β2)·g²
/// w ← w − α · (m / (1 − β1ᵗ)) / (√(v / (1 − β2ᵗ)) + ε)
/// ```
///
/// ```
/// use rust_neural_engine::optimizers::{Adam, Optimizer};
///
/// let mut adam = Adam::new(0.001, 0.9, 0.999, 1e-8);
/// let mut w = vec![0.5f32];
/// adam.update(&mut w, &[1.0]);
/// assert!(w[0] < 0.5);
/// ```
pub struct Adam {
    alpha: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: Moments,
}

impl Adam {
    pub fn new(alpha: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            alpha,
            beta1,
            beta2,
            epsilon,
            state: Moments::default(),
        }
    }

    /// Steps taken since creation or the last reset.
    pub fn step(&self) -> usize {
        self.state.t
    }
}

impl Optimizer for Adam {
    fn update(&mut self, parameters: &mut [f32], gradients: &[f32]) {
        check_lengths(parameters, gradients);
        let t = self.state.advance(parameters.len());
        let correct_m = 1.0 - self.beta1.powi(t);
        let correct_v = 1.0 - self.beta2.powi(t);
        let (b1, b2, alpha, eps) = (self.beta1, self.beta2, self.alpha, self.epsilon);

        let Moments { m, v, .. } = &mut self.state;
        for ((w, &g), (m, v)) in parameters
            .iter_mut()
            .zip(gradients)
            .zip(m.iter_mut().zip(v.iter_mut()))
        {
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            *w -= alpha * (*m / correct_m) / ((*v / correct_v).sqrt() + eps);
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
        OptimizerKind::Adam
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        // Bias correction makes the first step lr * g / (|g| + eps)
        let mut adam = Adam::new(0.1, 0.9, 0.999, 1e-8);
        let mut w = vec![1.0, -1.0];
        adam.update(&mut w, &[0.5, -2.0]);
        assert_relative_eq!(w[0], 0.9, epsilon = 1e-5);
        assert_relative_eq!(w[1], -0.9, epsilon = 1e-5);
        assert_eq!(adam.step(), 1);
    }

    #[test]
    fn test_reset_clears_step_counter() {
        let mut adam = Adam::new(0.01, 0.9, 0.999, 1e-8);
        let mut w = vec![0.0; 3];
        for _ in 0..4 {
            adam.update(&mut w, &[0.1, 0.2, 0.3]);
        }
        assert_eq!(adam.step(), 4);
        adam.reset();
        assert_eq!(adam.step(), 0);
    }

    #[test]
    fn test_second_step_formula() {
        let (lr, b1, b2, eps) = (0.01f32, 0.9f32, 0.999f32, 1e-8f32);
        let mut adam = Adam::new(lr, b1, b2, eps);
        let mut w = vec![0.0f32];
        adam.update(&mut w, &[1.0]);
        adam.update(&mut w, &[0.5]);

        let m1 = (1.0 - b1) * 1.0;
        let v1 = (1.0 - b2) * 1.0;
        let m2 = b1 * m1 + (1.0 - b1) * 0.5;
        let v2 = b2 * v1 + (1.0 - b2) * 0.25;
        let expected = -lr - lr * (m2 / (1.0 - b1 * b1)) / ((v2 / (1.0 - b2 * b2)).sqrt() + eps);
        assert_relative_eq!(w[0], expected, epsilon = 1e-6);
    }

    #[test]
    fn test_state_round_trip() {
        let mut adam = Adam::new(0.01, 0.9, 0.999, 1e-8);
        let mut w = vec![1.0, 2.0];
        adam.update(&mut w, &[0.3, -0.1]);

        let mut bytes = Vec::new();
        adam.export_state(&mut ModelWriter::new(&mut bytes)).unwrap();
        let mut restored = Adam::new(0.01, 0.9, 0.999, 1e-8);
        let mut cursor = std::io::Cursor::new(bytes);
        restored
            .import_state(&mut ModelReader::new(&mut cursor))
            .unwrap();
        assert_eq!(restored.step(), 1);

        let mut a = w.clone();
        let mut b = w.clone();
        adam.update(&mut a, &[0.2, 0.2]);
        restored.update(&mut b, &[0.2, 0.2]);
        assert_eq!(a, b);
    }
}
