//! Activation functions.
//!
//! Activations are stateless and operate in place on flat batch buffers.
//! Derivatives are written in terms of the activation *output* `y`, which is
//! what every layer caches for its backward pass.

use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};

/// Negative-side slope of [`Activation::LeakyRelu`].
pub const LEAKY_RELU_SLOPE: f32 = 0.01;

/// Activation kind; the tag doubles as the serialization discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu,
    Softmax,
}

impl Activation {
    pub fn tag(&self) -> &'static str {
        match self {
            Activation::Identity => "identity",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Relu => "relu",
            Activation::LeakyRelu => "leaky_relu",
            Activation::Softmax => "softmax",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        Ok(match tag {
            "identity" => Activation::Identity,
            "sigmoid" => Activation::Sigmoid,
            "tanh" => Activation::Tanh,
            "relu" => Activation::Relu,
            "leaky_relu" => Activation::LeakyRelu,
            "softmax" => Activation::Softmax,
            other => {
                return Err(NetworkError::Serialization(format!(
                    "unknown activation tag '{}'",
                    other
                )))
            }
        })
    }

    /// Element-wise activation. Softmax has no element-wise form and is
    /// treated as identity here; use [`Activation::apply`] for it.
    #[inline]
    pub fn apply_scalar(&self, x: f32) -> f32 {
        match self {
            Activation::Identity | Activation::Softmax => x,
            Activation::Sigmoid => sigmoid(x),
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
            Activation::LeakyRelu => {
                if x > 0.0 {
                    x
                } else {
                    LEAKY_RELU_SLOPE * x
                }
            }
        }
    }

    /// dy/dx expressed through the output `y`, for element-wise kinds.
    #[inline]
    pub fn derivative_from_output(&self, y: f32) -> f32 {
        match self {
            Activation::Identity | Activation::Softmax => 1.0,
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Tanh => 1.0 - y * y,
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyRelu => {
                if y > 0.0 {
                    1.0
                } else {
                    LEAKY_RELU_SLOPE
                }
            }
        }
    }

    /// Applies the activation in place. Softmax normalises each example
    /// (a row of `data.len() / batch_size` values) independently.
    pub fn apply(&self, data: &mut [f32], batch_size: usize) {
        match self {
            Activation::Identity => {}
            Activation::Softmax => {
                let cols = if batch_size == 0 { 0 } else { data.len() / batch_size };
                softmax_rows(data, batch_size, cols);
            }
            _ => {
                for value in data.iter_mut() {
                    *value = self.apply_scalar(*value);
                }
            }
        }
    }

    /// Converts a delta w.r.t. the output into a delta w.r.t. the
    /// pre-activation, in place.
    pub fn backward(&self, output: &[f32], delta: &mut [f32], batch_size: usize) {
        match self {
            Activation::Identity => {}
            Activation::Softmax => {
                let cols = if batch_size == 0 { 0 } else { output.len() / batch_size };
                for (y, d) in output.chunks_exact(cols).zip(delta.chunks_exact_mut(cols)) {
                    let dot: f32 = y.iter().zip(d.iter()).map(|(a, b)| a * b).sum();
                    for (dv, &yv) in d.iter_mut().zip(y) {
                        *dv = yv * (*dv - dot);
                    }
                }
            }
            _ => {
                for (d, &y) in delta.iter_mut().zip(output) {
                    *d *= self.derivative_from_output(y);
                }
            }
        }
    }

    /// Softmax is a per-example operation and cannot be used where an
    /// element-wise gate is required.
    pub fn is_elementwise(&self) -> bool {
        !matches!(self, Activation::Softmax)
    }
}

/// Logistic sigmoid.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Softmax applied row-wise with max subtraction for stability.
pub fn softmax_rows(outputs: &mut [f32], rows: usize, cols: usize) {
    if cols == 0 {
        return;
    }
    for row in outputs.chunks_exact_mut(cols).take(rows) {
        let max_value = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for value in row.iter_mut() {
            *value = (*value - max_value).exp();
            sum += *value;
        }
        let inv_sum = 1.0f32 / sum;
        for value in row.iter_mut() {
            *value *= inv_sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON_F32: f32 = 1e-6;

    #[test]
    fn test_sigmoid_zero() {
        assert!((sigmoid(0.0) - 0.5).abs() < EPSILON_F32);
    }

    #[test]
    fn test_relu_mixed() {
        let mut data = vec![-2.0, -1.0, 0.0, 1.0, 2.0];
        Activation::Relu.apply(&mut data, 1);
        assert_eq!(data, vec![0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut data = vec![1.0, 2.0, 3.0, -1.0, 0.0, 4.0];
        Activation::Softmax.apply(&mut data, 2);
        for row in data.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < EPSILON_F32);
        }
    }

    #[test]
    fn test_softmax_extreme_negative_logits() {
        let mut data = vec![-1000.0, -2000.0, -3000.0];
        softmax_rows(&mut data, 1, 3);
        assert!((data[0] - 1.0).abs() < EPSILON_F32);
        assert!(data[1].abs() < EPSILON_F32);
        assert!(data[2].abs() < EPSILON_F32);
    }

    #[test]
    fn test_softmax_shift_invariant() {
        let mut a = vec![0.5, -1.5, 2.0];
        let mut b: Vec<f32> = a.iter().map(|v| v + 17.0).collect();
        softmax_rows(&mut a, 1, 3);
        softmax_rows(&mut b, 1, 3);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_tag_round_trip() {
        for act in [
            Activation::Identity,
            Activation::Sigmoid,
            Activation::Tanh,
            Activation::Relu,
            Activation::LeakyRelu,
            Activation::Softmax,
        ] {
            assert_eq!(Activation::from_tag(act.tag()).unwrap(), act);
        }
        assert!(Activation::from_tag("swish").is_err());
    }

    #[test]
    fn test_tanh_derivative_matches_finite_difference() {
        let x = 0.3f32;
        let h = 1e-3f32;
        let numeric = ((x + h).tanh() - (x - h).tanh()) / (2.0 * h);
        let analytic = Activation::Tanh.derivative_from_output(x.tanh());
        assert!((numeric - analytic).abs() < 1e-3);
    }

    #[test]
    fn test_softmax_backward_matches_jacobian() {
        let mut y = vec![0.2, 0.3, 1.0];
        softmax_rows(&mut y, 1, 3);
        let mut delta = vec![1.0, 0.0, 0.0];
        Activation::Softmax.backward(&y, &mut delta, 1);
        // d y0 / d x0 = y0 (1 - y0), d y0 / d x1 = -y0 y1
        assert!((delta[0] - y[0] * (1.0 - y[0])).abs() < EPSILON_F32);
        assert!((delta[1] + y[0] * y[1]).abs() < EPSILON_F32);
    }
}
