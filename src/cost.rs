//! Cost functions.
//!
//! Each cost exposes a scalar value summed over the batch and a derivative
//! with respect to the terminal layer's *pre-activation*. The derivative
//! takes the terminal activation into account: softmax paired with a
//! cross-entropy cost uses the fused `output - target` form, every other
//! pairing multiplies the output gradient by the activation derivative.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::utils::Activation;
use serde::{Deserialize, Serialize};

/// Added inside logarithms and divisions so `ln(0)` never occurs.
pub const LOG_EPSILON: f32 = 1e-9;

/// Sparse targets below zero mean "no loss for this example".
pub const IGNORE_INDEX: f32 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cost {
    CrossEntropy,
    MeanSquaredError,
    /// Cross-entropy with one class index per example instead of a one-hot row.
    SparseCrossEntropy,
}

impl Cost {
    pub fn tag(&self) -> &'static str {
        match self {
            Cost::CrossEntropy => "cross_entropy",
            Cost::MeanSquaredError => "mean_squared_error",
            Cost::SparseCrossEntropy => "sparse_cross_entropy",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "cross_entropy" => Ok(Cost::CrossEntropy),
            "mean_squared_error" => Ok(Cost::MeanSquaredError),
            "sparse_cross_entropy" => Ok(Cost::SparseCrossEntropy),
            other => Err(NetworkError::Serialization(format!(
                "unknown cost tag '{}'",
                other
            ))),
        }
    }

    /// Number of target values per example for a layer producing `output_size` values.
    pub fn target_size(&self, output_size: usize) -> usize {
        match self {
            Cost::SparseCrossEntropy => 1,
            _ => output_size,
        }
    }

    /// Rejects pairings that have no defined derivative.
    pub fn check_activation(&self, activation: Activation) -> Result<()> {
        if *self == Cost::MeanSquaredError && activation == Activation::Softmax {
            return Err(NetworkError::UnsupportedCombination(
                "mean squared error cost cannot follow a softmax output".to_string(),
            ));
        }
        Ok(())
    }

    /// Total cost over the batch.
    pub fn cost(&self, output: &[f32], target: &[f32], batch_size: usize) -> Result<f32> {
        check_batch(batch_size)?;
        let cols = output.len() / batch_size;
        check_len(output.len(), cols * batch_size)?;
        check_len(target.len(), self.target_size(cols) * batch_size)?;

        let mut total = 0.0f64;
        match self {
            Cost::MeanSquaredError => {
                for (&o, &t) in output.iter().zip(target) {
                    let diff = (o - t) as f64;
                    total += 0.5 * diff * diff;
                }
            }
            Cost::CrossEntropy => {
                for (&o, &t) in output.iter().zip(target) {
                    if t != 0.0 {
                        total -= t as f64 * ((o + LOG_EPSILON) as f64).ln();
                    }
                }
            }
            Cost::SparseCrossEntropy => {
                for (b, &t) in target.iter().enumerate() {
                    if let Some(class) = sparse_class(t, cols)? {
                        total -= ((output[b * cols + class] + LOG_EPSILON) as f64).ln();
                    }
                }
            }
        }
        Ok(total as f32)
    }

    /// Delta w.r.t. the terminal layer's pre-activation.
    pub fn derivative(
        &self,
        output: &[f32],
        target: &[f32],
        activation: Activation,
        batch_size: usize,
    ) -> Result<Vec<f32>> {
        check_batch(batch_size)?;
        self.check_activation(activation)?;
        let cols = output.len() / batch_size;
        check_len(output.len(), cols * batch_size)?;
        check_len(target.len(), self.target_size(cols) * batch_size)?;

        let fused = activation == Activation::Softmax;
        let mut delta = vec![0.0f32; output.len()];
        match self {
            Cost::MeanSquaredError => {
                for ((d, &o), &t) in delta.iter_mut().zip(output).zip(target) {
                    *d = o - t;
                }
            }
            Cost::CrossEntropy => {
                if fused {
                    for ((d, &o), &t) in delta.iter_mut().zip(output).zip(target) {
                        *d = o - t;
                    }
                    return Ok(delta);
                }
                for ((d, &o), &t) in delta.iter_mut().zip(output).zip(target) {
                    *d = -t / (o + LOG_EPSILON);
                }
            }
            Cost::SparseCrossEntropy => {
                for (b, &t) in target.iter().enumerate() {
                    let Some(class) = sparse_class(t, cols)? else {
                        continue;
                    };
                    let row = &mut delta[b * cols..(b + 1) * cols];
                    if fused {
                        row.copy_from_slice(&output[b * cols..(b + 1) * cols]);
                        row[class] -= 1.0;
                    } else {
                        row[class] = -1.0 / (output[b * cols + class] + LOG_EPSILON);
                    }
                }
                if fused {
                    return Ok(delta);
                }
            }
        }
        activation.backward(output, &mut delta, batch_size);
        Ok(delta)
    }
}

fn sparse_class(target: f32, classes: usize) -> Result<Option<usize>> {
    if target < 0.0 {
        return Ok(None);
    }
    let class = target as usize;
    if class >= classes {
        return Err(NetworkError::DimensionMismatch {
            expected: classes,
            actual: class,
        });
    }
    Ok(Some(class))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_squared_error_value() {
        let out = [0.3, 0.2, 0.6, 0.4, 0.7];
        let target = [0.2, 0.1, 0.6, 0.3, 0.3];
        let cost = Cost::MeanSquaredError.cost(&out, &target, 1).unwrap();
        assert_relative_eq!(cost, 0.095, epsilon = 1e-5);
    }

    #[test]
    fn test_sparse_cross_entropy_value() {
        let out = [0.2, 0.6, 0.1, 0.0, 0.1];
        let cost = Cost::SparseCrossEntropy.cost(&out, &[2.0], 1).unwrap();
        assert_relative_eq!(cost, 2.302585, epsilon = 1e-5);
    }

    #[test]
    fn test_sparse_ignore_index_contributes_nothing() {
        let out = [0.5, 0.5, 0.25, 0.75];
        let cost = Cost::SparseCrossEntropy
            .cost(&out, &[IGNORE_INDEX, 1.0], 2)
            .unwrap();
        assert_relative_eq!(cost, -(0.75f32.ln()), epsilon = 1e-5);
        let delta = Cost::SparseCrossEntropy
            .derivative(&out, &[IGNORE_INDEX, 1.0], Activation::Softmax, 2)
            .unwrap();
        assert_eq!(&delta[..2], &[0.0, 0.0]);
        assert_relative_eq!(delta[2], 0.25, epsilon = 1e-6);
        assert_relative_eq!(delta[3], -0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_fused_softmax_cross_entropy() {
        let out = [0.7, 0.2, 0.1];
        let target = [0.0, 1.0, 0.0];
        let delta = Cost::CrossEntropy
            .derivative(&out, &target, Activation::Softmax, 1)
            .unwrap();
        assert_relative_eq!(delta[0], 0.7, epsilon = 1e-6);
        assert_relative_eq!(delta[1], -0.8, epsilon = 1e-6);
        assert_relative_eq!(delta[2], 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_mse_with_softmax_is_rejected() {
        let result = Cost::MeanSquaredError.derivative(&[0.5, 0.5], &[1.0, 0.0], Activation::Softmax, 1);
        assert!(matches!(result, Err(NetworkError::UnsupportedCombination(_))));
    }

    #[test]
    fn test_mse_derivative_includes_activation() {
        let out = [0.5f32];
        let delta = Cost::MeanSquaredError
            .derivative(&out, &[1.0], Activation::Sigmoid, 1)
            .unwrap();
        assert_relative_eq!(delta[0], -0.5 * 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_sparse_class_out_of_range() {
        assert!(Cost::SparseCrossEntropy.cost(&[0.5, 0.5], &[3.0], 1).is_err());
    }
}
