//! Batch tensor layout.
//!
//! A batch of `B` examples with shape `(C, H, W)` is one flat `f32` buffer of
//! length `B * C * H * W`, channel-major and width-fastest:
//!
//! ```text
//! index = w + W * (h + H * (c + C * b))
//! ```
//!
//! Flat feature vectors use `(n, 1, 1)`, so the same formula applies.

use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-example feature map dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl Shape {
    pub const fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// A flat vector of `size` features.
    pub const fn flat(size: usize) -> Self {
        Self::new(size, 1, 1)
    }

    /// Number of values in one example.
    pub fn size(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Number of values in one channel plane.
    pub fn spatial(&self) -> usize {
        self.height * self.width
    }

    pub fn is_flat(&self) -> bool {
        self.height == 1 && self.width == 1
    }

    /// Fails with `InvalidShape` unless every dimension is positive and one
    /// example fits in a single buffer.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.height == 0 || self.width == 0 {
            return Err(NetworkError::InvalidShape(format!(
                "all dimensions must be positive, got {}",
                self
            )));
        }
        buffer_len(&[self.channels, self.height, self.width])?;
        Ok(())
    }

    /// Flat index of element `(b, c, h, w)`.
    #[inline]
    pub fn index(&self, b: usize, c: usize, h: usize, w: usize) -> usize {
        w + self.width * (h + self.height * (c + self.channels * b))
    }
}

/// Largest element count of any single buffer. Model files prefix every
/// buffer with an `i32` length.
pub const MAX_BUFFER_LEN: usize = i32::MAX as usize;

/// Product of `dims`, or `InvalidShape` when it overflows or exceeds
/// [`MAX_BUFFER_LEN`].
pub fn buffer_len(dims: &[usize]) -> Result<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .filter(|&len| len <= MAX_BUFFER_LEN)
        .ok_or_else(|| {
            NetworkError::InvalidShape(format!(
                "buffer of {:?} elements exceeds {}",
                dims, MAX_BUFFER_LEN
            ))
        })
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// Zero-pads (or `fill`-pads) every channel plane by `pad_h` rows and `pad_w`
/// columns on each side. Returns the padded buffer laid out with shape
/// `(C, H + 2*pad_h, W + 2*pad_w)`.
pub fn pad(
    input: &[f32],
    batch_size: usize,
    shape: Shape,
    pad_h: usize,
    pad_w: usize,
    fill: f32,
) -> Vec<f32> {
    if pad_h == 0 && pad_w == 0 {
        return input.to_vec();
    }
    let padded_shape = Shape::new(
        shape.channels,
        shape.height + 2 * pad_h,
        shape.width + 2 * pad_w,
    );
    let mut out = vec![fill; batch_size * padded_shape.size()];
    for b in 0..batch_size {
        for c in 0..shape.channels {
            for h in 0..shape.height {
                let src = shape.index(b, c, h, 0);
                let dst = padded_shape.index(b, c, h + pad_h, pad_w);
                out[dst..dst + shape.width].copy_from_slice(&input[src..src + shape.width]);
            }
        }
    }
    out
}

/// Crops a padded buffer back to `shape`, the exact inverse of [`pad`].
pub fn unpad(padded: &[f32], batch_size: usize, shape: Shape, pad_h: usize, pad_w: usize) -> Vec<f32> {
    if pad_h == 0 && pad_w == 0 {
        return padded.to_vec();
    }
    let padded_shape = Shape::new(
        shape.channels,
        shape.height + 2 * pad_h,
        shape.width + 2 * pad_w,
    );
    let mut out = vec![0.0f32; batch_size * shape.size()];
    for b in 0..batch_size {
        for c in 0..shape.channels {
            for h in 0..shape.height {
                let src = padded_shape.index(b, c, h + pad_h, pad_w);
                let dst = shape.index(b, c, h, 0);
                out[dst..dst + shape.width].copy_from_slice(&padded[src..src + shape.width]);
            }
        }
    }
    out
}

/// Concatenates per-example blocks along the channel axis, in the order given.
///
/// Each part is `(buffer, channels)`; all parts share `spatial = H * W`.
pub fn concat_channels(parts: &[(&[f32], usize)], batch_size: usize, spatial: usize) -> Vec<f32> {
    let total_channels: usize = parts.iter().map(|&(_, c)| c).sum();
    let mut out = Vec::with_capacity(batch_size * total_channels * spatial);
    for b in 0..batch_size {
        for &(data, channels) in parts {
            let block = channels * spatial;
            out.extend_from_slice(&data[b * block..(b + 1) * block]);
        }
    }
    out
}

/// Splits a channel-concatenated buffer back into its parts.
pub fn split_channels(
    data: &[f32],
    batch_size: usize,
    spatial: usize,
    channel_counts: &[usize],
) -> Vec<Vec<f32>> {
    let total_channels: usize = channel_counts.iter().sum();
    let mut parts: Vec<Vec<f32>> = channel_counts
        .iter()
        .map(|&c| Vec::with_capacity(batch_size * c * spatial))
        .collect();
    for b in 0..batch_size {
        let mut offset = b * total_channels * spatial;
        for (part, &channels) in parts.iter_mut().zip(channel_counts) {
            let block = channels * spatial;
            part.extend_from_slice(&data[offset..offset + block]);
            offset += block;
        }
    }
    parts
}

/// `target += source`, element-wise.
pub fn add_assign(target: &mut [f32], source: &[f32]) {
    for (t, &s) in target.iter_mut().zip(source) {
        *t += s;
    }
}

/// Ceiling division for positive integers.
#[inline]
pub fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_is_width_fastest() {
        let shape = Shape::new(2, 3, 4);
        assert_eq!(shape.index(0, 0, 0, 1), 1);
        assert_eq!(shape.index(0, 0, 1, 0), 4);
        assert_eq!(shape.index(0, 1, 0, 0), 12);
        assert_eq!(shape.index(1, 0, 0, 0), 24);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(Shape::new(1, 0, 3).validate().is_err());
        assert!(Shape::flat(5).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_shapes() {
        let max = i32::MAX as usize;
        assert!(matches!(
            Shape::new(max, max, max).validate(),
            Err(NetworkError::InvalidShape(_))
        ));
        assert!(Shape::new(1 << 16, 1 << 16, 1).validate().is_err());
        assert!(Shape::flat(max).validate().is_ok());
        assert!(buffer_len(&[usize::MAX, 2]).is_err());
        assert_eq!(buffer_len(&[3, 4, 5]).unwrap(), 60);
    }

    #[test]
    fn test_pad_unpad_inverse() {
        let shape = Shape::new(2, 3, 2);
        let batch = 2;
        let input: Vec<f32> = (0..batch * shape.size()).map(|v| v as f32 + 1.0).collect();
        let padded = pad(&input, batch, shape, 2, 1, 0.0);
        assert_eq!(padded.len(), batch * 2 * 7 * 4);
        assert_eq!(unpad(&padded, batch, shape, 2, 1), input);
    }

    #[test]
    fn test_pad_places_border() {
        let shape = Shape::new(1, 1, 1);
        let padded = pad(&[5.0], 1, shape, 1, 1, 0.0);
        assert_eq!(padded, vec![0.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_concat_split_channels() {
        let a = vec![1.0, 2.0, 3.0, 4.0]; // batch 2, 1 channel, spatial 2
        let b = vec![5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]; // batch 2, 2 channels
        let joined = concat_channels(&[(&a, 1), (&b, 2)], 2, 2);
        assert_eq!(
            joined,
            vec![1.0, 2.0, 5.0, 6.0, 7.0, 8.0, 3.0, 4.0, 9.0, 10.0, 11.0, 12.0]
        );
        let parts = split_channels(&joined, 2, 2, &[1, 2]);
        assert_eq!(parts[0], a);
        assert_eq!(parts[1], b);
    }

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(4, 2), 2);
        assert_eq!(div_ceil(5, 2), 3);
        assert_eq!(div_ceil(1, 3), 1);
    }
}
