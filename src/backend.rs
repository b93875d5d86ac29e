//! Dense matrix kernels.
//!
//! Layers that reduce to matrix products (dense and recurrent) call into a
//! [`Backend`] handle injected at bind time. [`NativeBackend`] is pure Rust
//! and splits the output rows across the rayon pool; [`BlasBackend`] forwards
//! to `cblas` when the `blas` feature is enabled. Both are blocking calls.

use rayon::prelude::*;
use std::fmt::Debug;
use std::sync::Arc;

/// Row-major single-precision matrix kernels.
pub trait Backend: Debug + Send + Sync {
    /// `C = op(A) * op(B)` (or `C += ...` when `accumulate`), where `op(A)` is
    /// `m x k`, `op(B)` is `k x n` and `C` is `m x n`. A transposed operand is
    /// stored with its dimensions swapped.
    #[allow(clippy::too_many_arguments)]
    fn multiply(
        &self,
        transpose_a: bool,
        transpose_b: bool,
        m: usize,
        n: usize,
        k: usize,
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        accumulate: bool,
    );

    /// `A += x * y^T`, with `A` of shape `x.len() x y.len()`.
    fn outer_product(&self, x: &[f32], y: &[f32], a: &mut [f32]);

    fn name(&self) -> &'static str;
}

/// Shared backend handle.
pub type BackendHandle = Arc<dyn Backend>;

/// Returns the default backend for this build.
pub fn default_backend() -> BackendHandle {
    #[cfg(feature = "blas")]
    {
        Arc::new(BlasBackend)
    }
    #[cfg(not(feature = "blas"))]
    {
        Arc::new(NativeBackend)
    }
}

/// Portable rayon-parallel implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl Backend for NativeBackend {
    fn multiply(
        &self,
        transpose_a: bool,
        transpose_b: bool,
        m: usize,
        n: usize,
        k: usize,
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        accumulate: bool,
    ) {
        debug_assert_eq!(a.len(), m * k);
        debug_assert_eq!(b.len(), k * n);
        debug_assert_eq!(c.len(), m * n);
        if n == 0 {
            return;
        }
        // Each task owns one output row, so no two tasks write the same slot.
        c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            if !accumulate {
                row.iter_mut().for_each(|v| *v = 0.0);
            }
            for p in 0..k {
                let a_ip = if transpose_a { a[p * m + i] } else { a[i * k + p] };
                if a_ip == 0.0 {
                    continue;
                }
                if transpose_b {
                    for (j, out) in row.iter_mut().enumerate() {
                        *out += a_ip * b[j * k + p];
                    }
                } else {
                    let b_row = &b[p * n..(p + 1) * n];
                    for (out, &bv) in row.iter_mut().zip(b_row) {
                        *out += a_ip * bv;
                    }
                }
            }
        });
    }

    fn outer_product(&self, x: &[f32], y: &[f32], a: &mut [f32]) {
        let n = y.len();
        if n == 0 {
            return;
        }
        a.par_chunks_mut(n).zip(x.par_iter()).for_each(|(row, &xv)| {
            for (out, &yv) in row.iter_mut().zip(y) {
                *out += xv * yv;
            }
        });
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

/// BLAS-backed implementation (`cblas::sgemm` / `cblas::sger`).
#[cfg(feature = "blas")]
#[derive(Debug, Default, Clone, Copy)]
pub struct BlasBackend;

#[cfg(feature = "blas")]
extern crate blas_src;

#[cfg(feature = "blas")]
impl Backend for BlasBackend {
    fn multiply(
        &self,
        transpose_a: bool,
        transpose_b: bool,
        m: usize,
        n: usize,
        k: usize,
        a: &[f32],
        b: &[f32],
        c: &mut [f32],
        accumulate: bool,
    ) {
        use cblas::{sgemm, Layout, Transpose};
        let trans_a = if transpose_a {
            Transpose::Ordinary
        } else {
            Transpose::None
        };
        let trans_b = if transpose_b {
            Transpose::Ordinary
        } else {
            Transpose::None
        };
        let lda = if transpose_a { m } else { k };
        let ldb = if transpose_b { k } else { n };
        let beta = if accumulate { 1.0 } else { 0.0 };
        // SAFETY: slice lengths are checked by the callers against m, n and k.
        unsafe {
            sgemm(
                Layout::RowMajor,
                trans_a,
                trans_b,
                m as i32,
                n as i32,
                k as i32,
                1.0,
                a,
                lda as i32,
                b,
                ldb as i32,
                beta,
                c,
                n as i32,
            );
        }
    }

    fn outer_product(&self, x: &[f32], y: &[f32], a: &mut [f32]) {
        use cblas::{sger, Layout};
        // SAFETY: `a` holds x.len() * y.len() values in row-major order.
        unsafe {
            sger(
                Layout::RowMajor,
                x.len() as i32,
                y.len() as i32,
                1.0,
                x,
                1,
                y,
                1,
                a,
                y.len() as i32,
            );
        }
    }

    fn name(&self) -> &'static str {
        "blas"
    }
}
