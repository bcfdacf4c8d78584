//! Compute kernels.
//!
//! Every kernel operates on plain slices handed out by the buffer store; the
//! instance layer owns validation and dispatch. [`matrices`] builds
//! transition-probability matrices from eigen decompositions, [`partials`]
//! is the scalar post/pre-order propagation kernel, [`simd`] its vectorized
//! forms, and [`action`] the matrix-exponential-action backend.

pub mod action;
pub mod matrices;
pub mod partials;
pub mod simd;

/// Dimensions shared by the partials kernels.
#[derive(Debug, Clone, Copy)]
pub struct Dims {
    pub states: usize,
    pub patterns: usize,
    pub categories: usize,
}

impl Dims {
    pub fn category_stride(&self) -> usize {
        self.patterns * self.states
    }

    pub fn matrix_stride(&self) -> usize {
        self.states * self.states
    }
}
