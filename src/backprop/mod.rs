//! Verified gradient engine
//!
//! Training-side counterpart of the weight storage: a cross-entropy
//! objective over decoder forward passes, with gradients produced by a
//! hand-written reverse pass and verified against a complex-step derivative
//! oracle.
//!
//! - [`prompt`]: token sequences and the reverse-copy training task.
//! - [`field`]: the scalar abstraction letting one forward pass run in
//!   `f32`, `f64`, or `Complex<f64>`.
//! - [`scalar`]: reference implementations and scalar VJPs.
//! - [`parallel`]: batched f32 forward/backward over the worker pool.
//! - [`check`]: the complex-step verification harness.

pub mod check;
pub mod field;
pub mod parallel;
pub mod prompt;
pub mod scalar;
