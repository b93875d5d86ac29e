//! Shared utilities: the seeded RNG and activation functions.

pub mod activations;
pub mod rng;

pub use activations::{sigmoid, softmax_rows, Activation};
pub use rng::SimpleRng;
