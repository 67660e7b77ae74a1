//! Tensor helpers for anchor box geometry.

mod common;
pub mod box_encoder;
pub mod compound_tensor;
pub mod tensor;
pub mod utils;

pub use box_encoder::*;
pub use compound_tensor::*;
pub use tensor::*;
pub use utils::EPSILON;
