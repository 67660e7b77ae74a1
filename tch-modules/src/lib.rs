//! Loss modules for dense anchor-based detection.

mod common;
pub mod focal_loss;
pub mod smooth_l1_loss;

pub use focal_loss::*;
pub use smooth_l1_loss::*;
