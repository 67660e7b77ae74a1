//! Checked column tensors of batched boxes.

mod cxcywh;
mod tlbr;

pub use cxcywh::*;
pub use tlbr::*;
