//! Anchor assignment and the multibox loss.

mod anchor_matching;
mod config;
mod misc;
mod multibox_loss;

pub use anchor_matching::*;
pub use config::*;
pub use misc::*;
pub use multibox_loss::*;
