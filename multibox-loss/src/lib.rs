//! Multibox training loss for anchor-based detectors.
//!
//! The loss assigns ground truth boxes to a fixed set of prior boxes, then
//! computes a smooth-L1 localization loss on positive anchors and a softmax
//! focal loss on all non-ignored anchors.

mod common;
pub mod config;
pub mod loss;

pub use config::Config;
pub use loss::{
    AnchorMatcher, AnchorMatcherInit, AnchorOutcome, BatchMatchTargets, ClassPrior, GroundTruth,
    MatchSummary, MatchTargets, MultiBoxLoss, MultiBoxLossInit, MultiBoxLossOutput,
    MultiBoxPrediction,
};
