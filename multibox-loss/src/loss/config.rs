use super::{ClassPrior, MultiBoxLossInit};
use crate::common::*;
use tch_modules::FocalNormalization;

/// The loss function configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of classes including background.
    pub num_classes: NonZeroUsize,
    #[serde(default)]
    pub background_label: usize,
    /// Reserved for hard negative mining.
    pub negpos_ratio: Option<usize>,
    pub matched_threshold: Option<R64>,
    pub unmatched_threshold: Option<R64>,
    /// Scaling of center and size offsets.
    pub variance: Option<[R64; 2]>,
    /// Class prior weight, a single number or one number per class.
    pub alpha: Option<ClassPrior>,
    pub gamma: Option<R64>,
    #[serde(default)]
    pub normalization: FocalNormalization,
    pub smooth_l1_beta: Option<R64>,
}

impl Config {
    pub fn multibox_loss_init(&self, device: Device) -> MultiBoxLossInit {
        let Self {
            num_classes,
            background_label,
            negpos_ratio,
            matched_threshold,
            unmatched_threshold,
            variance,
            ref alpha,
            gamma,
            normalization,
            smooth_l1_beta,
        } = *self;

        let mut init = MultiBoxLossInit {
            background_label: background_label as i64,
            normalization,
            device,
            ..MultiBoxLossInit::new(num_classes.get() as i64)
        };

        if let Some(negpos_ratio) = negpos_ratio {
            init.negpos_ratio = negpos_ratio;
        }

        if let Some(matched_threshold) = matched_threshold {
            init.matched_threshold = matched_threshold.raw();
        }

        if let Some(unmatched_threshold) = unmatched_threshold {
            init.unmatched_threshold = unmatched_threshold.raw();
        }

        if let Some([center_var, size_var]) = variance {
            init.variance = [center_var.raw(), size_var.raw()];
        }

        if let Some(alpha) = alpha {
            init.alpha = alpha.clone();
        }

        if let Some(gamma) = gamma {
            init.gamma = gamma.raw();
        }

        if let Some(smooth_l1_beta) = smooth_l1_beta {
            init.smooth_l1_beta = smooth_l1_beta.raw();
        }

        init
    }
}
