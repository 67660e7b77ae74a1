use super::misc::{GroundTruth, MatchTargets, BACKGROUND_CLASS, IGNORED_CLASS};
use crate::common::*;

/// The assignment outcome of an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnchorOutcome {
    Positive,
    Negative,
    Ignored,
}

impl AnchorOutcome {
    /// Decide the outcome from the best overlap of an anchor.
    ///
    /// The matched threshold is inclusive for positives and the unmatched
    /// threshold is inclusive for the ignore band. Forced anchors are always positive.
    pub fn classify(
        forced: bool,
        overlap: f32,
        matched_threshold: f32,
        unmatched_threshold: f32,
    ) -> Self {
        if forced || overlap >= matched_threshold {
            Self::Positive
        } else if overlap >= unmatched_threshold {
            Self::Ignored
        } else {
            Self::Negative
        }
    }

    /// Recover the outcome from a sparse class target.
    pub fn from_class_target(target: i64) -> Self {
        match target {
            BACKGROUND_CLASS => Self::Negative,
            target if target < BACKGROUND_CLASS => Self::Ignored,
            _ => Self::Positive,
        }
    }
}

impl MatchTargets {
    /// Outcomes of each anchor in prior order.
    pub fn outcomes(&self) -> Vec<AnchorOutcome> {
        Vec::<i64>::from(&self.conf)
            .into_iter()
            .map(AnchorOutcome::from_class_target)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct AnchorMatcherInit {
    /// Anchors overlapping a ground truth at least this much are positive.
    pub matched_threshold: f64,
    /// Anchors overlapping every ground truth less than this are background.
    pub unmatched_threshold: f64,
    /// Scaling of center and size offsets.
    pub variance: [f64; 2],
    /// Number of classes including background.
    pub num_classes: i64,
}

impl AnchorMatcherInit {
    pub fn new(num_classes: i64) -> Self {
        Self {
            matched_threshold: 0.5,
            unmatched_threshold: 0.4,
            variance: [0.1, 0.2],
            num_classes,
        }
    }

    pub fn build(self) -> Result<AnchorMatcher> {
        let Self {
            matched_threshold,
            unmatched_threshold,
            variance,
            num_classes,
        } = self;

        ensure!(
            (0.0..=1.0).contains(&matched_threshold),
            "matched_threshold must be in range of [0, 1], but get {}",
            matched_threshold
        );
        ensure!(
            (0.0..=1.0).contains(&unmatched_threshold),
            "unmatched_threshold must be in range of [0, 1], but get {}",
            unmatched_threshold
        );
        ensure!(
            unmatched_threshold <= matched_threshold,
            "unmatched_threshold ({}) must not exceed matched_threshold ({})",
            unmatched_threshold,
            matched_threshold
        );
        ensure!(
            num_classes >= 2,
            "expect at least 2 classes including background, but get {}",
            num_classes
        );
        let encoder = BoxEncoder::new(variance)?;

        Ok(AnchorMatcher {
            matched_threshold,
            unmatched_threshold,
            encoder,
            num_classes,
        })
    }
}

/// Assigns ground truth objects to prior boxes of one image.
#[derive(Debug, Clone, Getters)]
pub struct AnchorMatcher {
    #[get = "pub"]
    matched_threshold: f64,
    #[get = "pub"]
    unmatched_threshold: f64,
    #[get = "pub"]
    encoder: BoxEncoder,
    #[get = "pub"]
    num_classes: i64,
}

impl AnchorMatcher {
    /// Compute the class and location targets of every prior.
    ///
    /// Matching is done on CPU and the returned targets stay on CPU.
    pub fn assign(&self, ground_truth: &GroundTruth, priors: &CxCyWHTensor) -> Result<MatchTargets> {
        tch::no_grad(|| {
            let priors = priors.to_device(Device::Cpu);
            let num_priors = priors.num_samples();
            ensure!(num_priors > 0, "expect at least one prior");

            if ground_truth.is_empty() {
                return Ok(MatchTargets::background(num_priors));
            }

            let max_label = ground_truth.labels().max().int64_value(&[]);
            ensure!(
                max_label + 1 < self.num_classes,
                "label {} is out of range for {} classes including background",
                max_label,
                self.num_classes
            );

            let gt_boxes = ground_truth.boxes();
            let overlaps = gt_boxes
                .pairwise_iou_with(&TLBRTensor::from(&priors))
                .to_kind(Kind::Float);

            // best ground truth per prior, and best prior per ground truth
            let (best_overlap, best_gt_index) = overlaps.max_dim(0, false);
            let (_, best_prior_index) = overlaps.max_dim(1, false);

            let overlap_vec = Vec::<f32>::from(&best_overlap);
            let mut gt_index_vec = Vec::<i64>::from(&best_gt_index);
            let mut forced_vec = vec![false; num_priors as usize];

            // later ground truths win when they share the best prior
            Vec::<i64>::from(&best_prior_index)
                .into_iter()
                .enumerate()
                .for_each(|(gt_index, prior_index)| {
                    gt_index_vec[prior_index as usize] = gt_index as i64;
                    forced_vec[prior_index as usize] = true;
                });

            let gt_index = Tensor::of_slice(&gt_index_vec);
            let label_vec = Vec::<i64>::from(&ground_truth.labels().index_select(0, &gt_index));
            let matched_threshold = self.matched_threshold as f32;
            let unmatched_threshold = self.unmatched_threshold as f32;

            let conf_vec: Vec<i64> = izip!(&forced_vec, &overlap_vec, &label_vec)
                .map(|(&forced, &overlap, &label)| {
                    match AnchorOutcome::classify(
                        forced,
                        overlap,
                        matched_threshold,
                        unmatched_threshold,
                    ) {
                        AnchorOutcome::Positive => label + 1,
                        AnchorOutcome::Negative => BACKGROUND_CLASS,
                        AnchorOutcome::Ignored => IGNORED_CLASS,
                    }
                })
                .collect();
            let conf = Tensor::of_slice(&conf_vec);

            let loc = {
                let matched_boxes = gt_boxes.index_select(&gt_index);
                let loc = self
                    .encoder
                    .encode(&matched_boxes, &priors)?
                    .to_kind(Kind::Float);
                loc.masked_fill(&conf.le(BACKGROUND_CLASS).unsqueeze(1), 0.0)
            };
            debug_assert!(!loc.has_nan(), "NaN detected");

            Ok(MatchTargets {
                loc,
                conf,
                forced: Tensor::of_slice(&forced_vec),
            })
        })
    }
}
