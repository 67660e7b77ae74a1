use super::{
    anchor_matching::{AnchorMatcher, AnchorMatcherInit},
    misc::{BatchMatchTargets, GroundTruth, MultiBoxPrediction},
};
use crate::common::*;
use tch_modules::{
    FocalLoss, FocalLossInit, FocalNormalization, MaskedSmoothL1Loss, MaskedSmoothL1LossInit,
};

/// The class prior weight of the focal loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClassPrior {
    /// The same weight for every class.
    Uniform(R64),
    /// One weight per class, background first.
    PerClass(Vec<R64>),
}

impl ClassPrior {
    pub fn to_tensor(&self, num_classes: i64) -> Result<Tensor> {
        let tensor = match self {
            Self::Uniform(alpha) => {
                Tensor::full(&[num_classes], alpha.raw(), (Kind::Float, Device::Cpu))
            }
            Self::PerClass(alphas) => {
                ensure!(
                    alphas.len() as i64 == num_classes,
                    "expect {} alpha values, but get {}",
                    num_classes,
                    alphas.len()
                );
                let alphas: Vec<f32> = alphas.iter().map(|alpha| alpha.raw() as f32).collect();
                Tensor::of_slice(&alphas)
            }
        };
        Ok(tensor)
    }
}

#[derive(Debug, Clone)]
pub struct MultiBoxLossInit {
    /// Number of classes including background.
    pub num_classes: i64,
    pub background_label: i64,
    /// Reserved for hard negative mining, which the focal objective does not use.
    pub negpos_ratio: usize,
    pub matched_threshold: f64,
    pub unmatched_threshold: f64,
    pub variance: [f64; 2],
    pub alpha: ClassPrior,
    pub gamma: f64,
    pub normalization: FocalNormalization,
    pub smooth_l1_beta: f64,
    pub device: Device,
}

impl MultiBoxLossInit {
    pub fn new(num_classes: i64) -> Self {
        let AnchorMatcherInit {
            matched_threshold,
            unmatched_threshold,
            variance,
            ..
        } = AnchorMatcherInit::new(num_classes);

        Self {
            num_classes,
            background_label: 0,
            negpos_ratio: 3,
            matched_threshold,
            unmatched_threshold,
            variance,
            alpha: ClassPrior::Uniform(r64(0.25)),
            gamma: 2.0,
            normalization: FocalNormalization::default(),
            smooth_l1_beta: 1.0,
            device: Device::Cpu,
        }
    }

    /// Build the loss with `[num_priors, 4]` priors in center form.
    pub fn build(self, priors: &Tensor) -> Result<MultiBoxLoss> {
        let Self {
            num_classes,
            background_label,
            negpos_ratio,
            matched_threshold,
            unmatched_threshold,
            variance,
            alpha,
            gamma,
            normalization,
            smooth_l1_beta,
            device,
        } = self;

        ensure!(
            background_label == 0,
            "only background label 0 is supported, but get {}",
            background_label
        );

        let matcher = AnchorMatcherInit {
            matched_threshold,
            unmatched_threshold,
            variance,
            num_classes,
        }
        .build()?;
        let focal_loss = FocalLossInit {
            alpha: alpha.to_tensor(num_classes)?,
            gamma,
            normalization,
        }
        .build(device)?;
        let loc_loss = MaskedSmoothL1LossInit {
            beta: smooth_l1_beta,
        }
        .build()?;

        let priors = tch::no_grad(|| -> Result<_> {
            let priors = priors.to_kind(Kind::Float).to_device(Device::Cpu);
            let priors =
                CxCyWHTensor::from_cxcywh(&priors).context("priors must be a [P, 4] tensor")?;
            ensure!(priors.num_samples() > 0, "expect at least one prior");
            ensure!(
                bool::from(priors.w().gt(0.0).logical_and(&priors.h().gt(0.0)).all()),
                "priors must have positive width and height"
            );
            Ok(priors)
        })?;

        Ok(MultiBoxLoss {
            matcher,
            focal_loss,
            loc_loss,
            priors,
            negpos_ratio,
            device,
        })
    }
}

/// The multibox loss combining anchor assignment, localization loss and focal loss.
#[derive(Debug, Getters)]
pub struct MultiBoxLoss {
    #[get = "pub"]
    matcher: AnchorMatcher,
    focal_loss: FocalLoss,
    loc_loss: MaskedSmoothL1Loss,
    /// Priors kept on CPU where the matching runs.
    #[get = "pub"]
    priors: CxCyWHTensor,
    #[get = "pub"]
    negpos_ratio: usize,
    #[get = "pub"]
    device: Device,
}

impl MultiBoxLoss {
    pub fn num_priors(&self) -> i64 {
        self.priors.num_samples()
    }

    pub fn num_classes(&self) -> i64 {
        self.focal_loss.num_classes()
    }

    pub fn forward(
        &self,
        prediction: &MultiBoxPrediction,
        ground_truths: &[GroundTruth],
    ) -> Result<MultiBoxLossOutput> {
        let batch_size = prediction.batch_size();
        let num_classes = self.num_classes();

        ensure!(
            prediction.num_priors() == self.num_priors(),
            "expect {} priors in prediction, but get {}",
            self.num_priors(),
            prediction.num_priors()
        );
        ensure!(
            prediction.num_classes() == num_classes,
            "expect {} classes in prediction, but get {}",
            num_classes,
            prediction.num_classes()
        );
        ensure!(
            ground_truths.len() as i64 == batch_size,
            "expect ground truth of {} images, but get {}",
            batch_size,
            ground_truths.len()
        );
        ensure!(
            prediction.device() == self.device,
            "expect prediction on {:?}, but get {:?}",
            self.device,
            prediction.device()
        );

        let targets = self.match_targets(ground_truths)?.to_device(self.device);

        let summary = targets.summary();
        debug!(
            "batch of {} images, {} positive, {} ignored, {} forced anchors",
            batch_size, summary.positive, summary.ignored, summary.forced
        );
        if summary.positive == 0 {
            warn!("no positive anchors in a batch of {} images", batch_size);
        }

        let loc_loss = self
            .loc_loss
            .forward(prediction.loc(), targets.loc(), targets.conf())?;
        let cls_loss = self.focal_loss.forward(
            &prediction.conf().reshape(&[-1, num_classes]),
            &targets.conf().reshape(&[-1]),
            batch_size,
        )?;

        Ok(MultiBoxLossOutput { loc_loss, cls_loss })
    }

    /// Assign ground truth to priors of every image and stack the targets.
    ///
    /// The targets are placed on CPU.
    pub fn match_targets(&self, ground_truths: &[GroundTruth]) -> Result<BatchMatchTargets> {
        let targets: Vec<_> = ground_truths
            .iter()
            .enumerate()
            .map(|(index, ground_truth)| {
                self.matcher
                    .assign(ground_truth, &self.priors)
                    .with_context(|| format!("unable to match ground truth of image {}", index))
            })
            .collect::<Result<_>>()?;
        BatchMatchTargets::stack(&targets)
    }
}

/// The two independently normalized losses of a batch.
#[derive(Debug, TensorLike)]
pub struct MultiBoxLossOutput {
    pub loc_loss: Tensor,
    pub cls_loss: Tensor,
}

impl MultiBoxLossOutput {
    /// Compute `loc_weight * loc_loss + cls_loss`.
    pub fn weighted_sum(&self, loc_weight: f64) -> Tensor {
        &self.loc_loss * loc_weight + &self.cls_loss
    }

    /// Average the losses of several batches, for example the outputs of multiple devices.
    ///
    /// The losses must reside on the same device.
    pub fn weighted_mean<L>(iter: impl IntoIterator<Item = (L, f64)>) -> Result<Self>
    where
        L: Borrow<MultiBoxLossOutput>,
    {
        let (outputs, weights): (Vec<_>, Vec<_>) = iter
            .into_iter()
            .map(|(output, weight)| (output.borrow().shallow_clone(), weight))
            .unzip();
        let weight_sum: f64 = weights.iter().sum();
        ensure!(
            weight_sum > 0.0,
            "the sum of weights must be positive, but get {}",
            weight_sum
        );

        let loc_loss = Tensor::f_sum_tensors(
            izip!(&outputs, &weights).map(|(output, &weight)| &output.loc_loss * weight),
        )? / weight_sum;
        let cls_loss = Tensor::f_sum_tensors(
            izip!(&outputs, &weights).map(|(output, &weight)| &output.cls_loss * weight),
        )? / weight_sum;

        Ok(Self { loc_loss, cls_loss })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::prelude::*;

    /// Two priors: one overlapping the test object well and one far away.
    fn priors() -> Tensor {
        Tensor::of_slice(&[0.5f32, 0.5, 0.4, 0.4, 0.1, 0.1, 0.1, 0.1]).view([2, 4])
    }

    fn loss_fn() -> Result<MultiBoxLoss> {
        MultiBoxLossInit::new(3).build(&priors())
    }

    fn prediction(batch_size: i64) -> Result<MultiBoxPrediction> {
        MultiBoxPrediction::new(
            Tensor::zeros(&[batch_size, 2, 4], (Kind::Float, Device::Cpu)),
            Tensor::zeros(&[batch_size, 2, 3], (Kind::Float, Device::Cpu)),
        )
    }

    #[test]
    fn localization_normalized_over_batch() -> Result<()> {
        let loss_fn = loss_fn()?;

        // the object is encoded to exactly zero offsets on the first prior
        let gt = GroundTruth::from_rows(&[[0.3, 0.3, 0.7, 0.7, 1.0]])?;
        let ground_truths = vec![gt, GroundTruth::empty()];

        // offsets of 0.5 on every coordinate of every prior
        let prediction = MultiBoxPrediction::new(
            Tensor::full(&[2, 2, 4], 0.5, (Kind::Float, Device::Cpu)),
            Tensor::zeros(&[2, 2, 3], (Kind::Float, Device::Cpu)),
        )?;

        let targets = loss_fn.match_targets(&ground_truths)?;
        ensure!(Vec::<i64>::from(&targets.conf().reshape(&[-1])) == vec![2, 0, 0, 0]);

        // one positive anchor with 4 coordinates of 0.5 * 0.5^2
        let output = loss_fn.forward(&prediction, &ground_truths)?;
        assert_abs_diff_eq!(output.loc_loss.double_value(&[]), 0.5, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn localization_normalized_by_positives_not_images() -> Result<()> {
        let loss_fn = loss_fn()?;

        // two objects, each exactly on one of the disjoint priors
        let gt = || -> Result<GroundTruth> {
            GroundTruth::from_rows(&[
                [0.3, 0.3, 0.7, 0.7, 1.0],
                [0.05, 0.05, 0.15, 0.15, 0.0],
            ])
        };
        let prediction = |batch_size: i64| {
            MultiBoxPrediction::new(
                Tensor::full(&[batch_size, 2, 4], 0.5, (Kind::Float, Device::Cpu)),
                Tensor::zeros(&[batch_size, 2, 3], (Kind::Float, Device::Cpu)),
            )
        };

        let ground_truths = vec![gt()?, GroundTruth::empty()];
        let targets = loss_fn.match_targets(&ground_truths)?;
        ensure!(Vec::<i64>::from(&targets.conf().reshape(&[-1])) == vec![2, 1, 0, 0]);
        ensure!(targets.summary().positive == 2);

        // 2 positives with 4 coordinates of 0.5 * 0.5^2 each, divided by 2
        let output = loss_fn.forward(&prediction(2)?, &ground_truths)?;
        assert_abs_diff_eq!(output.loc_loss.double_value(&[]), 0.5, epsilon = 1e-4);

        // more empty images leave the normalizer unchanged
        let ground_truths = vec![gt()?, GroundTruth::empty(), GroundTruth::empty()];
        let output = loss_fn.forward(&prediction(3)?, &ground_truths)?;
        assert_abs_diff_eq!(output.loc_loss.double_value(&[]), 0.5, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn uniform_scores_give_known_focal_loss() -> Result<()> {
        let loss_fn = loss_fn()?;
        let ground_truths = vec![GroundTruth::from_rows(&[[0.3, 0.3, 0.7, 0.7, 1.0]])?];
        let output = loss_fn.forward(&prediction(1)?, &ground_truths)?;

        // one positive and one background anchor, uniform probability 1/3
        let p: f64 = 1.0 / 3.0;
        let modulated = (1.0 - p).powi(2) * -p.ln();
        let expect = 0.25 * modulated + 0.75 * modulated;
        assert_abs_diff_eq!(output.cls_loss.double_value(&[]), expect, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn batch_without_ground_truth() -> Result<()> {
        let loss_fn = loss_fn()?;
        let loc = Tensor::randn(&[2, 2, 4], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let conf = Tensor::randn(&[2, 2, 3], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let prediction = MultiBoxPrediction::new(loc.shallow_clone(), conf.shallow_clone())?;

        let output = loss_fn.forward(&prediction, &[GroundTruth::empty(), GroundTruth::empty()])?;
        assert_abs_diff_eq!(output.loc_loss.double_value(&[]), 0.0);
        ensure!(output.cls_loss.double_value(&[]).is_finite());

        output.weighted_sum(1.0).backward();
        ensure!(bool::from(loc.grad().eq(0.0).all()));
        ensure!(!conf.grad().has_nan());
        Ok(())
    }

    #[test]
    fn exact_localization_gives_zero_loss() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let loss_fn = loss_fn()?;

        let ground_truths: Vec<_> = (0..4)
            .map(|_| {
                let l: f32 = rng.gen_range(0.2..0.4);
                let t: f32 = rng.gen_range(0.2..0.4);
                let label = rng.gen_range(0..2) as f32;
                GroundTruth::from_rows(&[[l, t, l + 0.35, t + 0.35, label]])
            })
            .collect::<Result<_>>()?;
        let targets = loss_fn.match_targets(&ground_truths)?;

        let prediction = MultiBoxPrediction::new(
            targets.loc().copy(),
            Tensor::randn(&[4, 2, 3], (Kind::Float, Device::Cpu)),
        )?;
        let output = loss_fn.forward(&prediction, &ground_truths)?;
        assert_abs_diff_eq!(output.loc_loss.double_value(&[]), 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn reject_mismatched_inputs() -> Result<()> {
        let loss_fn = loss_fn()?;
        let gt = || GroundTruth::empty();

        // wrong number of images
        ensure!(loss_fn.forward(&prediction(2)?, &[gt()]).is_err());

        // wrong number of priors
        let prediction = MultiBoxPrediction::new(
            Tensor::zeros(&[1, 3, 4], (Kind::Float, Device::Cpu)),
            Tensor::zeros(&[1, 3, 3], (Kind::Float, Device::Cpu)),
        )?;
        ensure!(loss_fn.forward(&prediction, &[gt()]).is_err());

        // wrong number of classes
        let prediction = MultiBoxPrediction::new(
            Tensor::zeros(&[1, 2, 4], (Kind::Float, Device::Cpu)),
            Tensor::zeros(&[1, 2, 5], (Kind::Float, Device::Cpu)),
        )?;
        ensure!(loss_fn.forward(&prediction, &[gt()]).is_err());
        Ok(())
    }

    #[test]
    fn reject_invalid_configuration() -> Result<()> {
        let build = |init: MultiBoxLossInit| init.build(&priors());

        ensure!(build(MultiBoxLossInit {
            unmatched_threshold: 0.6,
            ..MultiBoxLossInit::new(3)
        })
        .is_err());
        ensure!(build(MultiBoxLossInit {
            gamma: 0.0,
            ..MultiBoxLossInit::new(3)
        })
        .is_err());
        ensure!(build(MultiBoxLossInit {
            background_label: 1,
            ..MultiBoxLossInit::new(3)
        })
        .is_err());
        ensure!(build(MultiBoxLossInit {
            alpha: ClassPrior::PerClass(vec![r64(0.25), r64(0.25)]),
            ..MultiBoxLossInit::new(3)
        })
        .is_err());
        ensure!(build(MultiBoxLossInit {
            alpha: ClassPrior::Uniform(r64(1.5)),
            ..MultiBoxLossInit::new(3)
        })
        .is_err());
        ensure!(MultiBoxLossInit::new(3)
            .build(&Tensor::zeros(&[2, 3], (Kind::Float, Device::Cpu)))
            .is_err());
        Ok(())
    }

    #[test]
    fn weighted_mean_of_outputs() -> Result<()> {
        let lhs = MultiBoxLossOutput {
            loc_loss: Tensor::full(&[], 1.0, (Kind::Float, Device::Cpu)),
            cls_loss: Tensor::full(&[], 2.0, (Kind::Float, Device::Cpu)),
        };
        let rhs = MultiBoxLossOutput {
            loc_loss: Tensor::full(&[], 3.0, (Kind::Float, Device::Cpu)),
            cls_loss: Tensor::full(&[], 6.0, (Kind::Float, Device::Cpu)),
        };

        let mean = MultiBoxLossOutput::weighted_mean([(&lhs, 1.0), (&rhs, 3.0)])?;
        assert_abs_diff_eq!(mean.loc_loss.double_value(&[]), 2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(mean.cls_loss.double_value(&[]), 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(lhs.weighted_sum(2.0).double_value(&[]), 4.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn losses_decrease_under_training() -> Result<()> {
        use tch::nn::{self, OptimizerConfig as _};

        let loss_fn = loss_fn()?;
        let ground_truths = vec![GroundTruth::from_rows(&[[0.32, 0.28, 0.7, 0.72, 0.0]])?];

        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let loc = root.zeros("loc", &[1, 2, 4]);
        let conf = root.zeros("conf", &[1, 2, 3]);
        let mut opt = nn::Adam::default().build(&vs, 0.05)?;

        let compute = || -> Result<MultiBoxLossOutput> {
            let prediction = MultiBoxPrediction::new(loc.shallow_clone(), conf.shallow_clone())?;
            loss_fn.forward(&prediction, &ground_truths)
        };

        let initial = compute()?;
        for _ in 0..100 {
            let output = compute()?;
            opt.backward_step(&output.weighted_sum(1.0));
        }
        let last = compute()?;

        ensure!(last.loc_loss.double_value(&[]) < initial.loc_loss.double_value(&[]));
        ensure!(last.cls_loss.double_value(&[]) < initial.cls_loss.double_value(&[]));
        Ok(())
    }
}
