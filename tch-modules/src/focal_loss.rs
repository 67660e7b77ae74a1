use crate::common::*;
use tch_goodies::EPSILON;

/// The scaling applied on the summed focal loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr)]
pub enum FocalNormalization {
    /// Scale by the fraction of non-ignored anchors among all anchors in the batch.
    ContributingFraction,
    /// Scale by `total_anchors / (total_anchors * batch_size)`, i.e., divide by the batch size.
    BatchSize,
}

impl Default for FocalNormalization {
    fn default() -> Self {
        Self::ContributingFraction
    }
}

/// Softmax focal loss initializer.
#[derive(Debug)]
pub struct FocalLossInit {
    /// The per-class prior weight in shape `[num_classes]`.
    pub alpha: Tensor,
    /// The gamma coefficient of the modulating factor.
    pub gamma: f64,
    /// The normalization of the summed loss.
    pub normalization: FocalNormalization,
}

impl FocalLossInit {
    pub fn default(alpha: Tensor) -> Self {
        Self {
            alpha,
            gamma: 2.0,
            normalization: FocalNormalization::default(),
        }
    }

    /// Build a focal loss calculator with the alpha vector placed on `device`.
    pub fn build(self, device: Device) -> Result<FocalLoss> {
        let Self {
            alpha,
            gamma,
            normalization,
        } = self;

        ensure!(gamma > 0.0, "gamma must be positive, but get {}", gamma);
        let num_classes = alpha
            .size1()
            .context("alpha must be a 1-dimensional tensor")?;
        ensure!(
            num_classes >= 2,
            "expect at least 2 classes including background, but get {}",
            num_classes
        );

        let alpha = tch::no_grad(|| {
            alpha
                .to_kind(Kind::Float)
                .to_device(device)
                .set_requires_grad(false)
        });
        ensure!(
            bool::from(alpha.ge(0.0).logical_and(&alpha.le(1.0)).all()),
            "alpha values must be in range of [0.0, 1.0]"
        );

        Ok(FocalLoss {
            alpha,
            gamma,
            normalization,
            num_classes,
        })
    }
}

/// Softmax focal loss calculator with ignore masking.
///
/// Sparse targets follow the convention: negative values are ignored, `0`
/// is background and positive values are object classes.
#[derive(Debug)]
pub struct FocalLoss {
    alpha: Tensor,
    gamma: f64,
    normalization: FocalNormalization,
    num_classes: i64,
}

impl FocalLoss {
    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    pub fn device(&self) -> Device {
        self.alpha.device()
    }

    /// Compute per-anchor losses without reduction.
    ///
    /// The input is a `[N, num_classes]` tensor of raw scores and the target is a
    /// `[N]` int64 tensor. Ignored anchors get zero loss.
    pub fn forward_no_reduction(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (num_anchors, num_classes) = input.size2()?;
        ensure!(
            num_classes == self.num_classes,
            "expect {} classes, but get {}",
            self.num_classes,
            num_classes
        );
        ensure!(
            target.kind() == Kind::Int64 && target.size1()? == num_anchors,
            "expect target a [{}] int64 tensor",
            num_anchors
        );
        ensure!(
            input.device() == self.device() && target.device() == self.device(),
            "expect tensors on {:?}",
            self.device()
        );

        ensure!(
            bool::from(target.lt(num_classes).all()),
            "target values must be less than {}",
            num_classes
        );

        let probs = input.softmax(1, Kind::Float);

        let (loss_mask, class_mask, alpha_weight) = tch::no_grad(|| {
            let loss_mask = target.ge(0i64);
            // ignored entries are clamped for indexing only
            let ids = target.clamp_min(0i64);

            let class_mask = ids.one_hot(num_classes).to_kind(Kind::Float);
            let alpha = self.alpha.index_select(0, &ids);
            let is_positive = ids.gt(0i64).to_kind(Kind::Float);
            let alpha_weight: Tensor = &is_positive * &alpha + (1.0 - &is_positive) * (1.0 - &alpha);

            (loss_mask, class_mask, alpha_weight)
        });

        let prob = (&probs * &class_mask)
            .sum_dim_intlist(&[1], false, Kind::Float)
            .clamp(EPSILON, 1.0);
        let log_p = prob.log();
        // the base stays positive so that gamma < 1 keeps a finite gradient at p == 1
        let modulating_factor = (1.0f64 - &prob).clamp_min(EPSILON).pow_tensor_scalar(self.gamma);
        let loss = -alpha_weight * modulating_factor * log_p;

        Ok(loss * loss_mask.to_kind(Kind::Float))
    }

    /// Compute the normalized focal loss of a batch.
    ///
    /// The `input` and `target` tensors hold all anchors of the batch
    /// flattened along the first dimension.
    pub fn forward(&self, input: &Tensor, target: &Tensor, batch_size: i64) -> Result<Tensor> {
        let (num_anchors, _) = input.size2()?;
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(
            num_anchors % batch_size == 0,
            "{} anchors cannot be evenly divided into {} images",
            num_anchors,
            batch_size
        );

        // return zero tensor if input is empty
        if input.is_empty() {
            return Ok(Tensor::zeros(&[], (Kind::Float, input.device())).set_requires_grad(false));
        }

        let loss = self.forward_no_reduction(input, target)?;
        let loss_sum = loss.sum(Kind::Float);

        let factor = match self.normalization {
            FocalNormalization::ContributingFraction => {
                let num_contributing = target.ge(0i64).sum(Kind::Int64).int64_value(&[]);
                num_contributing as f64 / num_anchors as f64
            }
            FocalNormalization::BatchSize => {
                num_anchors as f64 / (num_anchors * batch_size) as f64
            }
        };

        let loss = loss_sum * factor;
        debug_assert!(!loss.has_nan(), "NaN detected");
        Ok(loss)
    }
}
