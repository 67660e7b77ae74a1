use crate::common::*;

/// The class target of background anchors.
pub const BACKGROUND_CLASS: i64 = 0;
/// The class target of anchors excluded from both losses.
pub const IGNORED_CLASS: i64 = -1;

/// Ground truth boxes and labels of one image.
#[derive(Debug, TensorLike, Getters)]
pub struct GroundTruth {
    /// Boxes in point form.
    #[get = "pub"]
    boxes: TLBRTensor,
    /// Zero-based object labels in shape `[num_objects]`.
    #[get = "pub"]
    labels: Tensor,
}

impl GroundTruth {
    /// Create a ground truth without objects.
    pub fn empty() -> Self {
        let boxes = TLBRTensor::from_xyxy(&Tensor::zeros(&[0, 4], (Kind::Float, Device::Cpu)))
            .unwrap();
        let labels = Tensor::zeros(&[0], (Kind::Int64, Device::Cpu));
        Self { boxes, labels }
    }

    /// Build from point-form boxes in shape `[N, 4]` and labels in shape `[N]`.
    pub fn new(boxes: &Tensor, labels: &Tensor) -> Result<Self> {
        let (boxes, labels) = tch::no_grad(|| -> Result<_> {
            let boxes = boxes.to_kind(Kind::Float).to_device(Device::Cpu);
            let labels = labels.to_kind(Kind::Double).to_device(Device::Cpu);

            let boxes = TLBRTensor::from_xyxy(&boxes)?;
            let num_objects = boxes.num_samples();
            ensure!(
                labels.size1()? == num_objects,
                "expect {} labels, but get {:?}",
                num_objects,
                labels.size()
            );
            ensure!(
                bool::from(labels.ge(0.0).all()) && bool::from(labels.eq_tensor(&labels.round()).all()),
                "labels must be non-negative integers"
            );
            ensure!(
                bool::from(
                    (boxes.b() - boxes.t())
                        .gt(0.0)
                        .logical_and(&(boxes.r() - boxes.l()).gt(0.0))
                        .all()
                ),
                "ground truth boxes must have positive width and height"
            );

            Ok((boxes, labels.to_kind(Kind::Int64)))
        })?;

        Ok(Self { boxes, labels })
    }

    /// Build from a `[N, 5]` tensor where the columns are `(xmin, ymin, xmax, ymax, label)`.
    ///
    /// An empty tensor yields a ground truth without objects.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        if tensor.is_empty() {
            return Ok(Self::empty());
        }

        let (_, num_columns) = tensor
            .size2()
            .context("ground truth must be a [N, 5] tensor")?;
        ensure!(
            num_columns == 5,
            "expect 5 ground truth columns, but get {}",
            num_columns
        );
        Self::new(&tensor.i((.., 0..4)), &tensor.i((.., 4)))
    }

    /// Build from `(xmin, ymin, xmax, ymax, label)` rows.
    pub fn from_rows(rows: &[[f32; 5]]) -> Result<Self> {
        let tensor = Tensor::of_slice(&rows.concat()).view([rows.len() as i64, 5]);
        Self::from_tensor(&tensor)
    }

    pub fn num_objects(&self) -> i64 {
        self.boxes.num_samples()
    }

    pub fn is_empty(&self) -> bool {
        self.num_objects() == 0
    }
}

/// Counts of anchor assignment outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MatchSummary {
    pub positive: usize,
    pub negative: usize,
    pub ignored: usize,
    /// Anchors made positive because they are the best anchor of some ground truth.
    pub forced: usize,
}

impl MatchSummary {
    fn from_tensors(conf: &Tensor, forced: &Tensor) -> Self {
        let count = |mask: Tensor| mask.sum(Kind::Int64).int64_value(&[]) as usize;
        Self {
            positive: count(conf.gt(BACKGROUND_CLASS)),
            negative: count(conf.eq(BACKGROUND_CLASS)),
            ignored: count(conf.lt(BACKGROUND_CLASS)),
            forced: count(forced.shallow_clone()),
        }
    }

    pub fn total(&self) -> usize {
        self.positive + self.negative + self.ignored
    }
}

impl Add for MatchSummary {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            positive: self.positive + rhs.positive,
            negative: self.negative + rhs.negative,
            ignored: self.ignored + rhs.ignored,
            forced: self.forced + rhs.forced,
        }
    }
}

/// Assignment targets of one image.
#[derive(Debug, TensorLike, Getters)]
pub struct MatchTargets {
    /// Encoded regression targets in shape `[num_priors, 4]`, zero on non-positive anchors.
    #[get = "pub"]
    pub(crate) loc: Tensor,
    /// Class targets in shape `[num_priors]`.
    #[get = "pub"]
    pub(crate) conf: Tensor,
    /// Forced-match flags in shape `[num_priors]`.
    #[get = "pub"]
    pub(crate) forced: Tensor,
}

impl MatchTargets {
    /// Targets where every anchor is background.
    pub fn background(num_priors: i64) -> Self {
        Self {
            loc: Tensor::zeros(&[num_priors, 4], (Kind::Float, Device::Cpu)),
            conf: Tensor::full(&[num_priors], BACKGROUND_CLASS, (Kind::Int64, Device::Cpu)),
            forced: Tensor::zeros(&[num_priors], (Kind::Bool, Device::Cpu)),
        }
    }

    pub fn num_priors(&self) -> i64 {
        self.conf.size1().unwrap()
    }

    pub fn summary(&self) -> MatchSummary {
        MatchSummary::from_tensors(&self.conf, &self.forced)
    }
}

/// Assignment targets of a batch, stacked along the first dimension.
#[derive(Debug, TensorLike, Getters)]
pub struct BatchMatchTargets {
    /// Encoded regression targets in shape `[batch, num_priors, 4]`.
    #[get = "pub"]
    loc: Tensor,
    /// Class targets in shape `[batch, num_priors]`.
    #[get = "pub"]
    conf: Tensor,
    /// Forced-match flags in shape `[batch, num_priors]`.
    #[get = "pub"]
    forced: Tensor,
}

impl BatchMatchTargets {
    /// Stack per-image targets in batch order.
    pub fn stack<T>(targets: &[T]) -> Result<Self>
    where
        T: Borrow<MatchTargets>,
    {
        ensure!(!targets.is_empty(), "expect at least one image");
        ensure!(
            targets
                .iter()
                .map(|target| target.borrow().num_priors())
                .all_equal(),
            "every image must have the same number of priors"
        );

        let loc_vec: Vec<_> = targets.iter().map(|target| &target.borrow().loc).collect();
        let conf_vec: Vec<_> = targets.iter().map(|target| &target.borrow().conf).collect();
        let forced_vec: Vec<_> = targets
            .iter()
            .map(|target| &target.borrow().forced)
            .collect();

        Ok(Self {
            loc: Tensor::stack(&loc_vec, 0),
            conf: Tensor::stack(&conf_vec, 0),
            forced: Tensor::stack(&forced_vec, 0),
        })
    }

    pub fn batch_size(&self) -> i64 {
        let (batch_size, _) = self.conf.size2().unwrap();
        batch_size
    }

    pub fn summary(&self) -> MatchSummary {
        MatchSummary::from_tensors(&self.conf, &self.forced)
    }

    /// Summaries of each image in batch order.
    pub fn image_summaries(&self) -> Vec<MatchSummary> {
        (0..self.batch_size())
            .map(|index| MatchSummary::from_tensors(&self.conf.i(index), &self.forced.i(index)))
            .collect()
    }
}

/// Unchecked raw outputs of the detector.
#[derive(Debug, TensorLike)]
pub struct MultiBoxPredictionUnchecked {
    /// Location offsets in shape `[batch, num_priors, 4]`.
    pub loc: Tensor,
    /// Class scores in shape `[batch, num_priors, num_classes]`.
    pub conf: Tensor,
}

/// Checked raw outputs of the detector.
#[derive(Debug, TensorLike, Getters)]
pub struct MultiBoxPrediction {
    #[get = "pub"]
    loc: Tensor,
    #[get = "pub"]
    conf: Tensor,
}

impl MultiBoxPrediction {
    pub fn new(loc: Tensor, conf: Tensor) -> Result<Self> {
        MultiBoxPredictionUnchecked { loc, conf }.try_into()
    }

    pub fn batch_size(&self) -> i64 {
        let (batch_size, _, _) = self.loc.size3().unwrap();
        batch_size
    }

    pub fn num_priors(&self) -> i64 {
        let (_, num_priors, _) = self.loc.size3().unwrap();
        num_priors
    }

    pub fn num_classes(&self) -> i64 {
        let (_, _, num_classes) = self.conf.size3().unwrap();
        num_classes
    }

    pub fn device(&self) -> Device {
        self.loc.device()
    }
}

impl TryFrom<MultiBoxPredictionUnchecked> for MultiBoxPrediction {
    type Error = Error;

    fn try_from(from: MultiBoxPredictionUnchecked) -> Result<Self, Self::Error> {
        let MultiBoxPredictionUnchecked { loc, conf } = from;
        let (loc_batch, loc_priors, num_params) = loc.size3()?;
        let (conf_batch, conf_priors, _num_classes) = conf.size3()?;
        ensure!(
            num_params == 4,
            "expect 4 location parameters, but get {}",
            num_params
        );
        ensure!(
            loc_batch == conf_batch && loc_priors == conf_priors,
            "size mismatch between loc {:?} and conf {:?}",
            loc.size(),
            conf.size()
        );
        ensure!(loc.device() == conf.device(), "device mismatch");
        Ok(Self { loc, conf })
    }
}

impl From<MultiBoxPrediction> for MultiBoxPredictionUnchecked {
    fn from(from: MultiBoxPrediction) -> Self {
        let MultiBoxPrediction { loc, conf } = from;
        Self { loc, conf }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ground_truth_from_tensor() -> Result<()> {
        let gt = GroundTruth::from_rows(&[[0.1, 0.1, 0.4, 0.5, 2.0], [0.5, 0.5, 0.9, 0.8, 0.0]])?;
        ensure!(gt.num_objects() == 2);
        ensure!(Vec::<i64>::from(gt.labels()) == vec![2, 0]);

        ensure!(GroundTruth::from_rows(&[])?.is_empty());
        ensure!(GroundTruth::from_tensor(&Tensor::zeros(&[0], (Kind::Float, Device::Cpu)))?
            .is_empty());
        Ok(())
    }

    #[test]
    fn reject_malformed_ground_truth() {
        // degenerate box
        assert!(GroundTruth::from_rows(&[[0.1, 0.1, 0.1, 0.5, 1.0]]).is_err());
        // fractional label
        assert!(GroundTruth::from_rows(&[[0.1, 0.1, 0.4, 0.5, 1.5]]).is_err());
        // negative label
        assert!(GroundTruth::from_rows(&[[0.1, 0.1, 0.4, 0.5, -1.0]]).is_err());
        // missing label column
        let tensor = Tensor::of_slice(&[0.1f32, 0.1, 0.4, 0.5]).view([1, 4]);
        assert!(GroundTruth::from_tensor(&tensor).is_err());
    }

    #[test]
    fn stack_targets() -> Result<()> {
        let first = MatchTargets::background(3);
        let second = MatchTargets {
            loc: Tensor::ones(&[3, 4], (Kind::Float, Device::Cpu)),
            conf: Tensor::of_slice(&[2i64, -1, 0]),
            forced: Tensor::of_slice(&[true, false, false]),
        };

        let batch = BatchMatchTargets::stack(&[first, second])?;
        ensure!(batch.loc().size3()? == (2, 3, 4));
        ensure!(batch.conf().size2()? == (2, 3));
        ensure!(
            batch.summary()
                == MatchSummary {
                    positive: 1,
                    negative: 4,
                    ignored: 1,
                    forced: 1,
                }
        );
        ensure!(batch.image_summaries()[0].negative == 3);

        let mismatched = [MatchTargets::background(3), MatchTargets::background(4)];
        ensure!(BatchMatchTargets::stack(&mismatched).is_err());
        Ok(())
    }

    #[test]
    fn reject_mismatched_prediction() {
        let loc = Tensor::zeros(&[2, 8, 4], (Kind::Float, Device::Cpu));
        let conf = Tensor::zeros(&[2, 7, 3], (Kind::Float, Device::Cpu));
        assert!(MultiBoxPrediction::new(loc, conf).is_err());

        let loc = Tensor::zeros(&[2, 8, 5], (Kind::Float, Device::Cpu));
        let conf = Tensor::zeros(&[2, 8, 3], (Kind::Float, Device::Cpu));
        assert!(MultiBoxPrediction::new(loc, conf).is_err());
    }
}
