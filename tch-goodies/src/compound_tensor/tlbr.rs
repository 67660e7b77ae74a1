use super::cxcywh::CxCyWHTensor;
use crate::{common::*, tensor::TensorExt, utils::EPSILON};

/// Checked tensor of batched box parameters in TLBR format.
///
/// The tensor is usually built from point-form boxes `[N, 4]` laid out as
/// `(xmin, ymin, xmax, ymax)`, i.e., `(l, t, r, b)`.
#[derive(Debug, TensorLike, Getters)]
pub struct TLBRTensor {
    /// The top parameter in shape `[batch, 1]`.
    #[get = "pub"]
    pub(crate) t: Tensor,
    /// The left parameter in shape `[batch, 1]`.
    #[get = "pub"]
    pub(crate) l: Tensor,
    /// The bottom parameter in shape `[batch, 1]`.
    #[get = "pub"]
    pub(crate) b: Tensor,
    /// The right parameter in shape `[batch, 1]`.
    #[get = "pub"]
    pub(crate) r: Tensor,
}

/// Unchecked tensor of batched box parameters in TLBR format.
#[derive(Debug, TensorLike)]
pub struct TLBRTensorUnchecked {
    /// The top parameter in shape `[batch, 1]`.
    pub t: Tensor,
    /// The left parameter in shape `[batch, 1]`.
    pub l: Tensor,
    /// The bottom parameter in shape `[batch, 1]`.
    pub b: Tensor,
    /// The right parameter in shape `[batch, 1]`.
    pub r: Tensor,
}

impl TLBRTensor {
    /// Build from a `[N, 4]` tensor of `(xmin, ymin, xmax, ymax)` rows.
    pub fn from_xyxy(tensor: &Tensor) -> Result<Self> {
        let columns = tensor
            .f_unzip_columns(4)
            .context("point-form boxes must be a [N, 4] tensor")?;
        let [l, t, r, b]: [Tensor; 4] = columns
            .try_into()
            .map_err(|_| format_err!("expect exactly 4 columns"))?;
        TLBRTensorUnchecked { t, l, b, r }.try_into()
    }

    /// Pack into a `[N, 4]` tensor of `(xmin, ymin, xmax, ymax)` rows.
    pub fn to_xyxy(&self) -> Tensor {
        let Self { t, l, b, r } = self;
        Tensor::cat(&[l, t, r, b], 1)
    }

    pub fn num_samples(&self) -> i64 {
        let (num, _) = self.t.size2().unwrap();
        num
    }

    pub fn device(&self) -> Device {
        self.t.device()
    }

    pub fn index_select(&self, indexes: &Tensor) -> Self {
        let Self { t, l, b, r } = self;
        let t = t.index_select(0, indexes);
        let l = l.index_select(0, indexes);
        let b = b.index_select(0, indexes);
        let r = r.index_select(0, indexes);
        Self { t, l, b, r }
    }

    /// Compute the box area in shape `[batch, 1]`.
    pub fn area(&self) -> Tensor {
        let Self { t, l, b, r } = self;
        (b - t) * (r - l)
    }

    /// Compute the intersection areas of every box pair.
    ///
    /// It returns a `[N, M]` tensor where `N` and `M` are the numbers of
    /// boxes in `self` and `other` respectively.
    pub fn pairwise_intersect_area_with(&self, other: &Self) -> Tensor {
        let Self {
            t: lhs_t,
            l: lhs_l,
            b: lhs_b,
            r: lhs_r,
        } = self;
        let [rhs_t, rhs_l, rhs_b, rhs_r] = {
            let Self { t, l, b, r } = other;
            [t, l, b, r].map(|param| param.transpose(0, 1))
        };

        let max_t = lhs_t.maximum(&rhs_t);
        let max_l = lhs_l.maximum(&rhs_l);
        let min_b = lhs_b.minimum(&rhs_b);
        let min_r = lhs_r.minimum(&rhs_r);

        let inner_h = (min_b - max_t).clamp_min(0.0);
        let inner_w = (min_r - max_l).clamp_min(0.0);

        inner_h * inner_w
    }

    /// Compute the IoU of every box pair in shape `[N, M]`.
    ///
    /// An empty `self` yields an empty `[0, M]` matrix.
    pub fn pairwise_iou_with(&self, other: &Self) -> Tensor {
        let inter_area = self.pairwise_intersect_area_with(other);
        let lhs_area = self.area();
        let rhs_area = other.area().transpose(0, 1);
        let union_area = lhs_area + rhs_area - &inter_area + EPSILON;
        inter_area / union_area
    }
}

impl TryFrom<TLBRTensorUnchecked> for TLBRTensor {
    type Error = Error;

    fn try_from(from: TLBRTensorUnchecked) -> Result<Self, Self::Error> {
        let TLBRTensorUnchecked { t, l, b, r } = from;
        match (t.size2()?, l.size2()?, b.size2()?, r.size2()?) {
            ((t_len, 1), (l_len, 1), (b_len, 1), (r_len, 1)) => ensure!(
                t_len == l_len && t_len == b_len && t_len == r_len,
                "size mismatch"
            ),
            _ => bail!("size mismatch"),
        };
        ensure!(
            hashset! {
                t.device(),
                l.device(),
                b.device(),
                r.device(),
            }
            .len()
                == 1,
            "device mismatch"
        );
        Ok(Self { t, l, b, r })
    }
}

impl From<TLBRTensor> for TLBRTensorUnchecked {
    fn from(from: TLBRTensor) -> Self {
        let TLBRTensor { t, l, b, r } = from;
        Self { t, l, b, r }
    }
}

impl From<&CxCyWHTensor> for TLBRTensor {
    fn from(from: &CxCyWHTensor) -> Self {
        let CxCyWHTensor { cx, cy, w, h } = from;

        let t = cy - h / 2.0;
        let b = cy + h / 2.0;
        let l = cx - w / 2.0;
        let r = cx + w / 2.0;

        Self { t, l, b, r }
    }
}
