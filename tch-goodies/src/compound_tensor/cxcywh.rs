use super::tlbr::TLBRTensor;
use crate::{common::*, tensor::TensorExt};

/// Checked tensor of batched box parameters in center form.
#[derive(Debug, TensorLike, Getters)]
pub struct CxCyWHTensor {
    /// The center x parameter in shape `[batch, 1]`.
    #[get = "pub"]
    pub(crate) cx: Tensor,
    /// The center y parameter in shape `[batch, 1]`.
    #[get = "pub"]
    pub(crate) cy: Tensor,
    /// The width parameter in shape `[batch, 1]`.
    #[get = "pub"]
    pub(crate) w: Tensor,
    /// The height parameter in shape `[batch, 1]`.
    #[get = "pub"]
    pub(crate) h: Tensor,
}

/// Unchecked tensor of batched box parameters in center form.
#[derive(Debug, TensorLike)]
pub struct CxCyWHTensorUnchecked {
    pub cx: Tensor,
    pub cy: Tensor,
    pub w: Tensor,
    pub h: Tensor,
}

impl CxCyWHTensor {
    /// Build from a `[N, 4]` tensor of `(cx, cy, w, h)` rows.
    pub fn from_cxcywh(tensor: &Tensor) -> Result<Self> {
        let columns = tensor
            .f_unzip_columns(4)
            .context("center-form boxes must be a [N, 4] tensor")?;
        let [cx, cy, w, h]: [Tensor; 4] = columns
            .try_into()
            .map_err(|_| format_err!("expect exactly 4 columns"))?;
        CxCyWHTensorUnchecked { cx, cy, w, h }.try_into()
    }

    /// Pack into a `[N, 4]` tensor of `(cx, cy, w, h)` rows.
    pub fn to_cxcywh(&self) -> Tensor {
        let Self { cx, cy, w, h } = self;
        Tensor::cat(&[cx, cy, w, h], 1)
    }

    pub fn num_samples(&self) -> i64 {
        let (num, _) = self.cx.size2().unwrap();
        num
    }

    pub fn device(&self) -> Device {
        self.cx.device()
    }

    pub fn index_select(&self, indexes: &Tensor) -> Self {
        let Self { cx, cy, w, h } = self;
        Self {
            cx: cx.index_select(0, indexes),
            cy: cy.index_select(0, indexes),
            w: w.index_select(0, indexes),
            h: h.index_select(0, indexes),
        }
    }

    /// Compute box area.
    pub fn area(&self) -> Tensor {
        &self.w * &self.h
    }
}

impl TryFrom<CxCyWHTensorUnchecked> for CxCyWHTensor {
    type Error = Error;

    fn try_from(from: CxCyWHTensorUnchecked) -> Result<Self, Self::Error> {
        let CxCyWHTensorUnchecked { cx, cy, w, h } = from;
        match (cx.size2()?, cy.size2()?, w.size2()?, h.size2()?) {
            ((cx_len, 1), (cy_len, 1), (w_len, 1), (h_len, 1)) => ensure!(
                cx_len == cy_len && cx_len == w_len && cx_len == h_len,
                "size mismatch"
            ),
            _ => bail!("size mismatch"),
        };
        ensure!(
            hashset! {
                cx.device(),
                cy.device(),
                w.device(),
                h.device(),
            }
            .len()
                == 1,
            "device mismatch"
        );
        Ok(Self { cx, cy, w, h })
    }
}

impl From<CxCyWHTensor> for CxCyWHTensorUnchecked {
    fn from(from: CxCyWHTensor) -> Self {
        let CxCyWHTensor { cx, cy, w, h } = from;
        Self { cx, cy, w, h }
    }
}

impl From<&TLBRTensor> for CxCyWHTensor {
    fn from(from: &TLBRTensor) -> Self {
        let TLBRTensor { t, l, b, r } = from;
        let h = b - t;
        let w = r - l;
        let cy = t + &h / 2.0;
        let cx = l + &w / 2.0;
        Self { cx, cy, w, h }
    }
}
