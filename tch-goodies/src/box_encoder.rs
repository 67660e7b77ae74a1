//! Anchor-relative encoding of box coordinates.

use crate::{
    common::*,
    compound_tensor::{CxCyWHTensor, TLBRTensor},
    tensor::TensorExt,
};

/// Encodes boxes into offsets relative to prior boxes and back.
///
/// The center offset is divided by the prior size and the first variance,
/// and the size ratio is taken in log space and divided by the second
/// variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxEncoder {
    variance: [f64; 2],
}

impl BoxEncoder {
    pub fn new(variance: [f64; 2]) -> Result<Self> {
        let [center_var, size_var] = variance;
        ensure!(
            center_var > 0.0 && size_var > 0.0,
            "variance components must be positive, but get {:?}",
            variance
        );
        Ok(Self { variance })
    }

    pub fn variance(&self) -> [f64; 2] {
        self.variance
    }

    /// Encode matched boxes against priors of the same length into a `[P, 4]` tensor.
    pub fn encode(&self, matched: &TLBRTensor, priors: &CxCyWHTensor) -> Result<Tensor> {
        ensure!(
            matched.num_samples() == priors.num_samples(),
            "expect {} matched boxes, but get {}",
            priors.num_samples(),
            matched.num_samples()
        );
        let [center_var, size_var] = self.variance;
        let matched = CxCyWHTensor::from(matched);

        let dx = (matched.cx() - priors.cx()) / (priors.w() * center_var);
        let dy = (matched.cy() - priors.cy()) / (priors.h() * center_var);
        let dw = (matched.w() / priors.w()).log() / size_var;
        let dh = (matched.h() / priors.h()).log() / size_var;

        Ok(Tensor::cat(&[dx, dy, dw, dh], 1))
    }

    /// Decode `[P, 4]` offsets back into point-form boxes.
    pub fn decode(&self, loc: &Tensor, priors: &CxCyWHTensor) -> Result<TLBRTensor> {
        let [dx, dy, dw, dh]: [Tensor; 4] = loc
            .f_unzip_columns(4)?
            .try_into()
            .map_err(|_| format_err!("expect exactly 4 columns"))?;
        ensure!(
            dx.size2()?.0 == priors.num_samples(),
            "expect {} encoded boxes, but get {}",
            priors.num_samples(),
            dx.size2()?.0
        );
        let [center_var, size_var] = self.variance;

        let cx = priors.cx() + dx * center_var * priors.w();
        let cy = priors.cy() + dy * center_var * priors.h();
        let w = priors.w() * (dw * size_var).exp();
        let h = priors.h() * (dh * size_var).exp();

        Ok(TLBRTensor::from(&CxCyWHTensor { cx, cy, w, h }))
    }
}
