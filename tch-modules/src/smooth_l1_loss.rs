use crate::common::*;

/// Masked smooth-L1 loss initializer.
#[derive(Debug, Clone)]
pub struct MaskedSmoothL1LossInit {
    /// The threshold where the loss turns from quadratic to linear.
    pub beta: f64,
}

impl Default for MaskedSmoothL1LossInit {
    fn default() -> Self {
        Self { beta: 1.0 }
    }
}

impl MaskedSmoothL1LossInit {
    pub fn build(self) -> Result<MaskedSmoothL1Loss> {
        let Self { beta } = self;
        ensure!(beta > 0.0, "beta must be positive, but get {}", beta);
        Ok(MaskedSmoothL1Loss { beta })
    }
}

/// Smooth-L1 box regression loss restricted to positive anchors.
///
/// The loss is summed over the coordinates of positive anchors and divided by
/// the number of positive anchors in the whole batch, or by 1 if there is none.
#[derive(Debug)]
pub struct MaskedSmoothL1Loss {
    beta: f64,
}

impl MaskedSmoothL1Loss {
    /// Compute the loss.
    ///
    /// - `input`: predicted offsets in shape `[batch, num_anchors, 4]`.
    /// - `target`: encoded offsets in shape `[batch, num_anchors, 4]`.
    /// - `conf_target`: sparse class targets in shape `[batch, num_anchors]`.
    pub fn forward(&self, input: &Tensor, target: &Tensor, conf_target: &Tensor) -> Result<Tensor> {
        let (batch_size, num_anchors, num_params) = input.size3()?;
        ensure!(
            num_params == 4,
            "expect 4 box parameters, but get {}",
            num_params
        );
        ensure!(
            target.size3()? == (batch_size, num_anchors, 4),
            "input and target tensors must have equal shape"
        );
        ensure!(
            conf_target.size2()? == (batch_size, num_anchors),
            "expect conf_target in shape [{}, {}]",
            batch_size,
            num_anchors
        );

        let (pos_mask, num_pos) = tch::no_grad(|| {
            let pos = conf_target.gt(0i64);
            let num_pos = pos.sum(Kind::Int64).int64_value(&[]);
            let pos_mask = pos.unsqueeze(-1).expand_as(input);
            (pos_mask, num_pos)
        });

        let pos_input = input.masked_select(&pos_mask);
        let pos_target = target.masked_select(&pos_mask).detach();
        let loss_sum = pos_input.smooth_l1_loss(&pos_target, Reduction::Sum, self.beta);

        let loss = loss_sum / num_pos.max(1) as f64;
        debug_assert!(!loss.has_nan(), "NaN detected");
        Ok(loss)
    }
}
