//! RMS normalization with fused residual-add.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(size, "weight")?;
        Ok(Self { weight, eps })
    }

    pub fn from_weight(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(&x.contiguous()?, &self.weight, self.eps as f32)
    }

    /// Add-then-normalize step used between decoder sublayers.
    ///
    /// With a residual, the sum `x + residual` becomes the new residual and
    /// the normalized sum is returned as the activation. Without one (the
    /// first sublayer of layer zero) `x` itself seeds the residual stream.
    pub fn forward_residual(
        &self,
        x: &Tensor,
        residual: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let residual = match residual {
            Some(r) => (x + r)?,
            None => x.clone(),
        };
        let normed = self.forward(&residual)?;
        Ok((normed, residual))
    }
}
