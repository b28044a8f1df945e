//! Rotary position embeddings with precomputed cos/sin tables.

use candle_core::{DType, Device, Result, Tensor};

pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    neox: bool,
}

impl RotaryEmbedding {
    /// Tables cover `[0, max_positions)`. `scaling_factor` applies linear
    /// rope scaling by dividing positions before the frequency product.
    pub fn new(
        head_dim: usize,
        max_positions: usize,
        base: f64,
        scaling_factor: Option<f64>,
        neox: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim / 2)
            .map(|i| (1.0 / base.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, head_dim / 2), device)?;

        let scale = scaling_factor.unwrap_or(1.0);
        let positions: Vec<f32> = (0..max_positions).map(|p| (p as f64 / scale) as f32).collect();
        let positions = Tensor::from_vec(positions, (max_positions, 1), device)?;

        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
            neox,
        })
    }

    /// Rotates `q` and `k`, both `[tokens, heads, head_dim]`, at the given
    /// flat `[tokens]` u32 positions.
    pub fn apply(&self, positions: &Tensor, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let cos = self.cos.index_select(positions, 0)?;
        let sin = self.sin.index_select(positions, 0)?;
        let q = self.rotate(q, &cos, &sin)?;
        let k = self.rotate(k, &cos, &sin)?;
        Ok((q, k))
    }

    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        // rope wants [batch, heads, tokens, head_dim].
        let x = x.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
        let rotated = if self.neox {
            candle_nn::rotary_emb::rope(&x, cos, sin)?
        } else {
            candle_nn::rotary_emb::rope_i(&x, cos, sin)?
        };
        rotated.squeeze(0)?.transpose(0, 1)?.contiguous()
    }
}
