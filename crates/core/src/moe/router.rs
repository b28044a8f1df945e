//! Top-k softmax router.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::distributed::ReplicatedLinear;

/// Routing output for a batch of tokens.
///
/// `weights` is `[tokens, k]` f32, `experts` is `[tokens, k]` u32. Column
/// order is descending by gate probability.
pub struct RoutingDecision {
    pub weights: Tensor,
    pub experts: Tensor,
}

/// Linear gate over the hidden state followed by f32 softmax and top-k.
///
/// The gate is replicated on every rank so all workers pick identical
/// experts for identical inputs.
pub struct MoeRouter {
    gate: ReplicatedLinear,
    num_experts: usize,
    top_k: usize,
    renormalize: bool,
}

impl MoeRouter {
    pub fn new(
        hidden_size: usize,
        num_experts: usize,
        top_k: usize,
        renormalize: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let gate = ReplicatedLinear::new(hidden_size, num_experts, false, vb)?;
        Ok(Self {
            gate,
            num_experts,
            top_k,
            renormalize,
        })
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Routes `hidden`, `[tokens, hidden]`, to experts.
    ///
    /// The softmax always runs in f32 regardless of the model dtype; half
    /// precision loses too much mass across many experts.
    pub fn route(&self, hidden: &Tensor) -> Result<RoutingDecision> {
        let logits = self.gate.forward(hidden)?.to_dtype(DType::F32)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;

        let order = probs.arg_sort_last_dim(false)?;
        let experts = order.narrow(D::Minus1, 0, self.top_k)?.contiguous()?;
        let weights = probs.gather(&experts, D::Minus1)?.contiguous()?;

        let weights = if self.renormalize {
            let sum = weights.sum_keepdim(D::Minus1)?;
            weights.broadcast_div(&sum)?
        } else {
            weights
        };
        Ok(RoutingDecision {
            weights,
            experts: experts.to_dtype(DType::U32)?,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }
}
