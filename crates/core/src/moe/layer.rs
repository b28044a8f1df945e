//! Sparse MoE block: router, packed routed experts, optional shared experts.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::debug;

use crate::distributed::{Communicator, ParallelContext};
use crate::error::{ModelError, Result};
use crate::layers::GatedMlp;
use crate::quantization::WeightLayout;

use super::bank::ExpertWeightBank;
use super::fused::fused_moe;
use super::router::MoeRouter;

/// Drop-in MLP replacement that routes each token through its top-k
/// experts and adds the always-on shared experts.
///
/// Every inner projection runs with reduction disabled so the block issues
/// exactly one all-reduce, after routed and shared outputs are combined.
pub struct SparseMoeBlock {
    router: MoeRouter,
    bank: ExpertWeightBank,
    shared: Option<GatedMlp>,
    hidden_size: usize,
}

impl SparseMoeBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hidden_size: usize,
        moe_intermediate_size: usize,
        num_experts: usize,
        top_k: usize,
        norm_topk_prob: bool,
        n_shared_experts: Option<usize>,
        hidden_act: &str,
        layout: WeightLayout,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        if ctx.world_size() > num_experts {
            return Err(ModelError::TensorParallelExceedsExperts {
                tp_size: ctx.world_size(),
                num_experts,
            });
        }

        let router = MoeRouter::new(hidden_size, num_experts, top_k, norm_topk_prob, vb.pp("gate"))?;

        // Experts are built as ordinary MLPs, then their shards are packed
        // into banks and the per-expert structs dropped. The banks own the
        // weights from here on.
        let mut gate_up = Vec::with_capacity(num_experts);
        let mut down = Vec::with_capacity(num_experts);
        for e in 0..num_experts {
            let expert = GatedMlp::new(
                hidden_size,
                moe_intermediate_size,
                hidden_act,
                layout,
                false,
                vb.pp(format!("experts.{e}")),
                ctx,
            )?;
            gate_up.push(expert.gate_up_weight()?);
            down.push(expert.down_weight().clone());
        }
        let bank = ExpertWeightBank::pack(&gate_up, &down)?;
        debug!(
            num_experts,
            top_k,
            shard = bank.intermediate_shard(),
            "packed routed expert banks"
        );

        let shared = match n_shared_experts {
            Some(n) => Some(GatedMlp::new(
                hidden_size,
                moe_intermediate_size * n,
                hidden_act,
                layout,
                false,
                vb.pp("shared_experts"),
                ctx,
            )?),
            None => None,
        };

        Ok(Self {
            router,
            bank,
            shared,
            hidden_size,
        })
    }

    pub fn bank(&self) -> &ExpertWeightBank {
        &self.bank
    }

    pub fn router(&self) -> &MoeRouter {
        &self.router
    }

    /// `hidden` is `[tokens, hidden]` or `[batch, seq, hidden]`; the output
    /// keeps the input shape.
    pub fn forward(&self, hidden: &Tensor, comm: &dyn Communicator) -> Result<Tensor> {
        let orig_shape = hidden.dims().to_vec();
        let hidden = hidden.reshape(((), self.hidden_size))?;

        let shared = match &self.shared {
            Some(mlp) => Some(mlp.forward(&hidden, comm)?),
            None => None,
        };
        let decision = self.router.route(&hidden)?;
        let mut out = fused_moe(&hidden, &self.bank, &decision)?;
        if let Some(shared) = shared {
            out = (out + shared)?;
        }
        // The single synchronization point for the whole block.
        if !comm.context().is_single() {
            out = comm.all_reduce(&out)?;
        }
        Ok(out.reshape(orig_shape)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCommunicator;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;

    fn block_weights(num_experts: usize, with_shared: bool) -> HashMap<String, Tensor> {
        let hidden = 2;
        let inter = 2;
        let dev = Device::Cpu;
        let mut map = HashMap::new();
        map.insert(
            "gate.weight".to_string(),
            Tensor::zeros((num_experts, hidden), DType::F32, &dev).unwrap(),
        );
        for e in 0..num_experts {
            let scale = (e + 1) as f32;
            let gate_up: Vec<f32> = vec![
                scale, 0.0, 0.0, scale, // gate rows
                1.0, 0.0, 0.0, 1.0, // up rows
            ];
            map.insert(
                format!("experts.{e}.gate_up_proj.weight"),
                Tensor::from_vec(gate_up, (2 * inter, hidden), &dev).unwrap(),
            );
            map.insert(
                format!("experts.{e}.down_proj.weight"),
                Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0], (hidden, inter), &dev).unwrap(),
            );
        }
        if with_shared {
            // One shared expert of the same width.
            map.insert(
                "shared_experts.gate_up_proj.weight".to_string(),
                Tensor::from_vec(
                    vec![1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0],
                    (2 * inter, hidden),
                    &dev,
                )
                .unwrap(),
            );
            map.insert(
                "shared_experts.down_proj.weight".to_string(),
                Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0], (hidden, inter), &dev).unwrap(),
            );
        }
        map
    }

    fn build(num_experts: usize, with_shared: bool, top_k: usize) -> SparseMoeBlock {
        let vb = VarBuilder::from_tensors(
            block_weights(num_experts, with_shared),
            DType::F32,
            &Device::Cpu,
        );
        SparseMoeBlock::new(
            2,
            2,
            num_experts,
            top_k,
            true,
            if with_shared { Some(1) } else { None },
            "silu",
            WeightLayout::Fused,
            vb,
            &ParallelContext::single(),
        )
        .unwrap()
    }

    fn silu(x: f32) -> f32 {
        x / (1.0 + (-x).exp())
    }

    #[test]
    fn too_many_workers_for_experts_is_fatal() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = SparseMoeBlock::new(
            2,
            2,
            2,
            2,
            false,
            None,
            "silu",
            WeightLayout::Fused,
            vb,
            &ParallelContext::new(0, 4),
        );
        assert!(matches!(
            err,
            Err(ModelError::TensorParallelExceedsExperts { tp_size: 4, num_experts: 2 })
        ));
    }

    #[test]
    fn preserves_three_dimensional_shape() {
        let block = build(4, false, 2);
        let comm = LocalCommunicator::new();
        let x = Tensor::ones((2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let y = block.forward(&x, &comm).unwrap();
        assert_eq!(y.dims(), &[2, 3, 2]);
    }

    #[test]
    fn uniform_router_averages_selected_experts() {
        // Zero gate weight makes routing uniform; with top-2 and
        // renormalization each selected expert contributes exactly half.
        let block = build(4, false, 2);
        let comm = LocalCommunicator::new();
        let x = Tensor::from_vec(vec![1.0f32, 2.0], (1, 2), &Device::Cpu).unwrap();
        let out = block.forward(&x, &comm).unwrap();
        let got = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let decision = block.router().route(&x).unwrap();
        let picked = decision.experts.to_vec2::<u32>().unwrap();
        let weights = decision.weights.to_vec2::<f32>().unwrap();
        assert!((weights[0][0] - 0.5).abs() < 1e-5);
        assert!((weights[0][1] - 0.5).abs() < 1e-5);

        // Expert e computes silu((e + 1) * x) * x per lane.
        let expert_out = |e: u32, x: f32| silu((e as f32 + 1.0) * x) * x;
        for (lane, &xv) in [1.0f32, 2.0].iter().enumerate() {
            let expected =
                0.5 * expert_out(picked[0][0], xv) + 0.5 * expert_out(picked[0][1], xv);
            assert!((got[lane] - expected).abs() < 1e-5, "{} vs {expected}", got[lane]);
        }
    }

    #[test]
    fn shared_experts_add_to_routed_output() {
        let routed_only = build(2, false, 2);
        let with_shared = build(2, true, 2);
        let comm = LocalCommunicator::new();
        let x = Tensor::from_vec(vec![0.5f32, -1.0], (1, 2), &Device::Cpu).unwrap();

        let a = routed_only
            .forward(&x, &comm)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let b = with_shared
            .forward(&x, &comm)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        // The shared expert is identity gate/up/down, so it adds silu(x)*x.
        for lane in 0..2 {
            let xv = [0.5f32, -1.0][lane];
            let expected = a[lane] + silu(xv) * xv;
            assert!((b[lane] - expected).abs() < 1e-5);
        }
    }
}
