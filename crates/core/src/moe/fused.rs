//! Reference fused MoE kernel.
//!
//! Tokens are grouped by expert so each expert runs one batched
//! silu-gated matmul over its assigned tokens, then results are scattered
//! back weighted by the routing probabilities. A device kernel with the
//! same contract can replace this without touching the callers.

use candle_core::{DType, Result, Tensor};

use super::bank::ExpertWeightBank;
use super::router::RoutingDecision;

/// Applies the routed experts to `hidden`, `[tokens, hidden_size]`.
///
/// Output keeps the input shape and dtype; accumulation happens in the
/// input dtype via scatter-add, matching a kernel writing in place.
pub fn fused_moe(
    hidden: &Tensor,
    bank: &ExpertWeightBank,
    decision: &RoutingDecision,
) -> Result<Tensor> {
    let (tokens, hidden_size) = hidden.dims2()?;
    let device = hidden.device();
    let shard = bank.intermediate_shard();

    let experts = decision.experts.to_vec2::<u32>()?;
    let weights = decision.weights.to_dtype(DType::F32)?.to_vec2::<f32>()?;

    // token index and routing weight per expert
    let mut assignments: Vec<Vec<(usize, f32)>> = vec![Vec::new(); bank.num_experts()];
    for t in 0..tokens {
        for (slot, &e) in experts[t].iter().enumerate() {
            assignments[e as usize].push((t, weights[t][slot]));
        }
    }

    let mut output = Tensor::zeros((tokens, hidden_size), hidden.dtype(), device)?;
    for (e, assigned) in assignments.iter().enumerate() {
        if assigned.is_empty() {
            continue;
        }
        let idx: Vec<u32> = assigned.iter().map(|&(t, _)| t as u32).collect();
        let idx = Tensor::from_vec(idx, (assigned.len(),), device)?;
        let x = hidden.index_select(&idx, 0)?;

        let gate_up = bank.expert_gate_up(e)?;
        let down = bank.expert_down(e)?;
        let projected = x.matmul(&gate_up.t()?)?;
        let gate = projected.narrow(1, 0, shard)?;
        let up = projected.narrow(1, shard, shard)?;
        let act = (candle_nn::ops::silu(&gate)? * up)?;
        let out = act.matmul(&down.t()?)?;

        let scale: Vec<f32> = assigned.iter().map(|&(_, w)| w).collect();
        let scale = Tensor::from_vec(scale, (assigned.len(), 1), device)?.to_dtype(out.dtype())?;
        let out = out.broadcast_mul(&scale)?;
        output = output.index_add(&idx, &out, 0)?;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn expert_bank() -> ExpertWeightBank {
        // Two experts over hidden 2, shard 2. Expert 0 is scaled identity
        // on both projections, expert 1 doubles it.
        let eye = Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0], (2, 2), &Device::Cpu).unwrap();
        let gate_up = |s: f64| {
            let block = eye.affine(s, 0.0).unwrap();
            Tensor::cat(&[&block, &block], 0).unwrap()
        };
        ExpertWeightBank::pack(
            &[gate_up(1.0), gate_up(2.0)],
            &[eye.clone(), eye.affine(2.0, 0.0).unwrap()],
        )
        .unwrap()
    }

    fn silu(x: f32) -> f32 {
        x / (1.0 + (-x).exp())
    }

    #[test]
    fn single_expert_matches_manual_mlp() {
        let bank = expert_bank();
        let hidden = Tensor::from_vec(vec![1.0f32, 2.0], (1, 2), &Device::Cpu).unwrap();
        let decision = RoutingDecision {
            weights: Tensor::from_vec(vec![1.0f32], (1, 1), &Device::Cpu).unwrap(),
            experts: Tensor::from_vec(vec![0u32], (1, 1), &Device::Cpu).unwrap(),
        };
        let out = fused_moe(&hidden, &bank, &decision).unwrap();
        let got = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // Identity gate and up: out_i = silu(x_i) * x_i.
        for (i, &x) in [1.0f32, 2.0].iter().enumerate() {
            assert!((got[i] - silu(x) * x).abs() < 1e-5);
        }
    }

    #[test]
    fn combines_top_two_experts_with_routing_weights() {
        let bank = expert_bank();
        let hidden = Tensor::from_vec(vec![1.0f32, 2.0], (1, 2), &Device::Cpu).unwrap();
        let half = |e: &[u32]| RoutingDecision {
            weights: Tensor::from_vec(vec![0.5f32, 0.5], (1, 2), &Device::Cpu).unwrap(),
            experts: Tensor::from_vec(e.to_vec(), (1, 2), &Device::Cpu).unwrap(),
        };
        let out = fused_moe(&hidden, &bank, &half(&[0, 1])).unwrap();
        let got = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        let only = |e: u32| {
            let d = RoutingDecision {
                weights: Tensor::from_vec(vec![1.0f32], (1, 1), &Device::Cpu).unwrap(),
                experts: Tensor::from_vec(vec![e], (1, 1), &Device::Cpu).unwrap(),
            };
            fused_moe(&hidden, &bank, &d)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        let (a, b) = (only(0), only(1));
        for i in 0..2 {
            let expected = 0.5 * a[i] + 0.5 * b[i];
            assert!((got[i] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn tokens_routed_independently() {
        let bank = expert_bank();
        let hidden =
            Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0], (2, 2), &Device::Cpu).unwrap();
        let decision = RoutingDecision {
            weights: Tensor::from_vec(vec![1.0f32, 1.0], (2, 1), &Device::Cpu).unwrap(),
            experts: Tensor::from_vec(vec![0u32, 1], (2, 1), &Device::Cpu).unwrap(),
        };
        let out = fused_moe(&hidden, &bank, &decision).unwrap();
        let rows = out.to_vec2::<f32>().unwrap();
        // Token 0 through expert 0, token 1 through the doubled expert 1.
        assert!((rows[0][0] - silu(1.0)).abs() < 1e-5);
        assert!((rows[1][1] - 4.0 * silu(2.0)).abs() < 1e-5);
    }
}
