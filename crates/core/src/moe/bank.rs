//! Packed expert weight storage.

use candle_core::{IndexOp, Result, Tensor};

/// All routed expert weights for one layer packed into two contiguous banks.
///
/// `gate_up` is `[experts, 2 * intermediate_shard, hidden]` with each
/// expert's gate rows before its up rows; `down` is `[experts, hidden,
/// intermediate_shard]`. Per-expert accessors return index views into the
/// banks rather than copies, so the banks are the only owners of expert
/// weight storage after packing.
pub struct ExpertWeightBank {
    gate_up: Tensor,
    down: Tensor,
    intermediate_shard: usize,
}

impl ExpertWeightBank {
    /// Stacks per-expert `[2 * shard, hidden]` gate/up weights and
    /// `[hidden, shard]` down weights into banks.
    pub fn pack(gate_up: &[Tensor], down: &[Tensor]) -> Result<Self> {
        if gate_up.is_empty() || gate_up.len() != down.len() {
            candle_core::bail!(
                "expert bank needs matching non-empty weight lists, got {} and {}",
                gate_up.len(),
                down.len()
            );
        }
        let (_, shard) = down[0].dims2()?;
        Ok(Self {
            gate_up: Tensor::stack(gate_up, 0)?,
            down: Tensor::stack(down, 0)?,
            intermediate_shard: shard,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.gate_up.dims()[0]
    }

    pub fn intermediate_shard(&self) -> usize {
        self.intermediate_shard
    }

    pub fn gate_up(&self) -> &Tensor {
        &self.gate_up
    }

    pub fn down(&self) -> &Tensor {
        &self.down
    }

    /// View of expert `idx`'s fused gate/up weight, `[2 * shard, hidden]`.
    pub fn expert_gate_up(&self, idx: usize) -> Result<Tensor> {
        self.gate_up.i(idx)
    }

    /// View of expert `idx`'s down weight, `[hidden, shard]`.
    pub fn expert_down(&self, idx: usize) -> Result<Tensor> {
        self.down.i(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn filled(shape: (usize, usize), value: f32) -> Tensor {
        Tensor::full(value, shape, &Device::Cpu).unwrap()
    }

    fn bank() -> ExpertWeightBank {
        let gate_up: Vec<Tensor> = (0..3).map(|e| filled((4, 2), e as f32)).collect();
        let down: Vec<Tensor> = (0..3).map(|e| filled((2, 2), 10.0 + e as f32)).collect();
        ExpertWeightBank::pack(&gate_up, &down).unwrap()
    }

    #[test]
    fn banks_have_expert_leading_dim() {
        let b = bank();
        assert_eq!(b.gate_up().dims(), &[3, 4, 2]);
        assert_eq!(b.down().dims(), &[3, 2, 2]);
        assert_eq!(b.num_experts(), 3);
        assert_eq!(b.intermediate_shard(), 2);
    }

    #[test]
    fn expert_views_read_their_bank_slice() {
        let b = bank();
        for e in 0..3 {
            let view = b.expert_gate_up(e).unwrap();
            assert_eq!(view.dims(), &[4, 2]);
            let vals = view.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(vals.iter().all(|&v| v == e as f32));

            let down = b.expert_down(e).unwrap();
            let vals = down.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(vals.iter().all(|&v| v == 10.0 + e as f32));
        }
    }

    #[test]
    fn pack_rejects_mismatched_lists() {
        let gate_up = vec![filled((4, 2), 0.0)];
        let down = vec![filled((2, 2), 0.0), filled((2, 2), 1.0)];
        assert!(ExpertWeightBank::pack(&gate_up, &down).is_err());
    }
}
