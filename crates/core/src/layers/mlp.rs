//! Silu-gated MLP over tensor-parallel projections.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::distributed::{
    ColumnParallelLinear, Communicator, MergedColumnParallelLinear, ParallelContext,
    RowParallelLinear,
};
use crate::error::{ModelError, Result};
use crate::quantization::WeightLayout;

enum GateUp {
    Fused(MergedColumnParallelLinear),
    Split {
        gate: ColumnParallelLinear,
        up: ColumnParallelLinear,
    },
}

/// `down(silu(gate(x)) * up(x))` with column-sharded gate/up and a
/// row-sharded down projection.
///
/// Checkpoint names follow the layout tag: `gate_up_proj` when fused,
/// `gate_proj`/`up_proj` when split. Routed experts construct this with
/// `reduce_results` off so the enclosing MoE block reduces once.
pub struct GatedMlp {
    gate_up: GateUp,
    down: RowParallelLinear,
    intermediate_shard: usize,
}

impl GatedMlp {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        hidden_act: &str,
        layout: WeightLayout,
        reduce_results: bool,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        if hidden_act != "silu" {
            return Err(ModelError::UnsupportedActivation(hidden_act.to_string()));
        }
        let gate_up = match layout {
            WeightLayout::Fused => GateUp::Fused(MergedColumnParallelLinear::new(
                hidden_size,
                intermediate_size,
                vb.pp("gate_up_proj"),
                ctx,
            )?),
            WeightLayout::Split => GateUp::Split {
                gate: ColumnParallelLinear::new(
                    hidden_size,
                    intermediate_size,
                    false,
                    false,
                    vb.pp("gate_proj"),
                    ctx,
                )?,
                up: ColumnParallelLinear::new(
                    hidden_size,
                    intermediate_size,
                    false,
                    false,
                    vb.pp("up_proj"),
                    ctx,
                )?,
            },
        };
        let down = RowParallelLinear::new(
            intermediate_size,
            hidden_size,
            false,
            reduce_results,
            vb.pp("down_proj"),
            ctx,
        )?;
        Ok(Self {
            gate_up,
            down,
            intermediate_shard: intermediate_size / ctx.world_size(),
        })
    }

    /// `x` is `[tokens, hidden]`.
    pub fn forward(&self, x: &Tensor, comm: &dyn Communicator) -> Result<Tensor> {
        let (gate, up) = match &self.gate_up {
            GateUp::Fused(proj) => {
                let y = proj.forward(x)?;
                let gate = y.narrow(1, 0, self.intermediate_shard)?;
                let up = y.narrow(1, self.intermediate_shard, self.intermediate_shard)?;
                (gate, up)
            }
            GateUp::Split { gate, up } => (gate.forward(x, comm)?, up.forward(x, comm)?),
        };
        let act = (candle_nn::ops::silu(&gate)? * up)?;
        Ok(self.down.forward(&act, comm)?)
    }

    /// Local fused gate/up weight, `[2 * shard, hidden]`, gate rows first.
    /// Split layouts concatenate on demand.
    pub fn gate_up_weight(&self) -> Result<Tensor> {
        match &self.gate_up {
            GateUp::Fused(proj) => Ok(proj.weight().clone()),
            GateUp::Split { gate, up } => {
                Ok(Tensor::cat(&[gate.weight(), up.weight()], 0)?)
            }
        }
    }

    /// Local down weight, `[hidden, shard]`.
    pub fn down_weight(&self) -> &Tensor {
        self.down.weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCommunicator;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;

    fn silu(x: f32) -> f32 {
        x / (1.0 + (-x).exp())
    }

    fn fused_vb(gate_up: Tensor, down: Tensor) -> VarBuilder<'static> {
        let mut map = HashMap::new();
        map.insert("gate_up_proj.weight".to_string(), gate_up);
        map.insert("down_proj.weight".to_string(), down);
        VarBuilder::from_tensors(map, DType::F32, &Device::Cpu)
    }

    #[test]
    fn rejects_non_silu_activation() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = GatedMlp::new(
            4,
            8,
            "gelu",
            WeightLayout::Fused,
            true,
            vb,
            &ParallelContext::single(),
        );
        assert!(matches!(err, Err(ModelError::UnsupportedActivation(_))));
    }

    #[test]
    fn identity_projections_compute_silu_gate() {
        // hidden 4, intermediate 8. Gate and up both embed x into the first
        // four intermediate lanes; down reads them back.
        let hidden = 4;
        let inter = 8;
        let mut gate_up = vec![0f32; 2 * inter * hidden];
        for i in 0..hidden {
            gate_up[i * hidden + i] = 1.0; // gate rows
            gate_up[(inter + i) * hidden + i] = 1.0; // up rows
        }
        let mut down = vec![0f32; hidden * inter];
        for i in 0..hidden {
            down[i * inter + i] = 1.0;
        }
        let vb = fused_vb(
            Tensor::from_vec(gate_up, (2 * inter, hidden), &Device::Cpu).unwrap(),
            Tensor::from_vec(down, (hidden, inter), &Device::Cpu).unwrap(),
        );
        let mlp = GatedMlp::new(
            hidden,
            inter,
            "silu",
            WeightLayout::Fused,
            true,
            vb,
            &ParallelContext::single(),
        )
        .unwrap();

        let x = vec![1.0f32, 2.0, -1.0, 0.5];
        let input = Tensor::from_vec(x.clone(), (1, hidden), &Device::Cpu).unwrap();
        let out = mlp
            .forward(&input, &LocalCommunicator::new())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (got, &xi) in out.iter().zip(&x) {
            let expected = silu(xi) * xi;
            assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");
        }
    }

    #[test]
    fn split_layout_matches_fused() {
        let hidden = 2;
        let inter = 2;
        let gate = Tensor::from_vec(vec![0.5f32, -0.3, 0.8, 0.1], (inter, hidden), &Device::Cpu)
            .unwrap();
        let up =
            Tensor::from_vec(vec![1.0f32, 0.2, -0.4, 0.9], (inter, hidden), &Device::Cpu).unwrap();
        let down =
            Tensor::from_vec(vec![0.7f32, -0.2, 0.3, 0.6], (hidden, inter), &Device::Cpu).unwrap();

        let fused = {
            let gate_up = Tensor::cat(&[&gate, &up], 0).unwrap();
            let vb = fused_vb(gate_up, down.clone());
            GatedMlp::new(
                hidden,
                inter,
                "silu",
                WeightLayout::Fused,
                true,
                vb,
                &ParallelContext::single(),
            )
            .unwrap()
        };
        let split = {
            let mut map = HashMap::new();
            map.insert("gate_proj.weight".to_string(), gate);
            map.insert("up_proj.weight".to_string(), up);
            map.insert("down_proj.weight".to_string(), down);
            let vb = VarBuilder::from_tensors(map, DType::F32, &Device::Cpu);
            GatedMlp::new(
                hidden,
                inter,
                "silu",
                WeightLayout::Split,
                true,
                vb,
                &ParallelContext::single(),
            )
            .unwrap()
        };

        let comm = LocalCommunicator::new();
        let x = Tensor::from_vec(vec![0.4f32, -1.2], (1, hidden), &Device::Cpu).unwrap();
        let a = fused.forward(&x, &comm).unwrap();
        let b = split.forward(&x, &comm).unwrap();
        assert_eq!(
            a.to_vec2::<f32>().unwrap(),
            b.to_vec2::<f32>().unwrap()
        );
        assert_eq!(
            fused.gate_up_weight().unwrap().to_vec2::<f32>().unwrap(),
            split.gate_up_weight().unwrap().to_vec2::<f32>().unwrap()
        );
    }
}
