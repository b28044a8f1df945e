//! Tensor-parallel linear and embedding layers.
//!
//! Shards are produced by loading the full weight and slicing out this
//! rank's block at construction time. Inputs to every `forward` are 2-D,
//! `[tokens, features]`; callers flatten batch dimensions first.

use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::VarBuilder;

use super::communicator::Communicator;
use super::context::ParallelContext;

fn check_divisible(value: usize, by: usize, what: &str) -> Result<()> {
    if by == 0 || value % by != 0 {
        candle_core::bail!("{what} ({value}) is not divisible by tensor parallel size {by}");
    }
    Ok(())
}

// ─── Replicated linear ──────────────────────────────────────────────────────

/// Full-weight linear held identically on every rank. Used for the MoE
/// router gate, which is too small to be worth sharding.
pub struct ReplicatedLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl ReplicatedLinear {
    pub fn new(in_features: usize, out_features: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get((out_features, in_features), "weight")?;
        let bias = if bias {
            Some(vb.get(out_features, "bias")?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(b) => y.broadcast_add(b),
            None => Ok(y),
        }
    }
}

// ─── Column parallel linear ─────────────────────────────────────────────────

/// Linear with the output dimension sharded across ranks.
pub struct ColumnParallelLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    gather_output: bool,
}

impl ColumnParallelLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        gather_output: bool,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        check_divisible(out_features, ctx.world_size(), "output features")?;
        let shard = out_features / ctx.world_size();
        let start = ctx.rank() * shard;

        let full = vb.get((out_features, in_features), "weight")?;
        let weight = full.i(start..start + shard)?.contiguous()?;
        let bias = if bias {
            let full = vb.get(out_features, "bias")?;
            Some(full.i(start..start + shard)?.contiguous()?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            gather_output,
        })
    }

    pub fn from_parts(weight: Tensor, bias: Option<Tensor>, gather_output: bool) -> Self {
        Self {
            weight,
            bias,
            gather_output,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, x: &Tensor, comm: &dyn Communicator) -> Result<Tensor> {
        let y = x.matmul(&self.weight.t()?)?;
        let y = match &self.bias {
            Some(b) => y.broadcast_add(b)?,
            None => y,
        };
        if self.gather_output {
            comm.all_gather(&y, 1)
        } else {
            Ok(y)
        }
    }
}

// ─── Merged column parallel linear ──────────────────────────────────────────

/// Gate and up projections fused into one column-sharded weight.
///
/// The full weight is `[2 * intermediate, hidden]` with the gate rows first.
/// Each rank keeps its block of the gate half stacked on its block of the
/// up half, so a single matmul produces both halves of its shard.
pub struct MergedColumnParallelLinear {
    weight: Tensor,
    shard_size: usize,
}

impl MergedColumnParallelLinear {
    pub fn new(
        in_features: usize,
        intermediate_size: usize,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        check_divisible(intermediate_size, ctx.world_size(), "intermediate size")?;
        let shard = intermediate_size / ctx.world_size();
        let start = ctx.rank() * shard;

        let full = vb.get((2 * intermediate_size, in_features), "weight")?;
        let gate = full.i(start..start + shard)?;
        let up = full.i(intermediate_size + start..intermediate_size + start + shard)?;
        let weight = Tensor::cat(&[&gate, &up], 0)?.contiguous()?;
        Ok(Self {
            weight,
            shard_size: shard,
        })
    }

    /// Builds the same layout from separately stored gate and up weights.
    pub fn from_split(
        gate: &Tensor,
        up: &Tensor,
        intermediate_size: usize,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        check_divisible(intermediate_size, ctx.world_size(), "intermediate size")?;
        let shard = intermediate_size / ctx.world_size();
        let start = ctx.rank() * shard;
        let gate = gate.i(start..start + shard)?;
        let up = up.i(start..start + shard)?;
        let weight = Tensor::cat(&[&gate, &up], 0)?.contiguous()?;
        Ok(Self {
            weight,
            shard_size: shard,
        })
    }

    /// Local `[2 * shard, hidden]` weight, gate rows first.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn shard_size(&self) -> usize {
        self.shard_size
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.matmul(&self.weight.t()?)
    }
}

// ─── QKV parallel linear ────────────────────────────────────────────────────

/// Fused q/k/v projection sharded by attention head.
///
/// Query heads split evenly across ranks. Key/value heads split when there
/// are at least as many as ranks, otherwise each head is replicated onto
/// `world_size / total_kv_heads` consecutive ranks and every replica group
/// slices the same block of the full weight.
pub struct QKVParallelLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    q_size: usize,
    kv_size: usize,
}

impl QKVParallelLinear {
    pub fn new(
        hidden_size: usize,
        head_dim: usize,
        total_heads: usize,
        total_kv_heads: usize,
        bias: bool,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        let tp = ctx.world_size();
        check_divisible(total_heads, tp, "attention heads")?;
        let num_heads = total_heads / tp;

        let (num_kv_heads, kv_shard) = if total_kv_heads >= tp {
            check_divisible(total_kv_heads, tp, "key/value heads")?;
            (total_kv_heads / tp, ctx.rank())
        } else {
            check_divisible(tp, total_kv_heads, "tensor parallel size")?;
            let replicas = tp / total_kv_heads;
            (1, ctx.rank() / replicas)
        };

        let q_size = num_heads * head_dim;
        let kv_size = num_kv_heads * head_dim;
        let q_total = total_heads * head_dim;
        let kv_section = total_kv_heads * head_dim;
        let rows = q_total + 2 * kv_section;

        let full = vb.get((rows, hidden_size), "weight")?;
        let q_start = ctx.rank() * q_size;
        let k_start = q_total + kv_shard * kv_size;
        let v_start = q_total + kv_section + kv_shard * kv_size;
        let weight = Tensor::cat(
            &[
                &full.i(q_start..q_start + q_size)?,
                &full.i(k_start..k_start + kv_size)?,
                &full.i(v_start..v_start + kv_size)?,
            ],
            0,
        )?
        .contiguous()?;

        let bias = if bias {
            let full = vb.get(rows, "bias")?;
            Some(
                Tensor::cat(
                    &[
                        &full.i(q_start..q_start + q_size)?,
                        &full.i(k_start..k_start + kv_size)?,
                        &full.i(v_start..v_start + kv_size)?,
                    ],
                    0,
                )?
                .contiguous()?,
            )
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            q_size,
            kv_size,
        })
    }

    /// Same sharding as [`Self::new`] but reading separate `q_proj`,
    /// `k_proj` and `v_proj` weights under `vb`, for layouts that forbid
    /// fused projections.
    pub fn from_split(
        hidden_size: usize,
        head_dim: usize,
        total_heads: usize,
        total_kv_heads: usize,
        bias: bool,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        let tp = ctx.world_size();
        check_divisible(total_heads, tp, "attention heads")?;
        let num_heads = total_heads / tp;

        let (num_kv_heads, kv_shard) = if total_kv_heads >= tp {
            check_divisible(total_kv_heads, tp, "key/value heads")?;
            (total_kv_heads / tp, ctx.rank())
        } else {
            check_divisible(tp, total_kv_heads, "tensor parallel size")?;
            let replicas = tp / total_kv_heads;
            (1, ctx.rank() / replicas)
        };

        let q_size = num_heads * head_dim;
        let kv_size = num_kv_heads * head_dim;
        let q_total = total_heads * head_dim;
        let kv_section = total_kv_heads * head_dim;

        let q_full = vb.pp("q_proj").get((q_total, hidden_size), "weight")?;
        let k_full = vb.pp("k_proj").get((kv_section, hidden_size), "weight")?;
        let v_full = vb.pp("v_proj").get((kv_section, hidden_size), "weight")?;
        let q_start = ctx.rank() * q_size;
        let kv_start = kv_shard * kv_size;
        let weight = Tensor::cat(
            &[
                &q_full.i(q_start..q_start + q_size)?,
                &k_full.i(kv_start..kv_start + kv_size)?,
                &v_full.i(kv_start..kv_start + kv_size)?,
            ],
            0,
        )?
        .contiguous()?;

        let bias = if bias {
            let q_full = vb.pp("q_proj").get(q_total, "bias")?;
            let k_full = vb.pp("k_proj").get(kv_section, "bias")?;
            let v_full = vb.pp("v_proj").get(kv_section, "bias")?;
            Some(
                Tensor::cat(
                    &[
                        &q_full.i(q_start..q_start + q_size)?,
                        &k_full.i(kv_start..kv_start + kv_size)?,
                        &v_full.i(kv_start..kv_start + kv_size)?,
                    ],
                    0,
                )?
                .contiguous()?,
            )
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            q_size,
            kv_size,
        })
    }

    /// Local query rows.
    pub fn q_size(&self) -> usize {
        self.q_size
    }

    /// Local key (or value) rows.
    pub fn kv_size(&self) -> usize {
        self.kv_size
    }

    /// Projects to `[tokens, q_size + 2 * kv_size]`, q then k then v.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(b) => y.broadcast_add(b),
            None => Ok(y),
        }
    }
}

// ─── Row parallel linear ────────────────────────────────────────────────────

/// Linear with the input dimension sharded across ranks.
///
/// Each rank computes a partial product; when `reduce_results` is set the
/// partials are summed at the end of forward. MoE experts turn the flag off
/// so the whole block can share one all-reduce.
pub struct RowParallelLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    reduce_results: bool,
}

impl RowParallelLinear {
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        reduce_results: bool,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        check_divisible(in_features, ctx.world_size(), "input features")?;
        let shard = in_features / ctx.world_size();
        let start = ctx.rank() * shard;

        let full = vb.get((out_features, in_features), "weight")?;
        let weight = full.i((.., start..start + shard))?.contiguous()?;
        // Bias is not sharded; it is added once, after the reduce.
        let bias = if bias {
            Some(vb.get(out_features, "bias")?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            reduce_results,
        })
    }

    pub fn from_parts(weight: Tensor, bias: Option<Tensor>, reduce_results: bool) -> Self {
        Self {
            weight,
            bias,
            reduce_results,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, x: &Tensor, comm: &dyn Communicator) -> Result<Tensor> {
        let y = x.matmul(&self.weight.t()?)?;
        let y = if self.reduce_results && !comm.context().is_single() {
            comm.all_reduce(&y)?
        } else {
            y
        };
        match &self.bias {
            Some(b) => y.broadcast_add(b),
            None => Ok(y),
        }
    }
}

// ─── Vocab parallel embedding ───────────────────────────────────────────────

/// Token embedding table sharded over the vocabulary dimension.
///
/// Out-of-shard ids embed to zero locally; the all-reduce restores the full
/// rows because exactly one rank owns each id.
pub struct VocabParallelEmbedding {
    weight: Tensor,
    vocab_start: usize,
    shard_size: usize,
}

impl VocabParallelEmbedding {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        check_divisible(vocab_size, ctx.world_size(), "vocab size")?;
        let shard = vocab_size / ctx.world_size();
        let start = ctx.rank() * shard;

        let full = vb.get((vocab_size, hidden_size), "weight")?;
        let weight = full.i(start..start + shard)?.contiguous()?;
        Ok(Self {
            weight,
            vocab_start: start,
            shard_size: shard,
        })
    }

    /// `ids` is a flat `[tokens]` u32 tensor; returns `[tokens, hidden]`.
    pub fn forward(&self, ids: &Tensor, comm: &dyn Communicator) -> Result<Tensor> {
        let ids = ids.to_dtype(DType::I64)?;
        let start = Tensor::new(self.vocab_start as i64, ids.device())?;
        let offset = ids.broadcast_sub(&start)?;
        let in_shard = offset
            .ge(0i64)?
            .mul(&offset.lt(self.shard_size as i64)?)?
            .to_dtype(self.weight.dtype())?;
        let clamped = offset
            .clamp(0i64, self.shard_size as i64 - 1)?
            .to_dtype(DType::U32)?;
        let rows = self.weight.index_select(&clamped, 0)?;
        let rows = rows.broadcast_mul(&in_shard.unsqueeze(D::Minus1)?)?;
        if comm.context().is_single() {
            Ok(rows)
        } else {
            comm.all_reduce(&rows)
        }
    }
}

// ─── Parallel LM head ───────────────────────────────────────────────────────

/// Vocab-sharded output projection; logits are gathered to full width on
/// every rank so sampling sees the whole vocabulary.
pub struct ParallelLMHead {
    weight: Tensor,
}

impl ParallelLMHead {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        check_divisible(vocab_size, ctx.world_size(), "vocab size")?;
        let shard = vocab_size / ctx.world_size();
        let start = ctx.rank() * shard;

        let full = vb.get((vocab_size, hidden_size), "weight")?;
        let weight = full.i(start..start + shard)?.contiguous()?;
        Ok(Self { weight })
    }

    /// `hidden` is `[tokens, hidden]`; returns `[tokens, vocab]`.
    pub fn forward(&self, hidden: &Tensor, comm: &dyn Communicator) -> Result<Tensor> {
        let logits = hidden.matmul(&self.weight.t()?)?;
        if comm.context().is_single() {
            Ok(logits)
        } else {
            comm.all_gather(&logits, 1)
        }
    }
}
