//! Deepseek decoder stack: dense early layers, sparse MoE layers above
//! `first_k_dense_replace`, tensor-parallel attention with an external
//! paged KV cache.

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::info;

use crate::config::ModelConfig;
use crate::distributed::{
    Communicator, ParallelContext, ParallelLMHead, QKVParallelLinear, RowParallelLinear,
    VocabParallelEmbedding,
};
use crate::error::{ModelError, Result};
use crate::layers::{
    AttentionMetadata, GatedMlp, KvCache, PagedAttentionBackend, RmsNorm, RotaryEmbedding,
};
use crate::loader::{fuse_checkpoint, ExpertOwnership, ParamLayout};
use crate::moe::SparseMoeBlock;
use crate::quantization::{rope_is_neox, QuantBackend, WeightLayout};
use crate::sampling::{Sampler, SamplingParams};

// ─── Attention ──────────────────────────────────────────────────────────────

pub struct DeepseekAttention {
    qkv_proj: QKVParallelLinear,
    o_proj: RowParallelLinear,
    rotary: RotaryEmbedding,
    backend: Arc<dyn PagedAttentionBackend>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

/// Local key/value head count for this rank: heads split across workers
/// when possible, otherwise each head serves a group of workers.
pub(crate) fn local_kv_heads(total_kv_heads: usize, tp_size: usize) -> usize {
    if total_kv_heads >= tp_size {
        total_kv_heads / tp_size
    } else {
        1
    }
}

impl DeepseekAttention {
    pub fn new(
        cfg: &ModelConfig,
        layout: WeightLayout,
        neox: bool,
        backend: Arc<dyn PagedAttentionBackend>,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        let tp = ctx.world_size();
        let total_heads = cfg.num_attention_heads;
        let total_kv_heads = cfg.num_key_value_heads;
        if total_heads % tp != 0 {
            return Err(ModelError::IncompatibleHeads {
                num_heads: total_heads,
                tp_size: tp,
            });
        }
        if total_kv_heads >= tp {
            if total_kv_heads % tp != 0 {
                return Err(ModelError::IncompatibleKvHeads {
                    num_kv_heads: total_kv_heads,
                    tp_size: tp,
                });
            }
        } else if tp % total_kv_heads != 0 {
            return Err(ModelError::IncompatibleKvHeads {
                num_kv_heads: total_kv_heads,
                tp_size: tp,
            });
        }

        let head_dim = cfg.head_dim();
        let qkv_proj = match layout {
            WeightLayout::Fused => QKVParallelLinear::new(
                cfg.hidden_size,
                head_dim,
                total_heads,
                total_kv_heads,
                false,
                vb.pp("qkv_proj"),
                ctx,
            )?,
            WeightLayout::Split => QKVParallelLinear::from_split(
                cfg.hidden_size,
                head_dim,
                total_heads,
                total_kv_heads,
                false,
                vb.clone(),
                ctx,
            )?,
        };
        let o_proj = RowParallelLinear::new(
            total_heads * head_dim,
            cfg.hidden_size,
            false,
            true,
            vb.pp("o_proj"),
            ctx,
        )?;

        let scaling_factor = cfg.rope_scaling.as_ref().map(|s| s.factor);
        let max_positions = match scaling_factor {
            Some(f) => (cfg.max_position_embeddings as f64 * f) as usize,
            None => cfg.max_position_embeddings,
        };
        let rotary = RotaryEmbedding::new(
            head_dim,
            max_positions,
            cfg.rope_theta,
            scaling_factor,
            neox,
            vb.dtype(),
            vb.device(),
        )?;

        Ok(Self {
            qkv_proj,
            o_proj,
            rotary,
            backend,
            num_heads: total_heads / tp,
            num_kv_heads: local_kv_heads(total_kv_heads, tp),
            head_dim,
        })
    }

    /// `positions` is a flat `[tokens]` u32 tensor, `hidden` is
    /// `[tokens, hidden]`.
    pub fn forward(
        &self,
        positions: &Tensor,
        hidden: &Tensor,
        cache: &mut KvCache,
        meta: &AttentionMetadata,
        comm: &dyn Communicator,
    ) -> Result<Tensor> {
        let tokens = hidden.dims2()?.0;
        let q_size = self.qkv_proj.q_size();
        let kv_size = self.qkv_proj.kv_size();

        let qkv = self.qkv_proj.forward(hidden)?;
        let q = qkv
            .narrow(1, 0, q_size)?
            .reshape((tokens, self.num_heads, self.head_dim))?;
        let k = qkv
            .narrow(1, q_size, kv_size)?
            .reshape((tokens, self.num_kv_heads, self.head_dim))?;
        let v = qkv
            .narrow(1, q_size + kv_size, kv_size)?
            .reshape((tokens, self.num_kv_heads, self.head_dim))?;

        let (q, k) = self.rotary.apply(positions, &q, &k)?;
        let attn = self.backend.attend(&q, &k, &v, cache, meta)?;
        let attn = attn.reshape((tokens, q_size))?;
        Ok(self.o_proj.forward(&attn, comm)?)
    }
}

// ─── Decoder layer ──────────────────────────────────────────────────────────

enum FeedForward {
    Dense(GatedMlp),
    Sparse(SparseMoeBlock),
}

pub struct DeepseekDecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: DeepseekAttention,
    post_attention_layernorm: RmsNorm,
    ffn: FeedForward,
}

impl DeepseekDecoderLayer {
    pub fn new(
        layer_idx: usize,
        cfg: &ModelConfig,
        layout: WeightLayout,
        neox: bool,
        backend: Arc<dyn PagedAttentionBackend>,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        let self_attn =
            DeepseekAttention::new(cfg, layout, neox, backend, vb.pp("self_attn"), ctx)?;
        let ffn = if cfg.is_moe_layer(layer_idx) {
            FeedForward::Sparse(SparseMoeBlock::new(
                cfg.hidden_size,
                cfg.moe_intermediate_size.unwrap_or(cfg.intermediate_size),
                cfg.n_routed_experts.unwrap_or(0),
                cfg.num_experts_per_tok,
                cfg.norm_topk_prob,
                cfg.n_shared_experts,
                &cfg.hidden_act,
                layout,
                vb.pp("mlp"),
                ctx,
            )?)
        } else {
            FeedForward::Dense(GatedMlp::new(
                cfg.hidden_size,
                cfg.intermediate_size,
                &cfg.hidden_act,
                layout,
                true,
                vb.pp("mlp"),
                ctx,
            )?)
        };
        Ok(Self {
            input_layernorm: RmsNorm::new(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            self_attn,
            post_attention_layernorm: RmsNorm::new(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            ffn,
        })
    }

    /// Returns the new activation and the updated residual stream. Layer
    /// zero passes `residual: None` so its input seeds the stream.
    pub fn forward(
        &self,
        positions: &Tensor,
        hidden: &Tensor,
        cache: &mut KvCache,
        meta: &AttentionMetadata,
        residual: Option<&Tensor>,
        comm: &dyn Communicator,
    ) -> Result<(Tensor, Tensor)> {
        let (hidden, residual) = self
            .input_layernorm
            .forward_residual(hidden, residual)?;
        let hidden = self.self_attn.forward(positions, &hidden, cache, meta, comm)?;
        let (hidden, residual) = self
            .post_attention_layernorm
            .forward_residual(&hidden, Some(&residual))?;
        let hidden = match &self.ffn {
            FeedForward::Dense(mlp) => mlp.forward(&hidden, comm)?,
            FeedForward::Sparse(moe) => moe.forward(&hidden, comm)?,
        };
        Ok((hidden, residual))
    }
}

// ─── Model ──────────────────────────────────────────────────────────────────

pub struct DeepseekModel {
    embed_tokens: VocabParallelEmbedding,
    layers: Vec<DeepseekDecoderLayer>,
    norm: RmsNorm,
}

impl DeepseekModel {
    pub fn new(
        cfg: &ModelConfig,
        layout: WeightLayout,
        neox: bool,
        backend: Arc<dyn PagedAttentionBackend>,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        let embed_tokens =
            VocabParallelEmbedding::new(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"), ctx)?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for idx in 0..cfg.num_hidden_layers {
            layers.push(DeepseekDecoderLayer::new(
                idx,
                cfg,
                layout,
                neox,
                backend.clone(),
                vb.pp(format!("layers.{idx}")),
                ctx,
            )?);
        }
        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            embed_tokens,
            layers,
            norm,
        })
    }

    pub fn forward(
        &self,
        input_ids: &Tensor,
        positions: &Tensor,
        caches: &mut [KvCache],
        meta: &AttentionMetadata,
        comm: &dyn Communicator,
    ) -> Result<Tensor> {
        if caches.len() != self.layers.len() {
            return Err(candle_core::Error::Msg(format!(
                "got {} kv caches for {} layers",
                caches.len(),
                self.layers.len()
            ))
            .into());
        }
        let mut hidden = self.embed_tokens.forward(input_ids, comm)?;
        let mut residual: Option<Tensor> = None;
        for (layer, cache) in self.layers.iter().zip(caches.iter_mut()) {
            let (h, r) = layer.forward(positions, &hidden, cache, meta, residual.as_ref(), comm)?;
            hidden = h;
            residual = Some(r);
        }
        let (hidden, _) = self.norm.forward_residual(&hidden, residual.as_ref())?;
        Ok(hidden)
    }
}

// ─── Causal LM wrapper ──────────────────────────────────────────────────────

pub struct DeepseekForCausalLM {
    model: DeepseekModel,
    lm_head: ParallelLMHead,
    num_layers: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl DeepseekForCausalLM {
    pub fn new(
        cfg: &ModelConfig,
        quant: Option<&dyn QuantBackend>,
        backend: Arc<dyn PagedAttentionBackend>,
        vb: VarBuilder,
        ctx: &ParallelContext,
    ) -> Result<Self> {
        let layout = WeightLayout::from_backend(quant);
        let neox = rope_is_neox(quant);
        let model = DeepseekModel::new(cfg, layout, neox, backend, vb.pp("model"), ctx)?;
        let head_vb = if cfg.tie_word_embeddings {
            vb.pp("model.embed_tokens")
        } else {
            vb.pp("lm_head")
        };
        let lm_head = ParallelLMHead::new(cfg.vocab_size, cfg.hidden_size, head_vb, ctx)?;
        Ok(Self {
            model,
            lm_head,
            num_layers: cfg.num_hidden_layers,
            num_kv_heads: local_kv_heads(cfg.num_key_value_heads, ctx.world_size()),
            head_dim: cfg.head_dim(),
        })
    }

    /// Applies the weight-fusion protocol to raw checkpoint tensors and
    /// builds the model from the result.
    pub fn load<I>(
        cfg: &ModelConfig,
        quant: Option<&dyn QuantBackend>,
        backend: Arc<dyn PagedAttentionBackend>,
        entries: I,
        dtype: candle_core::DType,
        device: &candle_core::Device,
        ctx: &ParallelContext,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let layout = WeightLayout::from_backend(quant);
        let params = ParamLayout::of_model(cfg, layout, &ExpertOwnership::all());
        let state = fuse_checkpoint(entries, layout, &params)?;
        info!(tensors = state.len(), "checkpoint fused");
        let vb = VarBuilder::from_tensors(state, dtype, device);
        Self::new(cfg, quant, backend, vb, ctx)
    }

    /// One cache per layer, each sized for this rank's kv heads.
    pub fn make_kv_caches(
        &self,
        num_slots: usize,
        dtype: candle_core::DType,
        device: &candle_core::Device,
    ) -> Result<Vec<KvCache>> {
        (0..self.num_layers)
            .map(|_| {
                Ok(KvCache::new(
                    num_slots,
                    self.num_kv_heads,
                    self.head_dim,
                    dtype,
                    device,
                )?)
            })
            .collect()
    }

    pub fn forward(
        &self,
        input_ids: &Tensor,
        positions: &Tensor,
        caches: &mut [KvCache],
        meta: &AttentionMetadata,
        comm: &dyn Communicator,
    ) -> Result<Tensor> {
        self.model.forward(input_ids, positions, caches, meta, comm)
    }

    /// Projects the last hidden state of each sequence to full-vocab logits.
    pub fn compute_logits(
        &self,
        hidden: &Tensor,
        meta: &AttentionMetadata,
        comm: &dyn Communicator,
    ) -> Result<Tensor> {
        let mut last_rows = Vec::with_capacity(meta.query_lens.len());
        let mut offset = 0usize;
        for len in &meta.query_lens {
            offset += len;
            last_rows.push(offset as u32 - 1);
        }
        let idx = Tensor::from_vec(last_rows, (meta.query_lens.len(),), hidden.device())?;
        let last = hidden.index_select(&idx, 0)?;
        Ok(self.lm_head.forward(&last, comm)?)
    }

    pub fn sample(
        &self,
        logits: &Tensor,
        sampler: &dyn Sampler,
        params: &SamplingParams,
    ) -> Result<Vec<u32>> {
        Ok(sampler.sample(logits, params)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::LocalCommunicator;
    use crate::layers::ReferencePagedAttention;
    use candle_core::{DType, Device, Tensor};

    fn test_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            hidden_size: 16,
            intermediate_size: 32,
            num_hidden_layers: 3,
            num_attention_heads: 4,
            num_key_value_heads: 2,
            max_position_embeddings: 64,
            hidden_act: "silu".to_string(),
            n_routed_experts: Some(4),
            n_shared_experts: Some(1),
            moe_intermediate_size: Some(8),
            num_experts_per_tok: 2,
            norm_topk_prob: true,
            first_k_dense_replace: 1,
            moe_layer_freq: 1,
            ..Default::default()
        }
    }

    fn zeros_model(cfg: &ModelConfig) -> DeepseekForCausalLM {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        DeepseekForCausalLM::new(
            cfg,
            None,
            Arc::new(ReferencePagedAttention),
            vb,
            &ParallelContext::single(),
        )
        .unwrap()
    }

    #[test]
    fn builds_mixed_dense_and_moe_stack() {
        let cfg = test_config();
        let model = zeros_model(&cfg);
        assert_eq!(model.model.layers.len(), 3);
        assert!(matches!(model.model.layers[0].ffn, FeedForward::Dense(_)));
        assert!(matches!(model.model.layers[1].ffn, FeedForward::Sparse(_)));
        assert!(matches!(model.model.layers[2].ffn, FeedForward::Sparse(_)));
    }

    #[test]
    fn forward_and_logits_shapes() {
        let cfg = test_config();
        let model = zeros_model(&cfg);
        let comm = LocalCommunicator::new();
        let mut caches = model
            .make_kv_caches(64, DType::F32, &Device::Cpu)
            .unwrap();

        let ids = Tensor::from_vec(vec![1u32, 2, 3, 4, 5], (5,), &Device::Cpu).unwrap();
        let pos = Tensor::from_vec(vec![0u32, 1, 2, 3, 4], (5,), &Device::Cpu).unwrap();
        let meta = AttentionMetadata::prefill(5);
        let hidden = model
            .forward(&ids, &pos, &mut caches, &meta, &comm)
            .unwrap();
        assert_eq!(hidden.dims(), &[5, 16]);

        let logits = model.compute_logits(&hidden, &meta, &comm).unwrap();
        assert_eq!(logits.dims(), &[1, 32]);

        let tokens = model
            .sample(
                &logits,
                &crate::sampling::GreedySampler,
                &crate::sampling::SamplingParams::default(),
            )
            .unwrap();
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn incompatible_head_count_is_fatal() {
        let cfg = ModelConfig {
            num_attention_heads: 3,
            num_key_value_heads: 3,
            hidden_size: 12,
            ..test_config()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = DeepseekForCausalLM::new(
            &cfg,
            None,
            Arc::new(ReferencePagedAttention),
            vb,
            &ParallelContext::new(0, 2),
        );
        assert!(matches!(
            err,
            Err(ModelError::IncompatibleHeads { num_heads: 3, tp_size: 2 })
        ));
    }

    #[test]
    fn dense_and_moe_layers_thread_residual_identically() {
        // With zero weights every sublayer output is zero, so the residual
        // returned by any layer must be exactly its input and the new
        // activation must be zero, regardless of the feed-forward kind.
        let cfg = test_config();
        let model = zeros_model(&cfg);
        let comm = LocalCommunicator::new();
        let meta = AttentionMetadata::prefill(2);
        let pos = Tensor::from_vec(vec![0u32, 1], (2,), &Device::Cpu).unwrap();
        let x_data = vec![0.5f32; 32];
        let x = Tensor::from_vec(x_data.clone(), (2, 16), &Device::Cpu).unwrap();

        for layer in &model.model.layers {
            let mut cache = KvCache::new(8, 2, 4, DType::F32, &Device::Cpu).unwrap();
            let (hidden, residual) = layer
                .forward(&pos, &x, &mut cache, &meta, None, &comm)
                .unwrap();
            assert_eq!(
                residual.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                x_data
            );
            let h = hidden.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(h.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn decode_step_after_prefill() {
        let cfg = test_config();
        let model = zeros_model(&cfg);
        let comm = LocalCommunicator::new();
        let mut caches = model
            .make_kv_caches(64, DType::F32, &Device::Cpu)
            .unwrap();

        let ids = Tensor::from_vec(vec![1u32, 2, 3], (3,), &Device::Cpu).unwrap();
        let pos = Tensor::from_vec(vec![0u32, 1, 2], (3,), &Device::Cpu).unwrap();
        model
            .forward(&ids, &pos, &mut caches, &AttentionMetadata::prefill(3), &comm)
            .unwrap();

        let ids = Tensor::from_vec(vec![7u32], (1,), &Device::Cpu).unwrap();
        let pos = Tensor::from_vec(vec![3u32], (1,), &Device::Cpu).unwrap();
        let meta = AttentionMetadata::decode(4);
        let hidden = model
            .forward(&ids, &pos, &mut caches, &meta, &comm)
            .unwrap();
        assert_eq!(hidden.dims(), &[1, 16]);
    }
}
