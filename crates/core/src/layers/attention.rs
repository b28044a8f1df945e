//! Paged attention seam and a CPU reference backend.
//!
//! The model writes new key/value vectors into an externally owned cache
//! and attends over the full per-sequence history. Cache allocation, block
//! management and eviction all live behind [`PagedAttentionBackend`]; the
//! reference implementation here uses a flat slot table and exact scaled
//! dot-product attention.

use candle_core::{DType, Device, Result, Tensor, D};

/// Key/value cache for one layer, `[num_slots, kv_heads, head_dim]`.
///
/// Slots start zeroed and each slot belongs to exactly one token for its
/// lifetime, so writes are scatter-adds into untouched rows.
pub struct KvCache {
    pub key: Tensor,
    pub value: Tensor,
}

impl KvCache {
    pub fn new(
        num_slots: usize,
        kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let shape = (num_slots, kv_heads, head_dim);
        Ok(Self {
            key: Tensor::zeros(shape, dtype, device)?,
            value: Tensor::zeros(shape, dtype, device)?,
        })
    }
}

/// Describes where the current batch of tokens lives in the cache.
///
/// Tokens are laid out sequence by sequence: the first `query_lens[0]`
/// rows belong to sequence 0 and so on. `seq_slots[i]` lists sequence i's
/// full slot history oldest first, the new tokens' slots included last.
#[derive(Debug, Clone, Default)]
pub struct AttentionMetadata {
    pub slot_mapping: Vec<usize>,
    pub query_lens: Vec<usize>,
    pub seq_slots: Vec<Vec<usize>>,
}

impl AttentionMetadata {
    /// Metadata for a fresh single-sequence prefill occupying slots `0..len`.
    pub fn prefill(len: usize) -> Self {
        Self {
            slot_mapping: (0..len).collect(),
            query_lens: vec![len],
            seq_slots: vec![(0..len).collect()],
        }
    }

    /// Metadata for one decode step of a single sequence whose history
    /// occupies slots `0..context_len` with the new token at the end.
    pub fn decode(context_len: usize) -> Self {
        Self {
            slot_mapping: vec![context_len - 1],
            query_lens: vec![1],
            seq_slots: vec![(0..context_len).collect()],
        }
    }
}

pub trait PagedAttentionBackend: Send + Sync {
    /// Caches `k`/`v` and returns attention output, all `[tokens, heads,
    /// head_dim]` with `k`/`v` using the key/value head count.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: &mut KvCache,
        meta: &AttentionMetadata,
    ) -> Result<Tensor>;
}

/// Exact attention over the cached history, one sequence at a time.
pub struct ReferencePagedAttention;

impl ReferencePagedAttention {
    fn write_cache(
        cache: &mut KvCache,
        k: &Tensor,
        v: &Tensor,
        slot_mapping: &[usize],
    ) -> Result<()> {
        let slots: Vec<u32> = slot_mapping.iter().map(|&s| s as u32).collect();
        let slots = Tensor::from_vec(slots, (slot_mapping.len(),), k.device())?;
        cache.key = cache.key.index_add(&slots, &k.contiguous()?, 0)?;
        cache.value = cache.value.index_add(&slots, &v.contiguous()?, 0)?;
        Ok(())
    }

    fn gather_history(cache: &Tensor, slots: &[usize]) -> Result<Tensor> {
        let idx: Vec<u32> = slots.iter().map(|&s| s as u32).collect();
        let idx = Tensor::from_vec(idx, (slots.len(),), cache.device())?;
        cache.index_select(&idx, 0)
    }
}

/// Expands `[ctx, kv_heads, head_dim]` to `[ctx, heads, head_dim]` by
/// repeating each key/value head over its query-head group.
fn repeat_kv(x: Tensor, groups: usize) -> Result<Tensor> {
    if groups == 1 {
        return Ok(x);
    }
    let (ctx, kv_heads, head_dim) = x.dims3()?;
    x.unsqueeze(2)?
        .expand((ctx, kv_heads, groups, head_dim))?
        .contiguous()?
        .reshape((ctx, kv_heads * groups, head_dim))
}

fn causal_mask(q_len: usize, ctx_len: usize, device: &Device) -> Result<Tensor> {
    // Query row i may see keys up to position ctx_len - q_len + i.
    let offset = ctx_len - q_len;
    let mut data = vec![0f32; q_len * ctx_len];
    for i in 0..q_len {
        for j in (offset + i + 1)..ctx_len {
            data[i * ctx_len + j] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (q_len, ctx_len), device)
}

impl PagedAttentionBackend for ReferencePagedAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: &mut KvCache,
        meta: &AttentionMetadata,
    ) -> Result<Tensor> {
        let (tokens, num_heads, head_dim) = q.dims3()?;
        let (_, kv_heads, _) = k.dims3()?;
        if meta.slot_mapping.len() != tokens {
            candle_core::bail!(
                "slot mapping covers {} tokens, batch has {tokens}",
                meta.slot_mapping.len()
            );
        }
        if meta.query_lens.iter().sum::<usize>() != tokens {
            candle_core::bail!("query lengths do not sum to the token count");
        }
        if meta.query_lens.len() != meta.seq_slots.len() {
            candle_core::bail!("per-sequence metadata lengths disagree");
        }

        Self::write_cache(cache, k, v, &meta.slot_mapping)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let groups = num_heads / kv_heads;
        let mut outputs = Vec::with_capacity(meta.query_lens.len());
        let mut offset = 0usize;
        for (q_len, slots) in meta.query_lens.iter().zip(&meta.seq_slots) {
            let ctx_len = slots.len();
            if ctx_len < *q_len {
                candle_core::bail!("sequence history shorter than its query span");
            }
            let q_i = q.narrow(0, offset, *q_len)?;
            offset += q_len;

            let keys = repeat_kv(Self::gather_history(&cache.key, slots)?, groups)?;
            let values = repeat_kv(Self::gather_history(&cache.value, slots)?, groups)?;

            // [heads, q_len, ctx]
            let q_i = q_i.transpose(0, 1)?.contiguous()?;
            let keys = keys.transpose(0, 1)?.contiguous()?;
            let values = values.transpose(0, 1)?.contiguous()?;
            let scores = (q_i.matmul(&keys.transpose(1, 2)?)? * scale)?;
            let mask = causal_mask(*q_len, ctx_len, q.device())?.to_dtype(scores.dtype())?;
            let scores = scores.broadcast_add(&mask)?;
            let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
            let out = probs.matmul(&values)?;
            outputs.push(out.transpose(0, 1)?.contiguous()?);
        }
        Tensor::cat(&outputs, 0)
    }
}
