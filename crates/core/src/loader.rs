//! Checkpoint loading: the fusion protocol that turns per-projection
//! checkpoint tensors into the model's possibly-fused parameter set.
//!
//! Checkpoints always store `q_proj`/`k_proj`/`v_proj` and
//! `gate_proj`/`up_proj` separately. When the model uses fused layouts the
//! shards are collected in any arrival order and concatenated canonically
//! (q, k, v and gate, up) once all of them are present. The fused state
//! dict then feeds ordinary construction, where each rank slices out its
//! own shard.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::trace;

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};
use crate::quantization::WeightLayout;

// ─── Stacked parameter table ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackedShard {
    Q,
    K,
    V,
    Gate,
    Up,
}

impl StackedShard {
    fn slot(self) -> usize {
        match self {
            Self::Q | Self::Gate => 0,
            Self::K | Self::Up => 1,
            Self::V => 2,
        }
    }

    fn num_slots(self) -> usize {
        match self {
            Self::Q | Self::K | Self::V => 3,
            Self::Gate | Self::Up => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Q => "q",
            Self::K => "k",
            Self::V => "v",
            Self::Gate => "gate",
            Self::Up => "up",
        }
    }
}

/// Checkpoint projection name, fused target name, canonical position.
pub const STACKED_PARAMS_MAPPING: [(&str, &str, StackedShard); 5] = [
    ("q_proj", "qkv_proj", StackedShard::Q),
    ("k_proj", "qkv_proj", StackedShard::K),
    ("v_proj", "qkv_proj", StackedShard::V),
    ("gate_proj", "gate_up_proj", StackedShard::Gate),
    ("up_proj", "gate_up_proj", StackedShard::Up),
];

// ─── Expert ownership ───────────────────────────────────────────────────────

/// Which routed experts this worker materializes. Everything outside the
/// owned set is silently skipped at load time.
#[derive(Debug, Clone)]
pub enum ExpertOwnership {
    All,
    Range { start: usize, end: usize },
}

impl ExpertOwnership {
    pub fn all() -> Self {
        Self::All
    }

    /// Contiguous split of `num_experts` over `ep_size` workers.
    pub fn contiguous(num_experts: usize, ep_size: usize, ep_rank: usize) -> Self {
        let per_rank = num_experts.div_ceil(ep_size);
        let start = (ep_rank * per_rank).min(num_experts);
        let end = ((ep_rank + 1) * per_rank).min(num_experts);
        Self::Range { start, end }
    }

    pub fn owns(&self, expert: usize) -> bool {
        match self {
            Self::All => true,
            Self::Range { start, end } => (*start..*end).contains(&expert),
        }
    }
}

// ─── Expected parameter set ─────────────────────────────────────────────────

/// The names the constructed model will ask its `VarBuilder` for.
pub struct ParamLayout {
    names: HashSet<String>,
}

impl ParamLayout {
    pub fn from_names<I>(names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            names: names.into_iter().collect(),
        }
    }

    pub fn of_model(cfg: &ModelConfig, layout: WeightLayout, ownership: &ExpertOwnership) -> Self {
        let mut names = HashSet::new();
        names.insert("model.embed_tokens.weight".to_string());
        names.insert("model.norm.weight".to_string());
        if !cfg.tie_word_embeddings {
            names.insert("lm_head.weight".to_string());
        }

        let mlp_names: &[&str] = match layout {
            WeightLayout::Fused => &["gate_up_proj.weight", "down_proj.weight"],
            WeightLayout::Split => &["gate_proj.weight", "up_proj.weight", "down_proj.weight"],
        };

        for i in 0..cfg.num_hidden_layers {
            let layer = format!("model.layers.{i}");
            names.insert(format!("{layer}.input_layernorm.weight"));
            names.insert(format!("{layer}.post_attention_layernorm.weight"));
            match layout {
                WeightLayout::Fused => {
                    names.insert(format!("{layer}.self_attn.qkv_proj.weight"));
                }
                WeightLayout::Split => {
                    for p in ["q_proj", "k_proj", "v_proj"] {
                        names.insert(format!("{layer}.self_attn.{p}.weight"));
                    }
                }
            }
            names.insert(format!("{layer}.self_attn.o_proj.weight"));

            if cfg.is_moe_layer(i) {
                names.insert(format!("{layer}.mlp.gate.weight"));
                let num_experts = cfg.n_routed_experts.unwrap_or(0);
                for e in (0..num_experts).filter(|&e| ownership.owns(e)) {
                    for m in mlp_names {
                        names.insert(format!("{layer}.mlp.experts.{e}.{m}"));
                    }
                }
                if cfg.n_shared_experts.is_some() {
                    for m in mlp_names {
                        names.insert(format!("{layer}.mlp.shared_experts.{m}"));
                    }
                }
            } else {
                for m in mlp_names {
                    names.insert(format!("{layer}.mlp.{m}"));
                }
            }
        }
        Self { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

// ─── Fusion protocol ────────────────────────────────────────────────────────

struct FusedBuffer {
    slots: Vec<Option<Tensor>>,
    labels: Vec<&'static str>,
}

impl FusedBuffer {
    fn new(shard: StackedShard) -> Self {
        let n = shard.num_slots();
        let labels = if n == 3 {
            vec!["q", "k", "v"]
        } else {
            vec!["gate", "up"]
        };
        Self {
            slots: vec![None; n],
            labels,
        }
    }

    fn insert(&mut self, name: &str, shard: StackedShard, tensor: Tensor) -> Result<()> {
        let slot = shard.slot();
        if self.slots[slot].is_some() {
            return Err(ModelError::DuplicateShard {
                name: name.to_string(),
                shard: shard.label(),
            });
        }
        self.slots[slot] = Some(tensor);
        Ok(())
    }

    fn finalize(self, name: &str) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(self.slots.len());
        for (slot, label) in self.slots.into_iter().zip(self.labels) {
            match slot {
                Some(t) => parts.push(t),
                None => {
                    return Err(ModelError::IncompleteParameter {
                        name: name.to_string(),
                        missing: label,
                    })
                }
            }
        }
        Ok(Tensor::cat(&parts, 0)?)
    }
}

/// Skips that are expected rather than fatal: biases a quantized variant
/// dropped, and experts this worker does not own.
fn is_expected_absence(name: &str, params: &ParamLayout) -> bool {
    if params.contains(name) {
        return false;
    }
    name.ends_with(".bias")
        || name.contains(".mlp.experts.")
        || name.contains(".mlp.shared_experts.")
}

/// Runs the fusion protocol over raw checkpoint entries.
///
/// Entry order never matters; shard slots are concatenated canonically at
/// the end. A checkpoint tensor matching no model parameter is fatal
/// unless it is an expected absence.
pub fn fuse_checkpoint<I>(
    entries: I,
    layout: WeightLayout,
    params: &ParamLayout,
) -> Result<HashMap<String, Tensor>>
where
    I: IntoIterator<Item = (String, Tensor)>,
{
    let mut state: HashMap<String, Tensor> = HashMap::new();
    let mut pending: HashMap<String, FusedBuffer> = HashMap::new();

    for (name, tensor) in entries {
        // Rotary tables are rebuilt from config, never loaded.
        if name.contains("rotary_emb.inv_freq") {
            continue;
        }

        // A name the model uses as-is wins over shard rewriting; this also
        // covers checkpoints that already store fused weights.
        if params.contains(&name) {
            if state.insert(name.clone(), tensor).is_some() {
                return Err(ModelError::DuplicateShard {
                    name,
                    shard: "full",
                });
            }
            continue;
        }

        let mapping = if layout.is_fused() {
            STACKED_PARAMS_MAPPING
                .iter()
                .find(|(frag, _, _)| name.contains(frag))
        } else {
            None
        };

        match mapping {
            Some(&(frag, target_frag, shard)) => {
                let target = name.replace(frag, target_frag);
                if !params.contains(&target) {
                    if is_expected_absence(&target, params) {
                        trace!(name = %name, "skipping shard of unmaterialized parameter");
                        continue;
                    }
                    return Err(ModelError::MissingParameter(name));
                }
                pending
                    .entry(target.clone())
                    .or_insert_with(|| FusedBuffer::new(shard))
                    .insert(&target, shard, tensor)?;
            }
            None => {
                if is_expected_absence(&name, params) {
                    trace!(name = %name, "skipping unmaterialized parameter");
                    continue;
                }
                return Err(ModelError::MissingParameter(name));
            }
        }
    }

    for (name, buffer) in pending {
        let fused = buffer.finalize(&name)?;
        if state.insert(name.clone(), fused).is_some() {
            return Err(ModelError::DuplicateShard {
                name,
                shard: "full",
            });
        }
    }
    Ok(state)
}

/// Reads all tensors from a set of safetensors files.
pub fn load_safetensors<P: AsRef<Path>>(
    paths: &[P],
    device: &Device,
) -> Result<Vec<(String, Tensor)>> {
    let mut entries = Vec::new();
    for path in paths {
        let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        entries.extend(tensors);
    }
    Ok(entries)
}
