//! Model configuration parsed from a HuggingFace-style `config.json`.

use serde::Deserialize;

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_experts_per_tok() -> usize {
    2
}

fn default_moe_layer_freq() -> usize {
    1
}

/// Linear rope scaling, the only variant the rotary cache understands.
#[derive(Debug, Clone, Deserialize)]
pub struct RopeScaling {
    pub factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub max_position_embeddings: usize,
    pub hidden_act: String,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default)]
    pub tie_word_embeddings: bool,

    // Sparse MoE fields. A checkpoint without `n_routed_experts` is a plain
    // dense decoder and every layer uses the regular MLP.
    #[serde(default)]
    pub n_routed_experts: Option<usize>,
    #[serde(default)]
    pub n_shared_experts: Option<usize>,
    #[serde(default)]
    pub moe_intermediate_size: Option<usize>,
    #[serde(default = "default_experts_per_tok")]
    pub num_experts_per_tok: usize,
    #[serde(default)]
    pub norm_topk_prob: bool,
    #[serde(default)]
    pub first_k_dense_replace: usize,
    #[serde(default = "default_moe_layer_freq")]
    pub moe_layer_freq: usize,
}

impl ModelConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Whether layer `idx` replaces its dense MLP with a sparse MoE block.
    pub fn is_moe_layer(&self, idx: usize) -> bool {
        self.n_routed_experts.is_some()
            && idx >= self.first_k_dense_replace
            && idx % self.moe_layer_freq == 0
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            hidden_size: 4096,
            intermediate_size: 11008,
            num_hidden_layers: 30,
            num_attention_heads: 32,
            num_key_value_heads: 32,
            max_position_embeddings: 4096,
            hidden_act: "silu".to_string(),
            rms_norm_eps: 1e-6,
            rope_theta: 10000.0,
            rope_scaling: None,
            tie_word_embeddings: false,
            n_routed_experts: None,
            n_shared_experts: None,
            moe_intermediate_size: None,
            num_experts_per_tok: 2,
            norm_topk_prob: false,
            first_k_dense_replace: 0,
            moe_layer_freq: 1,
        }
    }
}
