//! Error types for model construction and checkpoint loading.
//!
//! Tensor-level failures from candle are wrapped transparently; everything
//! else here is a structural problem that makes the model unusable, so all
//! variants are fatal.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("unsupported activation {0:?}, only silu is supported")]
    UnsupportedActivation(String),

    #[error("tensor parallel size {tp_size} exceeds the number of routed experts {num_experts}")]
    TensorParallelExceedsExperts { tp_size: usize, num_experts: usize },

    #[error("{num_heads} attention heads cannot be split across {tp_size} workers")]
    IncompatibleHeads { num_heads: usize, tp_size: usize },

    #[error("{num_kv_heads} key/value heads cannot be split or replicated across {tp_size} workers")]
    IncompatibleKvHeads { num_kv_heads: usize, tp_size: usize },

    #[error("checkpoint tensor {0:?} has no matching model parameter")]
    MissingParameter(String),

    #[error("shard {shard} of {name:?} appears more than once in the checkpoint")]
    DuplicateShard { name: String, shard: &'static str },

    #[error("fused parameter {name:?} is missing its {missing} shard")]
    IncompleteParameter { name: String, missing: &'static str },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
