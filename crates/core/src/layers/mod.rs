//! Model-internal layers shared across architectures.

pub mod attention;
pub mod mlp;
pub mod normalization;
pub mod rotary;

pub use attention::{
    AttentionMetadata, KvCache, PagedAttentionBackend, ReferencePagedAttention,
};
pub use mlp::GatedMlp;
pub use normalization::RmsNorm;
pub use rotary::RotaryEmbedding;
