//! Decoder-only transformer inference layers with sparse mixture-of-experts
//! feed-forward blocks, tensor-parallel attention over an external paged KV
//! cache, and checkpoint weight fusion.
//!
//! The crate is organized bottom-up: [`distributed`] provides sharded
//! linear layers over an explicit parallel context, [`layers`] the shared
//! building blocks, [`moe`] the routed expert machinery, [`models`] the
//! Deepseek stack that ties them together, and [`loader`] the protocol
//! that adapts raw checkpoint tensors to the constructed parameter set.

pub mod config;
pub mod distributed;
pub mod error;
pub mod layers;
pub mod loader;
pub mod models;
pub mod moe;
pub mod quantization;
pub mod sampling;

pub use config::ModelConfig;
pub use error::{ModelError, Result};
pub use models::DeepseekForCausalLM;
