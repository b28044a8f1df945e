//! Model architectures.

pub mod deepseek;

pub use deepseek::DeepseekForCausalLM;
