//! Tensor-parallel building blocks.
//!
//! Every sharded layer receives an explicit [`ParallelContext`] at
//! construction and a [`Communicator`] at forward time; nothing here reads
//! ambient process-group state.

pub mod communicator;
pub mod context;
pub mod parallel_layers;

pub use communicator::{Communicator, LocalCommunicator};
pub use context::ParallelContext;
pub use parallel_layers::{
    ColumnParallelLinear, MergedColumnParallelLinear, ParallelLMHead, QKVParallelLinear,
    ReplicatedLinear, RowParallelLinear, VocabParallelEmbedding,
};
