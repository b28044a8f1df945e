//! Collective communication seam.
//!
//! Forward passes only ever need sum all-reduce and all-gather, so the
//! trait stays that small. The local implementation is the identity and
//! doubles as the test double for single-process multi-rank runs.

use candle_core::{Result, Tensor};

use super::context::ParallelContext;

pub trait Communicator: Send + Sync {
    fn context(&self) -> &ParallelContext;

    /// Sum-reduces `tensor` across all workers.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Concatenates each worker's `tensor` along `dim`, same result everywhere.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;
}

/// Identity communicator for a world of one.
///
/// With a simulated larger world it repeats the local shard, which is only
/// meaningful for exercising the collective call paths in tests.
pub struct LocalCommunicator {
    ctx: ParallelContext,
}

impl LocalCommunicator {
    pub fn new() -> Self {
        Self {
            ctx: ParallelContext::single(),
        }
    }

    pub fn with_context(ctx: ParallelContext) -> Self {
        Self { ctx }
    }
}

impl Default for LocalCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for LocalCommunicator {
    fn context(&self) -> &ParallelContext {
        &self.ctx
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        if self.ctx.is_single() {
            return Ok(tensor.clone());
        }
        let copies = vec![tensor.clone(); self.ctx.world_size()];
        Tensor::cat(&copies, dim)
    }
}
