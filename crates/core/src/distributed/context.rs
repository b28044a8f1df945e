//! Placement of the current worker inside the tensor-parallel group.

/// Rank and world size of the calling worker.
///
/// Threaded explicitly through constructors so a single process can build
/// shards for several ranks, which is how the multi-rank tests work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelContext {
    rank: usize,
    world_size: usize,
}

impl ParallelContext {
    /// Panics if `rank >= world_size` or `world_size == 0`; both indicate a
    /// launcher bug, not a runtime condition.
    pub fn new(rank: usize, world_size: usize) -> Self {
        assert!(world_size > 0, "world size must be positive");
        assert!(
            rank < world_size,
            "rank {rank} out of range for world size {world_size}"
        );
        Self { rank, world_size }
    }

    /// Single-worker context, rank 0 of 1.
    pub fn single() -> Self {
        Self::new(0, 1)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_single(&self) -> bool {
        self.world_size == 1
    }
}

impl Default for ParallelContext {
    fn default() -> Self {
        Self::single()
    }
}
