//! Traversal workspace.
//!
//! The backward walk keeps its pending tensors on a stack made of linked
//! fixed-capacity blocks. Blocks are never resized: when the top block is
//! full a new one is linked above it, and when a block drains it is retired
//! into a single reserved slot instead of being freed, so the next push can
//! pick it back up.
//!
//! A [`Workspace`] survives between backward passes. Passes that share a
//! [`ChainToken`] (same graph, same root, same root gradient buffer) form a
//! computation chain, typically one pass per training step. Over a chain the
//! workspace records the deepest stack it has seen and, after every pass,
//! sizes its reserved block to that peak, so a following pass over an equal
//! or smaller graph allocates nothing. A pass with a different token starts a
//! fresh chain and discards everything but one small reservation.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──> FreshChain ──> Walking ──> Drained
//!              ^                         │
//!              └── token differs ────────┤
//!                  ContinuingChain <─────┘ token matches
//! ```

use log::{debug, trace};

use crate::error::BackwardError;
use crate::tensors::TensorId;

/// Sizing policy for workspace blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Capacity of the reservation made when a chain starts, and the first
    /// growth unit.
    pub initial_capacity: usize,
    /// Percentage by which each newly allocated block outgrows the previous
    /// growth unit.
    pub growth_percent: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            growth_percent: 50,
        }
    }
}

impl WorkspaceConfig {
    /// Sets the starting capacity (at least 1).
    #[must_use]
    pub const fn with_initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = if capacity == 0 { 1 } else { capacity };
        self
    }

    /// Sets the growth percentage.
    #[must_use]
    pub const fn with_growth_percent(mut self, percent: usize) -> Self {
        self.growth_percent = percent;
        self
    }

    fn grow(&self, unit: usize) -> usize {
        (unit + unit * self.growth_percent / 100).max(unit + 1)
    }
}

/// Identity of a computation chain.
///
/// Two backward passes with equal tokens reuse the same workspace state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainToken {
    /// Graph the root lives in.
    pub graph: u64,
    /// Root tensor.
    pub root: TensorId,
    /// Generation of the root's gradient buffer.
    pub grad_generation: u32,
}

/// Where the workspace is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkspaceState {
    /// Never used, or abandoned after a failed pass.
    #[default]
    Idle,
    /// Reset for a new chain; about to walk.
    FreshChain,
    /// Reusing the previous chain's blocks; about to walk.
    ContinuingChain,
    /// A walk is in progress.
    Walking,
    /// The last walk completed and the reservation was calibrated.
    Drained,
}

/// Allocation and usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkspaceStats {
    /// Blocks allocated over the workspace's lifetime.
    pub blocks_allocated: usize,
    /// Blocks allocated since the current chain started.
    pub chain_blocks_allocated: usize,
    /// Chains started (fresh resets).
    pub resets: usize,
    /// Backward passes begun.
    pub runs: usize,
    /// Peak pending count at the end of the last completed pass.
    pub last_peak: usize,
}

impl WorkspaceStats {
    fn count_block(&mut self) {
        self.blocks_allocated += 1;
        self.chain_blocks_allocated += 1;
    }
}

#[derive(Debug)]
struct Block {
    slots: Vec<TensorId>,
    capacity: usize,
    below: Option<Box<Block>>,
}

impl Block {
    fn new(capacity: usize) -> Box<Self> {
        Box::new(Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            below: None,
        })
    }

    fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }
}

impl Drop for Block {
    // unlink iteratively so long chains cannot overflow the stack
    fn drop(&mut self) {
        let mut below = self.below.take();
        while let Some(mut block) = below {
            below = block.below.take();
        }
    }
}

/// Reusable stack of pending tensors for the backward walk.
#[derive(Debug, Default)]
pub struct Workspace {
    config: WorkspaceConfig,
    top: Option<Box<Block>>,
    reserved: Option<Box<Block>>,
    running: usize,
    peak: usize,
    growth_unit: usize,
    chain: Option<ChainToken>,
    state: WorkspaceState,
    stats: WorkspaceStats,
    pending: Vec<u32>,
}

impl Workspace {
    /// Workspace with the default configuration. Nothing is allocated until
    /// the first pass.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WorkspaceConfig::default())
    }

    /// Workspace with `config`.
    #[must_use]
    pub fn with_config(config: WorkspaceConfig) -> Self {
        Self {
            config: config.with_initial_capacity(config.initial_capacity),
            growth_unit: config.initial_capacity.max(1),
            ..Self::default()
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> WorkspaceState {
        self.state
    }

    /// Token of the chain the workspace is calibrated for.
    #[must_use]
    pub const fn chain(&self) -> Option<ChainToken> {
        self.chain
    }

    /// Counters.
    #[must_use]
    pub const fn stats(&self) -> &WorkspaceStats {
        &self.stats
    }

    /// Tensors currently pending.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.running
    }

    /// Whether nothing is pending.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.running == 0
    }

    /// Highest pending count seen over the current chain.
    #[must_use]
    pub const fn peak(&self) -> usize {
        self.peak
    }

    /// Capacity the next freshly allocated block will exceed.
    #[must_use]
    pub const fn growth_unit(&self) -> usize {
        self.growth_unit
    }

    /// Capacity of the reserved spare block, if there is one.
    #[must_use]
    pub fn reserved_capacity(&self) -> Option<usize> {
        self.reserved.as_ref().map(|b| b.capacity)
    }

    /// Number of blocks currently linked into the stack.
    #[must_use]
    pub fn block_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.top.as_deref();
        while let Some(block) = cursor {
            count += 1;
            cursor = block.below.as_deref();
        }
        count
    }

    /// Pushes a pending tensor, linking a new block when the top one is full.
    pub fn push(&mut self, id: TensorId) {
        if self.top.as_ref().is_none_or(|b| b.is_full()) {
            let mut block = match self.reserved.take() {
                Some(spare) => spare,
                None => self.allocate(),
            };
            block.below = self.top.take();
            self.top = Some(block);
        }

        if let Some(top) = self.top.as_mut() {
            top.slots.push(id);
        }
        self.running += 1;
        self.peak = self.peak.max(self.running);
    }

    /// Removes and returns the most recently pushed tensor. A block that
    /// drains is retired into the reserved slot.
    ///
    /// # Panics
    /// Panics if the workspace is empty.
    pub fn pop(&mut self) -> TensorId {
        let Some(top) = self.top.as_mut() else {
            panic!("pop on an empty traversal workspace");
        };
        let Some(id) = top.slots.pop() else {
            panic!("traversal workspace holds an empty block");
        };
        self.running -= 1;

        if top.slots.is_empty() {
            if let Some(mut spent) = self.top.take() {
                self.top = spent.below.take();
                trace!("retiring drained block of capacity {}", spent.capacity);
                self.reserved = Some(spent);
            }
        }
        id
    }

    /// The most recently pushed tensor.
    ///
    /// # Panics
    /// Panics if the workspace is empty.
    #[must_use]
    pub fn top(&self) -> TensorId {
        match self.top.as_ref().and_then(|b| b.slots.last()) {
            Some(&id) => id,
            None => panic!("top of an empty traversal workspace"),
        }
    }

    fn allocate(&mut self) -> Box<Block> {
        self.growth_unit = self.config.grow(self.growth_unit);
        self.stats.count_block();
        trace!("allocating traversal block of capacity {}", self.growth_unit);
        Block::new(self.growth_unit)
    }

    /// Drops every block and starts over with one reservation of the
    /// configured initial capacity.
    fn reset(&mut self) {
        self.top = None;
        self.running = 0;
        self.peak = 0;
        self.growth_unit = self.config.initial_capacity;
        self.stats.chain_blocks_allocated = 0;
        if self.reserved_capacity() != Some(self.config.initial_capacity) {
            self.reserved = Some(Block::new(self.config.initial_capacity));
            self.stats.count_block();
        }
        self.stats.resets += 1;
    }

    /// Enters a pass for `token`, resetting unless it continues the
    /// previous chain. Also sizes the pending-consumer table for
    /// `tensor_count` tensors.
    pub(crate) fn begin(&mut self, token: ChainToken, tensor_count: usize) {
        if self.chain == Some(token) {
            debug!("continuing chain at root {:?} (peak {})", token.root, self.peak);
            self.state = WorkspaceState::ContinuingChain;
        } else {
            debug!("fresh chain at root {:?} in graph {}", token.root, token.graph);
            self.reset();
            self.chain = Some(token);
            self.state = WorkspaceState::FreshChain;
        }

        if self.pending.len() < tensor_count {
            self.pending.resize(tensor_count, 0);
        }
        self.stats.runs += 1;
    }

    pub(crate) fn set_walking(&mut self) {
        self.state = WorkspaceState::Walking;
    }

    /// Counts one more consumer of `id`; true if it is the first.
    pub(crate) fn add_consumer(&mut self, id: TensorId) -> bool {
        let slot = &mut self.pending[id.index()];
        *slot += 1;
        *slot == 1
    }

    /// Marks one consumer of `id` as done; true once none remain.
    pub(crate) fn consume(&mut self, id: TensorId) -> bool {
        let slot = &mut self.pending[id.index()];
        *slot = slot.saturating_sub(1);
        *slot == 0
    }

    /// Throws away a failed pass. The next pass starts a fresh chain.
    pub(crate) fn abandon(&mut self) {
        while !self.is_empty() {
            let _ = self.pop();
        }
        self.pending.fill(0);
        self.chain = None;
        self.state = WorkspaceState::Idle;
    }

    /// Closes a pass: the stack must be empty, and the reservation is grown
    /// to the chain's peak.
    pub(crate) fn finish(&mut self) -> Result<(), BackwardError> {
        if !self.is_empty() {
            return Err(BackwardError::WorkspaceNotDrained(self.running));
        }

        let reserved = self.reserved_capacity().ok_or(BackwardError::ReservationMissing)?;
        if self.peak > reserved {
            debug!("growing reservation from {reserved} to peak {}", self.peak);
            self.reserved = Some(Block::new(self.peak));
            self.stats.count_block();
        }

        self.stats.last_peak = self.peak;
        self.state = WorkspaceState::Drained;
        debug!(
            "walk drained: peak {}, {} blocks allocated so far",
            self.peak, self.stats.blocks_allocated
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> TensorId {
        TensorId::from_raw(n)
    }

    fn token(root: u32) -> ChainToken {
        ChainToken {
            graph: 7,
            root: id(root),
            grad_generation: 0,
        }
    }

    #[test]
    fn push_pop_is_lifo_across_blocks() {
        let mut ws = Workspace::with_config(WorkspaceConfig::default().with_initial_capacity(2));
        ws.begin(token(0), 0);
        for n in 0..7 {
            ws.push(id(n));
        }
        assert_eq!(ws.len(), 7);
        assert_eq!(ws.top(), id(6));
        let popped: Vec<_> = (0..7).map(|_| ws.pop()).collect();
        assert_eq!(popped, (0..7).rev().map(id).collect::<Vec<_>>());
        assert!(ws.is_empty());
    }

    #[test]
    fn new_blocks_grow_by_half() {
        let mut ws = Workspace::with_config(WorkspaceConfig::default().with_initial_capacity(4));
        ws.begin(token(0), 0);
        // 4 from the reservation, then 6, then 9
        for n in 0..19 {
            ws.push(id(n));
        }
        assert_eq!(ws.block_count(), 3);
        assert_eq!(ws.growth_unit(), 9);
        assert_eq!(ws.stats().blocks_allocated, 3);
    }

    #[test]
    fn drained_block_becomes_the_spare() {
        let mut ws = Workspace::with_config(WorkspaceConfig::default().with_initial_capacity(2));
        ws.begin(token(0), 0);
        ws.push(id(0));
        ws.push(id(1));
        ws.push(id(2));
        assert_eq!(ws.block_count(), 2);
        assert_eq!(ws.reserved_capacity(), None);

        ws.pop();
        assert_eq!(ws.block_count(), 1);
        assert_eq!(ws.reserved_capacity(), Some(3));

        // refilling reuses the spare instead of allocating
        let before = ws.stats().blocks_allocated;
        ws.push(id(3));
        assert_eq!(ws.stats().blocks_allocated, before);
    }

    #[test]
    fn finish_sizes_the_reservation_to_the_peak() {
        let mut ws = Workspace::with_config(WorkspaceConfig::default().with_initial_capacity(2));
        ws.begin(token(0), 0);
        for n in 0..10 {
            ws.push(id(n));
        }
        while !ws.is_empty() {
            ws.pop();
        }
        ws.finish().unwrap();
        assert_eq!(ws.reserved_capacity(), Some(10));
        assert_eq!(ws.state(), WorkspaceState::Drained);

        ws.begin(token(0), 0);
        assert_eq!(ws.state(), WorkspaceState::ContinuingChain);
        let before = ws.stats().blocks_allocated;
        for n in 0..10 {
            ws.push(id(n));
        }
        assert_eq!(ws.block_count(), 1);
        assert_eq!(ws.stats().blocks_allocated, before);
    }

    #[test]
    fn different_token_resets_the_chain() {
        let mut ws = Workspace::new();
        ws.begin(token(0), 0);
        for n in 0..40 {
            ws.push(id(n));
        }
        while !ws.is_empty() {
            ws.pop();
        }
        ws.finish().unwrap();
        assert_eq!(ws.peak(), 40);

        ws.begin(token(1), 0);
        assert_eq!(ws.state(), WorkspaceState::FreshChain);
        assert_eq!(ws.peak(), 0);
        assert_eq!(ws.reserved_capacity(), Some(16));
        assert_eq!(ws.stats().resets, 2);
    }

    #[test]
    fn finish_rejects_leftovers() {
        let mut ws = Workspace::new();
        ws.begin(token(0), 0);
        ws.push(id(0));
        assert_eq!(ws.finish(), Err(BackwardError::WorkspaceNotDrained(1)));
    }

    #[test]
    fn consumer_counts_track_first_and_last() {
        let mut ws = Workspace::new();
        ws.begin(token(0), 3);
        assert!(ws.add_consumer(id(2)));
        assert!(!ws.add_consumer(id(2)));
        assert!(!ws.consume(id(2)));
        assert!(ws.consume(id(2)));
    }

    #[test]
    #[should_panic(expected = "pop on an empty traversal workspace")]
    fn pop_on_empty_panics() {
        let mut ws = Workspace::new();
        let _ = ws.pop();
    }

    #[test]
    #[should_panic(expected = "top of an empty traversal workspace")]
    fn top_on_empty_panics() {
        let _ = Workspace::new().top();
    }
}
