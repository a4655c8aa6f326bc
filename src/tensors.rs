//! Tensor arena.
//!
//! # Tensors and handles
//!
//! A [`Graph`] owns every tensor header, data buffer and gradient buffer it
//! creates. Callers hold [`TensorId`] handles, which are plain indices: they
//! are `Copy`, compare by identity, and cannot dangle while the graph lives.
//!
//! Each [`Tensor`] pairs a typed data [`Buffer`] with an optional `f32`
//! gradient buffer of the same length, both read through one [`Layout`]. The
//! [`DerivedOp`] records which operation produced the tensor and from which
//! operands; the backward pass follows these records.
//!
//! ## Gradient tracking
//! - Leaves request tracking explicitly; only `f32` leaves may.
//! - A derived tensor tracks gradients if any operand does.
//! - Tracking tensors get a zeroed gradient buffer at creation.
//!
//! ## Example
//!
//! ```rust
//! use gradwalk::Graph;
//!
//! let mut g = Graph::new();
//! let x = g.leaf(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], true).unwrap();
//! assert_eq!(g.tensor(x).shape(), &[2, 2]);
//! assert_eq!(g.grad(x).unwrap(), vec![0.0; 4]);
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

use briny::prelude::TrustedData;

use crate::dtype::{Buffer, DType};
use crate::error::TensorError;
use crate::iter::offsets;
use crate::layout::{Bounded, Layout};
use crate::workspace::{Workspace, WorkspaceConfig};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a tensor inside a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TensorId(u32);

impl TensorId {
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Position of the tensor in its arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Operation kinds that can produce a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Elementwise negation.
    Neg,
    /// Expansion to a larger shape through stride-0 axes.
    Broadcast,
    /// Swap of the last two axes.
    Transpose,
    /// Reversal of every axis.
    TransposeAll,
    /// Broadcasting addition.
    Add,
    /// Broadcasting subtraction.
    Sub,
    /// Broadcasting multiplication.
    Mul,
    /// Broadcasting true division.
    Div,
    /// Batched matrix product.
    MatMul,
    /// Sum of every element into a rank-1, size-1 tensor.
    Sum,
}

impl OpKind {
    /// Whether the backward pass knows how to push a gradient through this
    /// operation. The unary layout and sign operations do not.
    #[must_use]
    pub const fn has_grad_rule(self) -> bool {
        !matches!(
            self,
            Self::Neg | Self::Broadcast | Self::Transpose | Self::TransposeAll
        )
    }

    /// Whether operands are aligned to the result by trailing-axis
    /// broadcasting.
    #[must_use]
    pub const fn is_elementwise(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div)
    }
}

/// How a tensor came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivedOp {
    /// Created directly, not by an operation.
    Leaf,
    /// Result of a one-operand operation.
    Unary {
        /// Operation kind.
        op: OpKind,
        /// The operand.
        operand: TensorId,
    },
    /// Result of a two-operand operation.
    Binary {
        /// Operation kind.
        op: OpKind,
        /// Left operand.
        lhs: TensorId,
        /// Right operand.
        rhs: TensorId,
    },
}

impl DerivedOp {
    /// Recorded operation, if any.
    #[must_use]
    pub const fn kind(&self) -> Option<OpKind> {
        match *self {
            Self::Leaf => None,
            Self::Unary { op, .. } | Self::Binary { op, .. } => Some(op),
        }
    }

    /// Operand handles by slot.
    #[must_use]
    pub const fn operand_slots(&self) -> [Option<TensorId>; 2] {
        match *self {
            Self::Leaf => [None, None],
            Self::Unary { operand, .. } => [Some(operand), None],
            Self::Binary { lhs, rhs, .. } => [Some(lhs), Some(rhs)],
        }
    }

    /// Operand handles in slot order. A tensor used twice appears twice.
    pub fn operands(&self) -> impl Iterator<Item = TensorId> + use<> {
        self.operand_slots().into_iter().flatten()
    }
}

/// A strided view over a data buffer and its parallel gradient buffer.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub(crate) layout: Layout,
    pub(crate) data: Buffer,
    pub(crate) grad: Option<Vec<f32>>,
    pub(crate) grad_generation: u32,
    pub(crate) should_grad: bool,
    pub(crate) op: DerivedOp,
}

impl Tensor {
    /// Layout shared by data and gradient.
    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Logical shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// Element type.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Raw data storage.
    #[must_use]
    pub const fn data(&self) -> &Buffer {
        &self.data
    }

    /// Raw gradient storage.
    #[must_use]
    pub fn grad_buffer(&self) -> Option<&[f32]> {
        self.grad.as_deref()
    }

    /// Whether the tensor requests gradients.
    #[must_use]
    pub const fn should_grad(&self) -> bool {
        self.should_grad
    }

    /// Producing operation.
    #[must_use]
    pub const fn op(&self) -> &DerivedOp {
        &self.op
    }

    /// Counter bumped every time the gradient buffer is replaced or dropped.
    #[must_use]
    pub const fn grad_generation(&self) -> u32 {
        self.grad_generation
    }
}

/// Arena of tensors plus the traversal workspace used to differentiate them.
#[derive(Debug)]
pub struct Graph {
    pub(crate) id: u64,
    pub(crate) nodes: Vec<Tensor>,
    pub(crate) workspace: Workspace,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Empty graph with a default workspace.
    #[must_use]
    pub fn new() -> Self {
        Self::with_workspace_config(WorkspaceConfig::default())
    }

    /// Empty graph whose workspace uses `config`.
    #[must_use]
    pub fn with_workspace_config(config: WorkspaceConfig) -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            workspace: Workspace::with_config(config),
        }
    }

    /// Process-unique identity of this graph.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Number of tensors in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Traversal workspace owned by this graph.
    #[must_use]
    pub const fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Creates a contiguous `f32` leaf tensor.
    ///
    /// # Errors
    /// Fails if `data` does not match `shape` or the rank is unsupported.
    pub fn leaf(&mut self, shape: &[usize], data: Vec<f32>, requires_grad: bool) -> Result<TensorId, TensorError> {
        self.leaf_typed(shape, data, requires_grad)
    }

    /// Creates a contiguous leaf tensor of any element type.
    ///
    /// # Errors
    /// Fails if `data` does not match `shape`, the rank is unsupported, or
    /// gradients are requested on integer data.
    pub fn leaf_typed(
        &mut self,
        shape: &[usize],
        data: impl Into<Buffer>,
        requires_grad: bool,
    ) -> Result<TensorId, TensorError> {
        let data = data.into();
        let layout = Layout::contiguous(shape)?;
        if layout.numel() != data.len() {
            return Err(TensorError::LengthMismatch {
                shape: shape.to_vec(),
                expected: layout.numel(),
                actual: data.len(),
            });
        }
        self.leaf_strided(layout, data, requires_grad)
    }

    /// Creates a leaf tensor over `data` with an arbitrary strided layout.
    ///
    /// # Errors
    /// Fails if the layout reaches past `data`, or gradients are requested on
    /// integer data.
    pub fn leaf_strided(
        &mut self,
        layout: Layout,
        data: impl Into<Buffer>,
        requires_grad: bool,
    ) -> Result<TensorId, TensorError> {
        let data = data.into();
        if requires_grad && !data.dtype().is_float() {
            return Err(TensorError::GradOnInteger(data.dtype()));
        }
        self.insert(layout, data, requires_grad, DerivedOp::Leaf)
    }

    pub(crate) fn insert(
        &mut self,
        layout: Layout,
        data: Buffer,
        should_grad: bool,
        op: DerivedOp,
    ) -> Result<TensorId, TensorError> {
        let len = data.len();
        let layout = TrustedData::new(Bounded { layout, len })
            .map_err(|_| TensorError::OutOfBounds {
                reach: layout.reach().unwrap_or(usize::MAX),
                len,
            })?
            .into_inner()
            .layout;

        let should_grad = should_grad && data.dtype().is_float();
        let id = TensorId::from_raw(u32::try_from(self.nodes.len()).map_err(|_| TensorError::ArenaFull)?);
        self.nodes.push(Tensor {
            layout,
            grad: should_grad.then(|| vec![0.0; len]),
            data,
            grad_generation: 0,
            should_grad,
            op,
        });
        Ok(id)
    }

    /// Records the result of an operation. Tracking is inherited from the
    /// operands.
    pub(crate) fn derive(&mut self, layout: Layout, data: Buffer, op: DerivedOp) -> Result<TensorId, TensorError> {
        let should_grad = op.operands().any(|o| self.nodes[o.index()].should_grad);
        self.insert(layout, data, should_grad, op)
    }

    /// Looks up a tensor.
    #[must_use]
    pub fn get(&self, id: TensorId) -> Option<&Tensor> {
        self.nodes.get(id.index())
    }

    /// Looks up a tensor, failing with [`TensorError::UnknownTensor`].
    ///
    /// # Errors
    /// Fails if `id` was not issued by this graph.
    pub fn try_tensor(&self, id: TensorId) -> Result<&Tensor, TensorError> {
        self.get(id).ok_or(TensorError::UnknownTensor(id))
    }

    /// Looks up a tensor.
    ///
    /// # Panics
    /// Panics if `id` was not issued by this graph.
    #[must_use]
    pub fn tensor(&self, id: TensorId) -> &Tensor {
        match self.get(id) {
            Some(t) => t,
            None => panic!("unknown tensor {id:?}"),
        }
    }

    /// Tensor values in row-major logical order, widened to `f32`.
    ///
    /// # Panics
    /// Panics if `id` was not issued by this graph.
    #[must_use]
    pub fn values(&self, id: TensorId) -> Vec<f32> {
        let t = self.tensor(id);
        let flat = t.data.to_f32_vec();
        offsets(&t.layout).map(|o| flat[o]).collect()
    }

    /// Gradient in row-major logical order, if the tensor has one.
    ///
    /// # Panics
    /// Panics if `id` was not issued by this graph.
    #[must_use]
    pub fn grad(&self, id: TensorId) -> Option<Vec<f32>> {
        let t = self.tensor(id);
        let g = t.grad.as_ref()?;
        Some(offsets(&t.layout).map(|o| g[o]).collect())
    }

    /// Zeroes every gradient buffer in place. Buffers are kept, so a
    /// following backward pass continues the same computation chain.
    pub fn zero_grad(&mut self) {
        for g in self.nodes.iter_mut().filter_map(|t| t.grad.as_mut()) {
            g.fill(0.0);
        }
    }

    /// Replaces a tensor's gradient buffer with a fresh zeroed allocation.
    ///
    /// # Errors
    /// Fails on an unknown handle or a tensor that does not track gradients.
    pub fn reset_grad(&mut self, id: TensorId) -> Result<(), TensorError> {
        let t = self.nodes.get_mut(id.index()).ok_or(TensorError::UnknownTensor(id))?;
        if !t.should_grad {
            return Err(TensorError::NotTracking(id));
        }
        t.grad = Some(vec![0.0; t.data.len()]);
        t.grad_generation = t.grad_generation.wrapping_add(1);
        Ok(())
    }

    /// Drops a tensor's gradient buffer while leaving it marked as tracking.
    /// A backward pass that reaches it afterwards fails with
    /// [`crate::BackwardError::MissingGradient`].
    ///
    /// # Errors
    /// Fails on an unknown handle.
    pub fn release_grad(&mut self, id: TensorId) -> Result<(), TensorError> {
        let t = self.nodes.get_mut(id.index()).ok_or(TensorError::UnknownTensor(id))?;
        t.grad = None;
        t.grad_generation = t.grad_generation.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_track_only_when_asked() {
        let mut g = Graph::new();
        let a = g.leaf(&[2], vec![1.0, 2.0], true).unwrap();
        let b = g.leaf(&[2], vec![1.0, 2.0], false).unwrap();
        assert!(g.tensor(a).should_grad());
        assert_eq!(g.tensor(a).grad_buffer(), Some(&[0.0, 0.0][..]));
        assert!(!g.tensor(b).should_grad());
        assert!(g.grad(b).is_none());
    }

    #[test]
    fn integer_leaves_refuse_gradients() {
        let mut g = Graph::new();
        assert_eq!(
            g.leaf_typed(&[2], vec![1i32, 2], true),
            Err(TensorError::GradOnInteger(DType::I32))
        );
        assert!(g.leaf_typed(&[2], vec![1i32, 2], false).is_ok());
    }

    #[test]
    fn strided_leaf_must_stay_inside_its_buffer() {
        let mut g = Graph::new();
        let ok = Layout::strided(&[2, 2], &[1, 2], 0).unwrap();
        let id = g.leaf_strided(ok, vec![1.0f32, 2.0, 3.0, 4.0], false).unwrap();
        assert_eq!(g.values(id), vec![1.0, 3.0, 2.0, 4.0]);

        let bad = Layout::strided(&[2, 2], &[2, 2], 1).unwrap();
        assert!(matches!(
            g.leaf_strided(bad, vec![0.0f32; 4], false),
            Err(TensorError::OutOfBounds { reach: 6, len: 4 })
        ));
    }

    #[test]
    fn length_mismatch_is_reported() {
        let mut g = Graph::new();
        assert!(matches!(
            g.leaf(&[2, 2], vec![1.0; 3], false),
            Err(TensorError::LengthMismatch { expected: 4, actual: 3, .. })
        ));
    }

    #[test]
    fn reset_and_release_bump_the_generation() {
        let mut g = Graph::new();
        let a = g.leaf(&[1], vec![1.0], true).unwrap();
        g.reset_grad(a).unwrap();
        assert_eq!(g.tensor(a).grad_generation(), 1);
        g.release_grad(a).unwrap();
        assert_eq!(g.tensor(a).grad_generation(), 2);
        assert!(g.grad(a).is_none());
    }

    #[test]
    fn graphs_have_distinct_ids() {
        assert_ne!(Graph::new().id(), Graph::new().id());
    }
}
