//! Error types.
//!
//! Two families: [`TensorError`] is returned by constructors and forward
//! operators, where a bad shape is an ordinary caller mistake that can be
//! reported. [`BackwardError`] describes the preconditions of a backward pass;
//! [`crate::Graph::backward`] turns it into a panic, while
//! [`crate::Graph::try_backward`] hands it back before any gradient is written.

use thiserror::Error;

use crate::dtype::DType;
use crate::layout::MAX_RANK;
use crate::tensors::{OpKind, TensorId};

/// Failures when building tensors or running forward operators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    /// Buffer length does not cover the shape.
    #[error("shape {shape:?} needs {expected} elements, got {actual}")]
    LengthMismatch {
        /// Requested shape.
        shape: Vec<usize>,
        /// Element count implied by the shape.
        expected: usize,
        /// Element count supplied.
        actual: usize,
    },

    /// Rank is zero or above [`MAX_RANK`].
    #[error("rank {0} is outside 1..={max}", max = MAX_RANK)]
    UnsupportedRank(usize),

    /// A layout addresses memory outside its buffer.
    #[error("layout reaches element {reach} of a buffer holding {len}")]
    OutOfBounds {
        /// Highest element index the layout can address, plus one.
        reach: usize,
        /// Buffer length.
        len: usize,
    },

    /// Shapes cannot be broadcast together.
    #[error("shapes {lhs:?} and {rhs:?} are not broadcast compatible")]
    NotBroadcastable {
        /// Left shape.
        lhs: Vec<usize>,
        /// Right shape.
        rhs: Vec<usize>,
    },

    /// Matmul contraction axes disagree.
    #[error("inner dimensions must match for matmul: {lhs} vs {rhs}")]
    InnerMismatch {
        /// Columns of the left operand.
        lhs: usize,
        /// Rows of the right operand.
        rhs: usize,
    },

    /// Gradient tracking was requested on a non-float tensor.
    #[error("tensors of type {0:?} cannot track gradients")]
    GradOnInteger(DType),

    /// Operation needs a gradient-tracking tensor.
    #[error("tensor {0:?} does not track gradients")]
    NotTracking(TensorId),

    /// Handle does not belong to this graph.
    #[error("unknown tensor {0:?}")]
    UnknownTensor(TensorId),

    /// The arena ran out of handles.
    #[error("graph cannot hold more tensors")]
    ArenaFull,
}

/// Violated preconditions and internal defects of a backward pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackwardError {
    /// Handle does not belong to the graph being walked.
    #[error("unknown tensor {0:?}")]
    UnknownTensor(TensorId),

    /// A tensor that has to hold a gradient is not `f32`.
    #[error("tensor {id:?} has dtype {dtype:?}; gradients need f32")]
    NotFloat {
        /// Offending tensor.
        id: TensorId,
        /// Its element type.
        dtype: DType,
    },

    /// A tensor that has to hold a gradient has no gradient buffer.
    #[error("tensor {0:?} has no gradient storage")]
    MissingGradient(TensorId),

    /// An operand has more axes than the result it fed.
    #[error("{op:?} operand {operand:?} has rank {operand_rank}, above result rank {result_rank}")]
    RankMismatch {
        /// Recorded operation.
        op: OpKind,
        /// Offending operand.
        operand: TensorId,
        /// Operand rank.
        operand_rank: usize,
        /// Result rank.
        result_rank: usize,
    },

    /// An operand axis is neither equal to the result axis nor 1.
    #[error("{op:?} operand {operand:?} with shape {operand_shape:?} does not broadcast to {result_shape:?}")]
    ShapeMismatch {
        /// Recorded operation.
        op: OpKind,
        /// Offending operand.
        operand: TensorId,
        /// Operand shape.
        operand_shape: Vec<usize>,
        /// Result shape.
        result_shape: Vec<usize>,
    },

    /// Tensors were left on the workspace after the walk.
    #[error("workspace still holds {0} tensors after the walk")]
    WorkspaceNotDrained(usize),

    /// Calibration found no reserved block.
    #[error("workspace has no reserved block after the walk")]
    ReservationMissing,
}
