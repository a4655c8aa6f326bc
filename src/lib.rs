//! gradwalk: reverse-mode automatic differentiation over strided tensors.
//!
//! Tensors live in a [`Graph`] arena and are addressed by [`TensorId`]
//! handles. Forward operators in [`ops`] compute values and record which
//! operation produced each result; [`Graph::backward`] then walks that record
//! from a root back to every tracked input, accumulating gradients under
//! right-aligned broadcasting.
//!
//! # Features
//!
//! - Strided layouts with broadcast (stride 0) axes and read-only views.
//! - Gradient rules for add, subtract, multiply, divide, batched matmul and
//!   full sum reduction.
//! - An iterative graph walk over a [`Workspace`] whose linked blocks are
//!   reused across passes on the same computation chain, so a training loop
//!   stops allocating after its first iteration.
//!
//! # Limitations
//!
//! - Negate, broadcast, transpose and transpose-all record their operands but
//!   contribute no gradient.
//! - Integer tensors can feed operations but never carry gradients.
//! - Rank is capped at [`layout::MAX_RANK`].
//!
//! # Example
//!
//! ```rust
//! use gradwalk::{DType, Graph};
//!
//! let mut g = Graph::new();
//! let a = g.leaf(&[2], vec![6.0, 1.0], true).unwrap();
//! let b = g.leaf(&[2], vec![2.0, 4.0], true).unwrap();
//! let c = g.div(a, b).unwrap();
//! let loss = g.sum(c).unwrap();
//! g.backward(loss);
//!
//! assert_eq!(g.tensor(a).dtype(), DType::F32);
//! assert_eq!(g.grad(a).unwrap(), vec![0.5, 0.25]);
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::many_single_char_names,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::module_name_repetitions
)]
#![forbid(unused_must_use)]
#![deny(missing_docs)]

pub mod backprop;
pub mod dtype;
pub mod error;
pub mod iter;
pub mod layout;
pub mod ops;
pub mod tensors;
pub mod workspace;

pub use self::dtype::{Buffer, DType, Element};
pub use self::error::{BackwardError, TensorError};
pub use self::layout::Layout;
pub use self::tensors::{DerivedOp, Graph, OpKind, Tensor, TensorId};
pub use self::workspace::{ChainToken, Workspace, WorkspaceConfig, WorkspaceState, WorkspaceStats};
