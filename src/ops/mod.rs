//! # Forward Operators
//!
//! Every operator reads its operands from a [`Graph`](crate::Graph), writes
//! a fresh result tensor, and records a [`DerivedOp`](crate::DerivedOp) so
//! the backward pass can find its way back.
//!
//! ## Submodules
//!
//! - [`elementwise`]: negate, add, subtract, multiply, divide with
//!   right-aligned broadcasting
//! - [`matmul`]: batched matrix product and the accumulation kernel shared
//!   with the matmul gradient
//! - [`reduce`]: sum of every element
//! - [`shape`]: broadcast, transpose and transpose-all views
//!
//! ## Result types
//!
//! - `i32` with `i32` stays `i32`; any `f32` operand makes the result `f32`.
//! - Division always produces `f32`.
//! - Elementwise and reduction results are contiguous. Shape operators keep
//!   the operand's storage and only change the layout.
//!
//! ## Example
//! ```rust
//! use gradwalk::Graph;
//!
//! let mut g = Graph::new();
//! let a = g.leaf(&[2, 1], vec![1.0, 2.0], true).unwrap();
//! let b = g.leaf(&[3], vec![10.0, 20.0, 30.0], false).unwrap();
//! let c = g.add(a, b).unwrap();
//! assert_eq!(g.tensor(c).shape(), &[2, 3]);
//! assert_eq!(g.values(c), vec![11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
//! ```

pub mod elementwise;
pub mod matmul;
pub mod reduce;
pub mod shape;
