//! Layout-only operators.
//!
//! The result shares a copy of the operand's storage and differs only in
//! layout. The backward pass records these operations but has no gradient
//! rule for them.

use crate::error::TensorError;
use crate::layout::Layout;
use crate::tensors::{DerivedOp, Graph, OpKind, TensorId};

impl Graph {
    /// Expands `x` to `shape` through stride-0 axes.
    ///
    /// # Errors
    /// Fails on an unknown handle or a shape `x` cannot broadcast to.
    pub fn broadcast_to(&mut self, x: TensorId, shape: &[usize]) -> Result<TensorId, TensorError> {
        self.relayout(x, OpKind::Broadcast, |l| l.broadcast_to(shape))
    }

    /// Swaps the last two axes of `x`.
    ///
    /// # Errors
    /// Fails on an unknown handle.
    pub fn transpose(&mut self, x: TensorId) -> Result<TensorId, TensorError> {
        self.relayout(x, OpKind::Transpose, |l| Ok(l.transposed()))
    }

    /// Reverses every axis of `x`.
    ///
    /// # Errors
    /// Fails on an unknown handle.
    pub fn transpose_all(&mut self, x: TensorId) -> Result<TensorId, TensorError> {
        self.relayout(x, OpKind::TransposeAll, |l| Ok(l.reversed()))
    }

    fn relayout(
        &mut self,
        x: TensorId,
        op: OpKind,
        view: impl FnOnce(&Layout) -> Result<Layout, TensorError>,
    ) -> Result<TensorId, TensorError> {
        let t = self.try_tensor(x)?;
        let layout = view(&t.layout)?;
        let data = t.data.clone();
        self.derive(layout, data, DerivedOp::Unary { op, operand: x })
    }
}

#[cfg(test)]
mod tests {
    use crate::Graph;

    #[test]
    fn transpose_all_reverses_axes() {
        let mut g = Graph::new();
        let a = g.leaf(&[2, 1, 3], (0..6).map(|x| x as f32).collect(), false).unwrap();
        let t = g.transpose_all(a).unwrap();
        assert_eq!(g.tensor(t).shape(), &[3, 1, 2]);
        assert_eq!(g.values(t), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn broadcast_repeats_rows() {
        let mut g = Graph::new();
        let a = g.leaf(&[3], vec![1.0, 2.0, 3.0], true).unwrap();
        let b = g.broadcast_to(a, &[2, 3]).unwrap();
        assert_eq!(g.values(b), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        assert!(g.tensor(b).should_grad());
        assert_eq!(g.tensor(b).grad_buffer().map(<[f32]>::len), Some(3));
    }
}
