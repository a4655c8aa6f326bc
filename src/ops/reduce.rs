//! Reductions.

use crate::dtype::{Buffer, BufferVisitor, Element};
use crate::error::TensorError;
use crate::iter::offsets;
use crate::layout::Layout;
use crate::tensors::{DerivedOp, Graph, OpKind, TensorId};

impl Graph {
    /// Sum of every element, as a rank-1 tensor of size 1.
    ///
    /// # Errors
    /// Fails on an unknown handle.
    pub fn sum(&mut self, x: TensorId) -> Result<TensorId, TensorError> {
        let data = {
            let t = self.try_tensor(x)?;
            t.data.visit(SumAll(&t.layout))
        };
        self.derive(Layout::contiguous(&[1])?, data, DerivedOp::Unary { op: OpKind::Sum, operand: x })
    }
}

struct SumAll<'a>(&'a Layout);

impl BufferVisitor for SumAll<'_> {
    type Output = Buffer;

    fn visit<T: Element>(self, data: &[T]) -> Buffer {
        let total = offsets(self.0).fold(T::ZERO, |acc, o| acc.add(data[o]));
        T::wrap(vec![total])
    }
}
