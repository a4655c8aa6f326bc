//! Elementwise operators with right-aligned broadcasting.

use crate::dtype::{Buffer, BufferVisitor, DType, Element};
use crate::error::TensorError;
use crate::iter::{BroadcastCursor, offsets};
use crate::layout::{Layout, broadcast_shapes};
use crate::tensors::{DerivedOp, Graph, OpKind, TensorId};

impl Graph {
    /// `-x`, elementwise.
    ///
    /// # Errors
    /// Fails on an unknown handle.
    pub fn neg(&mut self, x: TensorId) -> Result<TensorId, TensorError> {
        let (layout, data) = {
            let t = self.try_tensor(x)?;
            let out = Layout::contiguous(t.shape())?;
            (out, t.data.visit(Negate(&t.layout)))
        };
        self.derive(layout, data, DerivedOp::Unary { op: OpKind::Neg, operand: x })
    }

    /// `lhs + rhs` with broadcasting.
    ///
    /// # Errors
    /// Fails on unknown handles or non-broadcastable shapes.
    pub fn add(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId, TensorError> {
        self.binary(OpKind::Add, lhs, rhs)
    }

    /// `lhs - rhs` with broadcasting.
    ///
    /// # Errors
    /// Fails on unknown handles or non-broadcastable shapes.
    pub fn sub(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId, TensorError> {
        self.binary(OpKind::Sub, lhs, rhs)
    }

    /// `lhs * rhs` with broadcasting.
    ///
    /// # Errors
    /// Fails on unknown handles or non-broadcastable shapes.
    pub fn mul(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId, TensorError> {
        self.binary(OpKind::Mul, lhs, rhs)
    }

    /// `lhs / rhs` with broadcasting, always in `f32`.
    ///
    /// # Errors
    /// Fails on unknown handles or non-broadcastable shapes.
    pub fn div(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId, TensorError> {
        self.binary(OpKind::Div, lhs, rhs)
    }

    fn binary(&mut self, op: OpKind, lhs: TensorId, rhs: TensorId) -> Result<TensorId, TensorError> {
        let (layout, data) = {
            let a = self.try_tensor(lhs)?;
            let b = self.try_tensor(rhs)?;
            let out = Layout::contiguous(&broadcast_shapes(a.shape(), b.shape())?)?;

            let dtype = match op {
                OpKind::Div => DType::F32,
                _ => a.dtype().promote(b.dtype()),
            };
            let data = match (dtype, &a.data, &b.data) {
                (DType::I32, Buffer::I32(x), Buffer::I32(y)) => {
                    Buffer::I32(zip_broadcast(&out, (&a.layout, x.as_slice()), (&b.layout, y.as_slice()), combine(op)))
                }
                _ => {
                    let (x, y) = (a.data.widened(), b.data.widened());
                    Buffer::F32(zip_broadcast(&out, (&a.layout, &*x), (&b.layout, &*y), combine_f32(op)))
                }
            };
            (out, data)
        };
        self.derive(layout, data, DerivedOp::Binary { op, lhs, rhs })
    }
}

struct Negate<'a>(&'a Layout);

impl BufferVisitor for Negate<'_> {
    type Output = Buffer;

    fn visit<T: Element>(self, data: &[T]) -> Buffer {
        T::wrap(offsets(self.0).map(|o| data[o].neg()).collect())
    }
}

fn combine<T: Element>(op: OpKind) -> fn(T, T) -> T {
    match op {
        OpKind::Sub => T::sub,
        OpKind::Mul => T::mul,
        _ => T::add,
    }
}

fn combine_f32(op: OpKind) -> fn(f32, f32) -> f32 {
    match op {
        OpKind::Div => |x, y| x / y,
        other => combine(other),
    }
}

/// Fills a contiguous `out` layout from two operands broadcast into it.
fn zip_broadcast<T: Copy>(
    out: &Layout,
    (la, a): (&Layout, &[T]),
    (lb, b): (&Layout, &[T]),
    f: fn(T, T) -> T,
) -> Vec<T> {
    BroadcastCursor::new(out, [la, lb])
        .map(|(_, [oa, ob])| f(a[oa], b[ob]))
        .collect()
}
