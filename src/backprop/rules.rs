//! Op-local gradient rules.
//!
//! Each rule reads the accumulated gradient of a result tensor and adds its
//! contribution into the gradient buffer of one operand. Operands are
//! aligned to the result by trailing-axis broadcasting, so an operand that
//! was broadcast in the forward pass receives the sum over the broadcast
//! positions.

use crate::dtype::{BufferVisitor, Element};
use crate::error::BackwardError;
use crate::iter::{for_each_offset, offsets};
use crate::layout::{Layout, Misfit};
use crate::tensors::{DerivedOp, OpKind, Tensor, TensorId};

use super::matmul::MatmulViews;
use super::scalar::{ScalarOp, apply_scalar};

/// `id` must be able to hold a gradient.
pub(crate) fn require_grad(id: TensorId, t: &Tensor) -> Result<(), BackwardError> {
    if !t.dtype().is_float() {
        return Err(BackwardError::NotFloat { id, dtype: t.dtype() });
    }
    if t.grad.is_none() {
        return Err(BackwardError::MissingGradient(id));
    }
    Ok(())
}

/// Checks everything the rules of `id` will rely on.
pub(crate) fn validate(nodes: &[Tensor], id: TensorId) -> Result<(), BackwardError> {
    let t = &nodes[id.index()];
    require_grad(id, t)?;

    for operand in t.op.operands() {
        let o = &nodes[operand.index()];
        if o.should_grad {
            require_grad(operand, o)?;
        }
    }

    match t.op {
        DerivedOp::Binary { op: OpKind::MatMul, lhs, rhs } => {
            MatmulViews::new(
                (lhs, &nodes[lhs.index()].layout),
                (rhs, &nodes[rhs.index()].layout),
                &t.layout,
            )?;
        }
        DerivedOp::Binary { op, lhs, rhs } if op.is_elementwise() => {
            for operand in [lhs, rhs] {
                fits(op, operand, &nodes[operand.index()].layout, &t.layout)?;
            }
        }
        DerivedOp::Unary { op: OpKind::Sum, operand } if t.layout.numel() != 1 => {
            return Err(BackwardError::ShapeMismatch {
                op: OpKind::Sum,
                operand,
                operand_shape: nodes[operand.index()].shape().to_vec(),
                result_shape: t.shape().to_vec(),
            });
        }
        _ => {}
    }
    Ok(())
}

fn fits(op: OpKind, operand: TensorId, layout: &Layout, result: &Layout) -> Result<(), BackwardError> {
    match layout.fits_into(result) {
        Ok(()) => Ok(()),
        Err(Misfit::Rank) => Err(BackwardError::RankMismatch {
            op,
            operand,
            operand_rank: layout.rank(),
            result_rank: result.rank(),
        }),
        Err(Misfit::Size) => Err(BackwardError::ShapeMismatch {
            op,
            operand,
            operand_shape: layout.shape().to_vec(),
            result_shape: result.shape().to_vec(),
        }),
    }
}

/// Adds the contribution of `parent`'s gradient to the operand in `slot`.
pub(crate) fn propagate(
    nodes: &mut [Tensor],
    parent: TensorId,
    slot: usize,
    operand: TensorId,
) -> Result<(), BackwardError> {
    let mut target = nodes[operand.index()]
        .grad
        .take()
        .ok_or(BackwardError::MissingGradient(operand))?;
    let outcome = accumulate(nodes, parent, slot, operand, &mut target);
    nodes[operand.index()].grad = Some(target);
    outcome
}

fn accumulate(
    nodes: &[Tensor],
    parent: TensorId,
    slot: usize,
    operand: TensorId,
    target: &mut [f32],
) -> Result<(), BackwardError> {
    let p = &nodes[parent.index()];
    let gp = p.grad.as_deref().ok_or(BackwardError::MissingGradient(parent))?;
    let (lp, lt) = (&p.layout, &nodes[operand.index()].layout);

    match (p.op, slot) {
        (DerivedOp::Binary { op: OpKind::Add, .. }, _) | (DerivedOp::Binary { op: OpKind::Sub, .. }, 0) => {
            reduce_into(target, lt, gp, lp, 1.0);
        }
        (DerivedOp::Binary { op: OpKind::Sub, .. }, _) => {
            reduce_into(target, lt, gp, lp, -1.0);
        }
        (DerivedOp::Binary { op: OpKind::Mul, lhs, rhs }, s) => {
            let other_id = if s == 0 { rhs } else { lhs };
            let other = &nodes[other_id.index()];
            other.data.visit(Against {
                parent: (lp, gp),
                target: (lt, target),
                other: &other.layout,
                f: |g: f32, o: f32, _: usize| g * o,
            });
        }
        (DerivedOp::Binary { op: OpKind::Div, rhs, .. }, 0) => {
            let den = &nodes[rhs.index()];
            den.data.visit(Against {
                parent: (lp, gp),
                target: (lt, target),
                other: &den.layout,
                f: |g: f32, d: f32, _: usize| g / d,
            });
        }
        (DerivedOp::Binary { op: OpKind::Div, lhs, .. }, _) => {
            let num = &nodes[lhs.index()];
            let den = nodes[operand.index()].data.widened();
            num.data.visit(Against {
                parent: (lp, gp),
                target: (lt, target),
                other: &num.layout,
                f: |g: f32, n: f32, at: usize| {
                    let d = den[at];
                    -g * n / (d * d)
                },
            });
        }
        (DerivedOp::Binary { op: OpKind::MatMul, lhs, rhs }, s) => {
            let (a, b) = (&nodes[lhs.index()], &nodes[rhs.index()]);
            let views = MatmulViews::new((lhs, &a.layout), (rhs, &b.layout), lp)?;
            if s == 0 {
                views.accumulate_lhs(target, gp, &b.data.widened());
            } else {
                views.accumulate_rhs(target, gp, &a.data.widened());
            }
        }
        (DerivedOp::Unary { op: OpKind::Sum, .. }, _) => {
            let g = offsets(lp).next().map_or(0.0, |o| gp[o]);
            apply_scalar(target, lt, ScalarOp::Add, g);
        }
        _ => {}
    }
    Ok(())
}

/// `target += sign * parent`, summed over the axes `target` was broadcast
/// along.
fn reduce_into(target: &mut [f32], lt: &Layout, parent: &[f32], lp: &Layout, sign: f32) {
    for_each_offset(lp, [lt], |po, [to]| target[to] += sign * parent[po]);
}

/// Accumulates `f(parent_grad, other_value, target_offset)` into the target,
/// reading the other operand in its own element type.
struct Against<'a, F> {
    parent: (&'a Layout, &'a [f32]),
    target: (&'a Layout, &'a mut [f32]),
    other: &'a Layout,
    f: F,
}

impl<F: Fn(f32, f32, usize) -> f32> BufferVisitor for Against<'_, F> {
    type Output = ();

    fn visit<T: Element>(self, data: &[T]) {
        let Self { parent: (lp, gp), target: (lt, g), other, f } = self;
        for_each_offset(lp, [lt, other], |po, [to, oo]| {
            g[to] += f(gp[po], data[oo].to_f32(), to);
        });
    }
}
