//! Batched matrix multiplication.
//!
//! All axes but the last two are batch axes and broadcast against each
//! other. A rank-1 left operand behaves as a single row and a rank-1 right
//! operand as a single column; the matching axis is dropped from the result
//! again, so `[k] @ [k, n]` is `[n]` and `[k] @ [k]` is `[1]`.

use crate::dtype::{Buffer, Element};
use crate::error::TensorError;
use crate::iter::BroadcastCursor;
use crate::layout::{Layout, broadcast_shapes};
use crate::tensors::{DerivedOp, Graph, OpKind, TensorId};

impl Graph {
    /// Matrix product `lhs @ rhs`.
    ///
    /// # Errors
    /// Returns [`TensorError::InnerMismatch`] if the contracted axes differ,
    /// [`TensorError::NotBroadcastable`] if the batch axes disagree, or
    /// [`TensorError::UnsupportedRank`] if the result would be too deep.
    pub fn matmul(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId, TensorError> {
        let (layout, data) = {
            let a = self.try_tensor(lhs)?;
            let b = self.try_tensor(rhs)?;
            let (la, lb) = (as_matrix_lhs(&a.layout), as_matrix_rhs(&b.layout));
            let (ra, rb) = (la.rank(), lb.rank());

            if la.size(ra - 1) != lb.size(rb - 2) {
                return Err(TensorError::InnerMismatch {
                    lhs: la.size(ra - 1),
                    rhs: lb.size(rb - 2),
                });
            }
            let (m, n) = (la.size(ra - 2), lb.size(rb - 1));
            let batch = broadcast_shapes(&la.shape()[..ra - 2], &lb.shape()[..rb - 2])?;

            let mut full = batch.clone();
            full.extend([m, n]);
            let promoted = Layout::contiguous(&full)?;

            let mut shape = batch;
            if a.layout.rank() > 1 {
                shape.push(m);
            }
            if b.layout.rank() > 1 {
                shape.push(n);
            }
            if shape.is_empty() {
                shape.push(1);
            }
            let out = Layout::contiguous(&shape)?;

            let driver = promoted.batch_part();
            let data = match (&a.data, &b.data) {
                (Buffer::I32(x), Buffer::I32(y)) => {
                    let mut acc = vec![0i32; promoted.numel()];
                    batched_matmul_accumulate(
                        &driver,
                        (&promoted, acc.as_mut_slice()),
                        (&la, x.as_slice()),
                        (&lb, y.as_slice()),
                    );
                    Buffer::I32(acc)
                }
                _ => {
                    let (x, y) = (a.data.widened(), b.data.widened());
                    let mut acc = vec![0f32; promoted.numel()];
                    batched_matmul_accumulate(&driver, (&promoted, acc.as_mut_slice()), (&la, &*x), (&lb, &*y));
                    Buffer::F32(acc)
                }
            };
            (out, data)
        };
        self.derive(layout, data, DerivedOp::Binary { op: OpKind::MatMul, lhs, rhs })
    }
}

/// `[k]` viewed as `[1, k]`; matrices pass through.
#[must_use]
pub fn as_matrix_lhs(layout: &Layout) -> Layout {
    if layout.rank() == 1 { layout.unsqueezed(0) } else { *layout }
}

/// `[k]` viewed as `[k, 1]`; matrices pass through.
#[must_use]
pub fn as_matrix_rhs(layout: &Layout) -> Layout {
    if layout.rank() == 1 { layout.unsqueezed(1) } else { *layout }
}

/// Adds `lhs @ rhs` into `out`, one matrix product per position of `batch`.
///
/// All three layouts are at least rank 2 and their batch axes broadcast into
/// `batch`. When an operand is broadcast along a batch axis that `out` also
/// lacks, several batch positions land on the same `out` matrix and their
/// products add up, which is how a broadcast operand's gradient gets reduced.
///
/// # Panics
/// Panics if a batch part does not broadcast into `batch`, or if an offset
/// falls outside its slice.
pub(crate) fn batched_matmul_accumulate<T: Element>(
    batch: &Layout,
    (lo, out): (&Layout, &mut [T]),
    (la, a): (&Layout, &[T]),
    (lb, b): (&Layout, &[T]),
) {
    let (ro, ra, rb) = (lo.rank(), la.rank(), lb.rank());
    let (m, n, k) = (lo.size(ro - 2), lo.size(ro - 1), la.size(ra - 1));
    let (os0, os1) = (lo.stride(ro - 2), lo.stride(ro - 1));
    let (as0, as1) = (la.stride(ra - 2), la.stride(ra - 1));
    let (bs0, bs1) = (lb.stride(rb - 2), lb.stride(rb - 1));

    let parts = [lo.batch_part(), la.batch_part(), lb.batch_part()];
    for (_, [ob, ab, bb]) in BroadcastCursor::new(batch, [&parts[0], &parts[1], &parts[2]]) {
        for i in 0..m {
            for j in 0..n {
                let mut dot = T::ZERO;
                for p in 0..k {
                    dot = dot.add(a[ab + i * as0 + p * as1].mul(b[bb + p * bs0 + j * bs1]));
                }
                let slot = &mut out[ob + i * os0 + j * os1];
                *slot = slot.add(dot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_by_three_times_three_by_two() {
        let mut g = Graph::new();
        let a = g.leaf(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], false).unwrap();
        let b = g.leaf(&[3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], false).unwrap();
        let c = g.matmul(a, b).unwrap();
        assert_eq!(g.tensor(c).shape(), &[2, 2]);
        assert_eq!(g.values(c), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn vector_operands_drop_their_axis() {
        let mut g = Graph::new();
        let v = g.leaf(&[2], vec![1.0, 2.0], false).unwrap();
        let m = g.leaf(&[2, 3], vec![1.0, 0.0, 2.0, 0.0, 1.0, 3.0], false).unwrap();
        let vm = g.matmul(v, m).unwrap();
        assert_eq!(g.tensor(vm).shape(), &[3]);
        assert_eq!(g.values(vm), vec![1.0, 2.0, 8.0]);

        let w = g.leaf(&[3], vec![1.0, 1.0, 1.0], false).unwrap();
        let mw = g.matmul(m, w).unwrap();
        assert_eq!(g.tensor(mw).shape(), &[2]);
        assert_eq!(g.values(mw), vec![3.0, 4.0]);

        let dot = g.matmul(v, v).unwrap();
        assert_eq!(g.tensor(dot).shape(), &[1]);
        assert_eq!(g.values(dot), vec![5.0]);
    }

    #[test]
    fn batch_axes_broadcast() {
        let mut g = Graph::new();
        let a = g.leaf(&[2, 1, 2], vec![1.0, 2.0, 3.0, 4.0], false).unwrap();
        let b = g.leaf(&[2, 1], vec![1.0, 10.0], false).unwrap();
        let c = g.matmul(a, b).unwrap();
        assert_eq!(g.tensor(c).shape(), &[2, 1, 1]);
        assert_eq!(g.values(c), vec![21.0, 43.0]);
    }

    #[test]
    fn transposed_views_are_read_through_strides() {
        let mut g = Graph::new();
        let a = g.leaf(&[2, 2], vec![1.0, 2.0, 3.0, 4.0], false).unwrap();
        let at = g.transpose(a).unwrap();
        let c = g.matmul(at, a).unwrap();
        assert_eq!(g.values(c), vec![10.0, 14.0, 14.0, 20.0]);
    }

    #[test]
    fn integer_matmul_stays_integer() {
        let mut g = Graph::new();
        let a = g.leaf_typed(&[1, 2], vec![2i32, 3], false).unwrap();
        let b = g.leaf_typed(&[2, 1], vec![4i32, 5], false).unwrap();
        let c = g.matmul(a, b).unwrap();
        assert_eq!(g.tensor(c).data(), &Buffer::I32(vec![23]));
    }

    #[test]
    fn inner_mismatch_is_rejected() {
        let mut g = Graph::new();
        let a = g.leaf(&[2, 3], vec![0.0; 6], false).unwrap();
        let b = g.leaf(&[2, 3], vec![0.0; 6], false).unwrap();
        assert!(matches!(g.matmul(a, b), Err(TensorError::InnerMismatch { .. })));
    }

    #[test]
    fn accumulation_adds_onto_existing_values() {
        let l = Layout::contiguous(&[1, 1]).unwrap();
        let mut out = vec![5.0f32];
        let batch = l.batch_part();
        batched_matmul_accumulate(&batch, (&l, out.as_mut_slice()), (&l, &[2.0f32][..]), (&l, &[3.0f32][..]));
        assert_eq!(out, vec![11.0]);
    }
}
