//! Gradient of the batched matrix product.
//!
//! For `C = A @ B`: `dA += dC @ Bᵀ` and `dB += Aᵀ @ dC`. Vector operands and
//! the result are read through rank-2 views; nothing about the stored
//! tensors changes, so every gradient keeps its tensor's own shape.

use crate::error::BackwardError;
use crate::layout::{Layout, MAX_RANK, Misfit};
use crate::ops::matmul::{as_matrix_lhs, as_matrix_rhs, batched_matmul_accumulate};
use crate::tensors::{OpKind, TensorId};

/// Matrix views of the two operands and the result.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatmulViews {
    pub lhs: Layout,
    pub rhs: Layout,
    pub result: Layout,
}

impl MatmulViews {
    /// Builds the views and checks that they describe a valid product.
    pub(crate) fn new(
        (lhs_id, lhs): (TensorId, &Layout),
        (rhs_id, rhs): (TensorId, &Layout),
        result: &Layout,
    ) -> Result<Self, BackwardError> {
        let (a, b) = (as_matrix_lhs(lhs), as_matrix_rhs(rhs));

        let result = match (lhs.rank(), rhs.rank()) {
            (1, 1) if result.rank() == 1 => result.unsqueezed(1),
            (1, _) | (_, 1) if result.rank() >= MAX_RANK => return Err(rank_mismatch(lhs_id, lhs, result)),
            (1, _) => result.unsqueezed(result.rank() - 1),
            (_, 1) => result.unsqueezed(result.rank()),
            _ => *result,
        };
        let views = Self { lhs: a, rhs: b, result };

        let (ra, rb, rc) = (a.rank(), b.rank(), result.rank());
        if rc < 2 {
            return Err(rank_mismatch(lhs_id, &a, &result));
        }
        if a.size(ra - 1) != b.size(rb - 2) || a.size(ra - 2) != result.size(rc - 2) {
            return Err(shape_mismatch(lhs_id, lhs, &result));
        }
        if b.size(rb - 1) != result.size(rc - 1) {
            return Err(shape_mismatch(rhs_id, rhs, &result));
        }

        let batch = result.batch_part();
        for (id, operand, view) in [(lhs_id, lhs, &a), (rhs_id, rhs, &b)] {
            match view.batch_part().fits_into(&batch) {
                Ok(()) => {}
                Err(Misfit::Rank) => return Err(rank_mismatch(id, view, &result)),
                Err(Misfit::Size) => return Err(shape_mismatch(id, operand, &result)),
            }
        }
        Ok(views)
    }

    /// `dA += dC @ Bᵀ`
    pub(crate) fn accumulate_lhs(&self, grad_lhs: &mut [f32], grad_result: &[f32], rhs: &[f32]) {
        batched_matmul_accumulate(
            &self.result.batch_part(),
            (&self.lhs, grad_lhs),
            (&self.result, grad_result),
            (&self.rhs.transposed(), rhs),
        );
    }

    /// `dB += Aᵀ @ dC`
    pub(crate) fn accumulate_rhs(&self, grad_rhs: &mut [f32], grad_result: &[f32], lhs: &[f32]) {
        batched_matmul_accumulate(
            &self.result.batch_part(),
            (&self.rhs, grad_rhs),
            (&self.lhs.transposed(), lhs),
            (&self.result, grad_result),
        );
    }
}

fn rank_mismatch(operand: TensorId, view: &Layout, result: &Layout) -> BackwardError {
    BackwardError::RankMismatch {
        op: OpKind::MatMul,
        operand,
        operand_rank: view.rank(),
        result_rank: result.rank(),
    }
}

fn shape_mismatch(operand: TensorId, layout: &Layout, result: &Layout) -> BackwardError {
    BackwardError::ShapeMismatch {
        op: OpKind::MatMul,
        operand,
        operand_shape: layout.shape().to_vec(),
        result_shape: result.shape().to_vec(),
    }
}
