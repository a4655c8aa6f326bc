//! Constant updates over a gradient buffer.
//!
//! Used to seed the root of a backward pass and to spread the scalar
//! gradient of a sum back over its operand.

use rayon::prelude::*;

use crate::iter::offsets;
use crate::layout::Layout;

/// Below this many elements the contiguous path stays on one thread.
const PAR_MIN_LEN: usize = 4096;

/// Update applied to every element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarOp {
    /// `g = c`
    Set,
    /// `g += c`
    Add,
    /// `g -= c`
    Sub,
    /// `g *= c`
    Mul,
    /// `g /= c`
    Div,
}

impl ScalarOp {
    #[inline]
    fn apply(self, g: &mut f32, c: f32) {
        match self {
            Self::Set => *g = c,
            Self::Add => *g += c,
            Self::Sub => *g -= c,
            Self::Mul => *g *= c,
            Self::Div => *g /= c,
        }
    }
}

/// Applies `op` with `value` to every element `layout` addresses in `grad`.
///
/// Dense layouts are updated in parallel. Strided layouts go through the
/// broadcast iterator, so an element reached through several stride-0
/// positions receives the update once per position.
///
/// # Panics
/// Panics if `layout` reaches past the end of `grad`.
pub fn apply_scalar(grad: &mut [f32], layout: &Layout, op: ScalarOp, value: f32) {
    if layout.is_contiguous() {
        let start = layout.offset();
        grad[start..start + layout.numel()]
            .par_iter_mut()
            .with_min_len(PAR_MIN_LEN)
            .for_each(|g| op.apply(g, value));
    } else {
        for o in offsets(layout) {
            op.apply(&mut grad[o], value);
        }
    }
}
