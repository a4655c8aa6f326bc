//! Strided layout descriptors.
//!
//! A [`Layout`] maps a logical index to an element offset: `offset +
//! sum(index[d] * stride[d])`. Sizes and strides are element counts. A stride
//! of 0 marks a broadcast axis, where every index along the axis lands on the
//! same element.
//!
//! Layouts are small `Copy` values backed by fixed arrays, so views
//! (transposes, inserted axes, broadcasts) are computed and discarded freely
//! without touching the tensor they describe.

use briny::prelude::{Validate, ValidationError};

use crate::error::TensorError;

/// Highest rank a layout can describe.
pub const MAX_RANK: usize = 8;

/// Rank, per-axis sizes and strides, and base offset of a tensor view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layout {
    rank: usize,
    sizes: [usize; MAX_RANK],
    strides: [usize; MAX_RANK],
    offset: usize,
}

/// How an operand layout fails to broadcast into a result layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misfit {
    /// Operand has more axes than the result.
    Rank,
    /// An aligned axis is neither equal nor 1.
    Size,
}

impl Layout {
    /// Row-major contiguous layout for `shape`, starting at offset 0.
    ///
    /// # Errors
    /// Returns [`TensorError::UnsupportedRank`] for an empty shape or one with
    /// more than [`MAX_RANK`] axes.
    pub fn contiguous(shape: &[usize]) -> Result<Self, TensorError> {
        let rank = check_rank(shape.len())?;
        let mut sizes = [0; MAX_RANK];
        let mut strides = [0; MAX_RANK];
        sizes[..rank].copy_from_slice(shape);

        let mut step = 1;
        for d in (0..rank).rev() {
            strides[d] = step;
            step *= shape[d].max(1);
        }

        Ok(Self {
            rank,
            sizes,
            strides,
            offset: 0,
        })
    }

    /// Layout from explicit sizes, strides and offset.
    ///
    /// # Errors
    /// Returns [`TensorError::UnsupportedRank`] for a bad rank, or
    /// [`TensorError::LengthMismatch`] when `strides` and `sizes` disagree in
    /// length.
    pub fn strided(sizes: &[usize], strides: &[usize], offset: usize) -> Result<Self, TensorError> {
        let rank = check_rank(sizes.len())?;
        if strides.len() != rank {
            return Err(TensorError::LengthMismatch {
                shape: sizes.to_vec(),
                expected: rank,
                actual: strides.len(),
            });
        }

        let mut out = Self {
            rank,
            sizes: [0; MAX_RANK],
            strides: [0; MAX_RANK],
            offset,
        };
        out.sizes[..rank].copy_from_slice(sizes);
        out.strides[..rank].copy_from_slice(strides);
        Ok(out)
    }

    /// Number of axes.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    /// Per-axis sizes.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.sizes[..self.rank]
    }

    /// Per-axis strides.
    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides[..self.rank]
    }

    /// Base offset.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Size of `axis`.
    #[must_use]
    pub fn size(&self, axis: usize) -> usize {
        self.shape()[axis]
    }

    /// Stride of `axis`.
    #[must_use]
    pub fn stride(&self, axis: usize) -> usize {
        self.strides()[axis]
    }

    /// Number of logical elements (the product of all sizes).
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Whether the view is dense, row-major and free of broadcast axes.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        let mut step = 1;
        for d in (0..self.rank).rev() {
            if self.sizes[d] != 1 && self.strides[d] != step {
                return false;
            }
            step *= self.sizes[d];
        }
        true
    }

    /// One past the highest element offset the view can touch, or 0 for an
    /// empty view. `None` on overflow.
    #[must_use]
    pub fn reach(&self) -> Option<usize> {
        if self.numel() == 0 {
            return Some(0);
        }
        self.shape()
            .iter()
            .zip(self.strides())
            .try_fold(self.offset, |acc, (&n, &s)| acc.checked_add((n - 1).checked_mul(s)?))?
            .checked_add(1)
    }

    /// View with the last two axes swapped. Rank-1 layouts are returned as-is.
    #[must_use]
    pub fn transposed(&self) -> Self {
        let mut out = *self;
        if self.rank >= 2 {
            out.sizes.swap(self.rank - 2, self.rank - 1);
            out.strides.swap(self.rank - 2, self.rank - 1);
        }
        out
    }

    /// View with every axis reversed.
    #[must_use]
    pub fn reversed(&self) -> Self {
        let mut out = *self;
        out.sizes[..self.rank].reverse();
        out.strides[..self.rank].reverse();
        out
    }

    /// View with a size-1 axis inserted before `axis` (`axis == rank`
    /// appends).
    ///
    /// # Panics
    /// Panics if the layout is already at [`MAX_RANK`] or `axis > rank`.
    #[must_use]
    pub fn unsqueezed(&self, axis: usize) -> Self {
        assert!(self.rank < MAX_RANK, "cannot insert an axis past rank {MAX_RANK}");
        assert!(axis <= self.rank, "axis {axis} out of range for rank {}", self.rank);

        let mut out = *self;
        out.sizes.copy_within(axis..self.rank, axis + 1);
        out.strides.copy_within(axis..self.rank, axis + 1);
        out.sizes[axis] = 1;
        out.strides[axis] = 0;
        out.rank += 1;
        out
    }

    /// The leading (batch) axes of a matrix layout, everything but the last
    /// two. A layout with no batch axes yields a single size-1 axis so it can
    /// still follow a broadcast iteration.
    #[must_use]
    pub fn batch_part(&self) -> Self {
        let batch = self.rank.saturating_sub(2);
        if batch == 0 {
            let mut out = *self;
            out.rank = 1;
            out.sizes = [0; MAX_RANK];
            out.strides = [0; MAX_RANK];
            out.sizes[0] = 1;
            return out;
        }

        let mut out = *self;
        out.rank = batch;
        out.sizes[batch..].fill(0);
        out.strides[batch..].fill(0);
        out
    }

    /// View of this layout expanded to `shape`, with stride 0 on every axis
    /// that is added in front or stretched from size 1.
    ///
    /// # Errors
    /// Returns [`TensorError::NotBroadcastable`] if the shapes disagree, or
    /// [`TensorError::UnsupportedRank`] for an invalid target rank.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Self, TensorError> {
        let rank = check_rank(shape.len())?;
        let incompatible = || TensorError::NotBroadcastable {
            lhs: self.shape().to_vec(),
            rhs: shape.to_vec(),
        };
        if self.rank > rank {
            return Err(incompatible());
        }

        let lead = rank - self.rank;
        let mut out = Self {
            rank,
            sizes: [0; MAX_RANK],
            strides: [0; MAX_RANK],
            offset: self.offset,
        };
        out.sizes[..rank].copy_from_slice(shape);
        for d in 0..self.rank {
            let (have, want) = (self.sizes[d], shape[lead + d]);
            if have == want {
                out.strides[lead + d] = self.strides[d];
            } else if have != 1 {
                return Err(incompatible());
            }
        }
        Ok(out)
    }

    /// Checks that this (operand) layout broadcasts into `result` under
    /// right-aligned rules.
    ///
    /// # Errors
    /// Returns which rule was broken.
    pub fn fits_into(&self, result: &Self) -> Result<(), Misfit> {
        if self.rank > result.rank {
            return Err(Misfit::Rank);
        }
        let lead = result.rank - self.rank;
        for d in 0..self.rank {
            let n = self.sizes[d];
            if n != 1 && n != result.sizes[lead + d] {
                return Err(Misfit::Size);
            }
        }
        Ok(())
    }
}

/// Right-aligned broadcast of two shapes.
///
/// # Errors
/// Returns [`TensorError::NotBroadcastable`] if an aligned pair is neither
/// equal nor contains a 1.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, TensorError> {
    let rank = lhs.len().max(rhs.len());
    let mut out = vec![1; rank];
    for (d, slot) in out.iter_mut().enumerate() {
        let l = (d + lhs.len()).checked_sub(rank).map_or(1, |i| lhs[i]);
        let r = (d + rhs.len()).checked_sub(rank).map_or(1, |i| rhs[i]);
        *slot = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(TensorError::NotBroadcastable {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                });
            }
        };
    }
    Ok(out)
}

fn check_rank(rank: usize) -> Result<usize, TensorError> {
    if rank == 0 || rank > MAX_RANK {
        Err(TensorError::UnsupportedRank(rank))
    } else {
        Ok(rank)
    }
}

/// A layout together with the length of the buffer it indexes.
///
/// Validates when every offset the layout can produce lies inside the
/// buffer, which is what lets the kernels index without further checks.
#[derive(Debug, Clone, Copy)]
pub struct Bounded {
    /// Layout under test.
    pub layout: Layout,
    /// Buffer length in elements.
    pub len: usize,
}

impl Validate for Bounded {
    fn validate(&self) -> Result<(), ValidationError> {
        match self.layout.reach() {
            Some(reach) if reach <= self.len => Ok(()),
            _ => Err(ValidationError),
        }
    }
}
