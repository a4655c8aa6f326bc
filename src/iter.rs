//! Strided broadcast iteration.
//!
//! [`BroadcastCursor`] walks every element of a driving layout in row-major
//! order and, in lockstep, the matching element offset in up to `N` following
//! layouts. Followers are aligned to the driver from the trailing axis; an
//! axis a follower lacks, or holds with size 1, contributes nothing to that
//! follower's offset.
//!
//! The cursor is an odometer over fixed arrays. After each element the last
//! digit advances and every running offset grows by that axis' stride; when
//! a digit wraps, the offset it accumulated is subtracted back out and the
//! carry moves one axis to the left. No allocation happens at any point.

use crate::layout::{Layout, MAX_RANK};

/// Lockstep offsets over a driving layout and `N` broadcast followers.
///
/// Yields `(driver_offset, follower_offsets)`.
#[derive(Debug, Clone)]
pub struct BroadcastCursor<const N: usize> {
    rank: usize,
    sizes: [usize; MAX_RANK],
    digits: [usize; MAX_RANK],
    driver_strides: [usize; MAX_RANK],
    follower_strides: [[usize; MAX_RANK]; N],
    driver_offset: usize,
    offsets: [usize; N],
    remaining: usize,
}

impl<const N: usize> BroadcastCursor<N> {
    /// Start a walk over `driver`, tracking `followers`.
    ///
    /// # Panics
    /// Panics if a follower has more axes than the driver, or an aligned axis
    /// is neither 1 nor equal to the driver's.
    #[must_use]
    pub fn new(driver: &Layout, followers: [&Layout; N]) -> Self {
        let rank = driver.rank();
        let mut sizes = [0; MAX_RANK];
        let mut driver_strides = [0; MAX_RANK];
        sizes[..rank].copy_from_slice(driver.shape());
        driver_strides[..rank].copy_from_slice(driver.strides());

        let mut follower_strides = [[0; MAX_RANK]; N];
        let mut offsets = [0; N];
        for (f, follower) in followers.iter().enumerate() {
            assert!(
                follower.rank() <= rank,
                "follower rank {} exceeds driver rank {rank}",
                follower.rank()
            );
            let lead = rank - follower.rank();
            for d in 0..follower.rank() {
                let n = follower.size(d);
                assert!(
                    n == 1 || n == sizes[lead + d],
                    "follower shape {:?} does not broadcast to {:?}",
                    follower.shape(),
                    driver.shape()
                );
                // size-1 axes stay pinned at index 0
                if n != 1 {
                    follower_strides[f][lead + d] = follower.stride(d);
                }
            }
            offsets[f] = follower.offset();
        }

        Self {
            rank,
            sizes,
            digits: [0; MAX_RANK],
            driver_strides,
            follower_strides,
            driver_offset: driver.offset(),
            offsets,
            remaining: driver.numel(),
        }
    }

    fn advance(&mut self) {
        for d in (0..self.rank).rev() {
            self.digits[d] += 1;
            if self.digits[d] < self.sizes[d] {
                self.driver_offset += self.driver_strides[d];
                for (off, strides) in self.offsets.iter_mut().zip(&self.follower_strides) {
                    *off += strides[d];
                }
                return;
            }

            let spent = self.sizes[d] - 1;
            self.digits[d] = 0;
            self.driver_offset -= spent * self.driver_strides[d];
            for (off, strides) in self.offsets.iter_mut().zip(&self.follower_strides) {
                *off -= spent * strides[d];
            }
        }
    }
}

impl<const N: usize> Iterator for BroadcastCursor<N> {
    type Item = (usize, [usize; N]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = (self.driver_offset, self.offsets);
        self.remaining -= 1;
        if self.remaining > 0 {
            self.advance();
        }
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<const N: usize> ExactSizeIterator for BroadcastCursor<N> {}

/// Offsets of every element of `layout` in row-major order.
#[must_use]
pub fn offsets(layout: &Layout) -> impl ExactSizeIterator<Item = usize> {
    BroadcastCursor::<0>::new(layout, []).map(|(off, _)| off)
}

/// Callback form of [`BroadcastCursor`]: calls `f` with the driver offset
/// and the follower offsets of every element of `driver`.
///
/// # Panics
/// Same conditions as [`BroadcastCursor::new`].
pub fn for_each_offset<const N: usize>(
    driver: &Layout,
    followers: [&Layout; N],
    mut f: impl FnMut(usize, [usize; N]),
) {
    for (off, rest) in BroadcastCursor::new(driver, followers) {
        f(off, rest);
    }
}
