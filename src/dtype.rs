//! Element types and typed storage.
//!
//! Every numeric routine in the crate is generic over [`Element`], so the
//! `f32` and `i32` paths share one implementation. [`Buffer`] is the
//! type-erased owner the arena stores; [`Buffer::visit`] recovers the typed
//! slice for a single generic call.

use core::fmt::Debug;
use std::borrow::Cow;

/// Runtime tag for the element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit signed integer. Never carries gradients.
    I32,
    /// 32-bit float.
    F32,
}

impl DType {
    /// Whether tensors of this type may carry a gradient buffer.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32)
    }

    /// Type produced by a binary operation over `self` and `other`.
    #[must_use]
    pub const fn promote(self, other: Self) -> Self {
        match (self, other) {
            (Self::I32, Self::I32) => Self::I32,
            _ => Self::F32,
        }
    }
}

/// Numeric element that can live in a tensor buffer.
///
/// Integer arithmetic wraps; the engine never differentiates through it.
pub trait Element: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// Matching runtime tag.
    const DTYPE: DType;
    /// Additive identity.
    const ZERO: Self;
    /// Multiplicative identity.
    const ONE: Self;

    /// Widen (or convert) to `f32`.
    fn to_f32(self) -> f32;
    /// Convert from `f32`, truncating for integers.
    fn from_f32(x: f32) -> Self;
    /// Move a vector of this type into a [`Buffer`].
    fn wrap(data: Vec<Self>) -> Buffer;

    /// `self + rhs`.
    #[must_use]
    fn add(self, rhs: Self) -> Self;
    /// `self - rhs`.
    #[must_use]
    fn sub(self, rhs: Self) -> Self;
    /// `self * rhs`.
    #[must_use]
    fn mul(self, rhs: Self) -> Self;
    /// `-self`.
    #[must_use]
    fn neg(self) -> Self;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
    const ZERO: Self = 0.0;
    const ONE: Self = 1.0;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(x: f32) -> Self {
        x
    }

    fn wrap(data: Vec<Self>) -> Buffer {
        Buffer::F32(data)
    }

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self + rhs
    }

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self - rhs
    }

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        self * rhs
    }

    #[inline]
    fn neg(self) -> Self {
        -self
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
    const ZERO: Self = 0;
    const ONE: Self = 1;

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(x: f32) -> Self {
        x as Self
    }

    fn wrap(data: Vec<Self>) -> Buffer {
        Buffer::I32(data)
    }

    #[inline]
    fn add(self, rhs: Self) -> Self {
        self.wrapping_add(rhs)
    }

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        self.wrapping_sub(rhs)
    }

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        self.wrapping_mul(rhs)
    }

    #[inline]
    fn neg(self) -> Self {
        self.wrapping_neg()
    }
}

/// Generic computation over a typed slice.
///
/// Implemented by callers that need the concrete element type of a
/// [`Buffer`] without matching on it themselves.
pub trait BufferVisitor {
    /// Result of the visit.
    type Output;

    /// Called with the buffer's typed contents.
    fn visit<T: Element>(self, data: &[T]) -> Self::Output;
}

/// Owned, typed tensor storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    /// Integer storage.
    I32(Vec<i32>),
    /// Float storage.
    F32(Vec<f32>),
}

impl Buffer {
    /// Element type of the storage.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        match self {
            Self::I32(_) => DType::I32,
            Self::F32(_) => DType::F32,
        }
    }

    /// Number of stored elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::I32(v) => v.len(),
            Self::F32(v) => v.len(),
        }
    }

    /// Whether the storage holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch a generic visitor on the typed contents.
    pub fn visit<V: BufferVisitor>(&self, visitor: V) -> V::Output {
        match self {
            Self::I32(v) => visitor.visit(v),
            Self::F32(v) => visitor.visit(v),
        }
    }

    /// Float view of the storage, if it is `f32`.
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::F32(v) => Some(v),
            Self::I32(_) => None,
        }
    }

    /// The storage as `f32`, borrowed when it already is and widened
    /// otherwise.
    #[must_use]
    pub fn widened(&self) -> Cow<'_, [f32]> {
        match self {
            Self::F32(v) => Cow::Borrowed(v),
            Self::I32(v) => Cow::Owned(v.iter().map(|&x| x.to_f32()).collect()),
        }
    }

    /// Copy of the storage widened to `f32`.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.widened().into_owned()
    }
}

impl From<Vec<f32>> for Buffer {
    fn from(v: Vec<f32>) -> Self {
        Self::F32(v)
    }
}

impl From<Vec<i32>> for Buffer {
    fn from(v: Vec<i32>) -> Self {
        Self::I32(v)
    }
}
