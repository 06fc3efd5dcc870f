//! Tensor shapes for the TGC graph compiler.
//!
//! A [`Shape`] is the type of a tensor value: an element type ([`DType`]),
//! a list of extents (`lens`), and a list of strides measured in
//! *elements*. Strides are what make the layout predicates interesting:
//!
//! - **standard**: strides are exactly the row-major strides of `lens`
//! - **packed**: the data occupies `elements()` contiguous elements
//! - **broadcasted**: at least one stride is zero
//! - **transposed**: packed but not standard
//!
//! Nearly every pass in the compiler dispatches on these predicates, so
//! they are defined here once and tested exhaustively.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Extents or strides of a shape. Rank 4 covers the common NCHW case
/// without spilling to the heap.
pub type Dims = SmallVec<[usize; 4]>;

/// Tensor element types.
///
/// Each dtype has a known storage width; `f16` is carried as a storage
/// width only, the core never does arithmetic on half floats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 8-bit signed integer.
    Int8,
    /// 8-bit unsigned integer.
    UInt8,
    /// 16-bit signed integer.
    Int16,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 16-bit floating point (storage only).
    Float16,
    /// 32-bit floating point.
    Float32,
    /// 64-bit floating point.
    Float64,
}

impl DType {
    /// Size in bytes of one element.
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::Float16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }

    /// Stable lowercase name, used by the debug printer.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int8 => "i8",
            Self::UInt8 => "u8",
            Self::Int16 => "i16",
            Self::Int32 => "i32",
            Self::Int64 => "i64",
            Self::Float16 => "f16",
            Self::Float32 => "f32",
            Self::Float64 => "f64",
        }
    }

    /// True for the floating-point dtypes.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float16 | Self::Float32 | Self::Float64)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors from shape construction and indexing.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ShapeError {
    /// `lens` and `strides` had different ranks.
    #[error("rank mismatch: {lens} lens vs {strides} strides")]
    RankMismatch {
        /// Number of extents given.
        lens: usize,
        /// Number of strides given.
        strides: usize,
    },

    /// A multi-index had the wrong rank for this shape.
    #[error("index rank {got} does not match shape rank {rank}")]
    IndexRank {
        /// Rank of the supplied index.
        got: usize,
        /// Rank of the shape.
        rank: usize,
    },
}

/// The type of a tensor value: element type, extents, strides.
///
/// Strides are in elements, not bytes. A freshly constructed shape is
/// standard (row-major); views produced by transpose, slice, or broadcast
/// carry non-standard strides.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dtype: DType,
    lens: Dims,
    strides: Dims,
}

impl Shape {
    /// A standard (row-major) shape.
    #[must_use]
    pub fn new(dtype: DType, lens: impl IntoIterator<Item = usize>) -> Self {
        let lens: Dims = lens.into_iter().collect();
        let strides = row_major_strides(&lens);
        Self {
            dtype,
            lens,
            strides,
        }
    }

    /// A shape with explicit strides.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeError::RankMismatch`] if the ranks differ.
    pub fn with_strides(
        dtype: DType,
        lens: impl IntoIterator<Item = usize>,
        strides: impl IntoIterator<Item = usize>,
    ) -> Result<Self, ShapeError> {
        let lens: Dims = lens.into_iter().collect();
        let strides: Dims = strides.into_iter().collect();
        if lens.len() != strides.len() {
            return Err(ShapeError::RankMismatch {
                lens: lens.len(),
                strides: strides.len(),
            });
        }
        Ok(Self {
            dtype,
            lens,
            strides,
        })
    }

    /// A rank-1 scalar shape `[1]`.
    #[must_use]
    pub fn scalar_shape(dtype: DType) -> Self {
        Self::new(dtype, [1])
    }

    /// The rank-0 empty shape, used by operators that produce no value.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(DType::Float32, [])
    }

    /// True for the rank-0 empty shape.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lens.is_empty()
    }

    /// The element type.
    #[must_use]
    pub const fn dtype(&self) -> DType {
        self.dtype
    }

    /// The extents.
    #[must_use]
    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    /// The strides, in elements.
    #[must_use]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.lens.len()
    }

    /// Logical number of elements: the product of `lens`.
    ///
    /// The rank-0 empty shape has no elements.
    #[must_use]
    pub fn elements(&self) -> usize {
        if self.lens.is_empty() {
            return 0;
        }
        self.lens.iter().product()
    }

    /// Logical size in bytes.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.elements() * self.dtype.size_bytes()
    }

    /// Number of elements the strided data actually spans.
    ///
    /// For a standard shape this equals `elements()`; broadcast strides
    /// shrink it, gaps from slicing grow it past the packed size.
    #[must_use]
    pub fn element_space(&self) -> usize {
        if self.lens.is_empty() || self.elements() == 0 {
            return 0;
        }
        1 + self
            .lens
            .iter()
            .zip(&self.strides)
            .map(|(&l, &s)| (l - 1) * s)
            .sum::<usize>()
    }

    /// True if every extent is 1.
    #[must_use]
    pub fn scalar(&self) -> bool {
        self.lens.iter().all(|&l| l == 1)
    }

    /// True if the strides are exactly the row-major strides of `lens`,
    /// no extent is zero, and nothing is broadcast.
    #[must_use]
    pub fn standard(&self) -> bool {
        !self.lens.is_empty()
            && self.lens.iter().all(|&l| l > 0)
            && self.strides == row_major_strides(&self.lens)
    }

    /// True if the data occupies exactly `elements()` contiguous elements.
    #[must_use]
    pub fn packed(&self) -> bool {
        !self.lens.is_empty() && self.element_space() == self.elements()
    }

    /// True if any stride is zero.
    #[must_use]
    pub fn broadcasted(&self) -> bool {
        self.strides.iter().any(|&s| s == 0)
    }

    /// True if packed but not standard: a permuted view of packed data.
    #[must_use]
    pub fn transposed(&self) -> bool {
        self.packed() && !self.standard()
    }

    /// Linear element offset of a multi-index, through the strides.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeError::IndexRank`] if the index rank is wrong.
    /// Out-of-range components are debug-asserted.
    pub fn index(&self, multi: &[usize]) -> Result<usize, ShapeError> {
        if multi.len() != self.rank() {
            return Err(ShapeError::IndexRank {
                got: multi.len(),
                rank: self.rank(),
            });
        }
        debug_assert!(
            multi.iter().zip(&self.lens).all(|(&m, &l)| m < l),
            "multi-index {multi:?} out of range for lens {:?}",
            self.lens
        );
        Ok(multi
            .iter()
            .zip(&self.strides)
            .map(|(&m, &s)| m * s)
            .sum())
    }

    /// The multi-index of the `i`-th element in logical row-major order.
    ///
    /// Inverse of [`Shape::index`] only for standard shapes; for
    /// non-standard shapes this walks the logical order while `index`
    /// dereferences through the strides.
    #[must_use]
    pub fn multi(&self, mut i: usize) -> Dims {
        let mut out: Dims = SmallVec::with_capacity(self.rank());
        out.resize(self.rank(), 0);
        for (d, &l) in self.lens.iter().enumerate().rev() {
            if l > 0 {
                out[d] = i % l;
                i /= l;
            }
        }
        out
    }

    /// The shape with the same lens in standard layout.
    #[must_use]
    pub fn as_standard(&self) -> Self {
        Self::new(self.dtype, self.lens.iter().copied())
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.lens.as_slice())?;
        if !self.standard() {
            write!(f, "/{:?}", self.strides.as_slice())?;
        }
        Ok(())
    }
}

/// Row-major strides for the given extents.
#[must_use]
pub fn row_major_strides(lens: &[usize]) -> Dims {
    let mut strides: Dims = SmallVec::with_capacity(lens.len());
    strides.resize(lens.len(), 0);
    let mut acc = 1;
    for (d, &l) in lens.iter().enumerate().rev() {
        strides[d] = acc;
        acc *= l;
    }
    strides
}

/// The permutation that sorts strides descending: the order in which a
/// transposed view's axes were laid out originally.
#[must_use]
pub fn find_permutation(shape: &Shape) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..shape.rank()).collect();
    perm.sort_by(|&a, &b| shape.strides()[b].cmp(&shape.strides()[a]));
    perm
}

/// Inverts a permutation.
#[must_use]
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}
