//! Owned tensor buffers and immutable literal values.
//!
//! An [`Argument`] is a shape plus the bytes backing it; it is what
//! operator `compute` implementations exchange. A [`Literal`] is an
//! immutable argument created during graph construction; two literals are
//! equal iff their shapes match and their bytes match on the canonical
//! layout.

use tgc_shape::{DType, Shape};

/// Marker for element types that can back a literal.
pub trait Scalar: Copy {
    /// The dtype this Rust type stores.
    const DTYPE: DType;
    /// Little-endian bytes of one element.
    fn to_bytes(self, out: &mut Vec<u8>);
}

macro_rules! impl_scalar {
    ($t:ty, $d:expr) => {
        impl Scalar for $t {
            const DTYPE: DType = $d;
            fn to_bytes(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

impl_scalar!(i8, DType::Int8);
impl_scalar!(u8, DType::UInt8);
impl_scalar!(i16, DType::Int16);
impl_scalar!(i32, DType::Int32);
impl_scalar!(i64, DType::Int64);
impl_scalar!(f32, DType::Float32);
impl_scalar!(f64, DType::Float64);

/// A tensor value: a shape and the bytes it reads through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Argument {
    /// The value's shape. Strides index into `data` elementwise, starting
    /// at `offset`.
    pub shape: Shape,
    /// Byte offset of the first element within `data`. View operators
    /// (slice) advance it instead of copying.
    pub offset: usize,
    /// Backing bytes, covering the shape's element space past `offset`.
    pub data: Vec<u8>,
}

impl Argument {
    /// A zero-filled argument of the given shape.
    #[must_use]
    pub fn zeroed(shape: Shape) -> Self {
        let bytes = shape.element_space() * shape.dtype().size_bytes();
        Self {
            shape,
            offset: 0,
            data: vec![0; bytes],
        }
    }

    /// Reinterpret the same bytes under a different shape.
    ///
    /// Used by view operators (transpose, slice) whose output reads the
    /// input's buffer through different strides.
    #[must_use]
    pub fn with_shape(&self, shape: Shape) -> Self {
        Self {
            shape,
            offset: self.offset,
            data: self.data.clone(),
        }
    }

    /// Copy the logical elements into a fresh standard-layout argument.
    #[must_use]
    pub fn make_contiguous(&self) -> Self {
        let out_shape = self.shape.as_standard();
        let esize = self.shape.dtype().size_bytes();
        let mut data = Vec::with_capacity(out_shape.elements() * esize);
        for i in 0..self.shape.elements() {
            let multi = self.shape.multi(i);
            // multi is always the right rank here
            let src = self.offset + self.shape.index(&multi).unwrap_or(0) * esize;
            data.extend_from_slice(&self.data[src..src + esize]);
        }
        Self {
            shape: out_shape,
            offset: 0,
            data,
        }
    }
}

/// An immutable constant tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Literal {
    shape: Shape,
    bytes: Vec<u8>,
}

impl Literal {
    /// A literal from raw bytes. The bytes are the canonical layout of
    /// `shape`'s element space.
    #[must_use]
    pub fn from_bytes(shape: Shape, bytes: Vec<u8>) -> Self {
        Self { shape, bytes }
    }

    /// A literal from typed elements in standard layout.
    ///
    /// The element count must equal the shape's element count; a short or
    /// long slice is a caller bug and is debug-asserted.
    #[must_use]
    pub fn from_slice<T: Scalar>(shape: Shape, values: &[T]) -> Self {
        debug_assert_eq!(shape.dtype(), T::DTYPE);
        debug_assert_eq!(shape.elements(), values.len());
        let mut bytes = Vec::with_capacity(values.len() * T::DTYPE.size_bytes());
        for &v in values {
            v.to_bytes(&mut bytes);
        }
        Self { shape, bytes }
    }

    /// A generated literal filled with 0, 1, 2, and so on; a handy test
    /// fixture.
    #[must_use]
    pub fn sequence(shape: Shape) -> Self {
        let esize = shape.dtype().size_bytes();
        let mut bytes = Vec::with_capacity(shape.elements() * esize);
        for i in 0..shape.elements() {
            match shape.dtype() {
                DType::Float32 => (i as f32).to_bytes(&mut bytes),
                DType::Float64 => (i as f64).to_bytes(&mut bytes),
                DType::Int8 => (i as i8).to_bytes(&mut bytes),
                DType::UInt8 => (i as u8).to_bytes(&mut bytes),
                DType::Int16 => (i as i16).to_bytes(&mut bytes),
                DType::Int32 => (i as i32).to_bytes(&mut bytes),
                DType::Int64 => (i as i64).to_bytes(&mut bytes),
                DType::Float16 => bytes.extend_from_slice(&(i as u16).to_le_bytes()),
            }
        }
        Self { shape, bytes }
    }

    /// The literal's shape.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// The canonical-layout bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The literal as an argument.
    #[must_use]
    pub fn argument(&self) -> Argument {
        Argument {
            shape: self.shape.clone(),
            offset: 0,
            data: self.bytes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_equality_is_bytewise() {
        let s = Shape::new(DType::Float32, [2, 2]);
        let a = Literal::from_slice(s.clone(), &[1.0f32, 2.0, 3.0, 4.0]);
        let b = Literal::from_slice(s.clone(), &[1.0f32, 2.0, 3.0, 4.0]);
        let c = Literal::from_slice(s, &[1.0f32, 2.0, 3.0, 5.0]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn sequence_fills_in_order() {
        let l = Literal::sequence(Shape::new(DType::Int32, [3]));
        assert_eq!(l.bytes().len(), 12);
        assert_eq!(&l.bytes()[4..8], &1i32.to_le_bytes());
    }

    #[test]
    fn contiguous_gathers_through_strides() {
        // a transposed view of [[0,1],[2,3]] reads [[0,2],[1,3]]
        let std = Shape::new(DType::Int32, [2, 2]);
        let arg = Literal::from_slice(std, &[0i32, 1, 2, 3]).argument();
        let t = Shape::with_strides(DType::Int32, [2, 2], [1, 2]).unwrap();
        let packed = arg.with_shape(t).make_contiguous();
        assert!(packed.shape.standard());
        let vals: Vec<i32> = packed
            .data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(vals, vec![0, 2, 1, 3]);
    }
}
