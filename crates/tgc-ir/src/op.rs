//! Operators: polymorphic descriptions of operations, independent of any
//! program position.
//!
//! [`Op`] is a closed sum over the known operators, plus
//! [`Op::Extension`] holding a trait object for target-specific variants.
//! Equality and printing both go through the same reflection tuple
//! ([`Op::attributes`]), so an extension operator compares and prints by
//! exactly the same rule as a built-in: name first, then fields.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use tgc_shape::Shape;

use crate::error::Error;
use crate::literal::Argument;
use crate::pass::Context;

/// A reflected operator field value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// An integer field.
    Int(i64),
    /// An integer-list field (permutations, axes, dims).
    Ints(Vec<i64>),
    /// A string field.
    Str(String),
    /// A shape-valued field.
    Shape(Shape),
}

impl std::fmt::Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Ints(v) => write!(f, "{v:?}"),
            Self::Str(v) => write!(f, "{v}"),
            Self::Shape(v) => write!(f, "{v}"),
        }
    }
}

/// The reflection tuple: ordered `(field, value)` pairs.
pub type Attrs = Vec<(&'static str, AttrValue)>;

/// A target-specific operator, registered by name.
///
/// Implementations get equality and printing for free through
/// [`ExtendedOp::attributes`]; `compute` defaults to not-computable so
/// placeholder operators can exist before lowering.
pub trait ExtendedOp: std::fmt::Debug + Send + Sync {
    /// Stable operator name.
    fn name(&self) -> &str;

    /// Reflected fields for equality and printing.
    fn attributes(&self) -> Attrs {
        Vec::new()
    }

    /// Output shape from input shapes.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when the inputs violate the operator's
    /// preconditions.
    fn compute_shape(&self, inputs: &[Shape]) -> Result<Shape, Error>;

    /// Execute the operator.
    ///
    /// # Errors
    ///
    /// Defaults to [`Error::NotComputable`]: placeholder operators used
    /// before lowering cannot run.
    fn compute(
        &self,
        _ctx: &Context,
        _output: &Shape,
        _args: &[Argument],
    ) -> Result<Argument, Error> {
        Err(Error::NotComputable {
            op: self.name().to_string(),
        })
    }

    /// Which input buffer the output writes into, if any.
    fn output_alias(&self, _inputs: &[Shape]) -> Option<usize> {
        None
    }

    /// Hook run by the pipeline after all passes, before execution.
    fn finalize(&self, _ctx: &mut Context) {}

    /// Downcast support for [`Op::as_extension`].
    fn as_any(&self) -> &dyn Any;
}

/// An operator value.
#[derive(Clone, Debug)]
pub enum Op {
    /// Program input, bound by name at evaluation time.
    Parameter {
        /// The parameter name.
        name: String,
    },
    /// Immutable constant; the payload lives on the instruction.
    Literal,
    /// Shape-only placeholder for a constant whose data is not yet bound.
    Outline {
        /// The declared shape.
        shape: Shape,
    },
    /// Permute dimensions; a strided view.
    Transpose {
        /// The permutation applied to the input's axes.
        perm: Vec<usize>,
    },
    /// Copy into standard (row-major) layout.
    Contiguous,
    /// Reinterpret packed data under new extents.
    Reshape {
        /// Target extents; one entry may be -1 to be inferred.
        dims: Vec<i64>,
    },
    /// Drop size-1 axes.
    Squeeze {
        /// Axes to drop; empty means all size-1 axes.
        axes: Vec<usize>,
    },
    /// Insert size-1 axes.
    Unsqueeze {
        /// Axes at which to insert.
        axes: Vec<usize>,
    },
    /// Sub-view along the given axes; a strided view.
    Slice {
        /// Axes being restricted.
        axes: Vec<usize>,
        /// Inclusive start per axis.
        starts: Vec<usize>,
        /// Exclusive end per axis.
        ends: Vec<usize>,
    },
    /// Concatenate along an axis.
    Concat {
        /// The concatenation axis.
        axis: usize,
    },
    /// Matrix product over the trailing two dimensions.
    Dot,
    /// The identity function.
    Identity,
    /// Elementwise sine; keeps a packed input's layout, re-standardizes
    /// anything else.
    Sin,
    /// Broadcasting elementwise addition.
    Add,
    /// Sum-reduce the given axes to extent 1.
    ReduceSum {
        /// Axes to reduce.
        axes: Vec<usize>,
    },
    /// Request for a transient buffer, erased by the memory passes.
    Allocate {
        /// The buffer's shape when no outline input is given.
        shape: Shape,
    },
    /// Typed view at a byte offset into the single input's buffer.
    Load {
        /// Byte offset into the input.
        offset: usize,
        /// The view's shape.
        shape: Shape,
    },
    /// Does nothing; produces the empty shape.
    Nop,
    /// Device-stream switch marker.
    SetStream {
        /// The stream being switched to.
        stream: u32,
    },
    /// A target-specific operator.
    Extension(Arc<dyn ExtendedOp>),
}

impl Op {
    /// Wrap a target-specific operator.
    #[must_use]
    pub fn extension(op: impl ExtendedOp + 'static) -> Self {
        Self::Extension(Arc::new(op))
    }

    /// Stable operator name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Parameter { .. } => "@param",
            Self::Literal => "@literal",
            Self::Outline { .. } => "@outline",
            Self::Transpose { .. } => "transpose",
            Self::Contiguous => "contiguous",
            Self::Reshape { .. } => "reshape",
            Self::Squeeze { .. } => "squeeze",
            Self::Unsqueeze { .. } => "unsqueeze",
            Self::Slice { .. } => "slice",
            Self::Concat { .. } => "concat",
            Self::Dot => "dot",
            Self::Identity => "identity",
            Self::Sin => "sin",
            Self::Add => "add",
            Self::ReduceSum { .. } => "reduce_sum",
            Self::Allocate { .. } => "allocate",
            Self::Load { .. } => "load",
            Self::Nop => "nop",
            Self::SetStream { .. } => "set_stream",
            Self::Extension(op) => op.name(),
        }
    }

    /// The reflection tuple used for equality and printing.
    #[must_use]
    pub fn attributes(&self) -> Attrs {
        fn ints(v: &[usize]) -> AttrValue {
            AttrValue::Ints(v.iter().map(|&x| x as i64).collect())
        }
        match self {
            Self::Parameter { name } => vec![("name", AttrValue::Str(name.clone()))],
            Self::Outline { shape } => vec![("shape", AttrValue::Shape(shape.clone()))],
            Self::Transpose { perm } => vec![("perm", ints(perm))],
            Self::Reshape { dims } => vec![("dims", AttrValue::Ints(dims.clone()))],
            Self::Squeeze { axes } | Self::Unsqueeze { axes } | Self::ReduceSum { axes } => {
                vec![("axes", ints(axes))]
            }
            Self::Slice { axes, starts, ends } => vec![
                ("axes", ints(axes)),
                ("starts", ints(starts)),
                ("ends", ints(ends)),
            ],
            Self::Concat { axis } => vec![("axis", AttrValue::Int(*axis as i64))],
            Self::Allocate { shape } => vec![("shape", AttrValue::Shape(shape.clone()))],
            Self::Load { offset, shape } => vec![
                ("offset", AttrValue::Int(*offset as i64)),
                ("shape", AttrValue::Shape(shape.clone())),
            ],
            Self::SetStream { stream } => vec![("stream", AttrValue::Int(i64::from(*stream)))],
            Self::Extension(op) => op.attributes(),
            _ => Vec::new(),
        }
    }

    /// True for operators added through dedicated program methods whose
    /// shape is fixed at construction rather than computed from inputs.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Parameter { .. } | Self::Literal)
    }

    /// Output shape from input shapes.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when inputs violate the operator's
    /// preconditions.
    pub fn compute_shape(&self, inputs: &[Shape]) -> Result<Shape, Error> {
        match self {
            Self::Parameter { .. } | Self::Literal => Err(Error::InternalInvariant(format!(
                "{} carries its shape; compute_shape must not be called",
                self.name()
            ))),
            Self::Outline { shape } => {
                expect_inputs(self.name(), inputs, 0)?;
                Ok(shape.clone())
            }
            Self::Transpose { perm } => {
                expect_inputs(self.name(), inputs, 1)?;
                let s = &inputs[0];
                if perm.len() != s.rank() || !is_permutation(perm) {
                    return Err(Error::shape_mismatch(
                        self.name(),
                        format!("invalid permutation {perm:?} for rank {}", s.rank()),
                    ));
                }
                let lens: Vec<usize> = perm.iter().map(|&p| s.lens()[p]).collect();
                let strides: Vec<usize> = perm.iter().map(|&p| s.strides()[p]).collect();
                Ok(Shape::with_strides(s.dtype(), lens, strides)?)
            }
            Self::Contiguous => {
                expect_inputs(self.name(), inputs, 1)?;
                Ok(inputs[0].as_standard())
            }
            Self::Reshape { dims } => {
                expect_inputs(self.name(), inputs, 1)?;
                let s = &inputs[0];
                if !s.packed() {
                    return Err(Error::shape_mismatch(self.name(), "input is not packed"));
                }
                let lens = infer_reshape(self.name(), s.elements(), dims)?;
                Ok(Shape::new(s.dtype(), lens))
            }
            Self::Squeeze { axes } => {
                expect_inputs(self.name(), inputs, 1)?;
                let s = &inputs[0];
                if !s.packed() {
                    return Err(Error::shape_mismatch(self.name(), "input is not packed"));
                }
                for &a in axes {
                    if a >= s.rank() || s.lens()[a] != 1 {
                        return Err(Error::shape_mismatch(
                            self.name(),
                            format!("axis {a} is not a unit axis"),
                        ));
                    }
                }
                let lens: Vec<usize> = s
                    .lens()
                    .iter()
                    .enumerate()
                    .filter(|(i, &l)| {
                        if axes.is_empty() {
                            l != 1
                        } else {
                            !axes.contains(i)
                        }
                    })
                    .map(|(_, &l)| l)
                    .collect();
                if lens.is_empty() {
                    return Ok(Shape::scalar_shape(s.dtype()));
                }
                Ok(Shape::new(s.dtype(), lens))
            }
            Self::Unsqueeze { axes } => {
                expect_inputs(self.name(), inputs, 1)?;
                let s = &inputs[0];
                if !s.packed() {
                    return Err(Error::shape_mismatch(self.name(), "input is not packed"));
                }
                let out_rank = s.rank() + axes.len();
                let mut lens = Vec::with_capacity(out_rank);
                let mut src = s.lens().iter();
                for i in 0..out_rank {
                    if axes.contains(&i) {
                        lens.push(1);
                    } else {
                        lens.push(*src.next().ok_or_else(|| {
                            Error::shape_mismatch(self.name(), format!("axis {i} out of range"))
                        })?);
                    }
                }
                Ok(Shape::new(s.dtype(), lens))
            }
            Self::Slice { axes, starts, ends } => {
                expect_inputs(self.name(), inputs, 1)?;
                let s = &inputs[0];
                if axes.len() != starts.len() || axes.len() != ends.len() {
                    return Err(Error::shape_mismatch(
                        self.name(),
                        "axes, starts, and ends must have equal length",
                    ));
                }
                let mut lens: Vec<usize> = s.lens().to_vec();
                for ((&a, &st), &en) in axes.iter().zip(starts).zip(ends) {
                    if a >= s.rank() || st > en || en > s.lens()[a] {
                        return Err(Error::shape_mismatch(
                            self.name(),
                            format!("range {st}..{en} out of bounds on axis {a}"),
                        ));
                    }
                    lens[a] = en - st;
                }
                Ok(Shape::with_strides(
                    s.dtype(),
                    lens,
                    s.strides().iter().copied(),
                )?)
            }
            Self::Concat { axis } => {
                if inputs.is_empty() {
                    return Err(Error::shape_mismatch(self.name(), "no inputs"));
                }
                let first = &inputs[0];
                if *axis >= first.rank() {
                    return Err(Error::shape_mismatch(
                        self.name(),
                        format!("axis {axis} out of range for rank {}", first.rank()),
                    ));
                }
                let mut lens: Vec<usize> = first.lens().to_vec();
                for s in &inputs[1..] {
                    if s.dtype() != first.dtype() || s.rank() != first.rank() {
                        return Err(Error::shape_mismatch(self.name(), "mismatched inputs"));
                    }
                    for (d, (&l, &f)) in s.lens().iter().zip(first.lens()).enumerate() {
                        if d == *axis {
                            lens[*axis] += l;
                        } else if l != f {
                            return Err(Error::shape_mismatch(
                                self.name(),
                                format!("extent mismatch on axis {d}"),
                            ));
                        }
                    }
                }
                Ok(Shape::new(first.dtype(), lens))
            }
            Self::Dot => {
                expect_inputs(self.name(), inputs, 2)?;
                let (a, b) = (&inputs[0], &inputs[1]);
                if a.dtype() != b.dtype() || a.rank() < 2 || a.rank() != b.rank() {
                    return Err(Error::shape_mismatch(self.name(), "mismatched operands"));
                }
                let r = a.rank();
                if a.lens()[..r - 2] != b.lens()[..r - 2] || a.lens()[r - 1] != b.lens()[r - 2] {
                    return Err(Error::shape_mismatch(
                        self.name(),
                        format!("cannot contract {:?} with {:?}", a.lens(), b.lens()),
                    ));
                }
                let mut lens: Vec<usize> = a.lens()[..r - 1].to_vec();
                lens.push(b.lens()[r - 1]);
                Ok(Shape::new(a.dtype(), lens))
            }
            Self::Identity => {
                expect_inputs(self.name(), inputs, 1)?;
                Ok(inputs[0].clone())
            }
            Self::Sin => {
                expect_inputs(self.name(), inputs, 1)?;
                let s = &inputs[0];
                if !s.dtype().is_float() {
                    return Err(Error::shape_mismatch(self.name(), "requires a float input"));
                }
                // a packed operand keeps its layout; gaps are squeezed out
                // into a fresh standard shape
                if s.packed() {
                    Ok(s.clone())
                } else {
                    Ok(s.as_standard())
                }
            }
            Self::Add => {
                expect_inputs(self.name(), inputs, 2)?;
                let (a, b) = (&inputs[0], &inputs[1]);
                if a.dtype() != b.dtype() {
                    return Err(Error::shape_mismatch(self.name(), "operand dtypes differ"));
                }
                let lens = broadcast_lens(self.name(), a.lens(), b.lens())?;
                if a == b && a.packed() {
                    return Ok(a.clone());
                }
                Ok(Shape::new(a.dtype(), lens))
            }
            Self::ReduceSum { axes } => {
                expect_inputs(self.name(), inputs, 1)?;
                let s = &inputs[0];
                let mut lens: Vec<usize> = s.lens().to_vec();
                for &a in axes {
                    if a >= s.rank() {
                        return Err(Error::shape_mismatch(
                            self.name(),
                            format!("axis {a} out of range"),
                        ));
                    }
                    lens[a] = 1;
                }
                Ok(Shape::new(s.dtype(), lens))
            }
            Self::Allocate { shape } => {
                if inputs.len() > 1 {
                    return Err(Error::shape_mismatch(self.name(), "at most one input"));
                }
                Ok(inputs.first().cloned().unwrap_or_else(|| shape.clone()))
            }
            Self::Load { offset, shape } => {
                expect_inputs(self.name(), inputs, 1)?;
                if offset + shape.bytes() > inputs[0].bytes() {
                    return Err(Error::shape_mismatch(
                        self.name(),
                        format!(
                            "view [{offset}, {}) exceeds buffer of {} bytes",
                            offset + shape.bytes(),
                            inputs[0].bytes()
                        ),
                    ));
                }
                Ok(shape.clone())
            }
            Self::Nop => Ok(Shape::empty()),
            Self::SetStream { .. } => {
                if inputs.len() > 1 {
                    return Err(Error::shape_mismatch(self.name(), "at most one input"));
                }
                Ok(inputs.first().cloned().unwrap_or_else(Shape::empty))
            }
            Self::Extension(op) => op.compute_shape(inputs),
        }
    }

    /// Execute the operator.
    ///
    /// Only the view and copy operators are computable in the core; the
    /// rest are placeholders for lowering and fail with
    /// [`Error::NotComputable`].
    ///
    /// # Errors
    ///
    /// [`Error::NotComputable`] for placeholder operators.
    pub fn compute(
        &self,
        ctx: &Context,
        output: &Shape,
        args: &[Argument],
    ) -> Result<Argument, Error> {
        match self {
            Self::Identity => Ok(args[0].clone()),
            Self::Transpose { .. } | Self::Reshape { .. } | Self::Squeeze { .. }
            | Self::Unsqueeze { .. } => Ok(args[0].with_shape(output.clone())),
            Self::Slice { axes, starts, .. } => {
                let s = &args[0].shape;
                let elem_offset: usize = axes
                    .iter()
                    .zip(starts)
                    .map(|(&a, &st)| st * s.strides()[a])
                    .sum();
                let mut view = args[0].with_shape(output.clone());
                view.offset += elem_offset * s.dtype().size_bytes();
                Ok(view)
            }
            Self::Contiguous => Ok(args[0].make_contiguous()),
            Self::Allocate { .. } => Ok(Argument::zeroed(output.clone())),
            Self::Extension(op) => op.compute(ctx, output, args),
            _ => Err(Error::NotComputable {
                op: self.name().to_string(),
            }),
        }
    }

    /// Which input buffer the output writes into or views, if any.
    #[must_use]
    pub fn output_alias(&self, inputs: &[Shape]) -> Option<usize> {
        match self {
            Self::Identity
            | Self::Transpose { .. }
            | Self::Reshape { .. }
            | Self::Squeeze { .. }
            | Self::Unsqueeze { .. }
            | Self::Slice { .. }
            | Self::Load { .. } => Some(0),
            Self::Extension(op) => op.output_alias(inputs),
            _ => None,
        }
    }

    /// Run the operator's finalize hook.
    pub fn finalize(&self, ctx: &mut Context) {
        if let Self::Extension(op) = self {
            op.finalize(ctx);
        }
    }

    /// Downcast an extension operator to its concrete type.
    ///
    /// # Errors
    ///
    /// [`Error::BadCast`] if this is not an extension of type `T`.
    pub fn as_extension<T: 'static>(&self) -> Result<&T, Error> {
        let err = Error::BadCast {
            expected: std::any::type_name::<T>(),
        };
        match self {
            Self::Extension(op) => op.as_any().downcast_ref::<T>().ok_or(err),
            _ => Err(err),
        }
    }
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name() && self.attributes() == other.attributes()
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())?;
        let attrs = self.attributes();
        let mut delim = '[';
        for (k, v) in &attrs {
            write!(f, "{delim}{k}={v}")?;
            delim = ',';
        }
        if delim == ',' {
            f.write_str("]")?;
        }
        Ok(())
    }
}

/// Check an exact input count the way every operator needs to.
pub(crate) fn expect_inputs(op: &str, inputs: &[Shape], n: usize) -> Result<(), Error> {
    if inputs.len() != n {
        return Err(Error::shape_mismatch(
            op,
            format!("expected {n} inputs, got {}", inputs.len()),
        ));
    }
    Ok(())
}

/// NumPy-style broadcast of two extent lists, aligned at the trailing
/// dimension. A missing or size-1 extent stretches to the other side's;
/// anything else is a mismatch.
fn broadcast_lens(op: &str, a: &[usize], b: &[usize]) -> Result<Vec<usize>, Error> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let x = a.len().checked_sub(rank - i).map_or(1, |j| a[j]);
        let y = b.len().checked_sub(rank - i).map_or(1, |j| b[j]);
        let l = if x == y || y == 1 {
            x
        } else if x == 1 {
            y
        } else {
            return Err(Error::shape_mismatch(
                op,
                format!("cannot broadcast {a:?} with {b:?}"),
            ));
        };
        out.push(l);
    }
    Ok(out)
}

fn is_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}

fn infer_reshape(op: &str, elements: usize, dims: &[i64]) -> Result<Vec<usize>, Error> {
    let negatives = dims.iter().filter(|&&d| d < 0).count();
    if negatives > 1 || dims.iter().any(|&d| d == 0) {
        return Err(Error::shape_mismatch(op, format!("invalid dims {dims:?}")));
    }
    let known: usize = dims.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
    let lens: Vec<usize> = if negatives == 1 {
        if known == 0 || elements % known != 0 {
            return Err(Error::shape_mismatch(
                op,
                format!("cannot infer dims {dims:?} from {elements} elements"),
            ));
        }
        dims.iter()
            .map(|&d| if d < 0 { elements / known } else { d as usize })
            .collect()
    } else {
        dims.iter().map(|&d| d as usize).collect()
    };
    if lens.iter().product::<usize>() != elements {
        return Err(Error::shape_mismatch(
            op,
            format!("dims {dims:?} do not cover {elements} elements"),
        ));
    }
    Ok(lens)
}
