//! # TGC: a graph-level compiler for tensor computations
//!
//! TGC ingests a dataflow graph of tensor operations, rewrites it through
//! a target's pass pipeline, and produces an executable schedule whose
//! memory is pre-planned: every transient allocation becomes an offset
//! into one scratch buffer.
//!
//! This facade re-exports the public surface of the workspace crates:
//!
//! - [`tgc_shape`]: shapes, element types, layout predicates
//! - [`tgc_ir`]: the program IR, operators, and the pass pipeline
//! - [`tgc_match`]: the pattern sub-language passes rewrite with
//! - [`tgc_passes`]: the optimization and memory-planning passes
//!
//! ```
//! use tgc::{DType, Op, Program, Shape};
//!
//! let mut p = Program::new();
//! let x = p.add_parameter("x", Shape::new(DType::Float32, [2, 2])).unwrap();
//! let t = p.add_instruction(Op::Transpose { perm: vec![1, 0] }, &[x]).unwrap();
//! let c = p.add_instruction(Op::Contiguous, &[t]).unwrap();
//! assert!(p.ins(c).shape().standard());
//! ```

#![warn(missing_docs)]

pub use tgc_ir::{
    Argument, AttrValue, Attrs, Context, DType, Error, EventMask, ExtendedOp, InsId, Instruction,
    Literal, Op, Pass, Program, Scalar, Shape, ShapeError, Target,
};
pub use tgc_match::{find_matches, MatchResult, MatchRewrite, Matcher};
pub use tgc_passes::{
    align_up, liveness, DeadCodeElimination, EliminateAllocation, EliminateContiguous,
    MemoryColoring, SimplifyReshapes, DISABLE_ENV,
};
