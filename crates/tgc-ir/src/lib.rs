//! # TGC intermediate representation
//!
//! The IR of the TGC graph compiler: a [`Program`] of [`Instruction`]s
//! forming a DAG over typed tensor [`Shape`]s, with operator polymorphism
//! through [`Op`].
//!
//! ## Pipeline position
//!
//! ```text
//! Builder / importer
//!     |
//!     v
//! [Program]  <- this crate: instructions, operators, mutation API
//!     |
//!     v
//! [Passes]   <- tgc-passes: rewrites over the Program
//!     |
//!     v
//! Executable schedule with pre-planned memory
//! ```
//!
//! ## Main types
//!
//! - [`Program`]: ordered instruction DAG with parameters and literals
//! - [`Instruction`] / [`InsId`]: arena-allocated nodes and their ids
//! - [`Op`]: sum of known operators plus [`ExtendedOp`] extensions
//! - [`Pass`] / [`Target`]: the compilation pipeline contract
//! - [`Error`]: every failure the IR layer can produce

#![warn(missing_docs)]

mod error;
mod literal;
mod op;
mod pass;
mod program;

pub use error::Error;
pub use literal::{Argument, Literal, Scalar};
pub use op::{AttrValue, Attrs, ExtendedOp, Op};
pub use pass::{Context, Pass, Target};
pub use program::{EventMask, InsId, Instruction, Program};

pub use tgc_shape::{DType, Shape, ShapeError};
