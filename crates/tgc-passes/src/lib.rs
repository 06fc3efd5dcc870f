//! Optimization and lowering passes over the TGC IR.
//!
//! The transforms a target composes into its pipeline:
//!
//! - [`DeadCodeElimination`]: drop everything unreachable from the result
//! - [`SimplifyReshapes`]: collapse redundant shape juggling
//! - [`EliminateContiguous`]: remove copies nobody needs
//! - [`EliminateAllocation`]: stack transient buffers into one parameter
//! - [`MemoryColoring`]: pack transient buffers with live-range reuse
//!
//! The [`liveness`] module provides the interval analysis, per-instruction
//! live sets, dominators, and the stream concurrency model the memory
//! passes build on.

#![warn(missing_docs)]

mod dce;
mod eliminate_allocation;
mod eliminate_contiguous;
pub mod liveness;
mod memory_coloring;
mod simplify_reshapes;

pub use dce::DeadCodeElimination;
pub use eliminate_allocation::{align_up, EliminateAllocation};
pub use eliminate_contiguous::EliminateContiguous;
pub use memory_coloring::{MemoryColoring, DISABLE_ENV};
pub use simplify_reshapes::SimplifyReshapes;
