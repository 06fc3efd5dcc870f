//! Shared fixtures for the pipeline tests: the unit operators targets
//! lower to, and the little targets the suites compile with.

#![allow(dead_code)]

use std::any::Any;

use tgc::{
    Context, DType, DeadCodeElimination, EliminateAllocation, EliminateContiguous, Error,
    ExtendedOp, InsId, MemoryColoring, Op, Pass, Program, Shape, Target,
};

pub fn f32s(lens: &[usize]) -> Shape {
    Shape::new(DType::Float32, lens.iter().copied())
}

/// A kernel stand-in: writes its result into its first input, accepts any
/// layout.
#[derive(Debug)]
pub struct PassOp;

impl ExtendedOp for PassOp {
    fn name(&self) -> &str {
        "pass"
    }

    fn compute_shape(&self, inputs: &[Shape]) -> Result<Shape, Error> {
        Ok(inputs.first().cloned().unwrap_or_else(Shape::empty))
    }

    fn output_alias(&self, inputs: &[Shape]) -> Option<usize> {
        (!inputs.is_empty()).then_some(0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A kernel stand-in that insists on standard input layouts.
#[derive(Debug)]
pub struct PassStandardOp;

impl ExtendedOp for PassStandardOp {
    fn name(&self) -> &str {
        "pass_standard"
    }

    fn compute_shape(&self, inputs: &[Shape]) -> Result<Shape, Error> {
        for s in inputs {
            if !s.standard() {
                return Err(Error::shape_mismatch(
                    self.name(),
                    "requires standard inputs",
                ));
            }
        }
        Ok(inputs.first().cloned().unwrap_or_else(Shape::empty))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn pass(p: &mut Program, inputs: &[InsId]) -> InsId {
    p.add_instruction(Op::extension(PassOp), inputs).unwrap()
}

pub fn pass_standard(p: &mut Program, inputs: &[InsId]) -> InsId {
    p.add_instruction(Op::extension(PassStandardOp), inputs)
        .unwrap()
}

/// An allocation the way lowered programs request them: a shape-only
/// outline feeding an `allocate`.
pub fn add_alloc(p: &mut Program, lens: &[usize]) -> InsId {
    let shape = f32s(lens);
    let outline = p.add_outline(shape.clone());
    p.add_instruction(Op::Allocate { shape }, &[outline])
        .unwrap()
}

pub fn no_allocate(p: &Program) -> bool {
    p.iter().all(|id| p.ins(id).name() != "allocate")
}

pub struct ContiguousTarget;

impl Target for ContiguousTarget {
    fn name(&self) -> &str {
        "eliminate_contiguous"
    }

    fn passes(&self) -> Vec<Box<dyn Pass>> {
        vec![
            Box::new(EliminateContiguous),
            Box::new(DeadCodeElimination),
        ]
    }
}

pub struct AllocationTarget {
    pub align: usize,
}

impl Target for AllocationTarget {
    fn name(&self) -> &str {
        "eliminate_allocation"
    }

    fn passes(&self) -> Vec<Box<dyn Pass>> {
        vec![
            Box::new(EliminateAllocation::new("allocate", self.align)),
            Box::new(DeadCodeElimination),
        ]
    }
}

pub struct ColoringTarget;

impl Target for ColoringTarget {
    fn name(&self) -> &str {
        "memory_coloring"
    }

    fn passes(&self) -> Vec<Box<dyn Pass>> {
        // constructed directly so the environment switch cannot interfere
        vec![Box::new(MemoryColoring {
            allocation_op: "allocate".into(),
            alignment: 32,
            num_streams: 4,
            enabled: true,
        })]
    }

    fn context(&self) -> Context {
        Context { num_streams: 4 }
    }
}
