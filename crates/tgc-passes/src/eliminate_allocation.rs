//! Fuse every transient allocation into one `memory` parameter.
//!
//! Allocations are stacked: each gets the running total as its offset, and
//! the total grows by the allocation's size rounded up to the target's
//! alignment. Non-trivial reuse is memory coloring's job; this pass is the
//! fallback when coloring is disabled, and the shape every coloring rewrite
//! shares (allocation becomes a `load` view into a single buffer).

use tgc_ir::{Context, DType, Error, Op, Pass, Program, Shape};

/// Rewrites `allocation_op` instructions into views of one `memory`
/// parameter, stacked at aligned offsets.
#[derive(Clone, Debug)]
pub struct EliminateAllocation {
    /// Name of the operator that allocates transient buffers.
    pub allocation_op: String,
    /// Offset alignment in bytes.
    pub alignment: usize,
}

impl EliminateAllocation {
    /// A pass for the given allocation operator and alignment.
    #[must_use]
    pub fn new(allocation_op: impl Into<String>, alignment: usize) -> Self {
        Self {
            allocation_op: allocation_op.into(),
            alignment,
        }
    }
}

/// Round `n` up to a multiple of `align`.
#[must_use]
pub fn align_up(n: usize, align: usize) -> usize {
    if align <= 1 {
        return n;
    }
    n.div_ceil(align) * align
}

impl Pass for EliminateAllocation {
    fn name(&self) -> &str {
        "eliminate_allocation"
    }

    fn apply(&self, program: &mut Program, _ctx: &mut Context) -> Result<(), Error> {
        let allocs: Vec<_> = program
            .iter()
            .filter(|&id| program.ins(id).name() == self.allocation_op)
            .collect();
        if allocs.is_empty() {
            return Ok(());
        }

        let mut total = 0;
        let mut offsets = Vec::with_capacity(allocs.len());
        for &a in &allocs {
            offsets.push(total);
            total += align_up(program.ins(a).shape().bytes(), self.alignment);
        }
        tracing::debug!(allocations = allocs.len(), bytes = total, "stacking");

        let memory = program.add_parameter("memory", Shape::new(DType::Int8, [total]))?;
        let first = program.order()[0];
        program.move_instruction(memory, first)?;
        for (&a, offset) in allocs.iter().zip(offsets) {
            let shape = program.ins(a).shape().clone();
            program.replace_with_op(a, Op::Load { offset, shape }, &[memory])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(4, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(7, 1), 7);
        assert_eq!(align_up(0, 32), 0);
    }

    #[test]
    fn allocations_become_views() {
        let mut p = Program::new();
        let a = p
            .add_instruction(
                Op::Allocate {
                    shape: Shape::new(DType::Float32, [8]),
                },
                &[],
            )
            .unwrap();
        let b = p
            .add_instruction(
                Op::Allocate {
                    shape: Shape::new(DType::Float32, [40]),
                },
                &[],
            )
            .unwrap();
        EliminateAllocation::new("allocate", 32)
            .apply(&mut p, &mut Context::default())
            .unwrap();
        assert_eq!(p.parameter_shape("memory").unwrap().bytes(), 32 + 160);
        assert_eq!(p.ins(a).name(), "load");
        assert_eq!(p.ins(b).name(), "load");
        assert_eq!(p.ins(b).shape().lens(), &[40]);
        p.validate().unwrap();
    }

    #[test]
    fn no_allocations_is_a_no_op() {
        let mut p = Program::new();
        p.add_parameter("x", Shape::new(DType::Float32, [2]))
            .unwrap();
        EliminateAllocation::new("allocate", 32)
            .apply(&mut p, &mut Context::default())
            .unwrap();
        assert!(p.parameter_shape("memory").is_err());
    }
}
