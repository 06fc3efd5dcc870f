//! Remove `contiguous` copies nobody needs.
//!
//! A `contiguous` is redundant when every reader would compute the same
//! output shape reading the non-standard input directly; then the readers
//! are rewired and the copy dies. When a reader insists on the standard
//! layout but the copy is fed entirely by constants, the copy is evaluated
//! at compile time and replaced with a fresh literal, which is standard by
//! construction. Only a `contiguous` that a reader genuinely needs at run
//! time survives.

use tgc_ir::{Argument, Context, Error, InsId, Literal, Pass, Program, Shape};

/// Eliminates redundant `contiguous` instructions.
#[derive(Clone, Copy, Debug, Default)]
pub struct EliminateContiguous;

/// Would `reader` still produce its current shape if it read `new_shape`
/// in place of `old_input`?
fn accepts_input_shape(p: &Program, reader: InsId, old_input: InsId, new_shape: &Shape) -> bool {
    let ins = p.ins(reader);
    let shapes: Vec<Shape> = ins
        .inputs()
        .iter()
        .map(|&i| {
            if i == old_input {
                new_shape.clone()
            } else {
                p.ins(i).shape().clone()
            }
        })
        .collect();
    match ins.op().compute_shape(&shapes) {
        Ok(s) => &s == ins.shape(),
        Err(_) => false,
    }
}

/// Evaluate a constant subgraph, bottoming out at literals.
fn eval_const(p: &Program, id: InsId, ctx: &Context) -> Option<Argument> {
    let ins = p.ins(id);
    if let Some(lit) = ins.literal() {
        return Some(lit.argument());
    }
    let args: Option<Vec<Argument>> = ins
        .inputs()
        .iter()
        .map(|&i| eval_const(p, i, ctx))
        .collect();
    ins.op().compute(ctx, ins.shape(), &args?).ok()
}

impl Pass for EliminateContiguous {
    fn name(&self) -> &str {
        "eliminate_contiguous"
    }

    fn apply(&self, program: &mut Program, ctx: &mut Context) -> Result<(), Error> {
        let terminal = program.terminal();
        for ins in program.order().to_vec() {
            if !program.has_instruction(ins)
                || program.ins(ins).name() != "contiguous"
                || Some(ins) == terminal
            {
                continue;
            }
            let readers = program.ins(ins).outputs().to_vec();
            if readers.is_empty() {
                continue;
            }
            let input = program.ins(ins).inputs()[0];
            let input_shape = program.ins(input).shape().clone();

            if readers
                .iter()
                .all(|&r| accepts_input_shape(program, r, ins, &input_shape))
            {
                tracing::trace!("rewiring readers past a contiguous");
                program.replace_instruction(ins, input)?;
                continue;
            }

            // a constant layout can be fixed once, at compile time
            if let Some(arg) = eval_const(program, ins, ctx) {
                let packed = arg.make_contiguous();
                let lit = program.insert_literal(
                    ins,
                    Literal::from_bytes(packed.shape.clone(), packed.data),
                )?;
                program.replace_instruction(ins, lit)?;
            }
        }
        Ok(())
    }
}
