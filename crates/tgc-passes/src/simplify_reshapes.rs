//! Collapse redundant shape-juggling: reshaper chains, no-op views,
//! nested transposes, and transposes trapped under a concat.
//!
//! Four rewrites run over every live instruction, in order:
//!
//! 1. drop reshapers, transposes, and slices whose output shape equals
//!    their input's,
//! 2. fold reshaper chains back to the earliest member with the same
//!    shape,
//! 3. fuse nested transposes into one composed permutation (or nothing,
//!    when the composition is the identity),
//! 4. sink a transpose below a concat whose inputs all share a transposed
//!    layout.
//!
//! The pass is idempotent: a second run finds nothing left to rewrite.

use tgc_ir::{Context, Error, InsId, Op, Pass, Program};
use tgc_match::{
    all_inputs, all_of, any_output, arg, find_matches, name, none_of, same_input_shapes,
    same_shape, skip_output, transpose_shape, MatchResult, MatchRewrite, Matcher,
};
use tgc_shape::{find_permutation, invert_permutation};

const RESHAPER_NAMES: [&str; 4] = ["reshape", "contiguous", "squeeze", "unsqueeze"];

fn is_reshaper(p: &Program, ins: InsId) -> bool {
    let n = p.ins(ins).name();
    RESHAPER_NAMES.iter().any(|&r| r == n)
}

/// The transpose feeding `ins`, looking through `contiguous`; `ins` itself
/// when there is none.
fn find_transpose_input(p: &Program, ins: InsId) -> InsId {
    let inputs = p.ins(ins).inputs();
    if inputs.len() != 1 {
        return ins;
    }
    let input = inputs[0];
    match p.ins(input).name() {
        "contiguous" => find_transpose_input(p, input),
        "transpose" => input,
        _ => ins,
    }
}

fn transpose_perm(p: &Program, ins: InsId) -> Vec<usize> {
    match p.ins(ins).op() {
        Op::Transpose { perm } => perm.clone(),
        _ => Vec::new(),
    }
}

/// `result[i] = dims[permutation[i]]`.
fn reorder_dims(dims: &[usize], permutation: &[usize]) -> Vec<usize> {
    permutation.iter().map(|&i| dims[i]).collect()
}

fn is_no_transpose(dims: &[usize]) -> bool {
    dims.iter().enumerate().all(|(i, &d)| i == d)
}

/// Rewrite 1: a reshaper, transpose, or slice whose shape equals its
/// input's is a no-op.
struct FindNopReshapes;

impl MatchRewrite for FindNopReshapes {
    fn matcher(&self) -> Matcher {
        all_of([
            name(["reshape", "contiguous", "squeeze", "unsqueeze", "transpose", "slice"]),
            same_shape(arg(0, tgc_match::any())),
        ])
    }

    fn apply(&self, p: &mut Program, r: MatchResult) -> Result<(), Error> {
        let input = p.ins(r.ins).inputs()[0];
        p.replace_instruction(r.ins, input)
    }
}

/// Rewrite 2: in a chain of reshapers, any member whose shape reappears
/// deeper in the chain can be replaced by the deeper member.
struct FindReshaper;

impl MatchRewrite for FindReshaper {
    fn matcher(&self) -> Matcher {
        all_of([
            tgc_match::name_of(&RESHAPER_NAMES),
            any_output(tgc_match::name_of(&RESHAPER_NAMES)),
        ])
    }

    fn apply(&self, p: &mut Program, r: MatchResult) -> Result<(), Error> {
        let mut chain = vec![r.ins];
        let mut cur = r.ins;
        while is_reshaper(p, cur) {
            cur = p.ins(cur).inputs()[0];
            chain.push(cur);
        }
        for (i, &start) in chain.iter().enumerate() {
            let found = chain
                .iter()
                .rev()
                .find(|&&deeper| {
                    deeper != start && p.ins(deeper).shape() == p.ins(start).shape()
                })
                .copied();
            if let Some(deeper) = found {
                // only rewrite when the deeper member really is deeper
                if chain[i..].contains(&deeper) {
                    p.replace_instruction(start, deeper)?;
                }
                break;
            }
        }
        Ok(())
    }
}

/// Rewrite 3: fuse nested transposes. Matches the outermost transpose of
/// a chain (none of its consumers, looking through `contiguous`, is
/// another transpose).
struct FindTranspose;

impl MatchRewrite for FindTranspose {
    fn matcher(&self) -> Matcher {
        all_of([
            name(["transpose"]),
            none_of([skip_output(name(["contiguous"]), name(["transpose"]))]),
        ])
    }

    fn apply(&self, p: &mut Program, r: MatchResult) -> Result<(), Error> {
        let ins = r.ins;
        let mut dims: Vec<usize> = (0..p.ins(ins).shape().rank()).collect();
        let mut x = ins;
        let mut t = ins;
        loop {
            dims = reorder_dims(&transpose_perm(p, t), &dims);
            x = t;
            t = find_transpose_input(p, x);
            if x == t || p.ins(t).name() != "transpose" {
                break;
            }
        }
        if t == ins || p.ins(t).name() != "transpose" {
            return Ok(());
        }
        let source = p.ins(t).inputs()[0];
        if is_no_transpose(&dims) {
            p.replace_instruction(ins, source)
        } else {
            p.replace_with_op(ins, Op::Transpose { perm: dims }, &[source])
        }
    }
}

/// Rewrite 4: when every input of a concat shares one transposed layout,
/// concat the sources instead and transpose once afterwards.
struct FindConcatTranspose;

impl MatchRewrite for FindConcatTranspose {
    fn matcher(&self) -> Matcher {
        all_of([
            name(["concat"]),
            same_input_shapes(),
            all_inputs(transpose_shape()),
        ])
    }

    fn apply(&self, p: &mut Program, r: MatchResult) -> Result<(), Error> {
        let ins = r.ins;
        let s = p.ins(p.ins(ins).inputs()[0]).shape().clone();
        debug_assert!(s.transposed());
        let axis = match p.ins(ins).op() {
            Op::Concat { axis } => *axis,
            _ => return Err(Error::InternalInvariant("concat matcher missed".into())),
        };
        let permutation = find_permutation(&s);
        let ipermutation = invert_permutation(&permutation);
        let new_axis = ipermutation[axis];

        let inputs = p.ins(ins).inputs().to_vec();
        let mut sources = Vec::new();
        for &input in &inputs {
            let src = if p.ins(input).name() == "transpose"
                && p.ins(p.ins(input).inputs()[0]).shape().standard()
            {
                p.ins(input).inputs()[0]
            } else {
                p.insert_instruction(
                    ins,
                    Op::Transpose {
                        perm: permutation.clone(),
                    },
                    &[input],
                )?
            };
            sources.push(src);
        }
        let concat = p.insert_instruction(ins, Op::Concat { axis: new_axis }, &sources)?;
        let t = p.insert_instruction(
            ins,
            Op::Transpose {
                perm: ipermutation,
            },
            &[concat],
        )?;
        debug_assert_eq!(p.ins(ins).shape().lens(), p.ins(t).shape().lens());
        p.replace_instruction(ins, t)
    }
}

/// Runs the four reshape rewrites over the program once.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimplifyReshapes;

impl Pass for SimplifyReshapes {
    fn name(&self) -> &str {
        "simplify_reshapes"
    }

    fn apply(&self, program: &mut Program, _ctx: &mut Context) -> Result<(), Error> {
        let terminal = program.terminal();
        for ins in program.order().to_vec() {
            if !program.has_instruction(ins) {
                continue;
            }
            if Some(ins) == terminal && program.ins(ins).name() == "contiguous" {
                continue;
            }
            // skip instructions already dead from earlier rewrites
            if program.ins(ins).outputs().is_empty() && Some(ins) != terminal {
                continue;
            }
            let rewrites: [&dyn MatchRewrite; 4] = [
                &FindNopReshapes,
                &FindReshaper,
                &FindTranspose,
                &FindConcatTranspose,
            ];
            find_matches(program, ins, &rewrites)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgc_ir::{DType, Shape};

    fn run(p: &mut Program) {
        SimplifyReshapes
            .apply(p, &mut Context::default())
            .unwrap();
        crate::DeadCodeElimination
            .apply(p, &mut Context::default())
            .unwrap();
        p.validate().unwrap();
    }

    #[test]
    fn nop_transpose_is_dropped() {
        let mut p = Program::new();
        let x = p
            .add_parameter("x", Shape::new(DType::Float32, [2, 3]))
            .unwrap();
        let t = p
            .add_instruction(Op::Transpose { perm: vec![0, 1] }, &[x])
            .unwrap();
        p.add_instruction(Op::Sin, &[t]).unwrap();
        run(&mut p);
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn double_transpose_cancels() {
        let mut p = Program::new();
        let x = p
            .add_parameter("x", Shape::new(DType::Float32, [2, 3]))
            .unwrap();
        let t1 = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[x])
            .unwrap();
        let t2 = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[t1])
            .unwrap();
        p.add_instruction(Op::Sin, &[t2]).unwrap();
        run(&mut p);
        assert_eq!(p.len(), 2);
        let terminal = p.terminal().unwrap();
        assert_eq!(p.ins(terminal).inputs(), &[x]);
    }

    #[test]
    fn nested_transposes_fuse_to_one() {
        let mut p = Program::new();
        let x = p
            .add_parameter("x", Shape::new(DType::Float32, [2, 3, 4]))
            .unwrap();
        let t1 = p
            .add_instruction(
                Op::Transpose {
                    perm: vec![1, 2, 0],
                },
                &[x],
            )
            .unwrap();
        let t2 = p
            .add_instruction(
                Op::Transpose {
                    perm: vec![1, 2, 0],
                },
                &[t1],
            )
            .unwrap();
        let out_shape = p.ins(t2).shape().clone();
        p.add_instruction(Op::Contiguous, &[t2]).unwrap();
        run(&mut p);
        // x, one fused transpose, contiguous
        assert_eq!(p.len(), 3);
        let fused = p.ins(p.terminal().unwrap()).inputs()[0];
        assert_eq!(p.ins(fused).name(), "transpose");
        assert_eq!(
            p.ins(fused).op(),
            &Op::Transpose {
                perm: vec![2, 0, 1]
            }
        );
        assert_eq!(p.ins(fused).shape(), &out_shape);
        assert_eq!(p.ins(fused).inputs(), &[x]);
    }

    #[test]
    fn reshaper_chain_folds_to_matching_shape() {
        let mut p = Program::new();
        let x = p
            .add_parameter("x", Shape::new(DType::Float32, [2, 6]))
            .unwrap();
        let r1 = p
            .add_instruction(Op::Reshape { dims: vec![3, 4] }, &[x])
            .unwrap();
        let r2 = p
            .add_instruction(Op::Reshape { dims: vec![12] }, &[r1])
            .unwrap();
        let r3 = p
            .add_instruction(Op::Reshape { dims: vec![3, 4] }, &[r2])
            .unwrap();
        p.add_instruction(Op::Sin, &[r3]).unwrap();
        run(&mut p);
        // r3 collapses onto r1; r2 dies
        assert_eq!(p.len(), 3);
        let sink = p.terminal().unwrap();
        assert_eq!(p.ins(p.ins(sink).inputs()[0]).name(), "reshape");
        assert_eq!(p.ins(p.ins(sink).inputs()[0]).shape().lens(), &[3, 4]);
    }

    #[test]
    fn terminal_contiguous_is_preserved() {
        let mut p = Program::new();
        let x = p
            .add_parameter("x", Shape::new(DType::Float32, [2, 3]))
            .unwrap();
        let t = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[x])
            .unwrap();
        p.add_instruction(Op::Contiguous, &[t]).unwrap();
        run(&mut p);
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn concat_transpose_sinks() {
        let mut p = Program::new();
        let a = p
            .add_parameter("a", Shape::new(DType::Float32, [2, 3]))
            .unwrap();
        let b = p
            .add_parameter("b", Shape::new(DType::Float32, [2, 3]))
            .unwrap();
        let ta = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[a])
            .unwrap();
        let tb = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[b])
            .unwrap();
        let cat = p
            .add_instruction(Op::Concat { axis: 0 }, &[ta, tb])
            .unwrap();
        let old_lens = p.ins(cat).shape().lens().to_vec();
        p.add_instruction(Op::Contiguous, &[cat]).unwrap();
        run(&mut p);
        // a, b, concat over sources, one transpose, contiguous
        assert_eq!(p.len(), 5);
        let terminal = p.terminal().unwrap();
        let t = p.ins(terminal).inputs()[0];
        assert_eq!(p.ins(t).name(), "transpose");
        assert_eq!(p.ins(t).shape().lens(), old_lens.as_slice());
        let inner = p.ins(t).inputs()[0];
        assert_eq!(p.ins(inner).name(), "concat");
        assert_eq!(p.ins(inner).inputs(), &[a, b]);
        // the sunk concat runs on axis 1 over the standard sources
        assert_eq!(p.ins(inner).shape().lens(), &[2, 6]);
    }

    #[test]
    fn idempotent() {
        let mut p = Program::new();
        let x = p
            .add_parameter("x", Shape::new(DType::Float32, [2, 3, 4]))
            .unwrap();
        let t1 = p
            .add_instruction(
                Op::Transpose {
                    perm: vec![1, 2, 0],
                },
                &[x],
            )
            .unwrap();
        let t2 = p
            .add_instruction(
                Op::Transpose {
                    perm: vec![2, 0, 1],
                },
                &[t1],
            )
            .unwrap();
        p.add_instruction(Op::Contiguous, &[t2]).unwrap();
        run(&mut p);
        let once = p.to_string();
        run(&mut p);
        assert_eq!(p.to_string(), once);
    }
}
