//! Declarative patterns over instructions.
//!
//! A [`Matcher`] is a small predicate tree interpreted against a program
//! cursor. Rewrites bundle a matcher with an `apply` through
//! [`MatchRewrite`], and passes drive them with [`find_matches`].
//!
//! Matching is deterministic, left-to-right, and non-backtracking: a
//! traversal combinator commits to the first instruction that satisfies
//! its sub-pattern. Rewrites may mutate the program inside `apply`;
//! `find_matches` re-checks that the cursor is still alive before trying
//! the next rewrite, but never restarts the walk.

#![warn(missing_docs)]

use rustc_hash::FxHashMap;

use tgc_ir::{Error, InsId, Program};

/// A predicate tree over instructions.
#[derive(Clone, Debug)]
pub enum Matcher {
    /// Always matches.
    Any,
    /// Operator name is one of the given names.
    Name(Vec<&'static str>),
    /// Every sub-matcher matches the cursor.
    AllOf(Vec<Matcher>),
    /// At least one sub-matcher matches the cursor.
    AnyOf(Vec<Matcher>),
    /// No sub-matcher matches the cursor.
    NoneOf(Vec<Matcher>),
    /// The `k`-th input exists and matches.
    Arg(usize, Box<Matcher>),
    /// Every input matches.
    AllInputs(Box<Matcher>),
    /// At least one input matches.
    AnyInput(Box<Matcher>),
    /// Every reader matches.
    AllOutputs(Box<Matcher>),
    /// At least one reader matches.
    AnyOutput(Box<Matcher>),
    /// The cursor's shape equals the shape of the instruction the inner
    /// matcher resolves to.
    SameShape(Box<Matcher>),
    /// All inputs share one shape.
    SameInputShapes,
    /// The cursor's shape is transposed.
    TransposeShape,
    /// The cursor's shape is standard.
    StandardShape,
    /// Exactly one reader.
    UsedOnce,
    /// Walk readers, skipping through instructions matching `skip`, until
    /// one matches `then`.
    SkipOutput {
        /// Instructions to walk through.
        skip: Box<Matcher>,
        /// The pattern a walked-to reader must satisfy.
        then: Box<Matcher>,
    },
    /// Always matches and records the cursor under a name.
    Bind(&'static str, Box<Matcher>),
}

impl Matcher {
    /// Interpret the pattern at a cursor.
    #[must_use]
    pub fn matches(&self, p: &Program, ins: InsId) -> bool {
        self.eval(p, ins, &mut FxHashMap::default())
    }

    fn eval(&self, p: &Program, ins: InsId, bind: &mut FxHashMap<&'static str, InsId>) -> bool {
        match self {
            Self::Any => true,
            Self::Name(names) => {
                let n = p.ins(ins).name();
                names.iter().any(|&candidate| candidate == n)
            }
            Self::AllOf(ms) => ms.iter().all(|m| m.eval(p, ins, bind)),
            Self::AnyOf(ms) => ms.iter().any(|m| m.eval(p, ins, bind)),
            Self::NoneOf(ms) => !ms.iter().any(|m| m.eval(p, ins, bind)),
            Self::Arg(k, m) => p
                .ins(ins)
                .inputs()
                .get(*k)
                .is_some_and(|&i| m.eval(p, i, bind)),
            Self::AllInputs(m) => p
                .ins(ins)
                .inputs()
                .iter()
                .all(|&i| m.eval(p, i, bind)),
            Self::AnyInput(m) => p
                .ins(ins)
                .inputs()
                .iter()
                .any(|&i| m.eval(p, i, bind)),
            Self::AllOutputs(m) => p
                .ins(ins)
                .outputs()
                .iter()
                .all(|&o| m.eval(p, o, bind)),
            Self::AnyOutput(m) => p
                .ins(ins)
                .outputs()
                .iter()
                .any(|&o| m.eval(p, o, bind)),
            Self::SameShape(m) => m
                .resolve(p, ins)
                .is_some_and(|other| p.ins(ins).shape() == p.ins(other).shape()),
            Self::SameInputShapes => {
                let inputs = p.ins(ins).inputs();
                match inputs.split_first() {
                    None => true,
                    Some((&first, rest)) => {
                        let s = p.ins(first).shape();
                        rest.iter().all(|&i| p.ins(i).shape() == s)
                    }
                }
            }
            Self::TransposeShape => p.ins(ins).shape().transposed(),
            Self::StandardShape => p.ins(ins).shape().standard(),
            Self::UsedOnce => p.ins(ins).outputs().len() == 1,
            Self::SkipOutput { skip, then } => {
                fn walk(
                    p: &Program,
                    ins: InsId,
                    skip: &Matcher,
                    then: &Matcher,
                    bind: &mut FxHashMap<&'static str, InsId>,
                ) -> bool {
                    p.ins(ins).outputs().iter().any(|&o| {
                        if then.eval(p, o, bind) {
                            true
                        } else if skip.eval(p, o, bind) {
                            walk(p, o, skip, then, bind)
                        } else {
                            false
                        }
                    })
                }
                walk(p, ins, skip, then, bind)
            }
            Self::Bind(name, m) => {
                if m.eval(p, ins, bind) {
                    bind.insert(name, ins);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Resolve the instruction this pattern points at from a cursor:
    /// traversal nodes move, predicate nodes stay put.
    #[must_use]
    pub fn resolve(&self, p: &Program, ins: InsId) -> Option<InsId> {
        match self {
            Self::Arg(k, m) => {
                let &i = p.ins(ins).inputs().get(*k)?;
                m.resolve(p, i)
            }
            _ => self.matches(p, ins).then_some(ins),
        }
    }

    /// Run the pattern and collect named [`Matcher::Bind`] anchors.
    #[must_use]
    pub fn capture(&self, p: &Program, ins: InsId) -> Option<MatchResult> {
        let mut bind = FxHashMap::default();
        self.eval(p, ins, &mut bind).then_some(MatchResult {
            ins,
            bindings: bind,
        })
    }
}

/// A successful match: the cursor plus any named anchors.
#[derive(Clone, Debug)]
pub struct MatchResult {
    /// The matched instruction.
    pub ins: InsId,
    /// Instructions captured by [`Matcher::Bind`].
    pub bindings: FxHashMap<&'static str, InsId>,
}

/// A matcher paired with the rewrite it triggers.
pub trait MatchRewrite {
    /// The pattern to spot.
    fn matcher(&self) -> Matcher;

    /// Rewrite the program at a match.
    ///
    /// # Errors
    ///
    /// Any [`Error`]; aborts the enclosing pass.
    fn apply(&self, p: &mut Program, r: MatchResult) -> Result<(), Error>;
}

/// Try each rewrite against the cursor, left to right, applying on match.
///
/// # Errors
///
/// The first error an `apply` returns.
pub fn find_matches(
    p: &mut Program,
    cursor: InsId,
    rewrites: &[&dyn MatchRewrite],
) -> Result<(), Error> {
    for rw in rewrites {
        if !p.has_instruction(cursor) {
            break;
        }
        if let Some(r) = rw.matcher().capture(p, cursor) {
            rw.apply(p, r)?;
        }
    }
    Ok(())
}

// Builder shorthands, so pass code reads like the patterns it spots.

/// Match any instruction.
#[must_use]
pub fn any() -> Matcher {
    Matcher::Any
}

/// Match by operator name.
#[must_use]
pub fn name<const N: usize>(names: [&'static str; N]) -> Matcher {
    Matcher::Name(names.to_vec())
}

/// Match by a dynamic set of operator names.
#[must_use]
pub fn name_of(names: &[&'static str]) -> Matcher {
    Matcher::Name(names.to_vec())
}

/// All of the sub-patterns, at the cursor.
#[must_use]
pub fn all_of<const N: usize>(ms: [Matcher; N]) -> Matcher {
    Matcher::AllOf(ms.to_vec())
}

/// Any of the sub-patterns, at the cursor.
#[must_use]
pub fn any_of<const N: usize>(ms: [Matcher; N]) -> Matcher {
    Matcher::AnyOf(ms.to_vec())
}

/// None of the sub-patterns, at the cursor.
#[must_use]
pub fn none_of<const N: usize>(ms: [Matcher; N]) -> Matcher {
    Matcher::NoneOf(ms.to_vec())
}

/// Descend to the `k`-th input.
#[must_use]
pub fn arg(k: usize, m: Matcher) -> Matcher {
    Matcher::Arg(k, Box::new(m))
}

/// Every input satisfies the pattern.
#[must_use]
pub fn all_inputs(m: Matcher) -> Matcher {
    Matcher::AllInputs(Box::new(m))
}

/// Some input satisfies the pattern.
#[must_use]
pub fn any_input(m: Matcher) -> Matcher {
    Matcher::AnyInput(Box::new(m))
}

/// Some reader satisfies the pattern.
#[must_use]
pub fn any_output(m: Matcher) -> Matcher {
    Matcher::AnyOutput(Box::new(m))
}

/// Shape equals the shape of what `m` resolves to.
#[must_use]
pub fn same_shape(m: Matcher) -> Matcher {
    Matcher::SameShape(Box::new(m))
}

/// All inputs share one shape.
#[must_use]
pub fn same_input_shapes() -> Matcher {
    Matcher::SameInputShapes
}

/// The cursor's shape is transposed.
#[must_use]
pub fn transpose_shape() -> Matcher {
    Matcher::TransposeShape
}

/// The cursor's shape is standard.
#[must_use]
pub fn standard_shape() -> Matcher {
    Matcher::StandardShape
}

/// Walk readers through `skip` until one matches `then`.
#[must_use]
pub fn skip_output(skip: Matcher, then: Matcher) -> Matcher {
    Matcher::SkipOutput {
        skip: Box::new(skip),
        then: Box::new(then),
    }
}

/// Capture the cursor under a name.
#[must_use]
pub fn bind(n: &'static str, m: Matcher) -> Matcher {
    Matcher::Bind(n, Box::new(m))
}
