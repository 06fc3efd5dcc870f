//! Dead-code elimination.
//!
//! Reverse reachability from the terminal instruction; whatever is not
//! reached is removed. Parameters survive unconditionally since they are
//! the program's interface. Run between transforming passes to keep the
//! graph tidy.

use rustc_hash::FxHashSet;

use tgc_ir::{Context, Error, InsId, Pass, Program};

/// Removes instructions that cannot reach the terminal.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &str {
        "dead_code_elimination"
    }

    fn apply(&self, program: &mut Program, _ctx: &mut Context) -> Result<(), Error> {
        let Some(terminal) = program.terminal() else {
            return Ok(());
        };
        let mut live: FxHashSet<InsId> = FxHashSet::default();
        let mut stack = vec![terminal];
        for (_, id) in program.parameters() {
            stack.push(*id);
        }
        while let Some(id) = stack.pop() {
            if live.insert(id) {
                stack.extend(program.ins(id).inputs().iter().copied());
            }
        }
        let removed = program.len() - live.len();
        // reverse order, so readers go before what they read
        for id in program.order().to_vec().into_iter().rev() {
            if !live.contains(&id) {
                program.remove_instruction(id)?;
            }
        }
        if removed > 0 {
            tracing::trace!(removed, "dead instructions eliminated");
        }
        Ok(())
    }
}
