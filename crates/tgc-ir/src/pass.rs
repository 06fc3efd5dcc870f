//! The pass pipeline: targets hand the compiler an ordered list of passes,
//! and [`Program::compile`] applies them in place.
//!
//! Passes are all-or-nothing: the pipeline snapshots the program before
//! each pass and restores it if the pass fails, so a failed compile never
//! leaves a half-rewritten program behind.

use crate::error::Error;
use crate::program::Program;

/// Target-supplied compilation context, threaded through every pass and
/// operator `finalize` hook.
#[derive(Clone, Debug)]
pub struct Context {
    /// How many device streams the target schedules across. One means the
    /// stream model is inert.
    pub num_streams: u32,
}

impl Default for Context {
    fn default() -> Self {
        Self { num_streams: 1 }
    }
}

/// A deterministic program-to-program rewrite.
pub trait Pass {
    /// The pass name, for logs and diagnostics.
    fn name(&self) -> &str;

    /// Rewrite the program in place.
    ///
    /// # Errors
    ///
    /// Any [`Error`]; the pipeline rolls the program back on failure.
    fn apply(&self, program: &mut Program, ctx: &mut Context) -> Result<(), Error>;
}

/// A compilation target: a name, an ordered pass list, and a context.
pub trait Target {
    /// The target name.
    fn name(&self) -> &str;

    /// The passes to run, in order.
    fn passes(&self) -> Vec<Box<dyn Pass>>;

    /// The context handed to every pass.
    fn context(&self) -> Context {
        Context::default()
    }
}

impl Program {
    /// Run a target's pass pipeline over this program.
    ///
    /// # Errors
    ///
    /// The first pass error, with the program restored to its state before
    /// the failing pass.
    pub fn compile(&mut self, target: &dyn Target) -> Result<(), Error> {
        let mut ctx = target.context();
        tracing::debug!(target = target.name(), "compiling");
        for pass in target.passes() {
            let snapshot = self.clone();
            tracing::debug!(pass = pass.name(), "running pass");
            if let Err(err) = pass.apply(self, &mut ctx) {
                tracing::debug!(pass = pass.name(), %err, "pass failed; rolling back");
                *self = snapshot;
                return Err(err);
            }
        }
        for id in self.order().to_vec() {
            self.ins(id).op().finalize(&mut ctx);
        }
        Ok(())
    }
}
