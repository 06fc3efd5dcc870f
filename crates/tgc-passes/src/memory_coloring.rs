//! Memory coloring: pack all transient allocations into one scratch
//! buffer.
//!
//! Interval-graph allocation over the liveness intervals of §`liveness`:
//! allocations are placed in priority order (longest live range first,
//! then largest, then earliest defined), each at the lowest aligned
//! offset that fits among the already-placed allocations it conflicts
//! with. Two allocations conflict when their live ranges overlap, or when
//! their writers may run concurrently on different streams. Allocations
//! that never conflict may share bytes.
//!
//! The greedy placement is not optimal and makes no attempt to be: a
//! small early allocation can leave a hole too small for a later one,
//! which then bumps past everything it conflicts with. What it is, is
//! deterministic: the same program always colors to the same offsets.

use tgc_ir::{Context, DType, Error, Op, Pass, Program, Shape};

use crate::eliminate_allocation::align_up;
use crate::liveness::{allocation_intervals, LiveInterval, StreamAnalysis};

/// Environment variable that disables the pass when set to `1`.
pub const DISABLE_ENV: &str = "TGC_DISABLE_MEMORY_COLORING";

/// Replaces `allocation_op` instructions with views into a single
/// `scratch` parameter at conflict-free offsets.
#[derive(Clone, Debug)]
pub struct MemoryColoring {
    /// Name of the operator that allocates transient buffers.
    pub allocation_op: String,
    /// Offset alignment in bytes; undersized allocations are padded to it.
    pub alignment: usize,
    /// Stream count hint from the target; the analysis itself reads
    /// instruction tags.
    pub num_streams: u32,
    /// When false the pass is a no-op, leaving stacked allocations to
    /// [`crate::EliminateAllocation`].
    pub enabled: bool,
}

impl MemoryColoring {
    /// A coloring pass with the default 32-byte alignment. The enable
    /// switch is seeded from [`DISABLE_ENV`].
    #[must_use]
    pub fn new(allocation_op: impl Into<String>) -> Self {
        let disabled = std::env::var(DISABLE_ENV).is_ok_and(|v| v == "1");
        Self {
            allocation_op: allocation_op.into(),
            alignment: 32,
            num_streams: 1,
            enabled: !disabled,
        }
    }

    /// Set the stream count hint.
    #[must_use]
    pub fn with_streams(mut self, num_streams: u32) -> Self {
        self.num_streams = num_streams;
        self
    }

    /// Force the pass on or off, independent of the environment.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

fn conflicts(intervals: &[LiveInterval], sa: &StreamAnalysis<'_>, a: usize, b: usize) -> bool {
    if intervals[a].overlaps(&intervals[b]) {
        return true;
    }
    match (intervals[a].writer, intervals[b].writer) {
        (Some(wa), Some(wb)) => sa.concurrent(wa, wb),
        _ => false,
    }
}

impl Pass for MemoryColoring {
    fn name(&self) -> &str {
        "memory_coloring"
    }

    fn apply(&self, program: &mut Program, _ctx: &mut Context) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }
        let intervals = allocation_intervals(program, &self.allocation_op);
        if intervals.is_empty() {
            return Ok(());
        }
        let sa = StreamAnalysis::new(program);

        // longest live range first, then largest, then definition order
        let mut queue: Vec<usize> = (0..intervals.len())
            .filter(|&i| intervals[i].bytes > 0)
            .collect();
        queue.sort_by(|&a, &b| {
            intervals[b]
                .len()
                .cmp(&intervals[a].len())
                .then(intervals[b].bytes.cmp(&intervals[a].bytes))
                .then(a.cmp(&b))
        });

        let mut offsets: Vec<usize> = vec![0; intervals.len()];
        let mut placed: Vec<usize> = Vec::with_capacity(queue.len());
        let mut total = 0;
        for &i in &queue {
            let size = align_up(intervals[i].bytes, self.alignment);
            let mut obstacles: Vec<(usize, usize)> = placed
                .iter()
                .filter(|&&j| conflicts(&intervals, &sa, i, j))
                .map(|&j| (offsets[j], align_up(intervals[j].bytes, self.alignment)))
                .collect();
            obstacles.sort_unstable();
            let mut offset = 0;
            for (start, len) in obstacles {
                if offset + size <= start {
                    break;
                }
                offset = offset.max(start + len);
            }
            offsets[i] = offset;
            total = total.max(offset + size);
            placed.push(i);
        }
        tracing::debug!(
            allocations = intervals.len(),
            scratch_bytes = total,
            "colored"
        );

        // every pair that conflicts must end up byte-disjoint
        for (i, &a) in placed.iter().enumerate() {
            for &b in &placed[i + 1..] {
                let (ea, eb) = (
                    offsets[a] + align_up(intervals[a].bytes, self.alignment),
                    offsets[b] + align_up(intervals[b].bytes, self.alignment),
                );
                if conflicts(&intervals, &sa, a, b) && offsets[a] < eb && offsets[b] < ea {
                    return Err(Error::InternalInvariant(
                        "conflicting allocations share scratch bytes".into(),
                    ));
                }
            }
        }

        let scratch = program.add_parameter("scratch", Shape::new(DType::Int8, [total]))?;
        let first = program.order()[0];
        program.move_instruction(scratch, first)?;
        for (i, iv) in intervals.iter().enumerate() {
            let shape = program.ins(iv.ins).shape().clone();
            program.replace_with_op(
                iv.ins,
                Op::Load {
                    offset: offsets[i],
                    shape,
                },
                &[scratch],
            )?;
        }
        Ok(())
    }
}
