//! Liveness of transient allocations, with an optional stream-aware
//! concurrency model.
//!
//! Program points: the instruction at order index `i` reads its inputs at
//! point `2i` and writes its result at `2i + 1`. An allocation's live
//! interval starts when something first writes into it (found by chasing
//! `output_alias` chains) and ends at the write-point of its last reader;
//! an allocation nothing ever writes is live from its definition. Reading
//! a value that aliases an allocation counts as reading the allocation.
//!
//! When instructions carry stream tags, two instructions on different
//! streams with no ordering between them are concurrent. Ordering comes
//! from data dependencies (checked through the dominator tree first, then
//! by reachability) and same-stream program order; a wait-tagged
//! instruction reads the value its recorder produced, so record/wait
//! synchronization arrives through the data edges. Memory coloring widens
//! conflicts with this relation.

use rustc_hash::{FxHashMap, FxHashSet};

use tgc_ir::{InsId, Program};

/// The live interval of one allocation, in program points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveInterval {
    /// The allocation instruction.
    pub ins: InsId,
    /// First point at which the buffer's contents matter.
    pub begin: usize,
    /// Last point at which the buffer's contents matter.
    pub end: usize,
    /// Buffer size in bytes.
    pub bytes: usize,
    /// The instruction that first writes into the buffer, if any.
    pub writer: Option<InsId>,
}

impl LiveInterval {
    /// Interval length in points; the coloring priority key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    /// True for degenerate single-point intervals.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closed-interval overlap.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }
}

/// Compute live intervals for every `allocation_op` instruction, in
/// program order.
#[must_use]
pub fn allocation_intervals(p: &Program, allocation_op: &str) -> Vec<LiveInterval> {
    let order = p.order();
    let pos: FxHashMap<InsId, usize> = order.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let allocs: FxHashSet<InsId> = order
        .iter()
        .copied()
        .filter(|&id| p.ins(id).name() == allocation_op)
        .collect();

    let mut reads: FxHashMap<InsId, usize> = FxHashMap::default();
    let mut writers: FxHashMap<InsId, InsId> = FxHashMap::default();
    for &k in order {
        let k_pos = pos[&k];
        for &input in p.ins(k).inputs() {
            let root = p.alias_root(input);
            if allocs.contains(&root) {
                let end = reads.entry(root).or_insert(0);
                *end = (*end).max(2 * k_pos + 1);
            }
        }
        let own_root = p.alias_root(k);
        if own_root != k && allocs.contains(&own_root) {
            writers.entry(own_root).or_insert(k);
        }
    }

    // the program's result buffer must hold from its allocation onward;
    // everything else only matters once something writes into it
    let result_buffer = p.terminal().map(|t| p.alias_root(t));

    order
        .iter()
        .filter(|&&a| allocs.contains(&a))
        .map(|&a| {
            let begin = if result_buffer == Some(a) {
                2 * pos[&a]
            } else {
                writers
                    .get(&a)
                    .map_or(2 * pos[&a], |&w| 2 * pos[&w] + 1)
            };
            let end = reads.get(&a).copied().unwrap_or(begin).max(begin);
            LiveInterval {
                ins: a,
                begin,
                end,
                bytes: p.ins(a).shape().bytes(),
                writer: writers.get(&a).copied(),
            }
        })
        .collect()
}

/// The allocations live at each instruction, derived from the intervals.
#[must_use]
pub fn live_sets(p: &Program, allocation_op: &str) -> Vec<FxHashSet<InsId>> {
    let intervals = allocation_intervals(p, allocation_op);
    (0..p.len())
        .map(|i| {
            intervals
                .iter()
                .filter(|iv| iv.begin <= 2 * i + 1 && iv.end >= 2 * i)
                .map(|iv| iv.ins)
                .collect()
        })
        .collect()
}

/// Immediate dominators of the dataflow DAG.
///
/// An instruction with no inputs is a root (dominated only by the virtual
/// entry, reported as `None`). For everything else, the immediate
/// dominator is the nearest instruction every data path from a root must
/// pass through.
#[must_use]
pub fn immediate_dominators(p: &Program) -> FxHashMap<InsId, Option<InsId>> {
    let pos: FxHashMap<InsId, usize> = p
        .order()
        .iter()
        .enumerate()
        .map(|(i, &id)| (id, i))
        .collect();
    let mut idom: FxHashMap<InsId, Option<InsId>> = FxHashMap::default();

    let intersect = |idom: &FxHashMap<InsId, Option<InsId>>, mut a: InsId, mut b: InsId| {
        loop {
            if a == b {
                return Some(a);
            }
            // walk the deeper one up; a None parent is the virtual entry
            if pos[&a] > pos[&b] {
                a = idom.get(&a).copied().flatten()?;
            } else {
                b = idom.get(&b).copied().flatten()?;
            }
        }
    };

    // one forward pass suffices on a topologically ordered DAG
    for &id in p.order() {
        let inputs = p.ins(id).inputs();
        let mut new: Option<InsId> = None;
        let mut first = true;
        for &i in inputs {
            if first {
                new = Some(i);
                first = false;
            } else if let Some(cur) = new {
                new = intersect(&idom, cur, i);
                if new.is_none() {
                    break;
                }
            }
        }
        idom.insert(id, new);
    }
    idom
}

/// Stream-aware ordering and concurrency queries.
pub struct StreamAnalysis<'p> {
    p: &'p Program,
    pos: FxHashMap<InsId, usize>,
    idom: FxHashMap<InsId, Option<InsId>>,
}

impl<'p> StreamAnalysis<'p> {
    /// Analyze a program's stream and event structure.
    #[must_use]
    pub fn new(p: &'p Program) -> Self {
        let pos = p
            .order()
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();
        Self {
            p,
            pos,
            idom: immediate_dominators(p),
        }
    }

    /// True when the two instructions may run at the same time: both are
    /// stream-tagged, on different streams, and neither is ordered before
    /// the other.
    #[must_use]
    pub fn concurrent(&self, x: InsId, y: InsId) -> bool {
        let (Some(sx), Some(sy)) = (self.p.ins(x).stream(), self.p.ins(y).stream()) else {
            return false;
        };
        if sx == sy {
            return false;
        }
        !self.ordered(x, y) && !self.ordered(y, x)
    }

    /// Guaranteed happens-before.
    #[must_use]
    pub fn ordered(&self, a: InsId, b: InsId) -> bool {
        if self.pos[&a] >= self.pos[&b] {
            return false;
        }
        // the dominator tree settles most data orderings without a walk
        if self.dominates(a, b) {
            return true;
        }
        let mut seen: FxHashSet<InsId> = FxHashSet::default();
        let mut stack = vec![a];
        while let Some(cur) = stack.pop() {
            if cur == b {
                return true;
            }
            if !seen.insert(cur) || self.pos[&cur] > self.pos[&b] {
                continue;
            }
            for next in self.successors(cur) {
                stack.push(next);
            }
        }
        false
    }

    fn dominates(&self, a: InsId, b: InsId) -> bool {
        let mut cur = Some(b);
        while let Some(c) = cur {
            if c == a {
                return true;
            }
            cur = self.idom.get(&c).copied().flatten();
        }
        false
    }

    fn successors(&self, i: InsId) -> Vec<InsId> {
        // Data edges carry the event protocol: a wait-tagged instruction
        // reads the value its recorder produced, so record/wait ordering
        // is a data edge. Same-stream instructions execute in program
        // order regardless of data.
        let ins = self.p.ins(i);
        let mut next: Vec<InsId> = ins.outputs().to_vec();
        if let Some(s) = ins.stream() {
            if let Some(follow) = self
                .p
                .order()
                .iter()
                .copied()
                .skip(self.pos[&i] + 1)
                .find(|&j| self.p.ins(j).stream() == Some(s))
            {
                next.push(follow);
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use tgc_ir::{Attrs, DType, Error, EventMask, ExtendedOp, Op, Shape};
    use tgc_shape::Shape as S;

    /// Writes into its first input, like a lowered kernel.
    #[derive(Debug)]
    struct PassOp;
    impl ExtendedOp for PassOp {
        fn name(&self) -> &str {
            "pass"
        }
        fn attributes(&self) -> Attrs {
            Vec::new()
        }
        fn compute_shape(&self, inputs: &[S]) -> Result<S, Error> {
            Ok(inputs.first().cloned().unwrap_or_else(S::empty))
        }
        fn output_alias(&self, inputs: &[S]) -> Option<usize> {
            (!inputs.is_empty()).then_some(0)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn alloc(p: &mut Program, n: usize) -> InsId {
        let shape = Shape::new(DType::Float32, [n]);
        let o = p.add_outline(shape.clone());
        p.add_instruction(Op::Allocate { shape }, &[o]).unwrap()
    }

    fn pass_op(p: &mut Program, inputs: &[InsId]) -> InsId {
        p.add_instruction(Op::extension(PassOp), inputs).unwrap()
    }

    #[test]
    fn intervals_follow_alias_chains() {
        // a1 feeds p1, whose result is read much later through p2
        let mut p = Program::new();
        let a1 = alloc(&mut p, 8); // positions: o@0, a1@1
        let p1 = pass_op(&mut p, &[a1]); // @2, writes a1
        let a2 = alloc(&mut p, 40); // o@3, a2@4
        let p2 = pass_op(&mut p, &[a2, p1]); // @5, writes a2, reads a1
        let _ = p2;
        let ivs = allocation_intervals(&p, "allocate");
        assert_eq!(ivs.len(), 2);
        // a1: written by p1 (point 5), read by p2 (point 11)
        assert_eq!(ivs[0].ins, a1);
        assert_eq!((ivs[0].begin, ivs[0].end), (5, 11));
        assert_eq!(ivs[0].writer, Some(p1));
        // a2 backs the program's result: live from its definition
        assert_eq!((ivs[1].begin, ivs[1].end), (8, 11));
        assert!(ivs[0].overlaps(&ivs[1]));
    }

    #[test]
    fn unwritten_allocation_lives_from_definition() {
        let mut p = Program::new();
        let a1 = alloc(&mut p, 8); // a1@1
        let a2 = alloc(&mut p, 40); // a2@4
        let _ = pass_op(&mut p, &[a2, a1]); // @5 writes a2, reads a1
        let ivs = allocation_intervals(&p, "allocate");
        // a1 has no writer: live from its definition point (order index 1)
        // through the final read (order index 4)
        assert_eq!((ivs[0].begin, ivs[0].end), (2, 9));
        assert_eq!(ivs[0].writer, None);
        // a2 backs the result, so it is live from its definition too
        assert_eq!((ivs[1].begin, ivs[1].end), (6, 9));
        let _ = a1;
    }

    #[test]
    fn live_sets_match_intervals() {
        let mut p = Program::new();
        let a1 = alloc(&mut p, 8);
        let p1 = pass_op(&mut p, &[a1]);
        let a2 = alloc(&mut p, 40);
        let _ = pass_op(&mut p, &[a2, p1]);
        let sets = live_sets(&p, "allocate");
        // at the final instruction both buffers are live
        assert!(sets[5].contains(&a1));
        assert!(sets[5].contains(&a2));
        // at p1 only a1 is live
        assert!(sets[2].contains(&a1));
        assert!(!sets[2].contains(&a2));
    }

    #[test]
    fn dominators_on_a_diamond() {
        let mut p = Program::new();
        let x = p
            .add_parameter("x", Shape::new(DType::Float32, [2]))
            .unwrap();
        let a = p.add_instruction(Op::Sin, &[x]).unwrap();
        let b = p.add_instruction(Op::Sin, &[x]).unwrap();
        let j = p.add_instruction(Op::Add, &[a, b]).unwrap();
        let idom = immediate_dominators(&p);
        assert_eq!(idom[&x], None);
        assert_eq!(idom[&a], Some(x));
        assert_eq!(idom[&b], Some(x));
        // both paths into the join meet at x
        assert_eq!(idom[&j], Some(x));
    }

    #[test]
    fn stream_concurrency() {
        let mut p = Program::new();
        let a1 = alloc(&mut p, 40);
        let p1 = pass_op(&mut p, &[a1]);
        p.set_stream(p1, 0);
        p.add_event_mask(p1, EventMask::RECORD);
        let a2 = alloc(&mut p, 40);
        let p2 = pass_op(&mut p, &[a2, p1]);
        p.set_stream(p2, 0);
        let a3 = alloc(&mut p, 40);
        let p3 = pass_op(&mut p, &[a3, p1]);
        p.set_stream(p3, 1);
        p.add_event_mask(p3, EventMask::WAIT);
        let sa = StreamAnalysis::new(&p);
        // p1 records, p3 waits: ordered, not concurrent
        assert!(sa.ordered(p1, p3));
        assert!(!sa.concurrent(p1, p3));
        // p2 and p3 race on different streams
        assert!(sa.concurrent(p2, p3));
        assert!(!sa.concurrent(p1, p2));
    }
}
