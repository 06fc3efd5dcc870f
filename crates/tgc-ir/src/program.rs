//! The program: an ordered DAG of instructions.
//!
//! Instructions live in a slot arena owned by the [`Program`] and refer to
//! one another by [`InsId`]. Reverse edges (`outputs`) are maintained
//! explicitly on every mutation, so the invariant
//! `J ∈ outputs(I) ⇔ I ∈ inputs(J)` holds at all times. The program order
//! is a separate vector of ids; every instruction's inputs appear earlier
//! in it, and the last instruction is the program's result.

use rustc_hash::FxHashMap;

use tgc_shape::Shape;

use crate::error::Error;
use crate::literal::Literal;
use crate::op::Op;

/// A generational reference to an instruction inside one [`Program`].
///
/// Ids are only meaningful for the program that produced them; a removed
/// instruction's slot bumps its generation, so stale ids are detected
/// instead of silently aliasing new instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsId {
    index: u32,
    gen: u32,
}

/// Event-mask bits carried by instructions in the stream model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventMask(u8);

impl EventMask {
    /// No events.
    pub const NONE: Self = Self(0);
    /// The instruction records an event other streams can wait on.
    pub const RECORD: Self = Self(1);
    /// The instruction waits on a previously recorded event.
    pub const WAIT: Self = Self(2);

    /// True if all bits of `other` are set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// One node of the IR: an operator bound to input references, with the
/// cached output shape.
#[derive(Clone, Debug)]
pub struct Instruction {
    op: Op,
    shape: Shape,
    inputs: Vec<InsId>,
    outputs: Vec<InsId>,
    lit: Option<Literal>,
    stream: Option<u32>,
    events: EventMask,
}

impl Instruction {
    fn new(op: Op, shape: Shape, inputs: Vec<InsId>) -> Self {
        Self {
            op,
            shape,
            inputs,
            outputs: Vec::new(),
            lit: None,
            stream: None,
            events: EventMask::NONE,
        }
    }

    /// The operator.
    #[must_use]
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// The operator's name; shorthand used all over the passes.
    #[must_use]
    pub fn name(&self) -> &str {
        self.op.name()
    }

    /// The cached output shape.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Forward edges, in argument order.
    #[must_use]
    pub fn inputs(&self) -> &[InsId] {
        &self.inputs
    }

    /// Reverse edges: the instructions reading this one.
    #[must_use]
    pub fn outputs(&self) -> &[InsId] {
        &self.outputs
    }

    /// The literal payload, for `@literal` instructions.
    #[must_use]
    pub fn literal(&self) -> Option<&Literal> {
        self.lit.as_ref()
    }

    /// The stream tag, if the target assigned one.
    #[must_use]
    pub fn stream(&self) -> Option<u32> {
        self.stream
    }

    /// The event mask.
    #[must_use]
    pub fn events(&self) -> EventMask {
        self.events
    }
}

#[derive(Clone, Debug, Default)]
struct Slot {
    gen: u32,
    ins: Option<Instruction>,
}

/// An ordered sequence of instructions forming a DAG, plus the parameter
/// table and literal pool.
#[derive(Clone, Debug, Default)]
pub struct Program {
    slots: Vec<Slot>,
    order: Vec<InsId>,
    params: Vec<(String, InsId)>,
    param_index: FxHashMap<String, InsId>,
}

impl Program {
    /// An empty program.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The instruction behind an id.
    ///
    /// # Panics
    ///
    /// Panics on a stale or foreign id; that is an internal-invariant bug
    /// in the caller, not a recoverable condition.
    #[must_use]
    pub fn ins(&self, id: InsId) -> &Instruction {
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.gen == id.gen => match &slot.ins {
                Some(ins) => ins,
                None => panic!("instruction reference used after removal"),
            },
            _ => panic!("stale instruction reference"),
        }
    }

    fn ins_mut(&mut self, id: InsId) -> &mut Instruction {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.gen == id.gen => match &mut slot.ins {
                Some(ins) => ins,
                None => panic!("instruction reference used after removal"),
            },
            _ => panic!("stale instruction reference"),
        }
    }

    /// True if the id refers to a live instruction of this program.
    #[must_use]
    pub fn has_instruction(&self, id: InsId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.gen == id.gen && slot.ins.is_some())
    }

    /// Number of live instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when the program has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids in program order.
    #[must_use]
    pub fn order(&self) -> &[InsId] {
        &self.order
    }

    /// Iterate ids in program order.
    pub fn iter(&self) -> impl Iterator<Item = InsId> + '_ {
        self.order.iter().copied()
    }

    /// The terminal (return) instruction.
    #[must_use]
    pub fn terminal(&self) -> Option<InsId> {
        self.order.last().copied()
    }

    /// The program's output shape: the terminal's shape.
    #[must_use]
    pub fn output_shape(&self) -> Option<Shape> {
        self.terminal().map(|id| self.ins(id).shape().clone())
    }

    /// Position of an instruction in program order.
    #[must_use]
    pub fn position(&self, id: InsId) -> Option<usize> {
        self.order.iter().position(|&x| x == id)
    }

    /// Parameters in insertion order.
    #[must_use]
    pub fn parameters(&self) -> &[(String, InsId)] {
        &self.params
    }

    /// Look up a parameter instruction by name.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownParameter`] when no such parameter exists.
    pub fn get_parameter(&self, name: &str) -> Result<InsId, Error> {
        self.param_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    /// A parameter's shape by name.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownParameter`] when no such parameter exists.
    pub fn parameter_shape(&self, name: &str) -> Result<Shape, Error> {
        Ok(self.ins(self.get_parameter(name)?).shape().clone())
    }

    fn alloc_slot(&mut self, ins: Instruction) -> InsId {
        let index = self.slots.len() as u32;
        let id = InsId { index, gen: 0 };
        self.slots.push(Slot { gen: 0, ins: Some(ins) });
        id
    }

    fn wire_inputs(&mut self, user: InsId) {
        let inputs = self.ins(user).inputs.clone();
        for input in inputs {
            let outs = &mut self.ins_mut(input).outputs;
            if !outs.contains(&user) {
                outs.push(user);
            }
        }
    }

    fn unwire_input(&mut self, user: InsId, input: InsId) {
        if !self.ins(user).inputs.contains(&input) {
            self.ins_mut(input).outputs.retain(|&o| o != user);
        }
    }

    fn input_shapes(&self, inputs: &[InsId]) -> Vec<Shape> {
        inputs.iter().map(|&i| self.ins(i).shape.clone()).collect()
    }

    /// Register a named program input.
    ///
    /// # Errors
    ///
    /// [`Error::BadGraph`] if the name is already taken.
    pub fn add_parameter(&mut self, name: impl Into<String>, shape: Shape) -> Result<InsId, Error> {
        let name = name.into();
        if self.param_index.contains_key(&name) {
            return Err(Error::BadGraph(format!("duplicate parameter {name}")));
        }
        let op = Op::Parameter { name: name.clone() };
        let id = self.alloc_slot(Instruction::new(op, shape, Vec::new()));
        self.order.push(id);
        self.params.push((name.clone(), id));
        self.param_index.insert(name, id);
        Ok(id)
    }

    /// Append a literal to the program.
    #[must_use]
    pub fn add_literal(&mut self, lit: Literal) -> InsId {
        let mut ins = Instruction::new(Op::Literal, lit.shape().clone(), Vec::new());
        ins.lit = Some(lit);
        let id = self.alloc_slot(ins);
        self.order.push(id);
        id
    }

    /// Insert a literal immediately before `before`, as passes that fold
    /// constants must.
    ///
    /// # Errors
    ///
    /// [`Error::BadGraph`] if `before` is not in the program.
    pub fn insert_literal(&mut self, before: InsId, lit: Literal) -> Result<InsId, Error> {
        let pos = self
            .position(before)
            .ok_or_else(|| Error::BadGraph("insertion cursor not in program".into()))?;
        let mut ins = Instruction::new(Op::Literal, lit.shape().clone(), Vec::new());
        ins.lit = Some(lit);
        let id = self.alloc_slot(ins);
        self.order.insert(pos, id);
        Ok(id)
    }

    /// Append a shape-only constant placeholder.
    #[must_use]
    pub fn add_outline(&mut self, shape: Shape) -> InsId {
        let id = self.alloc_slot(Instruction::new(
            Op::Outline {
                shape: shape.clone(),
            },
            shape,
            Vec::new(),
        ));
        self.order.push(id);
        id
    }

    /// Append an instruction, validating its shape against the operator.
    ///
    /// # Errors
    ///
    /// Shape errors from the operator; [`Error::BadGraph`] for unknown
    /// input ids.
    pub fn add_instruction(&mut self, op: Op, inputs: &[InsId]) -> Result<InsId, Error> {
        for &i in inputs {
            if !self.has_instruction(i) {
                return Err(Error::BadGraph("input not in program".into()));
            }
        }
        let shape = op.compute_shape(&self.input_shapes(inputs))?;
        let id = self.alloc_slot(Instruction::new(op, shape, inputs.to_vec()));
        self.order.push(id);
        self.wire_inputs(id);
        Ok(id)
    }

    /// Insert an instruction immediately before `before`.
    ///
    /// Inputs must already appear earlier than `before` in program order.
    ///
    /// # Errors
    ///
    /// Shape errors from the operator; [`Error::BadGraph`] on topology
    /// violations.
    pub fn insert_instruction(
        &mut self,
        before: InsId,
        op: Op,
        inputs: &[InsId],
    ) -> Result<InsId, Error> {
        let pos = self
            .position(before)
            .ok_or_else(|| Error::BadGraph("insertion cursor not in program".into()))?;
        for &i in inputs {
            match self.position(i) {
                Some(p) if p < pos => {}
                _ => {
                    return Err(Error::BadGraph(
                        "input would come after the inserted instruction".into(),
                    ))
                }
            }
        }
        let shape = op.compute_shape(&self.input_shapes(inputs))?;
        let id = self.alloc_slot(Instruction::new(op, shape, inputs.to_vec()));
        self.order.insert(pos, id);
        self.wire_inputs(id);
        Ok(id)
    }

    /// Redirect every reader of `old` to `new`, leaving `old` dangling for
    /// dead-code elimination.
    ///
    /// # Errors
    ///
    /// [`Error::BadGraph`] if a reader of `old` comes before `new` in
    /// program order (the rewire would create a cycle).
    pub fn replace_instruction(&mut self, old: InsId, new: InsId) -> Result<(), Error> {
        if old == new {
            return Ok(());
        }
        let new_pos = self
            .position(new)
            .ok_or_else(|| Error::BadGraph("replacement not in program".into()))?;
        let readers = self.ins(old).outputs.clone();
        for &r in &readers {
            match self.position(r) {
                Some(p) if p > new_pos => {}
                _ => {
                    return Err(Error::BadGraph(
                        "replacement would not dominate a reader".into(),
                    ))
                }
            }
        }
        for r in readers {
            for slot in &mut self.ins_mut(r).inputs {
                if *slot == old {
                    *slot = new;
                }
            }
            let outs = &mut self.ins_mut(new).outputs;
            if !outs.contains(&r) {
                outs.push(r);
            }
        }
        self.ins_mut(old).outputs.clear();
        Ok(())
    }

    /// Rewrite an instruction in place to a new operator and inputs.
    ///
    /// # Errors
    ///
    /// Shape errors from the new operator; [`Error::BadGraph`] if an input
    /// does not precede the instruction.
    pub fn replace_with_op(&mut self, id: InsId, op: Op, inputs: &[InsId]) -> Result<(), Error> {
        let pos = self
            .position(id)
            .ok_or_else(|| Error::BadGraph("instruction not in program".into()))?;
        for &i in inputs {
            match self.position(i) {
                Some(p) if p < pos => {}
                _ => return Err(Error::BadGraph("input would come after its user".into())),
            }
        }
        let shape = op.compute_shape(&self.input_shapes(inputs))?;
        let old_inputs = std::mem::take(&mut self.ins_mut(id).inputs);
        for input in old_inputs {
            self.unwire_input(id, input);
        }
        let ins = self.ins_mut(id);
        ins.op = op;
        ins.shape = shape;
        ins.inputs = inputs.to_vec();
        self.wire_inputs(id);
        Ok(())
    }

    /// Move an instruction so it sits immediately before `before`,
    /// preserving topological legality.
    ///
    /// # Errors
    ///
    /// [`Error::BadGraph`] if the move would put the instruction before an
    /// input or after a reader.
    pub fn move_instruction(&mut self, id: InsId, before: InsId) -> Result<(), Error> {
        let from = self
            .position(id)
            .ok_or_else(|| Error::BadGraph("instruction not in program".into()))?;
        let mut to = self
            .position(before)
            .ok_or_else(|| Error::BadGraph("move cursor not in program".into()))?;
        self.order.remove(from);
        if from < to {
            to -= 1;
        }
        self.order.insert(to, id);
        let pos = to;
        let ins = self.ins(id);
        let ok = ins
            .inputs
            .iter()
            .all(|&i| self.position(i).is_some_and(|p| p < pos))
            && ins
                .outputs
                .iter()
                .all(|&o| self.position(o).is_some_and(|p| p > pos));
        if !ok {
            // undo
            self.order.remove(pos);
            self.order
                .insert(from.min(self.order.len()), id);
            return Err(Error::BadGraph("move would break topological order".into()));
        }
        Ok(())
    }

    /// Remove an instruction with no readers.
    ///
    /// # Errors
    ///
    /// [`Error::BadGraph`] if the instruction still has readers.
    pub fn remove_instruction(&mut self, id: InsId) -> Result<(), Error> {
        if !self.ins(id).outputs.is_empty() {
            return Err(Error::BadGraph(
                "cannot remove an instruction that still has readers".into(),
            ));
        }
        let inputs = std::mem::take(&mut self.ins_mut(id).inputs);
        for input in inputs {
            self.unwire_input(id, input);
        }
        if let Some(pos) = self.position(id) {
            self.order.remove(pos);
        }
        self.params.retain(|(_, p)| *p != id);
        self.param_index.retain(|_, p| *p != id);
        let slot = &mut self.slots[id.index as usize];
        slot.ins = None;
        slot.gen += 1;
        Ok(())
    }

    /// Tag an instruction with a device stream.
    pub fn set_stream(&mut self, id: InsId, stream: u32) {
        self.ins_mut(id).stream = Some(stream);
    }

    /// Add event-mask bits to an instruction.
    pub fn add_event_mask(&mut self, id: InsId, mask: EventMask) {
        self.ins_mut(id).events.insert(mask);
    }

    /// Follow `output_alias` chains to the instruction whose buffer this
    /// one ultimately writes into or views.
    #[must_use]
    pub fn alias_root(&self, mut id: InsId) -> InsId {
        loop {
            let ins = self.ins(id);
            let shapes = self.input_shapes(&ins.inputs);
            match ins.op.output_alias(&shapes) {
                Some(k) if k < ins.inputs.len() => id = ins.inputs[k],
                _ => return id,
            }
        }
    }

    /// Check the program-wide invariants: topological order, shape
    /// coherence for non-leaf instructions, and reverse-edge consistency.
    ///
    /// # Errors
    ///
    /// [`Error::InternalInvariant`] naming the first violation found.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen: FxHashMap<InsId, usize> = FxHashMap::default();
        for (pos, &id) in self.order.iter().enumerate() {
            let ins = self.ins(id);
            for &i in &ins.inputs {
                match seen.get(&i) {
                    Some(_) => {}
                    None => {
                        return Err(Error::InternalInvariant(format!(
                            "input of %{pos} does not precede it"
                        )))
                    }
                }
                if !self.ins(i).outputs.contains(&id) {
                    return Err(Error::InternalInvariant(format!(
                        "missing reverse edge into %{pos}"
                    )));
                }
            }
            for &o in &ins.outputs {
                if !self.has_instruction(o) || !self.ins(o).inputs.contains(&id) {
                    return Err(Error::InternalInvariant(format!(
                        "dangling reverse edge out of %{pos}"
                    )));
                }
            }
            if !ins.op.is_leaf() && ins.name() != "@outline" {
                let shapes = self.input_shapes(&ins.inputs);
                let expect = ins.op.compute_shape(&shapes)?;
                if expect != ins.shape {
                    return Err(Error::InternalInvariant(format!(
                        "cached shape of %{pos} disagrees with its operator"
                    )));
                }
            }
            seen.insert(id, pos);
        }
        Ok(())
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pos: FxHashMap<InsId, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(p, &id)| (id, p))
            .collect();
        for (p, &id) in self.order.iter().enumerate() {
            let ins = self.ins(id);
            write!(f, "%{p} = {}", ins.op())?;
            if !ins.inputs().is_empty() {
                let mut delim = '(';
                for i in ins.inputs() {
                    write!(f, "{delim}%{}", pos[i])?;
                    delim = ',';
                }
                f.write_str(")")?;
            }
            if !ins.shape().is_empty() {
                write!(f, " -> {}", ins.shape())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tgc_shape::DType;

    fn f32s(lens: &[usize]) -> Shape {
        Shape::new(DType::Float32, lens.iter().copied())
    }

    #[test]
    fn build_and_validate() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let t = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[x])
            .unwrap();
        let c = p.add_instruction(Op::Contiguous, &[t]).unwrap();
        assert_eq!(p.len(), 3);
        assert_eq!(p.terminal(), Some(c));
        assert!(p.ins(c).shape().standard());
        p.validate().unwrap();
    }

    #[test]
    fn duplicate_parameter_rejected() {
        let mut p = Program::new();
        p.add_parameter("x", f32s(&[1])).unwrap();
        assert!(matches!(
            p.add_parameter("x", f32s(&[1])),
            Err(Error::BadGraph(_))
        ));
    }

    #[test]
    fn unknown_parameter() {
        let p = Program::new();
        assert!(matches!(
            p.parameter_shape("nope"),
            Err(Error::UnknownParameter(_))
        ));
    }

    #[test]
    fn reverse_edges_follow_mutations() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let a = p.add_instruction(Op::Identity, &[x]).unwrap();
        let b = p.add_instruction(Op::Identity, &[x]).unwrap();
        assert_eq!(p.ins(x).outputs(), &[a, b]);
        p.replace_instruction(a, x).unwrap();
        // nothing read a, so its outputs just clear
        assert!(p.ins(a).outputs().is_empty());
        p.remove_instruction(b).unwrap();
        assert_eq!(p.ins(x).outputs(), &[a]);
        p.validate().unwrap();
    }

    #[test]
    fn replace_rewires_readers() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let t = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[x])
            .unwrap();
        let t2 = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[t])
            .unwrap();
        let sink = p.add_instruction(Op::Identity, &[t2]).unwrap();
        // t2 composes to identity; replace it with x
        p.replace_instruction(t2, x).unwrap();
        assert_eq!(p.ins(sink).inputs(), &[x]);
        assert!(p.ins(t2).outputs().is_empty());
        assert!(p.ins(x).outputs().contains(&sink));
        p.validate().unwrap();
    }

    #[test]
    fn replace_refuses_cycles() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let a = p.add_instruction(Op::Identity, &[x]).unwrap();
        let b = p.add_instruction(Op::Identity, &[a]).unwrap();
        // a's reader b comes before... replacing a with b would make b read itself
        assert!(matches!(
            p.replace_instruction(a, b),
            Err(Error::BadGraph(_))
        ));
    }

    #[test]
    fn insert_respects_topology() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let a = p.add_instruction(Op::Identity, &[x]).unwrap();
        let ins = p.insert_instruction(a, Op::Identity, &[x]).unwrap();
        assert_eq!(p.position(ins), Some(1));
        assert_eq!(p.position(a), Some(2));
        // inserting before x an instruction that reads x must fail
        assert!(p.insert_instruction(x, Op::Identity, &[x]).is_err());
        p.validate().unwrap();
    }

    #[test]
    fn remove_requires_no_readers() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let a = p.add_instruction(Op::Identity, &[x]).unwrap();
        assert!(p.remove_instruction(x).is_err());
        p.remove_instruction(a).unwrap();
        p.remove_instruction(x).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn stale_ids_are_detected() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        p.remove_instruction(x).unwrap();
        assert!(!p.has_instruction(x));
    }

    #[test]
    fn move_instruction_preserves_topology() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let y = p.add_parameter("y", f32s(&[2, 2])).unwrap();
        let a = p.add_instruction(Op::Identity, &[x]).unwrap();
        p.move_instruction(y, a).unwrap();
        assert_eq!(p.position(y), Some(1));
        // moving an instruction before its own input must fail and leave
        // the order as it was
        assert!(p.move_instruction(a, x).is_err());
        assert_eq!(p.position(a), Some(2));
        p.validate().unwrap();
    }

    #[test]
    fn alias_root_follows_chains() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let t = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[x])
            .unwrap();
        let i = p.add_instruction(Op::Identity, &[t]).unwrap();
        assert_eq!(p.alias_root(i), x);
        let c = p.add_instruction(Op::Contiguous, &[i]).unwrap();
        assert_eq!(p.alias_root(c), c);
    }

    #[test]
    fn printer_format() {
        let mut p = Program::new();
        let x = p.add_parameter("x", f32s(&[2, 2])).unwrap();
        let t = p
            .add_instruction(Op::Transpose { perm: vec![1, 0] }, &[x])
            .unwrap();
        p.add_instruction(Op::Contiguous, &[t]).unwrap();
        let text = p.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "%0 = @param[name=x] -> f32[2, 2]");
        assert_eq!(lines[1], "%1 = transpose[perm=[1, 0]](%0) -> f32[2, 2]/[1, 2]");
        assert_eq!(lines[2], "%2 = contiguous(%1) -> f32[2, 2]");
    }
}
