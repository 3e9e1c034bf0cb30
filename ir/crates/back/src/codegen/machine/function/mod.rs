use std::fmt::{
    Display,
    Formatter,
};

pub use cfg::{
    BasicBlock,
    BasicBlockId,
    Cfg,
};
use cranelift_entity::entity_impl;
use index_vec::IndexVec;
use itertools::Itertools;
use slotmap::{
    new_key_type,
    Key,
    SecondaryMap,
    SlotMap,
};
use smallvec::SmallVec;
use tracing::trace;

use crate::codegen::machine::{
    reg::{
        reg_name,
        RegNum,
        RegisterMask,
    },
    Instr,
    PseudoInstr,
    TargetMachine,
};

pub mod builder;
pub mod cfg;

#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);

entity_impl!(FunctionId, "fun");

new_key_type! {
    pub struct InstrRef;
}

impl Display for InstrRef {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // The low half of the key is the slot index.
        write!(f, "%{}", self.data().as_ffi() as u32)
    }
}

/// An instruction together with its def-use edges.
#[derive(Debug, Clone)]
pub struct Node<TM: TargetMachine> {
    pub instr: Instr<TM>,
    pub(crate) inputs: SmallVec<[InstrRef; 3]>,
    pub(crate) users: SmallVec<[InstrRef; 2]>,
    pub(crate) bb: BasicBlockId,
}

#[derive(Debug, Clone)]
pub struct Function<TM: TargetMachine> {
    pub name: String,
    pub basic_blocks: IndexVec<BasicBlockId, BasicBlock>,
    pub(crate) nodes: SlotMap<InstrRef, Node<TM>>,
    pub(crate) params: SmallVec<[InstrRef; 2]>,
    /// Location assigned by the register allocator.
    pub(crate) regs: SecondaryMap<InstrRef, RegNum>,
    cfg: Option<Cfg>,
}

impl<TM: TargetMachine> Function<TM> {
    pub fn new(name: String) -> Self {
        Self {
            name,
            basic_blocks: IndexVec::default(),
            nodes: SlotMap::with_key(),
            params: SmallVec::new(),
            regs: SecondaryMap::new(),
            cfg: None,
        }
    }

    pub fn create_bb(&mut self) -> BasicBlockId {
        let id = self.basic_blocks.next_idx();
        self.basic_blocks.push(BasicBlock::new(id))
    }

    pub fn params(&self) -> &[InstrRef] {
        &self.params
    }

    pub fn contains(&self, instr: InstrRef) -> bool {
        self.nodes.contains_key(instr)
    }

    pub fn instr(&self, instr: InstrRef) -> &Instr<TM> {
        &self.nodes[instr].instr
    }

    pub(crate) fn instr_mut(&mut self, instr: InstrRef) -> &mut Instr<TM> {
        &mut self.nodes[instr].instr
    }

    pub fn inputs(&self, instr: InstrRef) -> &[InstrRef] {
        &self.nodes[instr].inputs
    }

    /// Every instruction reading `instr`, once per read.
    pub fn users(&self, instr: InstrRef) -> &[InstrRef] {
        &self.nodes[instr].users
    }

    pub fn block_of(&self, instr: InstrRef) -> BasicBlockId {
        self.nodes[instr].bb
    }

    pub fn instructions(&self) -> impl Iterator<Item = InstrRef> + '_ {
        self.basic_blocks
            .iter()
            .flat_map(|bb| bb.instructions.iter().copied())
    }

    pub fn reg(&self, instr: InstrRef) -> Option<RegNum> {
        self.regs.get(instr).copied()
    }

    pub fn reg_name(&self, instr: InstrRef) -> Option<String> {
        self.reg(instr).map(reg_name::<TM>)
    }

    /// Output mask of the value `instr` defines, `None` if it defines no register value.
    ///
    /// Tuples define no value themselves, their projections do.
    pub fn output_mask(&self, instr: InstrRef) -> Option<RegisterMask> {
        match &self.nodes[instr].instr {
            Instr::Pseudo(PseudoInstr::Proj(idx)) => {
                let tuple = *self.nodes[instr].inputs.first()?;
                self.instr(tuple).output_mask(*idx)
            }
            instr if instr.output_count() == 1 => instr.output_mask(0),
            _ => None,
        }
    }

    /// Whether `instr` defines a value that lives in a register or stack slot.
    pub fn defines_value(&self, instr: InstrRef) -> bool {
        self.instr(instr).is_phi() || self.output_mask(instr).is_some()
    }

    /// Block in which input `idx` of `user` is read. Phi inputs are read at the end of the matching
    /// predecessor.
    pub fn use_block(&self, user: InstrRef, idx: usize) -> BasicBlockId {
        let bb = self.block_of(user);
        if self.instr(user).is_phi() {
            self.basic_blocks[bb].preds[idx]
        } else {
            bb
        }
    }

    pub fn position(&self, instr: InstrRef) -> usize {
        let bb = self.block_of(instr);
        self.basic_blocks[bb]
            .instructions
            .iter()
            .position(|candidate| *candidate == instr)
            .expect("Instruction is not scheduled in its block")
    }

    pub fn loop_depth(&self, bb: BasicBlockId) -> u32 {
        self.cfg().loop_depth(bb)
    }

    /// Index of the predecessor that closes a loop headed by `bb`.
    pub fn backedge_index(&self, bb: BasicBlockId) -> Option<usize> {
        let cfg = self.cfg();
        self.basic_blocks[bb]
            .preds
            .iter()
            .position(|pred| cfg.dominates(bb, *pred))
    }

    pub fn is_loop_header(&self, bb: BasicBlockId) -> bool {
        self.backedge_index(bb).is_some()
    }

    /// Position right after `def`, past the phi, projection and entry pseudo group following it.
    pub fn position_after(&self, def: InstrRef) -> (BasicBlockId, usize) {
        let bb = self.block_of(def);
        let instructions = &self.basic_blocks[bb].instructions;
        let mut pos = self.position(def) + 1;
        while let Some(next) = instructions.get(pos) {
            let next = self.instr(*next);
            if !(next.is_phi() || next.is_proj() || next.is_entry_def()) {
                break;
            }
            pos += 1;
        }
        (bb, pos)
    }

    /// Position in `bb` in front of its terminators.
    pub fn position_before_terminators(&self, bb: BasicBlockId) -> usize {
        let instructions = &self.basic_blocks[bb].instructions;
        let mut pos = instructions.len();
        while pos > 0 && self.instr(instructions[pos - 1]).is_terminator() {
            pos -= 1;
        }
        pos
    }

    /// Position at which a copy feeding input `idx` of `user` has to be placed.
    pub fn position_before_use(&self, user: InstrRef, idx: usize) -> (BasicBlockId, usize) {
        if self.instr(user).is_phi() {
            let pred = self.use_block(user, idx);
            (pred, self.position_before_terminators(pred))
        } else {
            (self.block_of(user), self.position(user))
        }
    }

    pub(crate) fn insert_at(
        &mut self,
        bb: BasicBlockId,
        pos: usize,
        instr: Instr<TM>,
        inputs: &[InstrRef],
    ) -> InstrRef {
        let node = self.nodes.insert(Node {
            instr,
            inputs: inputs.into(),
            users: SmallVec::new(),
            bb,
        });
        for input in inputs {
            self.nodes[*input].users.push(node);
        }
        self.basic_blocks[bb].instructions.insert(pos, node);
        trace!("Inserted {} {} at {bb}:{pos}", node, self.instr(node));
        node
    }

    pub(crate) fn append(&mut self, bb: BasicBlockId, instr: Instr<TM>, inputs: &[InstrRef]) -> InstrRef {
        let pos = self.basic_blocks[bb].instructions.len();
        self.insert_at(bb, pos, instr, inputs)
    }

    pub(crate) fn push_input(&mut self, instr: InstrRef, input: InstrRef) {
        self.nodes[instr].inputs.push(input);
        self.nodes[input].users.push(instr);
    }

    pub(crate) fn set_input(&mut self, instr: InstrRef, idx: usize, input: InstrRef) {
        let old = self.nodes[instr].inputs[idx];
        if old == input {
            return;
        }
        self.remove_user(old, instr);
        self.nodes[instr].inputs[idx] = input;
        self.nodes[input].users.push(instr);
    }

    pub(crate) fn swap_inputs(&mut self, instr: InstrRef, a: usize, b: usize) {
        self.nodes[instr].inputs.swap(a, b);
    }

    /// Points every read of `old` at `new`.
    pub(crate) fn replace_all_uses(&mut self, old: InstrRef, new: InstrRef) {
        let users = self.nodes[old].users.iter().copied().unique().collect_vec();
        for user in users {
            for idx in 0..self.nodes[user].inputs.len() {
                if self.nodes[user].inputs[idx] == old {
                    self.set_input(user, idx, new);
                }
            }
        }
    }

    /// Removes an instruction nobody reads.
    pub(crate) fn remove(&mut self, instr: InstrRef) {
        assert!(
            self.nodes[instr].users.is_empty(),
            "Cannot remove {instr}, it is still in use"
        );
        let bb = self.block_of(instr);
        let pos = self.position(instr);
        self.basic_blocks[bb].instructions.remove(pos);
        let inputs = std::mem::take(&mut self.nodes[instr].inputs);
        for input in inputs {
            self.remove_user(input, instr);
        }
        self.nodes.remove(instr);
        self.regs.remove(instr);
        trace!("Removed {instr}");
    }

    fn remove_user(&mut self, def: InstrRef, user: InstrRef) {
        let users = &mut self.nodes[def].users;
        if let Some(pos) = users.iter().position(|candidate| *candidate == user) {
            users.remove(pos);
        }
    }

    /// Removes rematerializable values and copies that lost all of their users.
    pub(crate) fn remove_dead_copies(&mut self) -> usize {
        let mut removed = 0;
        loop {
            let dead = self
                .instructions()
                .filter(|instr| {
                    let node = &self.nodes[*instr];
                    node.users.is_empty() && (node.instr.is_split() || node.instr.is_clone())
                })
                .collect_vec();
            if dead.is_empty() {
                return removed;
            }
            for instr in dead {
                self.remove(instr);
                removed += 1;
            }
        }
    }

    pub fn build_cfg(&mut self) {
        let cfg = Cfg::build(&self.basic_blocks);
        self.cfg = Some(cfg);
    }

    pub const fn has_cfg(&self) -> bool {
        self.cfg.is_some()
    }

    pub fn cfg(&self) -> &Cfg {
        self.cfg.as_ref().expect("Cfg has not been built yet")
    }
}

impl<TM: TargetMachine> Display for Function<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "function {}:", self.name)?;
        for (bb_id, bb) in self.basic_blocks.iter_enumerated() {
            writeln!(f, "{bb_id}: ")?;
            for instr in &bb.instructions {
                write!(f, "  ")?;
                if self.defines_value(*instr) {
                    write!(f, "{instr} = ")?;
                }
                write!(f, "{}", self.instr(*instr))?;
                let inputs = self.inputs(*instr);
                if !inputs.is_empty() {
                    write!(f, " {}", inputs.iter().join(", "))?;
                }
                if let Some(reg) = self.reg_name(*instr) {
                    write!(f, " -> {reg}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
