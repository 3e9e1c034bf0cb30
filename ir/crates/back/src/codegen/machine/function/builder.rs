use smallvec::{
    smallvec,
    SmallVec,
};
use tracing::debug;

use crate::{
    codegen::machine::{
        backend::Backend,
        function::{
            cfg::BasicBlockId,
            Function,
            InstrRef,
        },
        instr::PseudoInstr,
        Instr,
        TargetMachine,
    },
    FxIndexMap,
};

/// Builds a scheduled machine function block by block.
///
/// Phi inputs may be added in any order and before their values exist, `build` orders them by the
/// predecessors of the phi's block.
#[derive(Debug)]
pub struct FunctionBuilder<TM: TargetMachine> {
    function: Function<TM>,
    current_bb: BasicBlockId,
    phi_inputs: FxIndexMap<InstrRef, SmallVec<[(BasicBlockId, InstrRef); 2]>>,
}

impl<TM: TargetMachine> FunctionBuilder<TM> {
    pub fn new(name: impl Into<String>) -> Self {
        let mut function = Function::new(name.into());
        let entry = function.create_bb();
        Self {
            function,
            current_bb: entry,
            phi_inputs: FxIndexMap::default(),
        }
    }

    pub const fn current_block(&self) -> BasicBlockId {
        self.current_bb
    }

    pub fn create_block(&mut self) -> BasicBlockId {
        self.function.create_bb()
    }

    pub fn switch_to_block(&mut self, bb: BasicBlockId) {
        self.current_bb = bb;
    }

    /// Defines the next parameter at the top of the entry block.
    pub fn param(&mut self) -> InstrRef {
        let idx = self.function.params.len();
        let entry = BasicBlockId::new(0);
        let param = self
            .function
            .insert_at(entry, idx, Instr::Pseudo(PseudoInstr::Param(idx)), &[]);
        self.function.params.push(param);
        param
    }

    pub fn instr(&mut self, instr: TM::Instr, inputs: &[InstrRef]) -> InstrRef {
        self.push(Instr::Machine(instr), inputs)
    }

    /// Creates one projection per output of `tuple`.
    pub fn projections(&mut self, tuple: InstrRef) -> SmallVec<[InstrRef; 2]> {
        let count = self.function.instr(tuple).output_count();
        (0..count)
            .map(|idx| self.push(Instr::Pseudo(PseudoInstr::Proj(idx)), &[tuple]))
            .collect()
    }

    pub fn phi(&mut self) -> InstrRef {
        let bb = self.current_bb;
        let pos = self.function.basic_blocks[bb]
            .instructions
            .iter()
            .take_while(|instr| self.function.instr(**instr).is_phi())
            .count();
        let phi = self
            .function
            .insert_at(bb, pos, Instr::Pseudo(PseudoInstr::Phi), &[]);
        self.phi_inputs.insert(phi, smallvec![]);
        phi
    }

    pub fn add_phi_input(&mut self, phi: InstrRef, pred: BasicBlockId, value: InstrRef) {
        self.phi_inputs
            .get_mut(&phi)
            .expect("Not a phi created by this builder")
            .push((pred, value));
    }

    pub fn jmp(&mut self, target: BasicBlockId) -> InstrRef {
        self.push(TM::Backend::jmp(target), &[])
    }

    pub fn ret(&mut self, value: Option<InstrRef>) -> InstrRef {
        let instr = Instr::Pseudo(PseudoInstr::Ret {
            has_value: value.is_some(),
            callee_saves: SmallVec::new(),
        });
        let inputs: SmallVec<[InstrRef; 1]> = value.into_iter().collect();
        self.push(instr, &inputs)
    }

    pub fn build(mut self) -> Function<TM> {
        debug!("Building machine function {}", self.function.name);
        for (phi, inputs) in std::mem::take(&mut self.phi_inputs) {
            let bb = self.function.block_of(phi);
            let preds = self.function.basic_blocks[bb].preds.clone();
            for pred in preds {
                let value = inputs
                    .iter()
                    .find_map(|(from, value)| (*from == pred).then_some(*value))
                    .unwrap_or_else(|| panic!("Phi {phi} has no input for predecessor {pred}"));
                self.function.push_input(phi, value);
            }
        }
        self.function.build_cfg();
        self.function
    }

    fn push(&mut self, instr: Instr<TM>, inputs: &[InstrRef]) -> InstrRef {
        let labels = instr.labels();
        let node = self.function.append(self.current_bb, instr, inputs);
        for target in labels {
            self.add_edge(self.current_bb, target);
        }
        node
    }

    fn add_edge(&mut self, from: BasicBlockId, to: BasicBlockId) {
        let succs = &mut self.function.basic_blocks[from].succs;
        if succs.contains(&to) {
            return;
        }
        succs.push(to);
        self.function.basic_blocks[to].preds.push(from);
    }
}
