use itertools::Itertools;
use tracing::{
    debug,
    info,
};

use crate::codegen::{
    machine::{
        Function,
        InstrRef,
        RegNum,
        TargetMachine,
    },
    register_allocator::spill_cost,
};

/// Removes splits whose source and destination ended up in the same register after coloring.
///
/// A split that still moves its value gets rewired past earlier same-block splits if the original
/// source already sits in the destination register.
pub struct Coalescer<'func, TM: TargetMachine> {
    func: &'func mut Function<TM>,
    pub removed: usize,
    pub spills: usize,
    pub spill_cost: u64,
}

impl<'func, TM: TargetMachine> Coalescer<'func, TM> {
    pub fn new(func: &'func mut Function<TM>) -> Self {
        Self {
            func,
            removed: 0,
            spills: 0,
            spill_cost: 0,
        }
    }

    pub fn run(&mut self) {
        info!("Running register coalescer for function {}", self.func.name);
        let blocks = self.func.basic_blocks.indices().collect_vec();
        for bb in blocks.iter().copied() {
            let instructions = self.func.basic_blocks[bb].instructions.clone();
            for split in instructions {
                if !self.func.contains(split) || !self.func.instr(split).is_split() {
                    continue;
                }
                let Some(def_reg) = self.func.reg(split) else {
                    continue;
                };
                let source = self.func.inputs(split)[0];
                let mut use_reg = self.func.reg(source);
                if use_reg != Some(def_reg) && self.bypass(split, def_reg) {
                    use_reg = self.func.reg(self.func.inputs(split)[0]);
                }
                if use_reg == Some(def_reg) {
                    debug!("Removing redundant split {split}");
                    let source = self.func.inputs(split)[0];
                    self.func.replace_all_uses(split, source);
                    self.func.remove(split);
                    self.removed += 1;
                }
            }
        }
        self.removed += self.func.remove_dead_copies();

        for bb in blocks {
            let cost = spill_cost(self.func.loop_depth(bb));
            for instr in &self.func.basic_blocks[bb].instructions {
                if self.func.instr(*instr).is_split() {
                    self.spills += 1;
                    self.spill_cost += cost;
                }
            }
        }
    }

    /// Walks up the chain of same-block splits feeding `split` looking for a value already in
    /// `def_reg`, and reads that value directly if the register is untouched in between.
    fn bypass(&mut self, split: InstrRef, def_reg: RegNum) -> bool {
        let bb = self.func.block_of(split);
        let mut hop = self.func.inputs(split)[0];
        let source = loop {
            if !self.func.instr(hop).is_split() || self.func.block_of(hop) != bb {
                return false;
            }
            let source = self.func.inputs(hop)[0];
            if self.func.reg(source) == Some(def_reg) {
                break source;
            }
            hop = source;
        };

        let (from, to) = (self.func.position(hop), self.func.position(split));
        let clobbered = self.func.basic_blocks[bb].instructions[from + 1..to]
            .iter()
            .any(|instr| {
                self.func.reg(*instr) == Some(def_reg)
                    || self
                        .func
                        .instr(*instr)
                        .kill_mask()
                        .is_some_and(|kill| kill.contains(def_reg))
            });
        if clobbered {
            return false;
        }
        debug!("Bypassing {hop} for {split}");
        self.func.set_input(split, 0, source);
        true
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use crate::codegen::{
        machine::{
            backend::Backend as _,
            BasicBlockId,
            FunctionBuilder,
            Instr as MInstr,
            PhysicalRegister as _,
        },
        register_allocator::Coalescer,
        targets::x86_64::{
            Backend,
            Instr,
            PhysicalRegister,
            Target,
        },
    };

    #[test]
    #[traced_test]
    fn should_remove_splits_into_the_same_register() {
        let mut builder = FunctionBuilder::<Target>::new("noop");
        let a = builder.param();
        let ret = builder.ret(Some(a));
        let mut function = builder.build();
        let entry = BasicBlockId::new(0);
        let split = function.insert_at(entry, 1, Backend::split("test", 0), &[a]);
        function.set_input(ret, 0, split);
        function.regs.insert(a, PhysicalRegister::RAX.index());
        function.regs.insert(split, PhysicalRegister::RAX.index());

        let mut coalescer = Coalescer::new(&mut function);
        coalescer.run();
        assert_eq!(coalescer.removed, 1);
        assert_eq!(coalescer.spills, 0);
        assert!(!function.contains(split));
        assert_eq!(function.inputs(ret), &[a]);
    }

    #[test]
    #[traced_test]
    fn should_bypass_split_chains() {
        let mut builder = FunctionBuilder::<Target>::new("bypass");
        let a = builder.param();
        let ret = builder.ret(Some(a));
        let mut function = builder.build();
        let entry = BasicBlockId::new(0);
        let hi = function.insert_at(entry, 1, Backend::split("hi", 0), &[a]);
        let lo = function.insert_at(entry, 2, Backend::split("lo", 0), &[hi]);
        function.set_input(ret, 0, lo);
        function.regs.insert(a, PhysicalRegister::RDI.index());
        function.regs.insert(hi, PhysicalRegister::RAX.index());
        function.regs.insert(lo, PhysicalRegister::RDI.index());

        let mut coalescer = Coalescer::new(&mut function);
        coalescer.run();
        // `hi` loses its only user to the bypass.
        assert_eq!(coalescer.removed, 2);
        assert_eq!(coalescer.spills, 0);
        assert!(!function.contains(lo));
        assert!(!function.contains(hi));
        assert_eq!(function.inputs(ret), &[a]);
    }

    #[test]
    #[traced_test]
    fn should_not_bypass_clobbered_registers() {
        let mut builder = FunctionBuilder::<Target>::new("clobber");
        let a = builder.param();
        let entry = builder.current_block();
        let call = builder.instr(Instr::CALL64 { callee: "f", args: 0 }, &[]);
        let ret = builder.ret(Some(call));
        let mut function = builder.build();
        let hi = function.insert_at(entry, 1, Backend::split("hi", 0), &[a]);
        let lo = function.insert_at(entry, 3, Backend::split("lo", 0), &[hi]);
        let sum = function.insert_at(entry, 4, MInstr::Machine(Instr::ADD64rr), &[call, lo]);
        function.set_input(ret, 0, sum);
        function.regs.insert(a, PhysicalRegister::RDI.index());
        function.regs.insert(hi, PhysicalRegister::RBX.index());
        function.regs.insert(call, PhysicalRegister::RAX.index());
        function.regs.insert(lo, PhysicalRegister::RDI.index());
        function.regs.insert(sum, PhysicalRegister::RAX.index());

        let mut coalescer = Coalescer::new(&mut function);
        coalescer.run();
        assert_eq!(coalescer.removed, 0);
        assert_eq!(coalescer.spills, 2);
        assert_eq!(coalescer.spill_cost, 2);
        assert_eq!(function.inputs(lo), &[hi]);
    }
}
