use index_vec::IndexVec;
use itertools::Itertools;
use thiserror::Error;
use tracing::debug;

use crate::{
    codegen::machine::{
        reg::reg_name,
        BasicBlockId,
        Function,
        InstrRef,
        TargetMachine,
    },
    FxIndexSet,
};

/// A violation of the register assignment found by the [`Verifier`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("{instr} defines a value but has no register")]
    Unassigned { instr: InstrRef },
    #[error("{def} is defined into {reg} while {live} still lives there")]
    Interference {
        def: InstrRef,
        live: InstrRef,
        reg: String,
    },
    #[error("{instr} is assigned {reg} which its output mask does not allow")]
    OutputConstraint { instr: InstrRef, reg: String },
    #[error("input {idx} of {instr} is read from {reg} which its input mask does not allow")]
    InputConstraint {
        instr: InstrRef,
        idx: usize,
        reg: String,
    },
    #[error("{instr} does not write its result over input {idx}")]
    TwoAddress { instr: InstrRef, idx: usize },
    #[error("input {idx} of {phi} is not in the register of the phi")]
    PhiMismatch { phi: InstrRef, idx: usize },
    #[error("{value} lives in {reg} across {killer} which clobbers it")]
    Clobbered {
        value: InstrRef,
        killer: InstrRef,
        reg: String,
    },
    #[error("{split} copies its input into the register it already is in")]
    NoopSplit { split: InstrRef },
}

/// Checks an allocated function against the constraints of its instructions.
///
/// Liveness is recomputed on values rather than live ranges, so the verifier does not trust
/// anything the allocator computed besides the final registers.
pub struct Verifier<'func, TM: TargetMachine> {
    func: &'func Function<TM>,
    noop_splits: bool,
}

impl<'func, TM: TargetMachine> Verifier<'func, TM> {
    pub const fn new(func: &'func Function<TM>) -> Self {
        Self {
            func,
            noop_splits: true,
        }
    }

    /// Whether splits between identical registers are reported.
    #[must_use]
    pub const fn check_noop_splits(mut self, check: bool) -> Self {
        self.noop_splits = check;
        self
    }

    pub fn verify(&self) -> Vec<VerifyError> {
        debug!("Verifying register assignment of {}", self.func.name);
        let mut errors = Vec::new();
        for instr in self.func.instructions() {
            self.verify_constraints(instr, &mut errors);
        }
        let live_outs = self.live_outs();
        for (bb, live_out) in live_outs.into_iter_enumerated() {
            let mut live = live_out;
            self.scan_block(bb, &mut live, &mut errors);
        }
        if !errors.is_empty() {
            debug!("Found {} errors: {}", errors.len(), errors.iter().join("; "));
        }
        errors
    }

    fn verify_constraints(&self, instr: InstrRef, errors: &mut Vec<VerifyError>) {
        let node = self.func.instr(instr);
        let inputs = self.func.inputs(instr);
        let reg = self.func.reg(instr);
        if self.func.defines_value(instr) {
            match (reg, self.func.output_mask(instr)) {
                (None, _) => errors.push(VerifyError::Unassigned { instr }),
                (Some(reg), Some(mask)) if !mask.contains(reg) => {
                    errors.push(VerifyError::OutputConstraint {
                        instr,
                        reg: reg_name::<TM>(reg),
                    });
                }
                _ => {}
            }
        }

        if node.is_phi() {
            for (idx, input) in inputs.iter().enumerate() {
                if self.func.reg(*input) != reg {
                    errors.push(VerifyError::PhiMismatch { phi: instr, idx });
                }
            }
            return;
        }
        for (idx, input) in inputs.iter().enumerate() {
            let (Some(mask), Some(input_reg)) = (node.input_mask(idx), self.func.reg(*input)) else {
                continue;
            };
            if !mask.contains(input_reg) {
                errors.push(VerifyError::InputConstraint {
                    instr,
                    idx,
                    reg: reg_name::<TM>(input_reg),
                });
            }
        }
        if let Some(idx) = node.two_address() {
            if reg.is_some() && reg != self.func.reg(inputs[idx]) {
                errors.push(VerifyError::TwoAddress { instr, idx });
            }
        }
        if self.noop_splits && node.is_split() && reg.is_some() && reg == self.func.reg(inputs[0]) {
            errors.push(VerifyError::NoopSplit { split: instr });
        }
    }

    /// Values live at the end of each block, phi inputs included.
    fn live_outs(&self) -> IndexVec<BasicBlockId, FxIndexSet<InstrRef>> {
        let blocks = self.func.basic_blocks.len();
        let mut live_outs: IndexVec<BasicBlockId, FxIndexSet<InstrRef>> =
            (0..blocks).map(|_| FxIndexSet::default()).collect();
        let order = self
            .func
            .cfg()
            .reverse_postorder()
            .iter()
            .rev()
            .copied()
            .collect_vec();
        let mut changed = true;
        while changed {
            changed = false;
            for bb in order.iter().copied() {
                let mut live_out = FxIndexSet::default();
                for succ in self.func.basic_blocks[bb].succs().iter().copied() {
                    let mut live_in = live_outs[succ].clone();
                    self.scan_block(succ, &mut live_in, &mut Vec::new());
                    live_out.extend(live_in);
                    let Some(pred_idx) = self.func.basic_blocks[succ]
                        .preds()
                        .iter()
                        .position(|pred| *pred == bb)
                    else {
                        continue;
                    };
                    for instr in &self.func.basic_blocks[succ].instructions {
                        if !self.func.instr(*instr).is_phi() {
                            break;
                        }
                        live_out.insert(self.func.inputs(*instr)[pred_idx]);
                    }
                }
                if live_out.len() != live_outs[bb].len() {
                    live_outs[bb] = live_out;
                    changed = true;
                }
            }
        }
        live_outs
    }

    /// Walks `bb` backwards turning `live` from its live-out into its live-in set, recording every
    /// conflict on the way.
    fn scan_block(
        &self,
        bb: BasicBlockId,
        live: &mut FxIndexSet<InstrRef>,
        errors: &mut Vec<VerifyError>,
    ) {
        let instructions = &self.func.basic_blocks[bb].instructions;
        for instr in instructions.iter().rev().copied() {
            let node = self.func.instr(instr);
            if node.is_phi() {
                continue;
            }
            if self.func.defines_value(instr) {
                live.shift_remove(&instr);
                self.check_def(instr, live.iter().copied(), errors);
            }
            if let Some(kill) = node.kill_mask() {
                for value in live.iter().copied() {
                    let Some(reg) = self.func.reg(value) else {
                        continue;
                    };
                    if kill.contains(reg) {
                        errors.push(VerifyError::Clobbered {
                            value,
                            killer: instr,
                            reg: reg_name::<TM>(reg),
                        });
                    }
                }
            }
            for input in self.func.inputs(instr) {
                if self.func.defines_value(*input) {
                    live.insert(*input);
                }
            }
        }

        // Phis are defined all at once at the block head.
        let phis = instructions
            .iter()
            .copied()
            .take_while(|instr| self.func.instr(*instr).is_phi())
            .collect_vec();
        for phi in &phis {
            live.shift_remove(phi);
        }
        for (idx, phi) in phis.iter().enumerate() {
            let others = live.iter().chain(&phis[..idx]).copied();
            self.check_def(*phi, others, errors);
        }
    }

    fn check_def(
        &self,
        def: InstrRef,
        live: impl Iterator<Item = InstrRef>,
        errors: &mut Vec<VerifyError>,
    ) {
        let Some(reg) = self.func.reg(def) else {
            return;
        };
        let root = self.root(def);
        for other in live {
            if self.func.reg(other) == Some(reg) && self.root(other) != root {
                errors.push(VerifyError::Interference {
                    def,
                    live: other,
                    reg: reg_name::<TM>(reg),
                });
            }
        }
    }

    /// The value a chain of splits copies.
    fn root(&self, value: InstrRef) -> InstrRef {
        let mut value = value;
        while self.func.instr(value).is_split() {
            value = self.func.inputs(value)[0];
        }
        value
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
            PhysicalRegister as _,
        },
        register_allocator::{
            RegAlloc,
            RegAllocConfig,
            Verifier,
            VerifyError,
        },
        targets::x86_64::{
            Backend,
            Instr,
            PhysicalRegister,
            Target,
        },
    };

    #[test]
    #[traced_test]
    fn should_accept_allocated_functions() {
        let mut function = crate::test::loop_function();
        RegAlloc::new(&mut function, RegAllocConfig::new()).run().unwrap();
        assert_eq!(Verifier::new(&function).verify(), vec![]);
    }

    #[test]
    #[traced_test]
    fn should_report_values_sharing_a_register() {
        let mut builder = FunctionBuilder::<Target>::new("interference");
        let a = builder.instr(Instr::MOV64ri { immediate: 1 }, &[]);
        let b = builder.instr(Instr::MOV64ri { immediate: 2 }, &[]);
        let c = builder.instr(Instr::ADD64rr, &[a, b]);
        builder.ret(Some(c));
        let mut function = builder.build();
        for value in [a, b, c] {
            function.regs.insert(value, PhysicalRegister::RAX.index());
        }
        assert_eq!(
            Verifier::new(&function).verify(),
            vec![VerifyError::Interference {
                def: b,
                live: a,
                reg: "rax".to_string(),
            }]
        );
    }

    #[test]
    #[traced_test]
    fn should_report_unassigned_and_two_address_violations() {
        let mut builder = FunctionBuilder::<Target>::new("two_address");
        let a = builder.param();
        let b = builder.instr(Instr::ADD64ri { immediate: 1 }, &[a]);
        let c = builder.instr(Instr::ADD64ri { immediate: 2 }, &[b]);
        builder.ret(Some(c));
        let mut function = builder.build();
        function.regs.insert(a, PhysicalRegister::RDI.index());
        function.regs.insert(b, PhysicalRegister::RAX.index());
        let errors = Verifier::new(&function).verify();
        assert_eq!(
            errors,
            vec![
                VerifyError::TwoAddress { instr: b, idx: 0 },
                VerifyError::Unassigned { instr: c },
            ]
        );
        assert_eq!(errors[1].to_string(), format!("{c} defines a value but has no register"));
    }

    #[test]
    #[traced_test]
    fn should_report_noop_splits_only_when_asked() {
        let mut builder = FunctionBuilder::<Target>::new("noop");
        let a = builder.param();
        let ret = builder.ret(Some(a));
        let mut function = builder.build();
        let split = function.insert_at(BasicBlockId::new(0), 1, Backend::split("test", 0), &[a]);
        function.set_input(ret, 0, split);
        function.regs.insert(a, PhysicalRegister::RDI.index());
        function.regs.insert(split, PhysicalRegister::RDI.index());

        let input = VerifyError::InputConstraint {
            instr: ret,
            idx: 0,
            reg: "rdi".to_string(),
        };
        assert_eq!(
            Verifier::new(&function).verify(),
            vec![VerifyError::NoopSplit { split }, input.clone()]
        );
        assert_eq!(
            Verifier::new(&function).check_noop_splits(false).verify(),
            vec![input]
        );
    }

    #[test]
    #[traced_test]
    fn should_report_values_clobbered_by_calls() {
        let mut builder = FunctionBuilder::<Target>::new("clobber");
        let a = builder.param();
        let call = builder.instr(Instr::CALL64 { callee: "f", args: 0 }, &[]);
        let sum = builder.instr(Instr::ADD64rr, &[call, a]);
        builder.ret(Some(sum));
        let mut function = builder.build();
        function.regs.insert(a, PhysicalRegister::RDI.index());
        function.regs.insert(call, PhysicalRegister::RAX.index());
        function.regs.insert(sum, PhysicalRegister::RAX.index());
        assert_eq!(
            Verifier::new(&function).verify(),
            vec![VerifyError::Clobbered {
                value: a,
                killer: call,
                reg: "rdi".to_string(),
            }]
        );
    }
}
