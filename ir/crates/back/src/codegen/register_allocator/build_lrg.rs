use smallvec::SmallVec;
use tracing::trace;

use crate::codegen::{
    machine::{
        InstrRef,
        RegisterMask,
        TargetMachine,
    },
    register_allocator::{
        FailureKind,
        LrgId,
        RegAlloc,
    },
};

impl<TM: TargetMachine> RegAlloc<'_, TM> {
    /// Forms live ranges over the whole function and intersects their register masks.
    ///
    /// Returns `false` if some live range ended up without any allowed register.
    pub(super) fn build_live_ranges(&mut self) -> bool {
        let order = self.func.cfg().reverse_postorder().to_vec();
        for bb in order {
            let instrs = self.func.basic_blocks[bb].instructions.clone();
            for instr in instrs {
                if self.func.instr(instr).is_phi() {
                    self.build_phi(instr);
                    continue;
                }
                if self.func.instr(instr).commutes() && self.func.users(instr).len() == 1 {
                    self.maybe_commute(instr);
                }
                self.define(instr);
                self.record_uses(instr);
            }
        }
        self.unify();
        self.success()
    }

    /// A phi and all of its inputs share one live range.
    fn build_phi(&mut self, phi: InstrRef) {
        let inputs: SmallVec<[InstrRef; 3]> = self.func.inputs(phi).into();
        let existing = self
            .lrg(phi)
            .or_else(|| inputs.iter().find_map(|input| self.lrg(*input)));
        let mut lrg = match existing {
            Some(lrg) => lrg,
            None => self.new_lrg(phi),
        };
        lrg = self.union_into(lrg, phi);
        for input in inputs {
            lrg = self.union_into(lrg, input);
        }
        if self.lrgs[lrg].mask.is_empty() {
            self.fail(lrg, FailureKind::HardConflict);
        }
    }

    fn define(&mut self, instr: InstrRef) {
        let Some(mask) = self.func.output_mask(instr) else {
            return;
        };
        let lrg = match self.func.instr(instr).two_address() {
            Some(idx) => {
                let input = self.func.inputs(instr)[idx];
                let lrg = self.input_lrg(input);
                self.union_into(lrg, instr)
            }
            None => self.new_lrg(instr),
        };
        let split_depth = self.split_depth(instr);
        trace!("{instr} defines {lrg} with {mask:?}");
        if !self.lrgs[lrg].record_def(instr, mask, split_depth) {
            self.fail(lrg, FailureKind::HardConflict);
        }
    }

    fn record_uses(&mut self, instr: InstrRef) {
        let inputs: SmallVec<[InstrRef; 3]> = self.func.inputs(instr).into();
        let split_depth = self.split_depth(instr);
        for (idx, input) in inputs.into_iter().enumerate() {
            let Some(mask) = self.func.instr(instr).input_mask(idx) else {
                continue;
            };
            let Some(lrg) = self.lrg(input) else {
                continue;
            };
            if !self.lrgs[lrg].record_use(instr, idx, mask, split_depth) {
                self.fail(lrg, FailureKind::HardConflict);
            }
        }
    }

    fn input_lrg(&mut self, input: InstrRef) -> LrgId {
        match self.lrg(input) {
            Some(lrg) => lrg,
            None => self.new_lrg(input),
        }
    }

    /// Swaps the inputs of a commutative instruction if only its second input can satisfy the mask
    /// its single user wants.
    fn maybe_commute(&mut self, instr: InstrRef) {
        let inputs: SmallVec<[InstrRef; 3]> = self.func.inputs(instr).into();
        if inputs.len() < 2 {
            return;
        }
        let user = self.func.users(instr)[0];
        let Some(user_idx) = self
            .func
            .inputs(user)
            .iter()
            .position(|input| *input == instr)
        else {
            return;
        };
        let wanted = if self.func.instr(user).is_phi() {
            self.lrg(instr).map(|lrg| self.lrgs[lrg].mask)
        } else {
            self.func.instr(user).input_mask(user_idx)
        };
        let (Some(lhs), Some(rhs), Some(wanted)) = (
            self.value_mask(inputs[0]),
            self.value_mask(inputs[1]),
            wanted,
        ) else {
            return;
        };
        if !lhs.overlaps(wanted) && rhs.overlaps(wanted) {
            trace!("Commuting {instr}");
            self.func.swap_inputs(instr, 0, 1);
        }
    }

    fn value_mask(&mut self, value: InstrRef) -> Option<RegisterMask> {
        if self.func.instr(value).is_phi() {
            Some(
                self.lrg(value)
                    .map_or(RegisterMask::FULL, |lrg| self.lrgs[lrg].mask),
            )
        } else {
            self.func.output_mask(value)
        }
    }
}
