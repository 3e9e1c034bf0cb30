use std::{
    fmt::{
        Debug,
        Display,
    },
    hash::Hash,
};

use smallvec::SmallVec;

use crate::codegen::machine::{
    function::BasicBlockId,
    reg::{
        RegNum,
        RegisterMask,
    },
    TargetMachine,
};

pub trait PhysicalRegister: Debug + Clone + Copy + PartialEq + Eq + Hash + Sized + 'static {
    fn name(&self) -> &'static str;

    fn all() -> &'static [Self];

    /// The register number of this register. Must match its position in [`PhysicalRegister::all`].
    fn index(self) -> RegNum;

    fn from_index(index: RegNum) -> Option<Self> {
        Self::all().get(usize::from(index)).copied()
    }

    fn mask(self) -> RegisterMask {
        RegisterMask::single(self.index())
    }
}

/// Register constraints of a target instruction.
///
/// Inputs and outputs are numbered in operand order. Returning `None` from a mask query means the
/// operand does not live in a register (labels, immediates) and is ignored by the allocator.
pub trait MachInstr: Debug + Display + PartialEq + Eq + Clone {
    type TM: TargetMachine;

    fn name(&self) -> &'static str;

    fn input_mask(&self, idx: usize) -> Option<RegisterMask>;

    fn output_mask(&self, idx: usize) -> Option<RegisterMask>;

    /// Instructions with more than one output are tuples, their results are read through projections.
    fn output_count(&self) -> usize {
        1
    }

    /// Index of the input that must share the output register.
    fn two_address(&self) -> Option<usize> {
        None
    }

    /// Registers destroyed by this instruction in addition to its outputs.
    fn kill_mask(&self) -> Option<RegisterMask> {
        None
    }

    fn commutes(&self) -> bool {
        false
    }

    /// Cheap enough to recompute at every use instead of keeping it in a register.
    fn is_clone(&self) -> bool {
        false
    }

    fn is_call(&self) -> bool {
        false
    }

    fn labels(&self) -> SmallVec<[BasicBlockId; 2]> {
        SmallVec::new()
    }

    fn is_terminator(&self) -> bool {
        !self.labels().is_empty()
    }
}
