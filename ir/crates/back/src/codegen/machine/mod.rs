use std::fmt::Debug;

pub use backend::Backend;
pub use function::{
    builder::FunctionBuilder,
    BasicBlockId,
    Function,
    FunctionId,
    InstrRef,
};
pub use instr::{
    Instr,
    PseudoInstr,
};
pub use isa::{
    MachInstr,
    PhysicalRegister,
};
pub use module::Module;
pub use reg::{
    RegNum,
    RegisterMask,
    RegisterMaskRw,
};

use crate::codegen::machine::abi::CallingConvention;

pub mod abi;
pub mod isa;
pub mod module;
pub mod reg;

pub mod function;
pub mod instr;

pub mod backend;

pub trait TargetMachine: Debug + Default + Copy + Clone + PartialEq + Eq + 'static {
    type Reg: PhysicalRegister;

    type Instr: MachInstr<TM = Self>;

    type CallingConvention: CallingConvention<Reg = Self::Reg>;

    type Backend: Backend<TM = Self>;

    /// Number of physical registers. Register numbers at or above this are stack slots.
    #[allow(clippy::cast_possible_truncation)]
    fn reg_count() -> RegNum {
        Self::Reg::all().len() as RegNum
    }

    /// Registers a general purpose value may live in.
    fn gpr_mask() -> RegisterMask;

    fn stack_mask() -> RegisterMask {
        RegisterMask::from_start(Self::reg_count())
    }

    /// Locations a split may copy a value into.
    fn split_mask() -> RegisterMask {
        Self::gpr_mask().union(Self::stack_mask())
    }
}
