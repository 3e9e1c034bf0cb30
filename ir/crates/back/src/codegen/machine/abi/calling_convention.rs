use crate::codegen::machine::{
    isa::PhysicalRegister,
    reg::{
        RegNum,
        RegisterMask,
    },
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Slot<R: PhysicalRegister> {
    Register(R),
    /// The n-th stack passed argument.
    Stack(usize),
}

pub trait CallingConvention {
    type Reg: PhysicalRegister;

    fn parameter_slot(idx: usize) -> Slot<Self::Reg>;

    fn return_slot() -> Slot<Self::Reg>;

    fn caller_save() -> RegisterMask;

    /// Registers the allocator must never hand out, such as the stack pointer.
    fn never_save() -> RegisterMask;

    fn callee_save() -> RegisterMask {
        let all = RegisterMask::from_regs(Self::Reg::all().iter().map(|reg| reg.index()));
        all.subtract(Self::caller_save())
            .subtract(Self::never_save())
    }

    fn arg_mask(idx: usize) -> RegisterMask {
        slot_mask(Self::parameter_slot(idx))
    }

    fn return_mask() -> RegisterMask {
        slot_mask(Self::return_slot())
    }
}

/// Stack slots past the end of the register space get an empty mask.
fn slot_mask<R: PhysicalRegister>(slot: Slot<R>) -> RegisterMask {
    match slot {
        Slot::Register(reg) => reg.mask(),
        Slot::Stack(n) => R::all()
            .len()
            .checked_add(n)
            .and_then(|reg| RegNum::try_from(reg).ok())
            .map_or(RegisterMask::EMPTY, RegisterMask::single),
    }
}
