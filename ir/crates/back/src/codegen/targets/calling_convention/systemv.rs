use crate::codegen::{
    machine::{
        abi::{
            calling_convention::Slot,
            CallingConvention,
        },
        reg::RegisterMask,
    },
    targets::x86_64::{
        self,
        PhysicalRegister,
    },
};

#[derive(Default)]
pub struct SystemV;

impl CallingConvention for SystemV {
    type Reg = x86_64::PhysicalRegister;

    fn parameter_slot(idx: usize) -> Slot<Self::Reg> {
        let reg = match idx {
            0 => Self::Reg::RDI,
            1 => Self::Reg::RSI,
            2 => Self::Reg::RDX,
            3 => Self::Reg::RCX,
            4 => Self::Reg::R8,
            5 => Self::Reg::R9,
            _ => return Slot::Stack(idx - 6),
        };
        Slot::Register(reg)
    }

    fn return_slot() -> Slot<Self::Reg> {
        Slot::Register(Self::Reg::RAX)
    }

    fn caller_save() -> RegisterMask {
        [
            PhysicalRegister::RAX,
            PhysicalRegister::RCX,
            PhysicalRegister::RDX,
            PhysicalRegister::RSI,
            PhysicalRegister::RDI,
            PhysicalRegister::R8,
            PhysicalRegister::R9,
            PhysicalRegister::R10,
            PhysicalRegister::R11,
        ]
        .into_iter()
        .fold(x86_64::FLAGS, |mask, reg| mask.union(reg.mask()))
    }

    fn never_save() -> RegisterMask {
        PhysicalRegister::RSP.mask()
    }
}
