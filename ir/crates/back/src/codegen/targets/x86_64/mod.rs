use std::fmt::{
    Display,
    Formatter,
};

use smallvec::{
    smallvec,
    SmallVec,
};
use strum::VariantArray;

use machine::instr::Instr as MInstr;

use crate::codegen::{
    machine,
    machine::{
        abi::CallingConvention,
        backend,
        function::BasicBlockId,
        instr::PseudoInstr,
        isa::PhysicalRegister as MachPhysicalRegister,
        reg::{
            RegNum,
            RegisterMask,
        },
        TargetMachine,
    },
};
use crate::codegen::targets::calling_convention::systemv::SystemV;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Target;

impl TargetMachine for Target {
    type Reg = PhysicalRegister;
    type Instr = Instr;
    type CallingConvention = SystemV;
    type Backend = Backend;

    fn gpr_mask() -> RegisterMask {
        GPR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, VariantArray)]
#[strum(serialize_all = "lowercase")]
pub enum PhysicalRegister {
    RAX,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    FLAGS,
}

impl PhysicalRegister {
    pub const fn mask(self) -> RegisterMask {
        RegisterMask::single(self as RegNum)
    }
}

impl MachPhysicalRegister for PhysicalRegister {
    fn name(&self) -> &'static str {
        self.into()
    }

    fn all() -> &'static [Self] {
        Self::VARIANTS
    }

    fn index(self) -> RegNum {
        self as RegNum
    }
}

/// Every 64-bit general purpose register except the stack pointer.
pub const GPR: RegisterMask = RegisterMask::from_bits(0xffff).without(PhysicalRegister::RSP as RegNum);

pub const FLAGS: RegisterMask = PhysicalRegister::FLAGS.mask();

/// The divisor of `idiv` may not overlap the implicit `rdx:rax` operands.
const DIVISOR: RegisterMask = GPR
    .without(PhysicalRegister::RAX as RegNum)
    .without(PhysicalRegister::RDX as RegNum);

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum CC {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// x86-64 instructions in SSA form. Register operands are the inputs of the instruction node, the
/// result is the node itself.
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
pub enum Instr {
    MOV64ri { immediate: i64 },
    /// `xor r, r`
    MOV64r0,
    ADD64rr,
    ADD64ri { immediate: i64 },
    SUB64rr,
    IMUL64rr,
    /// Signed division of `rdx:rax`, produces quotient and remainder.
    IDIV64r,
    CMP64rr,
    CMP64ri { immediate: i64 },
    JCC { cc: CC, target: BasicBlockId },
    JMP { target: BasicBlockId },
    /// Call with `args` register arguments.
    CALL64 { callee: &'static str, args: usize },
}

impl machine::isa::MachInstr for Instr {
    type TM = Target;

    fn name(&self) -> &'static str {
        self.into()
    }

    fn input_mask(&self, idx: usize) -> Option<RegisterMask> {
        match self {
            Self::MOV64ri { .. } | Self::MOV64r0 | Self::JMP { .. } => None,
            Self::ADD64rr | Self::SUB64rr | Self::IMUL64rr | Self::CMP64rr => (idx < 2).then_some(GPR),
            Self::ADD64ri { .. } | Self::CMP64ri { .. } => (idx == 0).then_some(GPR),
            Self::IDIV64r => match idx {
                0 => Some(PhysicalRegister::RAX.mask()),
                1 => Some(DIVISOR),
                _ => None,
            },
            Self::JCC { .. } => (idx == 0).then_some(FLAGS),
            Self::CALL64 { args, .. } => (idx < *args).then(|| SystemV::arg_mask(idx)),
        }
    }

    fn output_mask(&self, idx: usize) -> Option<RegisterMask> {
        match self {
            Self::MOV64ri { .. }
            | Self::MOV64r0
            | Self::ADD64rr
            | Self::ADD64ri { .. }
            | Self::SUB64rr
            | Self::IMUL64rr => (idx == 0).then_some(GPR),
            Self::IDIV64r => match idx {
                0 => Some(PhysicalRegister::RAX.mask()),
                1 => Some(PhysicalRegister::RDX.mask()),
                _ => None,
            },
            Self::CMP64rr | Self::CMP64ri { .. } => (idx == 0).then_some(FLAGS),
            Self::CALL64 { .. } => (idx == 0).then(SystemV::return_mask),
            Self::JCC { .. } | Self::JMP { .. } => None,
        }
    }

    fn output_count(&self) -> usize {
        match self {
            Self::IDIV64r => 2,
            Self::JCC { .. } | Self::JMP { .. } => 0,
            _ => 1,
        }
    }

    fn two_address(&self) -> Option<usize> {
        match self {
            Self::ADD64rr | Self::ADD64ri { .. } | Self::SUB64rr | Self::IMUL64rr => Some(0),
            _ => None,
        }
    }

    fn kill_mask(&self) -> Option<RegisterMask> {
        match self {
            Self::MOV64r0 => Some(FLAGS),
            Self::CALL64 { .. } => Some(SystemV::caller_save()),
            _ => None,
        }
    }

    fn commutes(&self) -> bool {
        matches!(self, Self::ADD64rr | Self::IMUL64rr)
    }

    fn is_clone(&self) -> bool {
        matches!(self, Self::MOV64ri { .. } | Self::MOV64r0)
    }

    fn is_call(&self) -> bool {
        matches!(self, Self::CALL64 { .. })
    }

    fn labels(&self) -> SmallVec<[BasicBlockId; 2]> {
        match self {
            Self::JCC { target, .. } | Self::JMP { target } => smallvec![*target],
            _ => smallvec![],
        }
    }
}

impl Display for Instr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name: &'static str = self.into();
        write!(f, "{name}")?;
        match self {
            Self::MOV64ri { immediate } | Self::ADD64ri { immediate } | Self::CMP64ri { immediate } => {
                write!(f, " ${immediate}")
            }
            Self::JCC { cc, target } => {
                let cc: &'static str = cc.into();
                write!(f, " {cc} {target}")
            }
            Self::JMP { target } => write!(f, " {target}"),
            Self::CALL64 { callee, .. } => write!(f, " @{callee}"),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct Backend;

impl backend::Backend for Backend {
    type TM = Target;

    fn split(kind: &'static str, round: u8) -> MInstr<Self::TM> {
        MInstr::Pseudo(PseudoInstr::Split { kind, round })
    }

    fn jmp(target: BasicBlockId) -> MInstr<Self::TM> {
        MInstr::Machine(Instr::JMP { target })
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::{
        machine::{
            abi::CallingConvention,
            isa::MachInstr,
            reg::RegisterMask,
            TargetMachine,
        },
        targets::{
            calling_convention::systemv::SystemV,
            x86_64::{
                Instr,
                PhysicalRegister,
                Target,
                GPR,
            },
        },
    };

    #[test]
    fn should_describe_division_constraints() {
        let idiv = Instr::IDIV64r;
        assert_eq!(idiv.output_count(), 2);
        assert_eq!(idiv.output_mask(0), Some(PhysicalRegister::RAX.mask()));
        assert_eq!(idiv.output_mask(1), Some(PhysicalRegister::RDX.mask()));
        let divisor = idiv.input_mask(1).unwrap();
        assert!(!divisor.contains(PhysicalRegister::RAX as u8));
        assert!(!divisor.contains(PhysicalRegister::RDX as u8));
    }

    #[test]
    fn should_pass_arguments_past_the_sixth_on_the_stack() {
        assert_eq!(SystemV::arg_mask(0), PhysicalRegister::RDI.mask());
        assert_eq!(SystemV::arg_mask(5), PhysicalRegister::R9.mask());
        assert_eq!(SystemV::arg_mask(6), RegisterMask::single(Target::reg_count()));
        assert!(Target::split_mask().contains(Target::reg_count() + 3));
    }

    #[test]
    fn should_split_registers_into_saved_classes() {
        let callee_save = SystemV::callee_save();
        assert_eq!(callee_save.cardinality(), 6);
        assert!(callee_save.contains(PhysicalRegister::RBX as u8));
        assert!(!callee_save.contains(PhysicalRegister::RSP as u8));
        assert!(!callee_save.overlaps(SystemV::caller_save()));
        assert!(GPR.subtract(callee_save).subtract(SystemV::caller_save()).is_empty());
    }
}
