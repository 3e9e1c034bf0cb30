use std::fmt::{
    Display,
    Formatter,
};

use smallvec::SmallVec;

use crate::codegen::machine::{
    abi::CallingConvention,
    function::BasicBlockId,
    isa::MachInstr as MInstr,
    reg::{
        RegNum,
        RegisterMask,
    },
    TargetMachine,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr<TM: TargetMachine> {
    Pseudo(PseudoInstr),
    Machine(TM::Instr),
}

type CC<TM> = <TM as TargetMachine>::CallingConvention;

impl<TM: TargetMachine> Instr<TM> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pseudo(pseudo) => pseudo.name(),
            Self::Machine(machine) => machine.name(),
        }
    }

    pub fn input_mask(&self, idx: usize) -> Option<RegisterMask> {
        match self {
            Self::Pseudo(pseudo) => match pseudo {
                PseudoInstr::Split { .. } => (idx == 0).then(TM::split_mask),
                PseudoInstr::Ret {
                    has_value,
                    callee_saves,
                } => {
                    let callee_save = if *has_value {
                        if idx == 0 {
                            return Some(CC::<TM>::return_mask());
                        }
                        callee_saves.get(idx - 1)
                    } else {
                        callee_saves.get(idx)
                    };
                    callee_save.copied().map(RegisterMask::single)
                }
                PseudoInstr::Param(_)
                | PseudoInstr::Phi
                | PseudoInstr::Proj(_)
                | PseudoInstr::CalleeSave(_) => None,
            },
            Self::Machine(machine) => machine.input_mask(idx),
        }
    }

    /// Mask of the `idx`-th output.
    ///
    /// Phis have no mask of their own and projections take theirs from the tuple they project, see
    /// [`Function::output_mask`](crate::codegen::machine::Function::output_mask).
    pub fn output_mask(&self, idx: usize) -> Option<RegisterMask> {
        match self {
            Self::Pseudo(pseudo) => match pseudo {
                PseudoInstr::Param(param) => Some(CC::<TM>::arg_mask(*param)),
                PseudoInstr::Split { .. } => Some(TM::split_mask()),
                PseudoInstr::CalleeSave(reg) => Some(RegisterMask::single(*reg)),
                PseudoInstr::Phi | PseudoInstr::Proj(_) | PseudoInstr::Ret { .. } => None,
            },
            Self::Machine(machine) => machine.output_mask(idx),
        }
    }

    pub fn output_count(&self) -> usize {
        match self {
            Self::Pseudo(PseudoInstr::Ret { .. }) => 0,
            Self::Pseudo(_) => 1,
            Self::Machine(machine) => machine.output_count(),
        }
    }

    pub fn two_address(&self) -> Option<usize> {
        self.try_as_machine().and_then(MInstr::two_address)
    }

    pub fn kill_mask(&self) -> Option<RegisterMask> {
        self.try_as_machine().and_then(MInstr::kill_mask)
    }

    pub fn commutes(&self) -> bool {
        self.try_as_machine().is_some_and(MInstr::commutes)
    }

    pub fn is_clone(&self) -> bool {
        self.try_as_machine().is_some_and(MInstr::is_clone)
    }

    pub fn is_call(&self) -> bool {
        self.try_as_machine().is_some_and(MInstr::is_call)
    }

    pub fn labels(&self) -> SmallVec<[BasicBlockId; 2]> {
        self.try_as_machine()
            .map(MInstr::labels)
            .unwrap_or_default()
    }

    pub fn is_terminator(&self) -> bool {
        match self {
            Self::Pseudo(pseudo) => matches!(pseudo, PseudoInstr::Ret { .. }),
            Self::Machine(machine) => machine.is_terminator(),
        }
    }

    pub const fn is_phi(&self) -> bool {
        matches!(self, Self::Pseudo(PseudoInstr::Phi))
    }

    pub const fn is_split(&self) -> bool {
        matches!(self, Self::Pseudo(PseudoInstr::Split { .. }))
    }

    pub const fn is_proj(&self) -> bool {
        matches!(self, Self::Pseudo(PseudoInstr::Proj(_)))
    }

    pub const fn is_ret(&self) -> bool {
        matches!(self, Self::Pseudo(PseudoInstr::Ret { .. }))
    }

    pub const fn is_callee_save(&self) -> bool {
        matches!(self, Self::Pseudo(PseudoInstr::CalleeSave(_)))
    }

    /// Pseudo definitions pinned to the top of the entry block.
    pub const fn is_entry_def(&self) -> bool {
        matches!(
            self,
            Self::Pseudo(PseudoInstr::Param(_) | PseudoInstr::CalleeSave(_))
        )
    }

    pub const fn try_as_machine(&self) -> Option<&TM::Instr> {
        match self {
            Self::Pseudo(_) => None,
            Self::Machine(machine) => Some(machine),
        }
    }
}

impl<TM: TargetMachine> Display for Instr<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pseudo(pseudo) => write!(f, "{pseudo}"),
            Self::Machine(machine) => write!(f, "{machine}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PseudoInstr {
    /// The n-th function parameter, defined in its calling convention slot.
    Param(usize),
    /// Inputs are ordered like the predecessors of the phi's block.
    Phi,
    /// The n-th output of the tuple instruction in input 0.
    Proj(usize),
    Split {
        kind: &'static str,
        round: u8,
    },
    /// Entry value of a callee-save register, kept alive until every return.
    CalleeSave(RegNum),
    Ret {
        has_value: bool,
        callee_saves: SmallVec<[RegNum; 6]>,
    },
}

impl PseudoInstr {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Param(_) => "PARAM",
            Self::Phi => "PHI",
            Self::Proj(_) => "PROJ",
            Self::Split { .. } => "SPLIT",
            Self::CalleeSave(_) => "CALLEE_SAVE",
            Self::Ret { .. } => "RET",
        }
    }
}

impl Display for PseudoInstr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())?;
        match self {
            Self::Param(idx) | Self::Proj(idx) => write!(f, " {idx}"),
            Self::Split { kind, round } => write!(f, " {kind} #{round}"),
            Self::CalleeSave(reg) => write!(f, " {reg}"),
            Self::Phi | Self::Ret { .. } => Ok(()),
        }
    }
}
