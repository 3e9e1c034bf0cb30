use crate::codegen::machine::{
    function::BasicBlockId,
    Instr,
    TargetMachine,
};

/// Factories for the instructions the allocator and builder synthesize.
pub trait Backend {
    type TM: TargetMachine;

    /// A register-to-register (or register-to-stack) copy tagged with the reason it was inserted.
    fn split(kind: &'static str, round: u8) -> Instr<Self::TM>;

    fn jmp(target: BasicBlockId) -> Instr<Self::TM>;
}
