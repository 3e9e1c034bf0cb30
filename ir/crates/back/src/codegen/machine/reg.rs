use std::fmt::{
    Debug,
    Display,
    Formatter,
};

use itertools::Itertools;

use crate::codegen::machine::{
    isa::PhysicalRegister,
    TargetMachine,
};

/// Number of a register or stack slot.
///
/// Numbers below [`TargetMachine::reg_count`] are physical registers, everything above is a stack
/// slot.
pub type RegNum = u8;

/// Immutable set of register numbers.
///
/// Stack slots are an extension of the register space, so a mask that includes bits at or above
/// the register count allows the value to live in memory.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct RegisterMask(u128);

impl RegisterMask {
    pub const EMPTY: Self = Self(0);
    pub const FULL: Self = Self(u128::MAX);

    pub const fn from_bits(bits: u128) -> Self {
        Self(bits)
    }

    /// Empty if `reg` does not fit into the mask.
    pub const fn single(reg: RegNum) -> Self {
        Self(bit(reg))
    }

    /// All register numbers starting at `start`.
    #[allow(clippy::cast_lossless)]
    pub const fn from_start(start: RegNum) -> Self {
        match u128::MAX.checked_shl(start as u32) {
            Some(bits) => Self(bits),
            None => Self::EMPTY,
        }
    }

    pub fn from_regs(regs: impl IntoIterator<Item = RegNum>) -> Self {
        regs.into_iter()
            .fold(Self::EMPTY, |mask, reg| mask.union(Self::single(reg)))
    }

    pub const fn bits(self) -> u128 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn subtract(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn without(self, reg: RegNum) -> Self {
        self.subtract(Self::single(reg))
    }

    pub const fn overlaps(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_singleton(self) -> bool {
        self.0.is_power_of_two()
    }

    pub const fn contains(self, reg: RegNum) -> bool {
        self.0 & bit(reg) != 0
    }

    pub const fn cardinality(self) -> u32 {
        self.0.count_ones()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub const fn first_register(self) -> Option<RegNum> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as RegNum)
        }
    }

    /// Returns the lowest register in the mask that is strictly greater than `after`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_register(self, after: RegNum) -> Option<RegNum> {
        let shift = u32::from(after) + 1;
        let rest = self.0.checked_shr(shift)?;
        if rest == 0 {
            return None;
        }
        Some((shift + rest.trailing_zeros()) as RegNum)
    }

    pub fn iter(self) -> impl Iterator<Item = RegNum> {
        std::iter::successors(self.first_register(), move |reg| self.next_register(*reg))
    }

    pub const fn to_rw(self) -> RegisterMaskRw {
        RegisterMaskRw(self.0)
    }

    pub fn display<TM: TargetMachine>(self) -> RegisterMaskDisplay<TM> {
        RegisterMaskDisplay {
            mask: self,
            _tm: std::marker::PhantomData,
        }
    }
}

#[allow(clippy::cast_lossless)]
const fn bit(reg: RegNum) -> u128 {
    match 1_u128.checked_shl(reg as u32) {
        Some(bit) => bit,
        None => 0,
    }
}

impl Debug for RegisterMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegisterMask({:#x})", self.0)
    }
}

/// Scratch copy of a [`RegisterMask`] used while picking a color.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterMaskRw(u128);

impl RegisterMaskRw {
    pub fn clear(&mut self, reg: RegNum) {
        self.0 &= !bit(reg);
    }

    pub fn subtract(&mut self, mask: RegisterMask) {
        self.0 &= !mask.bits();
    }

    pub const fn freeze(self) -> RegisterMask {
        RegisterMask(self.0)
    }

    pub const fn is_empty(self) -> bool {
        self.freeze().is_empty()
    }

    pub const fn is_singleton(self) -> bool {
        self.freeze().is_singleton()
    }

    pub const fn contains(self, reg: RegNum) -> bool {
        self.freeze().contains(reg)
    }

    pub const fn cardinality(self) -> u32 {
        self.freeze().cardinality()
    }

    pub const fn first_register(self) -> Option<RegNum> {
        self.freeze().first_register()
    }
}

/// Returns the display name of a register number, e.g. `rax` or `[stk#17]`.
pub fn reg_name<TM: TargetMachine>(reg: RegNum) -> String {
    TM::Reg::from_index(reg).map_or_else(|| format!("[stk#{reg}]"), |reg| reg.name().to_string())
}

pub struct RegisterMaskDisplay<TM: TargetMachine> {
    mask: RegisterMask,
    _tm: std::marker::PhantomData<TM>,
}

impl<TM: TargetMachine> Display for RegisterMaskDisplay<TM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let stack_start = TM::reg_count();
        let regs = self
            .mask
            .iter()
            .take_while(|reg| *reg < stack_start)
            .map(reg_name::<TM>)
            .join(",");
        write!(f, "[{regs}")?;
        if self.mask.overlaps(RegisterMask::from_start(stack_start)) {
            if !regs.is_empty() {
                write!(f, ",")?;
            }
            write!(f, "stk")?;
        }
        write!(f, "]")
    }
}
