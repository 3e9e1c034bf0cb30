pub use calling_convention::{
    CallingConvention,
    Slot,
};

pub mod calling_convention;
