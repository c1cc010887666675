//! x86-64 target: register numbering, planning queries and the iced-x86 emitter.
//!
//! Registers are numbered by their hardware encoding. General purpose registers take numbers
//! 0 to 15 and the SSE registers follow at 16 to 31, so a register mask is a plain `u64`
//! with the low half-word covering the integer file.

pub mod architecture;
pub mod encoder;

pub use architecture::X64Architecture;
pub use encoder::X64Assembler;

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;
pub const XMM0: u8 = 16;
pub const XMM1: u8 = 17;
pub const XMM15: u8 = 31;

pub const GENERAL_REGISTER_MASK: u64 = 0xFFFF;
pub const FLOAT_REGISTER_MASK: u64 = 0xFFFF_0000;

/// Holds the current thread pointer for the whole method.
pub const THREAD: u8 = RBX;
/// Emitter scratch for absolute calls, jumps and far branch targets.
pub const SCRATCH: u8 = R11;

pub fn is_float_register(register: u8) -> bool {
    (XMM0..=XMM15).contains(&register)
}
