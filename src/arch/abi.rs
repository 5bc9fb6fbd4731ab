//! Calling-convention positions the engine core relies on.
//!
//! The wrap layer reads and writes arguments and return values through these
//! positions; everything else about the ABI stays inside the concrete ISA.

use crate::arch::Reg;

/// Register holding a function's return value.
pub const RET_REG: Reg = Reg(0);

/// Registers carrying the first arguments, in order. Further arguments live
/// on the application stack above the return address.
pub const ARG_REGS: [Reg; 6] = [Reg(1), Reg(2), Reg(3), Reg(4), Reg(5), Reg(6)];

/// The designated register an indirect-branch mangling leaves the dynamic
/// target in before entering the in-cache lookup.
pub const IBL_TARGET_REG: Reg = Reg(15);

/// Width of one application stack slot in bytes.
pub const STACK_SLOT: u64 = 8;
