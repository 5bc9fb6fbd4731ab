//! Architecture-neutral instruction model and machine-state records.
//!
//! The engine core never interprets raw machine bytes itself. It consumes the
//! decoder/encoder pair behind the [`InstrDecoder`] and [`InstrEncoder`]
//! traits and operates on the neutral [`DecodedInstr`] record those traits
//! exchange. Concrete ISAs (and the test ISA used by this crate's own test
//! suite) live outside the core.
//!
//! # Key Components
//!
//! - [`AppPc`] / [`CachePc`] - The two address spaces the engine moves between
//! - [`Mcontext`] - The plain machine-context record saved and restored on
//!   every context switch between cache code and engine code
//! - [`DecodedInstr`] and [`ControlKind`] - What the builder needs to know
//!   about one application instruction
//! - [`InstrDecoder`] / [`InstrEncoder`] - The consumed external interface to
//!   the machine-code layer, including the mangling primitives the builder
//!   asks the encoder to synthesize
//!
//! # Address Spaces
//!
//! An [`AppPc`] is an address in the application's original text and is the
//! immutable identity (tag) of a fragment. A [`CachePc`] is an address inside
//! engine-owned cache memory. Nothing in the engine ever confuses the two;
//! the translation layer ([`crate::translate`]) is the only bridge back from
//! cache addresses to application addresses.

mod abi;
mod instr;
mod isa;

pub use abi::{ARG_REGS, IBL_TARGET_REG, RET_REG, STACK_SLOT};
pub use instr::{AppPc, CachePc, ControlKind, DecodedInstr, FaultKind, Mcontext, Reg, NUM_GPRS};
pub use isa::{InstrDecoder, InstrEncoder, Isa};
