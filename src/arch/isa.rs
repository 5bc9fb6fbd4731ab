//! The consumed interface to the machine-code layer.
//!
//! The decoder and encoder are external collaborators: the engine core only
//! requires that application bytes round-trip through [`DecodedInstr`] and
//! that the encoder can synthesize the handful of mangling sequences the
//! fragment builder asks for. A concrete backend implements both traits for
//! one target architecture; the crate's test suite ships a small fixed-width
//! ISA that does the same.

use crate::{
    arch::{AppPc, DecodedInstr, FaultKind, Reg},
    Result,
};

/// Decodes raw application bytes into the neutral instruction record.
pub trait InstrDecoder: Send + Sync {
    /// Decodes one instruction starting at `pc`.
    ///
    /// `bytes` holds at most [`InstrDecoder::max_instr_len`] bytes starting at
    /// the application address `pc`; fewer when the page ends first.
    ///
    /// # Errors
    ///
    /// [`crate::Error::AppDecodeFault`] when the bytes are not a valid
    /// instruction; the builder turns this into a synthetic fragment that
    /// re-raises the architectural fault.
    fn decode(&self, bytes: &[u8], pc: AppPc) -> Result<DecodedInstr>;

    /// Upper bound on the encoded length of any single instruction.
    fn max_instr_len(&self) -> usize;
}

/// Encodes instructions and engine mangling sequences into cache bytes.
///
/// All methods append to `out`. A mangling sequence is restartable only at
/// its first byte; the builder records that boundary in the fragment's
/// translation table.
pub trait InstrEncoder: Send + Sync {
    /// Copies one application instruction into the cache, rewriting
    /// PC-relative addressing to absolute so the copy is position-independent
    /// of its original address.
    ///
    /// # Errors
    ///
    /// Returns an error only when `instr` cannot be re-encoded at all, which
    /// indicates a decoder/encoder mismatch and routes to the fatal path.
    fn encode_app_instr(&self, instr: &DecodedInstr, out: &mut Vec<u8>) -> Result<()>;

    /// Emits an exit through the owning fragment's patchable exit slot
    /// `slot`: either a dispatch stub round-trip or a direct jump to a linked
    /// target, depending on the slot's current word.
    fn encode_exit(&self, slot: u32, out: &mut Vec<u8>);

    /// Emits a conditional exit: control leaves through `slot` when the
    /// branch condition of `instr` holds, and falls through otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error when `instr` is not a conditional branch.
    fn encode_cond_exit(&self, instr: &DecodedInstr, slot: u32, out: &mut Vec<u8>) -> Result<()>;

    /// Emits the inverse conditional exit: control leaves through `slot`
    /// when the branch condition of `instr` does *not* hold. Used by the
    /// trace emitter to keep the recorded path inline.
    ///
    /// # Errors
    ///
    /// Returns an error when `instr` is not a conditional branch.
    fn encode_cond_exit_inverted(
        &self,
        instr: &DecodedInstr,
        slot: u32,
        out: &mut Vec<u8>,
    ) -> Result<()>;

    /// Emits the synthesized push of an application return address, used when
    /// mangling calls.
    fn encode_push_retaddr(&self, ret: AppPc, out: &mut Vec<u8>);

    /// Emits the pop of the application return address into `reg`, used when
    /// mangling returns before the indirect-branch lookup.
    fn encode_pop_retaddr(&self, reg: Reg, out: &mut Vec<u8>);

    /// Emits the indirect-branch lookup entry with the dynamic target in
    /// `reg`. On a hit the lookup continues in the cache; on a miss it exits
    /// to dispatch with the target preserved.
    fn encode_ibl_probe(&self, reg: Reg, out: &mut Vec<u8>);

    /// Emits the system-call exit stub through `slot`. The slot is never
    /// linked; dispatch performs the call on the application's behalf.
    fn encode_syscall_exit(&self, slot: u32, out: &mut Vec<u8>);

    /// Emits a synthetic fault that re-raises `fault` at application address
    /// `pc`, used for blocks whose bytes do not decode or whose page is
    /// unreadable.
    fn encode_fault(&self, fault: FaultKind, pc: AppPc, out: &mut Vec<u8>);
}

/// A complete machine-code backend: decoder and encoder for one target.
pub trait Isa: InstrDecoder + InstrEncoder {}

impl<T: InstrDecoder + InstrEncoder> Isa for T {}
