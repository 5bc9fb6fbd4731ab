//! The basic-block builder: decode, mangle, emit.
//!
//! Given a tag, the builder decodes application instructions sequentially up
//! to the first control transfer (or a configured maximum), emits a
//! semantically equivalent body into a scratch buffer, and mangles the
//! terminator so every way out of the block routes through an engine-managed
//! exit. The translation table is built in parallel with emission, one span
//! per copied instruction or mangling sequence.
//!
//! The builder never touches the cache or the fragment tables itself; it
//! returns a [`BuiltBlock`] and the commit step (placement, slab insertion,
//! table registration) belongs to dispatch, which also resolves the
//! lost-the-race case for shared tags.

use crate::{
    arch::{AppPc, ControlKind, DecodedInstr, FaultKind, Isa, IBL_TARGET_REG},
    cache::Partition,
    fragment::{ExitTarget, FragmentFlags},
    heap::ThreadArena,
    os::{OsFacade, ThreadId},
    translate::{Recipe, RecipeSource, RegRule, SpanKind, TranslationTable},
    Result,
};

/// Default cap on instructions per basic block.
pub const MAX_BLOCK_INSTRS: usize = 64;

/// What to build.
#[derive(Clone, Copy, Debug)]
pub struct BuildSpec {
    /// Fragment identity.
    pub tag: AppPc,
    /// Where decoding starts; differs from `tag` when a replacement is
    /// installed for it.
    pub decode_at: AppPc,
    /// Destination partition.
    pub partition: Partition,
    /// Owning thread for private fragments.
    pub owner: Option<ThreadId>,
    /// Build with [`FragmentFlags::CANNOT_LINK`] so control re-enters
    /// dispatch at this tag (wrapped entries, post-call sites).
    pub cannot_link: bool,
    /// Cap on decoded instructions.
    pub max_instrs: usize,
}

impl BuildSpec {
    /// A spec for a plain block at `tag`.
    #[must_use]
    pub fn at(tag: AppPc, partition: Partition, owner: Option<ThreadId>) -> Self {
        BuildSpec {
            tag,
            decode_at: tag,
            partition,
            owner,
            cannot_link: false,
            max_instrs: MAX_BLOCK_INSTRS,
        }
    }
}

/// The product of one build, ready for commit.
#[derive(Debug)]
pub struct BuiltBlock {
    /// Emitted body bytes (lease from the thread arena; recycle after
    /// placement).
    pub code: Vec<u8>,
    /// Bytes of application code covered, from `decode_at`.
    pub app_len: u32,
    /// Exit classifications, in exit-index order.
    pub exits: Vec<ExitTarget>,
    /// Translation spans covering the body.
    pub xl8: TranslationTable,
    /// Flags the fragment record starts with.
    pub flags: FragmentFlags,
}

/// Decodes one basic block and emits its cache body.
pub struct FragmentBuilder<'a> {
    isa: &'a dyn Isa,
    os: &'a dyn OsFacade,
}

impl<'a> FragmentBuilder<'a> {
    /// A builder borrowing the ISA backend and OS facade.
    #[must_use]
    pub fn new(isa: &'a dyn Isa, os: &'a dyn OsFacade) -> Self {
        FragmentBuilder { isa, os }
    }

    /// Builds the block described by `spec`.
    ///
    /// Unreadable or undecodable application bytes do not fail the build:
    /// the body ends in a synthetic fault that re-raises the architectural
    /// fault at the exact application PC, after any successfully decoded
    /// prefix has run.
    ///
    /// # Errors
    ///
    /// Only engine-side failures (encoder mismatch) propagate; they route to
    /// the fatal path.
    pub fn build(&self, spec: &BuildSpec, arena: &mut ThreadArena) -> Result<BuiltBlock> {
        let mut emit = Emitter::new(self.isa, arena.lease(256));
        if spec.cannot_link {
            emit.flags |= FragmentFlags::CANNOT_LINK;
        }

        let mut fetch = vec![0u8; self.isa.max_instr_len()];
        let mut pc = spec.decode_at;
        let mut count = 0usize;

        loop {
            if count == spec.max_instrs {
                // Length cap: synthesize a fall-through exit to the next
                // instruction.
                emit.direct_exit(pc, pc);
                break;
            }

            // Instruction fetch doubles as the per-page readability re-check
            // when a block crosses a page boundary.
            let got = match self.os.read_app(pc.0, &mut fetch) {
                Ok(got) if got > 0 => got,
                _ => {
                    emit.fault_exit(FaultKind::ExecFault(pc.0), pc);
                    break;
                }
            };

            let instr = match self.isa.decode(&fetch[..got], pc) {
                Ok(instr) => instr,
                Err(_) => {
                    emit.fault_exit(FaultKind::InvalidOpcode, pc);
                    break;
                }
            };

            if !instr.flow.ends_block() {
                emit.app_instr(&instr)?;
                pc = instr.next_pc();
                count += 1;
                continue;
            }

            pc = instr.next_pc();
            emit.terminator(&instr)?;
            break;
        }

        let app_len = pc.offset_from(spec.decode_at).max(0) as u32;
        let body_len = emit.code.len() as u32;
        emit.xl8.seal(body_len);

        Ok(BuiltBlock {
            code: emit.code,
            app_len,
            exits: emit.exits,
            xl8: emit.xl8,
            flags: emit.flags,
        })
    }
}

/// Emission state shared by the block builder and the trace emitter.
pub(crate) struct Emitter<'a> {
    pub(crate) isa: &'a dyn Isa,
    pub(crate) code: Vec<u8>,
    pub(crate) xl8: TranslationTable,
    pub(crate) exits: Vec<ExitTarget>,
    pub(crate) flags: FragmentFlags,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(isa: &'a dyn Isa, code: Vec<u8>) -> Self {
        Emitter {
            isa,
            code,
            xl8: TranslationTable::new(),
            exits: Vec::new(),
            flags: FragmentFlags::empty(),
        }
    }

    fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    pub(crate) fn app_instr(&mut self, instr: &DecodedInstr) -> Result<()> {
        self.xl8
            .push(self.offset(), instr.pc, SpanKind::App, Recipe::identity());
        self.isa.encode_app_instr(instr, &mut self.code)
    }

    /// Emits a guard for a conditional branch the recorded path fell out of:
    /// exit to `off_trace` when the branch goes the unrecorded way, continue
    /// inline otherwise.
    pub(crate) fn guard_exit(
        &mut self,
        instr: &DecodedInstr,
        off_trace: AppPc,
        recorded_taken: bool,
    ) -> Result<()> {
        let slot = self.push_exit(ExitTarget::Direct(off_trace));
        self.span(instr.pc, Recipe::identity());
        if recorded_taken {
            self.isa
                .encode_cond_exit_inverted(instr, slot, &mut self.code)
        } else {
            self.isa.encode_cond_exit(instr, slot, &mut self.code)
        }
    }

    /// Emits the synthesized push of a call's return address without the
    /// exit, for calls fused into a trace.
    pub(crate) fn inline_call(&mut self, instr: &DecodedInstr, ret: AppPc) {
        self.span(instr.pc, Recipe::identity());
        self.isa.encode_push_retaddr(ret, &mut self.code);
    }

    pub(crate) fn terminator(&mut self, instr: &DecodedInstr) -> Result<()> {
        match instr.flow {
            ControlKind::DirectJump { target } => {
                self.direct_exit(target, target);
            }
            ControlKind::CondJump { taken, fall } => {
                let slot = self.push_exit(ExitTarget::Direct(taken));
                self.span(instr.pc, Recipe::identity());
                self.isa.encode_cond_exit(instr, slot, &mut self.code)?;
                self.direct_exit(fall, fall);
            }
            ControlKind::DirectCall { target, ret } => {
                self.span(instr.pc, Recipe::identity());
                self.isa.encode_push_retaddr(ret, &mut self.code);
                self.direct_exit(target, target);
            }
            ControlKind::IndirectJump { reg } => {
                self.exits.push(ExitTarget::Indirect);
                self.span(instr.pc, Recipe::identity());
                self.isa.encode_ibl_probe(reg, &mut self.code);
            }
            ControlKind::IndirectCall { reg, ret } => {
                self.exits.push(ExitTarget::Indirect);
                self.span(instr.pc, Recipe::identity());
                self.isa.encode_push_retaddr(ret, &mut self.code);
                // Inside the probe the synthesized push has already happened;
                // rewinding to the call undoes it.
                self.span(instr.pc, Recipe {
                    rules: Vec::new(),
                    sp_adjust: 8,
                });
                self.isa.encode_ibl_probe(reg, &mut self.code);
            }
            ControlKind::Return => {
                self.exits.push(ExitTarget::Indirect);
                self.span(instr.pc, Recipe::identity());
                self.isa
                    .encode_pop_retaddr(IBL_TARGET_REG, &mut self.code);
                // The pop spilled the target register and moved the stack;
                // the recipe undoes both.
                self.span(
                    instr.pc,
                    Recipe {
                        rules: vec![RegRule {
                            reg: IBL_TARGET_REG,
                            source: RecipeSource::Spill(0),
                        }],
                        sp_adjust: -8,
                    },
                );
                self.isa.encode_ibl_probe(IBL_TARGET_REG, &mut self.code);
            }
            ControlKind::Syscall => {
                let slot = self.push_exit(ExitTarget::Syscall {
                    next: instr.next_pc(),
                    vector: None,
                });
                self.span(instr.pc, Recipe::identity());
                self.isa.encode_syscall_exit(slot, &mut self.code);
            }
            ControlKind::Interrupt { vector } => {
                let slot = self.push_exit(ExitTarget::Syscall {
                    next: instr.next_pc(),
                    vector: Some(vector),
                });
                self.span(instr.pc, Recipe::identity());
                self.isa.encode_syscall_exit(slot, &mut self.code);
            }
            ControlKind::None => {
                unreachable!("terminator called on a straight-line instruction")
            }
        }
        Ok(())
    }

    /// Emits an unconditional exit to `target`, restartable at `restart`.
    pub(crate) fn direct_exit(&mut self, target: AppPc, restart: AppPc) {
        let slot = self.push_exit(ExitTarget::Direct(target));
        self.span(restart, Recipe::identity());
        self.isa.encode_exit(slot, &mut self.code);
    }

    /// Emits the synthetic fault terminator.
    pub(crate) fn fault_exit(&mut self, kind: FaultKind, pc: AppPc) {
        self.flags |= FragmentFlags::SYNTH_FAULT;
        self.exits.push(ExitTarget::Fault { kind, pc });
        self.span(pc, Recipe::identity());
        self.isa.encode_fault(kind, pc, &mut self.code);
    }

    fn push_exit(&mut self, target: ExitTarget) -> u32 {
        let idx = self.exits.len() as u32;
        self.exits.push(target);
        idx
    }

    fn span(&mut self, restart: AppPc, recipe: Recipe) {
        self.xl8
            .push(self.offset(), restart, SpanKind::Mangle { restart }, recipe);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toy::{ProgramImage, ToyIsa, ToyOs};

    fn build_at(image: &ProgramImage, tag: u64) -> BuiltBlock {
        let isa = ToyIsa;
        let os = ToyOs::with_image(image.clone());
        let builder = FragmentBuilder::new(&isa, &os);
        let mut arena = ThreadArena::new();
        builder
            .build(&BuildSpec::at(AppPc(tag), Partition::Shared, None), &mut arena)
            .unwrap()
    }

    #[test]
    fn test_straight_line_block_ends_at_return() {
        let mut image = ProgramImage::new();
        image.label(0x1000).mov_imm(0, 1).ret();
        let built = build_at(&image, 0x1000);

        assert_eq!(built.exits.len(), 1);
        assert!(matches!(built.exits[0], ExitTarget::Indirect));
        assert!(built.app_len >= 2, "mov + ret bytes");
        assert!(!built.flags.contains(FragmentFlags::SYNTH_FAULT));
        // One app span plus the two return-mangle spans.
        assert_eq!(built.xl8.len(), 3);
    }

    #[test]
    fn test_cond_branch_has_two_direct_exits() {
        let mut image = ProgramImage::new();
        image.label(0x1000).jcc_nz(1, 0x2000).halt_pad();
        let built = build_at(&image, 0x1000);

        let fall = built.app_len as u64 + 0x1000;
        assert_eq!(built.exits.len(), 2);
        assert!(matches!(built.exits[0], ExitTarget::Direct(AppPc(0x2000))));
        assert!(matches!(built.exits[1], ExitTarget::Direct(t) if t.0 == fall));
    }

    #[test]
    fn test_call_synthesizes_retaddr_push() {
        let mut image = ProgramImage::new();
        image.label(0x1000).call(0x3000).halt_pad();
        let built = build_at(&image, 0x1000);

        assert_eq!(built.exits.len(), 1);
        assert!(matches!(built.exits[0], ExitTarget::Direct(AppPc(0x3000))));
        // push-retaddr span + exit span
        assert_eq!(built.xl8.len(), 2);
    }

    #[test]
    fn test_unreadable_start_builds_fault_block() {
        let image = ProgramImage::new();
        let built = build_at(&image, 0xdead_0000);

        assert!(built.flags.contains(FragmentFlags::SYNTH_FAULT));
        assert!(matches!(
            built.exits[0],
            ExitTarget::Fault {
                kind: FaultKind::ExecFault(0xdead_0000),
                ..
            }
        ));
    }

    #[test]
    fn test_undecodable_byte_faults_after_prefix() {
        let mut image = ProgramImage::new();
        image.label(0x1000).mov_imm(0, 7).raw(&[0xff]);
        let built = build_at(&image, 0x1000);

        assert!(built.flags.contains(FragmentFlags::SYNTH_FAULT));
        // The decoded prefix survives; the fault sits at its end.
        assert!(matches!(
            built.exits.last(),
            Some(ExitTarget::Fault {
                kind: FaultKind::InvalidOpcode,
                ..
            })
        ));
    }

    #[test]
    fn test_block_length_cap_synthesizes_fallthrough() {
        let mut image = ProgramImage::new();
        let mut cursor = image.label(0x1000);
        for _ in 0..100 {
            cursor = cursor.mov_imm(2, 5);
        }
        cursor.ret();

        let isa = ToyIsa;
        let os = ToyOs::with_image(image.clone());
        let builder = FragmentBuilder::new(&isa, &os);
        let mut arena = ThreadArena::new();
        let mut spec = BuildSpec::at(AppPc(0x1000), Partition::Shared, None);
        spec.max_instrs = 8;
        let built = builder.build(&spec, &mut arena).unwrap();

        assert_eq!(built.exits.len(), 1);
        let resume = 0x1000 + built.app_len as u64;
        assert!(matches!(built.exits[0], ExitTarget::Direct(t) if t.0 == resume));
    }
}
