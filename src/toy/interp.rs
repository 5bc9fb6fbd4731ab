//! The interpreting cache executor.
//!
//! Runs emitted cache bytes exactly as a native backend would run them:
//! application state lives in the [`Mcontext`], data accesses go through
//! the host facade (and fault the way the hardware would), linked exits and
//! indirect-lookup hits transfer within the cache, and everything else
//! returns control to dispatch per the [`CacheExecutor`] contract. The
//! interrupt flag is sampled at every fragment boundary, the same points a
//! native backend reaches through exit stubs.

use std::sync::atomic::Ordering;

use crate::{
    arch::{AppPc, CachePc, FaultKind, Mcontext},
    dispatch::{CacheExecutor, ExecEnv, ExecExit},
    fragment::{ExitWord, FragmentId},
    toy::isa::*,
    Result,
};

/// Longest emitted cache operation (the synthetic fault record).
const MAX_CACHE_OP: usize = 18;

/// Interprets cache bytes under the executor contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct ToyExecutor;

enum Step {
    /// Advance within the body by this many bytes.
    Next(u64),
    /// Transfer to another cache location (linked exit, lookup hit).
    Transfer(FragmentId, CachePc),
    /// Return to dispatch.
    Exit(ExecExit),
}

impl CacheExecutor for ToyExecutor {
    fn enter(
        &self,
        env: &mut ExecEnv<'_>,
        mc: &mut Mcontext,
        entry: CachePc,
        frag: FragmentId,
    ) -> Result<ExecExit> {
        let mut cur = frag;
        let mut pc = entry;

        loop {
            // Fragment boundary: the safe point a native backend reaches via
            // its exit stubs.
            if env.interrupt.load(Ordering::Acquire) {
                mc.pc = pc.0;
                return Ok(ExecExit::Interrupted {
                    frag: cur,
                    cache_pc: pc,
                });
            }

            // Run the current fragment until it transfers out.
            loop {
                match self.step(env, mc, cur, pc)? {
                    Step::Next(len) => pc = pc.advance(len),
                    Step::Transfer(next_frag, next_pc) => {
                        cur = next_frag;
                        pc = next_pc;
                        break;
                    }
                    Step::Exit(exit) => return Ok(exit),
                }
            }
        }
    }
}

impl ToyExecutor {
    fn step(
        &self,
        env: &mut ExecEnv<'_>,
        mc: &mut Mcontext,
        cur: FragmentId,
        pc: CachePc,
    ) -> Result<Step> {
        let mut buf = [0u8; MAX_CACHE_OP];
        let got = env.cache.read(pc, &mut buf)?;
        if got == 0 {
            return Err(corrupt_error!("execution ran off cache body at {pc}"));
        }

        let op = buf[0];
        Ok(match op {
            OP_MOV_IMM => {
                mc.gpr[buf[1] as usize] = u64::from(u32_at(&buf, 2));
                Step::Next(6)
            }
            OP_MOV_REG => {
                mc.gpr[buf[1] as usize] = mc.gpr[buf[2] as usize];
                Step::Next(3)
            }
            OP_ADD => {
                mc.gpr[buf[1] as usize] =
                    mc.gpr[buf[1] as usize].wrapping_add(mc.gpr[buf[2] as usize]);
                Step::Next(3)
            }
            OP_ADD_IMM => {
                mc.gpr[buf[1] as usize] =
                    mc.gpr[buf[1] as usize].wrapping_add(u64::from(u32_at(&buf, 2)));
                Step::Next(6)
            }
            OP_SUB_IMM => {
                mc.gpr[buf[1] as usize] =
                    mc.gpr[buf[1] as usize].wrapping_sub(u64::from(u32_at(&buf, 2)));
                Step::Next(6)
            }
            OP_LOAD => {
                let addr = u64_at(&buf, 2);
                let mut data = [0u8; 8];
                match env.os.read_app(addr, &mut data) {
                    Ok(8) => {
                        mc.gpr[buf[1] as usize] = u64::from_le_bytes(data);
                        Step::Next(10)
                    }
                    _ => self.fault(mc, cur, pc, FaultKind::ReadFault(addr)),
                }
            }
            OP_STORE => {
                let addr = u64_at(&buf, 2);
                let data = mc.gpr[buf[1] as usize].to_le_bytes();
                match env.os.write_app(addr, &data) {
                    Ok(()) => Step::Next(10),
                    Err(_) => self.fault(mc, cur, pc, FaultKind::WriteFault(addr)),
                }
            }
            OP_PUSH => {
                let sp = mc.sp.wrapping_sub(8);
                let data = mc.gpr[buf[1] as usize].to_le_bytes();
                match env.os.write_app(sp, &data) {
                    Ok(()) => {
                        mc.sp = sp;
                        Step::Next(2)
                    }
                    Err(_) => self.fault(mc, cur, pc, FaultKind::WriteFault(sp)),
                }
            }
            OP_POP => {
                let mut data = [0u8; 8];
                match env.os.read_app(mc.sp, &mut data) {
                    Ok(8) => {
                        mc.gpr[buf[1] as usize] = u64::from_le_bytes(data);
                        mc.sp = mc.sp.wrapping_add(8);
                        Step::Next(2)
                    }
                    _ => self.fault(mc, cur, pc, FaultKind::ReadFault(mc.sp)),
                }
            }
            OP_RD_SP => {
                mc.gpr[buf[1] as usize] = mc.sp;
                Step::Next(2)
            }
            OP_WR_SP => {
                mc.sp = mc.gpr[buf[1] as usize];
                Step::Next(2)
            }

            OP_EXIT => self.take_exit(env, mc, cur, u32_at(&buf, 1))?,
            OP_COND_EXIT => {
                if mc.gpr[buf[1] as usize] != 0 {
                    self.take_exit(env, mc, cur, u32_at(&buf, 2))?
                } else {
                    Step::Next(6)
                }
            }
            OP_COND_EXIT_INV => {
                if mc.gpr[buf[1] as usize] == 0 {
                    self.take_exit(env, mc, cur, u32_at(&buf, 2))?
                } else {
                    Step::Next(6)
                }
            }
            OP_PUSH_RET => {
                let ret = u64_at(&buf, 1);
                let sp = mc.sp.wrapping_sub(8);
                match env.os.write_app(sp, &ret.to_le_bytes()) {
                    Ok(()) => {
                        mc.sp = sp;
                        Step::Next(9)
                    }
                    Err(_) => self.fault(mc, cur, pc, FaultKind::WriteFault(sp)),
                }
            }
            OP_POP_RET => {
                let reg = buf[1] as usize;
                let mut data = [0u8; 8];
                match env.os.read_app(mc.sp, &mut data) {
                    Ok(8) => {
                        lock!(env.spills)[0] = mc.gpr[reg];
                        mc.gpr[reg] = u64::from_le_bytes(data);
                        mc.sp = mc.sp.wrapping_add(8);
                        Step::Next(2)
                    }
                    _ => self.fault(mc, cur, pc, FaultKind::ReadFault(mc.sp)),
                }
            }
            OP_IBL_PROBE => {
                let target = AppPc(mc.gpr[buf[1] as usize]);
                match env.ibl.probe(target) {
                    Some(next) if env.follow_links => {
                        let next_frag = env
                            .cache
                            .fragment_at(next)
                            .ok_or_else(|| corrupt_error!("lookup hit into dead cache at {next}"))?;
                        Step::Transfer(next_frag, next)
                    }
                    Some(next) => Step::Exit(ExecExit::IndirectHit { frag: cur, next }),
                    None => Step::Exit(ExecExit::IndirectMiss { target }),
                }
            }
            OP_SYSCALL_EXIT => Step::Exit(ExecExit::Syscall {
                frag: cur,
                exit: u32_at(&buf, 1),
            }),
            OP_FAULT => {
                let kind_byte = buf[1];
                let addr = u64_at(&buf, 10);
                let kind = match kind_byte {
                    1 => FaultKind::ReadFault(addr),
                    2 => FaultKind::WriteFault(addr),
                    3 => FaultKind::ExecFault(addr),
                    _ => FaultKind::InvalidOpcode,
                };
                self.fault(mc, cur, pc, kind)
            }

            other => {
                return Err(corrupt_error!(
                    "unexpected opcode {other:#04x} in cache at {pc}"
                ))
            }
        })
    }

    fn take_exit(
        &self,
        env: &ExecEnv<'_>,
        _mc: &mut Mcontext,
        cur: FragmentId,
        slot: u32,
    ) -> Result<Step> {
        let rec = env
            .slab
            .get(cur)
            .ok_or_else(|| corrupt_error!("executing fragment {cur} has no record"))?;
        let exit = rec
            .exit(slot)
            .ok_or_else(|| corrupt_error!("fragment {cur} has no exit slot {slot}"))?;
        Ok(match exit.word() {
            ExitWord::Stub(index) => Step::Exit(ExecExit::Stub {
                frag: cur,
                exit: index,
            }),
            ExitWord::Linked(next) => {
                if env.follow_links {
                    let next_frag = env
                        .cache
                        .fragment_at(next)
                        .ok_or_else(|| corrupt_error!("linked exit into dead cache at {next}"))?;
                    Step::Transfer(next_frag, next)
                } else {
                    Step::Exit(ExecExit::Branched {
                        frag: cur,
                        exit: slot,
                        next,
                    })
                }
            }
        })
    }

    fn fault(&self, mc: &mut Mcontext, cur: FragmentId, pc: CachePc, kind: FaultKind) -> Step {
        mc.pc = pc.0;
        Step::Exit(ExecExit::Fault {
            frag: cur,
            cache_pc: pc,
            kind,
        })
    }
}
