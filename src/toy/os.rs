//! The toy host facade: in-process memory, threads, and syscalls.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, RwLock,
};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    arch::Mcontext,
    os::{
        ExceptionRecord, OsFacade, OsRegion, Protection, RegionInfo, RegionState, SyscallOutcome,
        ThreadId,
    },
    toy::{ProgramImage, SYSNUM_REG, SYS_EXIT, SYS_WRITE},
    Error, Result,
};

/// Size of each stack the facade hands out.
pub const STACK_SIZE: u64 = 64 * 1024;

/// Base of the engine reservation range (cache units land here).
const RESERVE_BASE: u64 = 0x7000_0000_0000;
/// Base of the stack range.
const STACK_BASE: u64 = 0x0080_0000;

#[derive(Debug)]
struct MemRegion {
    base: u64,
    data: Vec<u8>,
    writable: bool,
}

impl MemRegion {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.data.len() as u64
    }
}

/// An in-process host for the engine core.
///
/// Application memory is a set of sparse regions (code from a
/// [`ProgramImage`], stacks, and any data regions a test maps). System
/// calls implement just enough surface for observable-behavior checks:
/// `r7 = 1` appends `r1` to the write log, `r7 = 60` exits the thread.
/// Thread contexts installed with [`ToyOs::install_thread`] back the forced
/// half of synchall.
pub struct ToyOs {
    mem: RwLock<Vec<MemRegion>>,
    next_reserve: AtomicU64,
    next_stack: AtomicU64,
    write_log: Mutex<Vec<u64>>,
    raised: Mutex<Vec<ExceptionRecord>>,
    threads: Mutex<FxHashMap<u64, Mcontext>>,
    suspended: Mutex<FxHashSet<u64>>,
    resumed: Mutex<FxHashSet<u64>>,
}

impl ToyOs {
    /// An empty host: no application memory mapped.
    #[must_use]
    pub fn new() -> Self {
        ToyOs {
            mem: RwLock::new(Vec::new()),
            next_reserve: AtomicU64::new(RESERVE_BASE),
            next_stack: AtomicU64::new(STACK_BASE),
            write_log: Mutex::new(Vec::new()),
            raised: Mutex::new(Vec::new()),
            threads: Mutex::new(FxHashMap::default()),
            suspended: Mutex::new(FxHashSet::default()),
            resumed: Mutex::new(FxHashSet::default()),
        }
    }

    /// A host with the image's code regions mapped read-only.
    #[must_use]
    pub fn with_image(image: ProgramImage) -> Self {
        let os = ToyOs::new();
        {
            let mut mem = write_lock!(os.mem);
            for (base, data) in image.regions {
                if !data.is_empty() {
                    mem.push(MemRegion {
                        base,
                        data,
                        writable: false,
                    });
                }
            }
        }
        os
    }

    /// Maps a zero-filled writable region (test data, jmp buffers).
    pub fn map_data(&self, base: u64, size: usize) {
        write_lock!(self.mem).push(MemRegion {
            base,
            data: vec![0; size],
            writable: true,
        });
    }

    /// Allocates a fresh stack, returning its initial (top) stack pointer.
    #[must_use]
    pub fn alloc_stack(&self) -> u64 {
        let base = self.next_stack.fetch_add(STACK_SIZE * 2, Ordering::Relaxed);
        self.map_data(base, STACK_SIZE as usize);
        base + STACK_SIZE
    }

    /// The observable output log (syscall writes, in order).
    #[must_use]
    pub fn write_log(&self) -> Vec<u64> {
        lock!(self.write_log).clone()
    }

    /// Events delivered to the application handler path.
    #[must_use]
    pub fn raised(&self) -> Vec<ExceptionRecord> {
        lock!(self.raised).clone()
    }

    /// Installs a fabricated register context for `tid`, backing the forced
    /// suspension path.
    pub fn install_thread(&self, tid: ThreadId, mc: Mcontext) {
        lock!(self.threads).insert(tid.0, mc);
    }

    /// Whether `tid` was force-suspended at some point.
    #[must_use]
    pub fn was_suspended(&self, tid: ThreadId) -> bool {
        lock!(self.suspended).contains(&tid.0)
    }

    /// Whether `tid` was resumed after a forced suspension.
    #[must_use]
    pub fn was_resumed(&self, tid: ThreadId) -> bool {
        lock!(self.resumed).contains(&tid.0)
    }

    /// The last context written back for `tid` (forced teleport result).
    #[must_use]
    pub fn installed_context(&self, tid: ThreadId) -> Option<Mcontext> {
        lock!(self.threads).get(&tid.0).cloned()
    }
}

impl Default for ToyOs {
    fn default() -> Self {
        Self::new()
    }
}

impl OsFacade for ToyOs {
    fn reserve(&self, size: usize, preferred: Option<u64>) -> Result<OsRegion> {
        let size = size.max(1) as u64;
        let base = preferred
            .unwrap_or_else(|| self.next_reserve.fetch_add(size.next_multiple_of(0x1000), Ordering::Relaxed));
        Ok(OsRegion { base, size })
    }

    fn commit(&self, _region: &OsRegion, _prot: Protection) -> Result<()> {
        Ok(())
    }

    fn protect(&self, _region: &OsRegion, _prot: Protection) -> Result<()> {
        Ok(())
    }

    fn free(&self, _region: OsRegion) -> Result<()> {
        Ok(())
    }

    fn query(&self, addr: u64) -> Option<RegionInfo> {
        let mem = read_lock!(self.mem);
        let region = mem.iter().find(|r| r.contains(addr))?;
        Some(RegionInfo {
            base: region.base,
            size: region.data.len() as u64,
            prot: if region.writable {
                Protection::RW
            } else {
                Protection::RX
            },
            state: RegionState::Committed,
        })
    }

    fn read_app(&self, addr: u64, buf: &mut [u8]) -> Result<usize> {
        let mem = read_lock!(self.mem);
        let region = mem
            .iter()
            .find(|r| r.contains(addr))
            .ok_or(Error::AppUnreadable(addr))?;
        let offset = (addr - region.base) as usize;
        let n = buf.len().min(region.data.len() - offset);
        buf[..n].copy_from_slice(&region.data[offset..offset + n]);
        Ok(n)
    }

    fn write_app(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut mem = write_lock!(self.mem);
        let region = mem
            .iter_mut()
            .find(|r| r.contains(addr) && r.writable)
            .ok_or(Error::AppUnreadable(addr))?;
        let offset = (addr - region.base) as usize;
        if offset + data.len() > region.data.len() {
            return Err(Error::AppUnreadable(addr + (region.data.len() - offset) as u64));
        }
        region.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn suspend_thread(&self, tid: ThreadId) -> Result<()> {
        if !lock!(self.threads).contains_key(&tid.0) {
            return Err(Error::SuspendFailed(tid.0));
        }
        lock!(self.suspended).insert(tid.0);
        Ok(())
    }

    fn resume_thread(&self, tid: ThreadId) -> Result<()> {
        lock!(self.resumed).insert(tid.0);
        Ok(())
    }

    fn thread_context(&self, tid: ThreadId) -> Result<Mcontext> {
        lock!(self.threads)
            .get(&tid.0)
            .cloned()
            .ok_or(Error::SuspendFailed(tid.0))
    }

    fn set_thread_context(&self, tid: ThreadId, mc: &Mcontext) -> Result<()> {
        lock!(self.threads).insert(tid.0, mc.clone());
        Ok(())
    }

    fn raise_to_app(&self, record: &ExceptionRecord, _mc: &Mcontext) -> Result<()> {
        lock!(self.raised).push(record.clone());
        Ok(())
    }

    fn syscall(&self, mc: &mut Mcontext) -> Result<SyscallOutcome> {
        let number = mc.reg(SYSNUM_REG);
        match number {
            SYS_WRITE => {
                lock!(self.write_log).push(mc.reg(crate::arch::ARG_REGS[0]));
                mc.set_reg(crate::arch::RET_REG, 0);
                Ok(SyscallOutcome::Continue)
            }
            SYS_EXIT => Ok(SyscallOutcome::ExitThread),
            _ => {
                mc.set_reg(crate::arch::RET_REG, u64::MAX);
                Ok(SyscallOutcome::Continue)
            }
        }
    }
}

impl std::fmt::Debug for ToyOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToyOs")
            .field("regions", &read_lock!(self.mem).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_app_memory() {
        let os = ToyOs::new();
        os.map_data(0x2000, 64);
        os.write_app(0x2000, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(os.read_app(0x2000, &mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_unmapped_read_fails() {
        let os = ToyOs::new();
        let mut buf = [0u8; 1];
        assert!(matches!(
            os.read_app(0xdead, &mut buf),
            Err(Error::AppUnreadable(0xdead))
        ));
    }

    #[test]
    fn test_code_regions_are_not_writable() {
        let mut image = ProgramImage::new();
        image.label(0x1000).ret();
        let os = ToyOs::with_image(image);
        assert!(os.write_app(0x1000, &[0]).is_err());
        let mut buf = [0u8; 1];
        assert_eq!(os.read_app(0x1000, &mut buf).unwrap(), 1);
    }

    #[test]
    fn test_partial_read_at_region_end() {
        let os = ToyOs::new();
        os.map_data(0x2000, 4);
        let mut buf = [0u8; 10];
        assert_eq!(os.read_app(0x2002, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_syscall_write_and_exit() {
        let os = ToyOs::new();
        let mut mc = Mcontext::default();
        mc.set_reg(SYSNUM_REG, SYS_WRITE);
        mc.set_reg(crate::arch::ARG_REGS[0], 99);
        assert_eq!(os.syscall(&mut mc).unwrap(), SyscallOutcome::Continue);
        assert_eq!(os.write_log(), vec![99]);

        mc.set_reg(SYSNUM_REG, SYS_EXIT);
        assert_eq!(os.syscall(&mut mc).unwrap(), SyscallOutcome::ExitThread);
    }
}
