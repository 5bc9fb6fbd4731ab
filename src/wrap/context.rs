//! The context handed to wrap callbacks.

use crate::{
    arch::{AppPc, Mcontext, ARG_REGS, RET_REG, STACK_SLOT},
    os::OsFacade,
    wrap::SkipCall,
};

/// Which callback a [`WrapContext`] belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WrapPhase {
    /// Before the wrapped function's first instruction.
    Pre,
    /// After a normal return, at the recorded post-call site.
    Post,
    /// During an abnormal unwind; registers are not valid and the return
    /// value is not queryable.
    PostAbnormal,
}

/// The machine-state window a pre or post callback operates through.
///
/// Accessors enforce phase discipline the way the original API does:
/// argument access belongs to the pre phase, return-value access to the
/// post phase, and nothing but cleanup is meaningful in an abnormal post.
/// Misuse is flagged (see [`WrapContext::misuses`]) and ignored, never
/// fatal.
pub struct WrapContext<'a> {
    pub(crate) phase: WrapPhase,
    pub(crate) func: AppPc,
    pub(crate) retaddr: AppPc,
    pub(crate) mc: &'a mut Mcontext,
    pub(crate) os: &'a dyn OsFacade,
    pub(crate) user_data: &'a mut u64,
    pub(crate) skip: &'a mut Option<SkipCall>,
    pub(crate) misuses: &'a mut Vec<&'static str>,
}

impl WrapContext<'_> {
    /// The wrapped function this callback fires for.
    #[must_use]
    pub fn func(&self) -> AppPc {
        self.func
    }

    /// Which phase this context belongs to.
    #[must_use]
    pub fn phase(&self) -> WrapPhase {
        self.phase
    }

    /// Whether this is the synthetic abnormal-unwind post call.
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        self.phase == WrapPhase::PostAbnormal
    }

    /// The return address recorded when the wrapped call entered.
    #[must_use]
    pub fn retaddr(&self) -> AppPc {
        self.retaddr
    }

    /// The `arg`-th argument (0-based), register or stack per the ABI.
    ///
    /// Pre phase only; flagged and `0` otherwise.
    #[must_use]
    pub fn arg(&mut self, arg: usize) -> u64 {
        if self.phase != WrapPhase::Pre {
            self.misuses.push("arg access outside pre callback");
            return 0;
        }
        if let Some(reg) = ARG_REGS.get(arg) {
            return self.mc.reg(*reg);
        }
        let slot = self.stack_arg_addr(arg);
        let mut buf = [0u8; 8];
        match self.os.read_app(slot, &mut buf) {
            Ok(8) => u64::from_le_bytes(buf),
            _ => {
                self.misuses.push("stack argument read failed");
                0
            }
        }
    }

    /// Overwrites the `arg`-th argument. Pre phase only.
    pub fn set_arg(&mut self, arg: usize, value: u64) {
        if self.phase != WrapPhase::Pre {
            self.misuses.push("set_arg outside pre callback");
            return;
        }
        if let Some(reg) = ARG_REGS.get(arg) {
            self.mc.set_reg(*reg, value);
            return;
        }
        let slot = self.stack_arg_addr(arg);
        if self.os.write_app(slot, &value.to_le_bytes()).is_err() {
            self.misuses.push("stack argument write failed");
        }
    }

    /// The wrapped function's return value. Post phase only.
    #[must_use]
    pub fn retval(&mut self) -> u64 {
        if self.phase != WrapPhase::Post {
            self.misuses.push("retval access outside normal post callback");
            return 0;
        }
        self.mc.reg(RET_REG)
    }

    /// Overwrites the return value the caller will observe. Post phase only.
    pub fn set_retval(&mut self, value: u64) {
        if self.phase != WrapPhase::Post {
            self.misuses.push("set_retval outside normal post callback");
            return;
        }
        self.mc.set_reg(RET_REG, value);
    }

    /// The application machine context at callback time.
    ///
    /// Not valid in the abnormal post phase (flagged; a zeroed context is
    /// returned there).
    #[must_use]
    pub fn mcontext(&mut self) -> &Mcontext {
        if self.phase == WrapPhase::PostAbnormal {
            self.misuses.push("mcontext access in abnormal post callback");
        }
        self.mc
    }

    /// Mutable access to the application machine context; changes take
    /// effect when the callback returns.
    #[must_use]
    pub fn mcontext_mut(&mut self) -> &mut Mcontext {
        if self.phase == WrapPhase::PostAbnormal {
            self.misuses.push("mcontext access in abnormal post callback");
        }
        self.mc
    }

    /// The user datum shared between a pre callback and its matching post.
    #[must_use]
    pub fn user_data(&self) -> u64 {
        *self.user_data
    }

    /// Replaces the user datum handed to the matching post callback.
    pub fn set_user_data(&mut self, value: u64) {
        *self.user_data = value;
    }

    /// Skips the wrapped function's body: the caller observes `retval` and
    /// no post callback fires. Pre phase only.
    pub fn skip_call(&mut self, retval: u64, stdcall_bytes: u64) {
        if self.phase != WrapPhase::Pre {
            self.misuses.push("skip_call outside pre callback");
            return;
        }
        *self.skip = Some(SkipCall {
            retval,
            stdcall_bytes,
        });
    }

    fn stack_arg_addr(&self, arg: usize) -> u64 {
        // At entry the stack pointer sits on the return address; stack
        // arguments start one slot above.
        let index = (arg - ARG_REGS.len()) as u64;
        self.mc
            .sp
            .wrapping_add(STACK_SLOT)
            .wrapping_add(index * STACK_SLOT)
    }
}
