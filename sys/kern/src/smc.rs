// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SMC dispatch.
//!
//! Two entry points exist for world-switch calls. Fast calls run to
//! completion on the caller's (temporary) stack and may not unmask
//! anything. Standard calls are bound to a thread slot: either a fresh
//! allocation, or -- when the call is a return-from-RPC -- the resumption
//! of a suspended slot. Both paths verify the stack canaries before doing
//! anything else.

use citadel_abi::{self as abi, SmcArgs};

use crate::exceptions::ExceptionMask;
use crate::platform::{ContextCtx, Platform};
use crate::thread::ThreadCore;

impl<P: Platform> ThreadCore<P> {
    /// Fast-call entry. Stateless: no thread is allocated and the handler
    /// must leave every exception masked.
    pub fn handle_fast_smc(&self, args: &mut SmcArgs) {
        self.check_canaries();
        (self.handlers.fast_smc)(self, args);
        // Fast handlers must not unmask any exceptions.
        assert_eq!(self.get_exceptions(), ExceptionMask::ALL);
    }

    /// Standard-call entry: demultiplexes between resuming a suspended
    /// thread and allocating a fresh one. Called with all exceptions
    /// masked, as the world entry leaves them.
    pub fn handle_std_smc(&self, args: &mut SmcArgs) {
        self.check_canaries();

        if args.a0 == abi::CALL_RETURN_FROM_RPC {
            self.resume_from_rpc(args);
        } else {
            self.alloc_and_run(args);
        }
    }

    /// Native-interrupt entry.
    pub fn handle_fiq(&self) {
        self.check_canaries();
        (self.handlers.fiq)(self);
    }

    pub fn handle_cpu_on(&self, a0: u64, a1: u64) -> u32 {
        (self.handlers.cpu_on)(a0, a1)
    }

    pub fn handle_cpu_off(&self, a0: u64, a1: u64) -> u32 {
        (self.handlers.cpu_off)(a0, a1)
    }

    pub fn handle_cpu_suspend(&self, a0: u64, a1: u64) -> u32 {
        (self.handlers.cpu_suspend)(a0, a1)
    }

    pub fn handle_cpu_resume(&self, a0: u64, a1: u64) -> u32 {
        (self.handlers.cpu_resume)(a0, a1)
    }

    pub fn handle_system_off(&self, a0: u64, a1: u64) -> u32 {
        (self.handlers.system_off)(a0, a1)
    }

    pub fn handle_system_reset(&self, a0: u64, a1: u64) -> u32 {
        (self.handlers.system_reset)(a0, a1)
    }

    /// Body of a standard call, running in the bound thread's context.
    ///
    /// Before the registered handler sees the call, the thread's RPC
    /// argument buffer is allocated (unless the preallocation cache still
    /// holds one); a caller that cannot provide one gets `ENOMEM` and the
    /// handler never runs. Afterwards the filesystem-RPC cache is flushed
    /// and the buffer is handed back, unless preallocation keeps it.
    fn std_smc_entry_body(&self, mut args: SmcArgs) -> SmcArgs {
        if !self.ensure_rpc_arg() {
            args.a0 = abi::RETURN_ENOMEM;
            return args;
        }

        (self.handlers.std_smc)(self, &mut args);

        self.fs_cache_clear();
        self.release_rpc_arg();
        args
    }
}

/// The function a fresh thread context starts in, reached through the
/// platform's context-switch primitive.
pub(crate) fn std_smc_context_entry<P: Platform>(
    ctx: ContextCtx,
    args: SmcArgs,
) -> SmcArgs {
    // Safety: the dispatcher stores a pointer to itself in the context
    // word and keeps the core alive until every context has been joined.
    let core = unsafe { &*(ctx.0 as *const ThreadCore<P>) };

    let out = core.std_smc_entry_body(args);

    core.mask_exceptions(ExceptionMask::ALL);
    core.state_free();
    out
}
