// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seams between the dispatch core and everything it does not own.
//!
//! The core is deliberately ignorant of the hardware and of the trusted
//! application layer. [`Platform`] collects the operations the surrounding
//! system must provide: CPU identity, the exception-mask register, the
//! context-switch primitive, the FPU bank, normal-world memory translation,
//! the demand pager, and user-mode entry. On bare metal these are backed by
//! the exception-vector assembly and the memory manager; on hosted builds
//! the [`host`] module provides an emulation good enough to drive the whole
//! SMC/RPC protocol from tests.
//!
//! [`SessionManager`] is the trusted-application layer the standard-call
//! entry hands commands to, and [`ThreadServices`] is the face of the core
//! that layer sees while it runs on a secure thread.

use citadel_abi::{Identity, MsgParam, Origin, SmcArgs, Uuid};
use core::ptr::NonNull;

use crate::entry::TaParams;
use crate::exceptions::ExceptionMask;
use crate::thread::{ThreadCore, UserMap};
use crate::tsd::PGT_CACHE_ENTRIES;
use crate::vfp::VfpBank;

/// Opaque context word passed through [`Platform::context_spawn`] to the
/// context entry function. The dispatcher puts a pointer to the core in
/// here; the platform must treat it as opaque and deliver it unchanged.
#[derive(Copy, Clone)]
pub struct ContextCtx(pub *const ());

/// Entry function of a freshly spawned thread context. Runs on the
/// thread's stack; its return value is the SMC reply of the completed
/// call.
pub type ContextEntry = fn(ContextCtx, SmcArgs) -> SmcArgs;

/// How a thread context gave control back to the dispatcher.
#[derive(Copy, Clone, Debug)]
pub enum ContextExit {
    /// The context ran to completion; the words are the SMC reply.
    Completed(SmcArgs),
    /// The context suspended itself (an RPC out to the normal world); the
    /// words are the RPC request.
    Suspended(SmcArgs),
}

/// Arguments for entering user code on the current thread.
#[derive(Copy, Clone, Debug)]
pub struct UserModeEntry {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub user_sp: u64,
    pub entry_func: u64,
    /// Status register to install, as computed by the kernel.
    pub spsr: u64,
}

/// Result of a user-mode excursion.
#[derive(Copy, Clone, Debug, Default)]
pub struct UserModeExit {
    pub ret: u32,
    pub exit_status0: u32,
    pub exit_status1: u32,
}

/// The operations the surrounding system provides to the dispatch core.
///
/// Implementations must be callable from any CPU entering the secure
/// world, hence the `Sync` bound. The context-switch operations carry the
/// same contract the exception-vector assembly honors on bare metal:
///
/// - `context_spawn` transfers control to `entry` on the stack recorded
///   for `slot` and returns when the context completes or suspends.
/// - `context_resume` delivers resume words to a suspended context and
///   likewise returns on the next completion or suspension.
/// - `context_yield` is called *from* a thread context to suspend it; it
///   returns the words delivered by a later `context_resume`.
pub trait Platform: Sync {
    /// Index of the CPU executing the caller, from the hardware CPU
    /// identifier register. Only meaningful while migration is impossible
    /// (IRQs masked); callers enforce that.
    fn core_index(&self) -> usize;

    /// Reads the exception-mask register of the current CPU.
    fn read_exceptions(&self) -> ExceptionMask;

    /// Writes the exception-mask register of the current CPU. Policy
    /// (spinlock assertions) lives in the core; this is the raw register.
    fn write_exceptions(&self, mask: ExceptionMask);

    /// Address of the standard-SMC entry trampoline, used as the initial
    /// program counter of a fresh thread context.
    fn std_smc_entry_pc(&self) -> u64;

    fn context_spawn(
        &self,
        slot: usize,
        entry: ContextEntry,
        ctx: ContextCtx,
        args: SmcArgs,
    ) -> ContextExit;

    fn context_resume(&self, slot: usize, args: SmcArgs) -> ContextExit;

    fn context_yield(&self, slot: usize, args: SmcArgs) -> SmcArgs;

    /// Whether the FPU is currently enabled for the running context.
    fn vfp_is_enabled(&self) -> bool;

    /// Enables or disables the FPU.
    fn vfp_set_enabled(&self, on: bool);

    /// Reads the FPU register bank into `bank`.
    fn vfp_read_bank(&self, bank: &mut VfpBank);

    /// Restores the FPU register bank from `bank`.
    fn vfp_write_bank(&self, bank: &VfpBank);

    /// The registered non-secure shared-memory object, as (base, size).
    /// Immutable after init.
    fn nsec_shm_region(&self) -> (u64, u64);

    /// Checks whether `[pa, pa+len)` lies entirely in non-secure physical
    /// memory.
    fn pbuf_is_nonsec(&self, pa: u64, len: u64) -> bool;

    /// Translates a non-secure physical address to a virtual pointer, or
    /// `None` if no mapping covers `[pa, pa+len)`.
    fn phys_to_virt_nsec(&self, pa: u64, len: usize) -> Option<NonNull<u8>>;

    /// Reserves a guard page plus `size` bytes of pager-backed stack for
    /// `slot` and returns the top-of-stack virtual address.
    fn pager_map_stack(&self, slot: usize, guard: u64, size: u64) -> u64;

    /// Returns the physical pages backing `[base, base+len)` to the pager.
    fn pager_release(&self, base: u64, len: u64);

    /// Whether a user-space address-space mapping is active on this CPU.
    fn user_map_active(&self) -> bool;

    /// Snapshots the active user-space mapping.
    fn read_user_map(&self) -> UserMap;

    /// Installs (or clears, with `None`) the user-space mapping.
    fn write_user_map(&self, map: Option<&UserMap>);

    /// Transfers to user code; returns when it exits or faults.
    fn enter_user_mode(&self, entry: UserModeEntry) -> UserModeExit;

    /// Feeds timing jitter into the platform PRNG. Called on every RPC
    /// suspension.
    fn add_jitter_entropy(&self);

    /// The trusted-application session layer.
    fn sessions(&self) -> &dyn SessionManager;
}

/// An error from the session layer, carried verbatim into the argument
/// record's `ret`/`ret_origin` fields.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionError {
    pub code: u32,
    pub origin: Origin,
}

impl SessionError {
    pub fn new(code: u32, origin: Origin) -> Self {
        SessionError { code, origin }
    }
}

/// The face of the dispatch core that the session layer sees while running
/// on a secure thread: outgoing RPC services and thread-local state.
pub trait ThreadServices {
    /// Issues a generic command RPC to the normal world; returns the
    /// command-level result code.
    fn rpc_cmd(&self, cmd: u32, params: &mut [MsgParam]) -> u32;

    /// Allocates normal-world shared memory; returns (physical address,
    /// cookie), or `None` if the allocation failed or failed validation.
    fn rpc_alloc_payload(&self, size: u64) -> Option<(u64, u64)>;

    /// Frees normal-world shared memory by cookie.
    fn rpc_free_payload(&self, cookie: u64);

    /// Stashes a payload buffer in the current thread's filesystem-RPC
    /// cache, releasing any previously cached buffer.
    fn fs_cache_put(&self, pa: u64, cookie: u64);

    /// Takes one page-table handle out of the current thread's cache.
    fn pgt_cache_take(&self) -> Option<u64>;

    /// Parks a page-table handle in the current thread's cache. Returns
    /// `false` when the cache is full; the caller keeps ownership then.
    fn pgt_cache_put(&self, pgt: u64) -> bool;

    /// Empties the current thread's page-table cache, returning every
    /// cached handle. The session layer calls this when it tears down the
    /// user address space the tables belonged to.
    fn pgt_cache_drain(&self) -> heapless::Vec<u64, PGT_CACHE_ENTRIES>;

    /// The session the current thread is executing on behalf of, if any.
    fn current_session(&self) -> Option<u32>;
}

/// The trusted-application session layer.
///
/// Command-level failures are reported through [`SessionError`], never by
/// panicking; the dispatch core carries them to the caller unchanged.
pub trait SessionManager: Sync {
    /// Opens a session toward the application named by `uuid` on behalf of
    /// `clnt`, returning the session handle.
    fn open_session(
        &self,
        services: &dyn ThreadServices,
        uuid: &Uuid,
        clnt: &Identity,
        params: &mut TaParams,
    ) -> Result<u32, SessionError>;

    /// Looks up a session handle, optionally taking it for exclusive use.
    /// Returns `None` for unknown handles.
    fn get_session(&self, id: u32, exclusive: bool) -> Option<u32>;

    /// Releases a handle taken by `get_session`.
    fn put_session(&self, id: u32);

    /// Closes a session; returns the command-level result code.
    fn close_session(&self, services: &dyn ThreadServices, id: u32) -> u32;

    /// Invokes command `func` on an open session.
    fn invoke_command(
        &self,
        services: &dyn ThreadServices,
        id: u32,
        func: u32,
        params: &mut TaParams,
    ) -> Result<(), SessionError>;

    /// Flags the pending command on a session as cancelled.
    fn cancel_command(
        &self,
        services: &dyn ThreadServices,
        id: u32,
    ) -> Result<(), SessionError>;

    /// Session-time accounting hook: user code resumed on this thread.
    fn update_utime_resume(&self) {}

    /// Session-time accounting hook: user code suspended on this thread.
    fn update_utime_suspend(&self) {}

    /// Profiling hook: user program counter at suspension.
    fn gprof_sample_pc(&self, _pc: u64) {}
}

/// Handler invoked for fast and standard SMCs.
pub type SmcHandler<P> = fn(&ThreadCore<P>, &mut SmcArgs);

/// Handler invoked for native interrupts taken while in secure world.
pub type FiqHandler<P> = fn(&ThreadCore<P>);

/// Handler invoked for power-management requests.
pub type PmHandler = fn(u64, u64) -> u32;

/// The platform handler table, fixed at construction.
///
/// There is deliberately no way to re-register a handler after the core is
/// built: the table is immutable configuration, not mutable global state.
pub struct Handlers<P: Platform> {
    pub std_smc: SmcHandler<P>,
    pub fast_smc: SmcHandler<P>,
    pub fiq: FiqHandler<P>,
    pub cpu_on: PmHandler,
    pub cpu_off: PmHandler,
    pub cpu_suspend: PmHandler,
    pub cpu_resume: PmHandler,
    pub system_off: PmHandler,
    pub system_reset: PmHandler,
}

impl<P: Platform> Handlers<P> {
    /// A table routing standard calls into the built-in entry demux, with
    /// the given fast-call handler and no-op PM handlers.
    pub fn with_defaults(fast_smc: SmcHandler<P>) -> Self {
        fn pm_noop(_a0: u64, _a1: u64) -> u32 {
            0
        }
        Handlers {
            std_smc: crate::entry::std_entry,
            fast_smc,
            fiq: |_| {},
            cpu_on: pm_noop,
            cpu_off: pm_noop,
            cpu_suspend: pm_noop,
            cpu_resume: pm_noop,
            system_off: pm_noop,
            system_reset: pm_noop,
        }
    }
}

// Manual impls: a derive would demand P: Clone/Copy, which a table of fn
// pointers does not need.
impl<P: Platform> Clone for Handlers<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Platform> Copy for Handlers<P> {}

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "none"))] {
        pub mod host;
    }
}
