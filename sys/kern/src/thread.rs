// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The thread table and its state machine.
//!
//! A fixed pool of secure threads services standard calls from the normal
//! world. Each slot cycles `FREE -> ACTIVE -> (SUSPENDED -> ACTIVE)* ->
//! FREE`; every transition happens under the single global lock, and the
//! critical sections touch only slot fields -- never the platform, never
//! the session layer. A suspended thread may be resumed on any CPU, so a
//! slot's saved register context is the whole of its execution state.

use alloc::boxed::Box;
use bitflags::bitflags;
use citadel_abi::{self as abi, SmcArgs};
use core::ops::{Deref, DerefMut};

use crate::config::Config;
use crate::cpu::CoreLocal;
use crate::exceptions::ExceptionMask;
use crate::kmutex::MutexId;
use crate::platform::{
    ContextCtx, ContextExit, Handlers, Platform, UserModeEntry, UserModeExit,
};
use crate::stack::StackPool;
use crate::tsd::Tsd;
use crate::vfp::VfpThreadState;

/// Size of the guard page placed below each pager-backed thread stack.
pub(crate) const GUARD_PAGE_SIZE: u64 = 4096;

/// Number of mutexes one thread may hold simultaneously.
pub(crate) const MAX_HELD_MUTEXES: usize = 16;

/// Lifecycle state of a thread slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Free,
    Active,
    Suspended,
}

impl ThreadState {
    pub fn is_active(&self) -> bool {
        *self == ThreadState::Active
    }
}

bitflags! {
    /// Per-thread flag bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ThreadFlags: u32 {
        /// Normal-world IRQs are to be unmasked while this thread runs.
        const IRQ_ENABLE = 1 << 0;
        /// The next resume must overwrite the first six saved registers
        /// with the caller's argument words.
        const COPY_ARGS_ON_RETURN = 1 << 1;
        /// The thread was suspended to hand a foreign interrupt to the
        /// normal world.
        const EXIT_ON_FOREIGN_INTR = 1 << 2;
    }
}

// AArch64 SPSR encoding, as much of it as the dispatch core touches.
pub(crate) const SPSR_M_EL1T: u64 = 0x4;
pub(crate) const SPSR_MODE_RW_32: u64 = 1 << 4;
pub(crate) const SPSR_32_T: u64 = 1 << 5;
pub(crate) const SPSR_F: u64 = 1 << 6;
pub(crate) const SPSR_I: u64 = 1 << 7;
pub(crate) const SPSR_A: u64 = 1 << 8;

/// Saved architectural register context of a thread.
#[derive(Copy, Clone, Debug, Default)]
pub struct ThreadRegs {
    pub pc: u64,
    pub spsr: u64,
    pub sp: u64,
    pub x: [u64; 31],
}

/// Whether a saved status register describes a user-mode context: either
/// an AArch32 one, or AArch64 at EL0.
pub(crate) fn is_from_user(spsr: u64) -> bool {
    if spsr & SPSR_MODE_RW_32 != 0 {
        return true;
    }
    (spsr >> 2) & 0x3 == 0
}

/// Maps an exception mask onto the corresponding SPSR bits.
fn mask_to_spsr_bits(mask: ExceptionMask) -> u64 {
    let mut bits = 0;
    if mask.contains(ExceptionMask::FIQ) {
        bits |= SPSR_F;
    }
    if mask.contains(ExceptionMask::IRQ) {
        bits |= SPSR_I;
    }
    if mask.contains(ExceptionMask::ASYNC_ABORT) {
        bits |= SPSR_A;
    }
    bits
}

/// Computes the status register for entering user code.
///
/// For a 32-bit entry: the current asynchronous-exception bits, the
/// AArch32 execution-state bit, and the Thumb bit taken from bit 0 of the
/// entry address. For a 64-bit entry: just the current exception bits.
/// Both widths report success here; a 32-bit request is not rejected on a
/// 64-bit core.
pub(crate) fn spsr_for_user_entry(
    is_32bit: bool,
    entry_func: u64,
    current: ExceptionMask,
) -> (u64, bool) {
    let s = if is_32bit {
        mask_to_spsr_bits(current)
            | SPSR_MODE_RW_32
            | ((entry_func & 1) << 5) & SPSR_32_T
    } else {
        mask_to_spsr_bits(current)
    };
    (s, true)
}

/// A user-space address-space snapshot, captured at suspension and
/// reinstalled on resume.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct UserMap {
    pub ttbr0: u64,
    pub asid: u32,
}

/// A cached normal-world shared-memory buffer: physical address plus the
/// opaque cookie the normal world frees it by. The virtual mapping is
/// re-derived on every access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RpcBuf {
    pub(crate) pa: u64,
    pub(crate) cookie: u64,
}

/// One slot of the thread table.
pub(crate) struct Thread {
    pub(crate) state: ThreadState,
    pub(crate) flags: ThreadFlags,
    pub(crate) regs: ThreadRegs,
    pub(crate) stack_va_end: u64,
    pub(crate) hyp_clnt_id: u64,
    pub(crate) user_map: Option<UserMap>,
    pub(crate) rpc_buf: Option<RpcBuf>,
    pub(crate) tsd: Tsd,
    pub(crate) mutexes: heapless::Vec<MutexId, MAX_HELD_MUTEXES>,
}

impl Thread {
    fn new(stack_va_end: u64) -> Self {
        Thread {
            state: ThreadState::Free,
            flags: ThreadFlags::empty(),
            regs: ThreadRegs::default(),
            stack_va_end,
            hyp_clnt_id: 0,
            user_map: None,
            rpc_buf: None,
            tsd: Tsd::default(),
            mutexes: heapless::Vec::new(),
        }
    }
}

/// Everything the global lock protects.
pub(crate) struct Table {
    pub(crate) slots: Box<[Thread]>,
    pub(crate) prealloc_rpc_cache: bool,
}

/// Guard for the global lock. Tracks the acquisition in the owning CPU's
/// spinlock count so that unmasking IRQs while it is held trips the
/// assertion in `set_exceptions`.
pub(crate) struct TableGuard<'a> {
    guard: spin::MutexGuard<'a, Table>,
    local: &'a CoreLocal,
}

impl Deref for TableGuard<'_> {
    type Target = Table;

    fn deref(&self) -> &Table {
        &self.guard
    }
}

impl DerefMut for TableGuard<'_> {
    fn deref_mut(&mut self) -> &mut Table {
        &mut self.guard
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.local.spinlock_released();
    }
}

/// The secure-world thread dispatch core.
///
/// One instance exists per secure world; every CPU entering the secure
/// world dispatches through it. Construction is the primary CPU's init;
/// secondary CPUs call [`init_per_cpu`][Self::init_per_cpu] before their
/// first dispatch.
pub struct ThreadCore<P: Platform> {
    // The platform must remain the first field: on hosted builds its drop
    // joins live thread contexts, which may still hold references into the
    // rest of the core.
    pub(crate) platform: P,
    pub(crate) config: Config,
    pub(crate) handlers: Handlers<P>,
    pub(crate) stacks: StackPool,
    pub(crate) locals: Box<[CoreLocal]>,
    pub(crate) vfp: Box<[spin::Mutex<VfpThreadState>]>,
    pub(crate) table: spin::Mutex<Table>,
}

impl<P: Platform> ThreadCore<P> {
    /// Primary-CPU initialization: reserves stack storage, writes the
    /// canaries, claims pager ranges for thread stacks when configured,
    /// and fixes the handler table for good.
    ///
    /// # Panics
    ///
    /// If no non-secure shared-memory region is registered, or the
    /// configuration is degenerate. Init failures are fatal; there is no
    /// partial secure world.
    pub fn new(config: Config, platform: P, handlers: Handlers<P>) -> Self {
        assert!(config.num_threads > 0);
        assert!(config.num_cores > 0);

        let (_, shm_size) = platform.nsec_shm_region();
        if shm_size == 0 {
            panic!("failed to register non-secure shared memory");
        }

        let stacks = StackPool::new(&config);

        let mut slots = alloc::vec::Vec::with_capacity(config.num_threads);
        for n in 0..config.num_threads {
            let va_end = if config.pager {
                platform.pager_map_stack(
                    n,
                    GUARD_PAGE_SIZE,
                    config.stack_thread_size as u64,
                )
            } else {
                stacks.thread_va_end(n)
            };
            slots.push(Thread::new(va_end));
        }

        let mut locals = alloc::vec::Vec::with_capacity(config.num_cores);
        locals.resize_with(config.num_cores, CoreLocal::new);

        let mut vfp = alloc::vec::Vec::with_capacity(config.num_threads);
        vfp.resize_with(config.num_threads, || {
            spin::Mutex::new(VfpThreadState::new())
        });

        ThreadCore {
            platform,
            config,
            handlers,
            stacks,
            locals: locals.into_boxed_slice(),
            vfp: vfp.into_boxed_slice(),
            table: spin::Mutex::new(Table {
                slots: slots.into_boxed_slice(),
                prealloc_rpc_cache: false,
            }),
        }
    }

    /// Per-CPU initialization: records the CPU's temporary and abort
    /// stack tops in its local block. IRQs must be masked.
    pub fn init_per_cpu(&self) {
        let cpu = {
            let l = self.core_local();
            // core_local bounds-checked the index.
            let cpu = self.platform.core_index();
            l.set_tmp_stack_va_end(self.stacks.tmp_va_end(cpu));
            l.set_abt_stack_va_end(self.stacks.abt_va_end(cpu));
            cpu
        };
        log::trace!("per-cpu init done on core {cpu}");
    }

    /// Claims slot 0 for the context the platform is already running in
    /// during boot, without going through allocation.
    pub fn init_boot_thread(&self) {
        let l = self.core_local();
        let mut table = self.lock_global();
        assert_eq!(table.slots[0].state, ThreadState::Free);
        table.slots[0].state = ThreadState::Active;
        l.set_curr_thread(Some(0));
    }

    /// Releases the boot thread once init is complete.
    pub fn clr_boot_thread(&self) {
        let l = self.core_local();
        let ct = l.curr_thread().expect("no boot thread to clear");
        let mut table = self.lock_global();
        assert!(table.slots[ct].state.is_active());
        assert!(table.slots[ct].mutexes.is_empty());
        table.slots[ct].state = ThreadState::Free;
        l.set_curr_thread(None);
    }

    /// Takes the global lock, recording the acquisition against the
    /// current CPU. IRQs must be masked.
    pub(crate) fn lock_global(&self) -> TableGuard<'_> {
        let local = self.core_local();
        let guard = self.table.lock();
        local.spinlock_acquired();
        TableGuard { guard, local }
    }

    /// Runs `f` on the current thread's slot, masking IRQs for the
    /// duration.
    pub(crate) fn with_current_slot<R>(
        &self,
        f: impl FnOnce(&mut Thread) -> R,
    ) -> R {
        let prev = self.mask_exceptions(ExceptionMask::IRQ);
        let ct = self
            .core_local()
            .curr_thread()
            .expect("no current thread");
        let r = {
            let mut table = self.lock_global();
            f(&mut table.slots[ct])
        };
        self.unmask_exceptions(prev);
        r
    }

    /// The current thread slot of the executing CPU, or `None` between
    /// threads. Masks IRQs internally, so callable from any context.
    pub fn curr_thread_id_may_fail(&self) -> Option<usize> {
        let prev = self.mask_exceptions(ExceptionMask::IRQ);
        let ct = self.core_local().curr_thread();
        self.unmask_exceptions(prev);
        ct
    }

    /// The current thread slot; panics if there is none.
    pub fn current_thread_id(&self) -> usize {
        let ct = self
            .curr_thread_id_may_fail()
            .expect("no current thread");
        assert!(ct < self.config.num_threads);
        ct
    }

    /// Initializes a slot's registers for a fresh standard call: program
    /// counter at the standard-SMC entry trampoline, EL1 with the user
    /// stack selector, IRQ and asynchronous abort masked but FIQ open,
    /// arguments in the first eight registers.
    fn init_regs(&self, thread: &mut Thread, args: &SmcArgs) {
        thread.regs = ThreadRegs::default();
        thread.regs.pc = self.platform.std_smc_entry_pc();
        thread.regs.spsr = SPSR_M_EL1T | SPSR_I | SPSR_A;
        thread.regs.sp = thread.stack_va_end;
        thread.regs.x[0] = args.a0;
        thread.regs.x[1] = args.a1;
        thread.regs.x[2] = args.a2;
        thread.regs.x[3] = args.a3;
        thread.regs.x[4] = args.a4;
        thread.regs.x[5] = args.a5;
        thread.regs.x[6] = args.a6;
        thread.regs.x[7] = args.a7;
        // Frame pointer, per the AAPCS.
        thread.regs.x[29] = 0;
    }

    /// Binds the first free slot to a fresh standard call and transfers
    /// control to it. On exhaustion replies `ETHREAD_LIMIT` without
    /// touching any state.
    pub(crate) fn alloc_and_run(&self, args: &mut SmcArgs) {
        let l = self.core_local();
        assert!(l.curr_thread().is_none());

        let n = {
            let mut table = self.lock_global();
            let n = table
                .slots
                .iter()
                .position(|t| t.state == ThreadState::Free);
            match n {
                None => None,
                Some(n) => {
                    table.slots[n].state = ThreadState::Active;
                    l.set_curr_thread(Some(n));
                    Some(n)
                }
            }
        };

        let Some(n) = n else {
            args.a0 = abi::RETURN_ETHREAD_LIMIT;
            return;
        };

        let entry_args = {
            let mut table = self.lock_global();
            let thread = &mut table.slots[n];
            thread.flags = ThreadFlags::empty();
            self.init_regs(thread, args);
            thread.hyp_clnt_id = args.a7;
            SmcArgs {
                a0: thread.regs.x[0],
                a1: thread.regs.x[1],
                a2: thread.regs.x[2],
                a3: thread.regs.x[3],
                a4: thread.regs.x[4],
                a5: thread.regs.x[5],
                a6: thread.regs.x[6],
                a7: thread.regs.x[7],
            }
        };

        self.lazy_save_ns_vfp();
        let exit = self.platform.context_spawn(
            n,
            crate::smc::std_smc_context_entry::<P>,
            ContextCtx(self as *const Self as *const ()),
            entry_args,
        );
        self.finish_dispatch(n, exit, args);
    }

    /// Resumes the suspended thread named in `a3`, provided the caller
    /// identity in `a7` matches the allocator's. Mismatches of any kind
    /// reply `ERESUME` without touching state.
    pub(crate) fn resume_from_rpc(&self, args: &mut SmcArgs) {
        let l = self.core_local();
        assert!(l.curr_thread().is_none());

        let n = args.a3 as usize;
        let resumable = {
            let mut table = self.lock_global();
            if n < self.config.num_threads
                && table.slots[n].state == ThreadState::Suspended
                && table.slots[n].hyp_clnt_id == args.a7
            {
                table.slots[n].state = ThreadState::Active;
                l.set_curr_thread(Some(n));
                true
            } else {
                false
            }
        };

        if !resumable {
            args.a0 = abi::RETURN_ERESUME;
            return;
        }

        let (resume_words, user_mode, user_map) = {
            let mut table = self.lock_global();
            let thread = &mut table.slots[n];
            let user_mode = is_from_user(thread.regs.spsr);

            // A return from a foreign-interrupt RPC must not take
            // parameters from the normal world; only RPC replies proper
            // overwrite the argument registers.
            if thread.flags.contains(ThreadFlags::COPY_ARGS_ON_RETURN) {
                thread.regs.x[0] = args.a0;
                thread.regs.x[1] = args.a1;
                thread.regs.x[2] = args.a2;
                thread.regs.x[3] = args.a3;
                thread.regs.x[4] = args.a4;
                thread.regs.x[5] = args.a5;
                thread.flags.remove(ThreadFlags::COPY_ARGS_ON_RETURN);
            }

            let words = SmcArgs {
                a0: thread.regs.x[0],
                a1: thread.regs.x[1],
                a2: thread.regs.x[2],
                a3: thread.regs.x[3],
                a4: thread.regs.x[4],
                a5: thread.regs.x[5],
                ..SmcArgs::default()
            };
            (words, user_mode, thread.user_map)
        };

        if user_mode {
            self.platform.sessions().update_utime_resume();
        }
        if let Some(map) = &user_map {
            self.platform.write_user_map(Some(map));
        }

        self.lazy_save_ns_vfp();
        let exit = self.platform.context_resume(n, resume_words);
        self.finish_dispatch(n, exit, args);
    }

    /// Suspends the current thread: publishes its register context and
    /// user mapping, flips the slot to SUSPENDED, and releases the CPU.
    /// Returns the slot index, which travels to the normal world as the
    /// resume handle.
    pub fn state_suspend(
        &self,
        flags: ThreadFlags,
        spsr: u64,
        pc: u64,
    ) -> usize {
        let l = self.core_local();
        let ct = l.curr_thread().expect("suspend without current thread");

        self.check_canaries();
        self.release_unused_kernel_stack(ct);

        if is_from_user(spsr) {
            self.user_save_vfp();
            self.platform.sessions().update_utime_suspend();
            self.platform.sessions().gprof_sample_pc(pc);
        }
        self.lazy_restore_ns_vfp();

        let user_map = if self.platform.user_map_active() {
            let map = self.platform.read_user_map();
            self.platform.write_user_map(None);
            Some(map)
        } else {
            None
        };

        let mut table = self.lock_global();
        let thread = &mut table.slots[ct];
        assert!(thread.state.is_active());
        thread.flags |= flags;
        thread.regs.spsr = spsr;
        thread.regs.pc = pc;
        thread.user_map = user_map;
        // Register context and user map are published above; only now does
        // the slot become visible as resumable.
        thread.state = ThreadState::Suspended;
        l.set_curr_thread(None);

        ct
    }

    /// Releases the current thread back to the pool.
    ///
    /// # Panics
    ///
    /// If the thread still holds mutexes: that is a leak the owner can
    /// never repair, and the pool must not recycle the slot.
    pub fn state_free(&self) {
        let l = self.core_local();
        let ct = l.curr_thread().expect("free without current thread");

        self.lazy_restore_ns_vfp();

        if self.config.pager {
            let va_end = {
                let table = self.table.lock();
                table.slots[ct].stack_va_end
            };
            let size = self.config.stack_thread_size as u64;
            self.platform.pager_release(va_end - size, size);
        }

        let mut table = self.lock_global();
        let thread = &mut table.slots[ct];
        assert!(
            thread.mutexes.is_empty(),
            "thread exiting while holding mutexes"
        );
        assert!(thread.state.is_active());
        thread.state = ThreadState::Free;
        thread.flags = ThreadFlags::empty();
        l.set_curr_thread(None);
    }

    /// With the pager enabled, returns the stack pages below the saved
    /// stack pointer -- the part the suspended thread is not using.
    fn release_unused_kernel_stack(&self, ct: usize) {
        if !self.config.pager {
            return;
        }
        let (sp, va_end) = {
            let table = self.table.lock();
            (table.slots[ct].regs.sp, table.slots[ct].stack_va_end)
        };
        let base = va_end - self.config.stack_thread_size as u64;
        self.platform.pager_release(base, sp - base);
    }

    /// Records whether normal-world IRQs should be serviced during this
    /// thread's execution, and applies it.
    pub fn set_irq(&self, enable: bool) {
        let exceptions = self.mask_exceptions(ExceptionMask::IRQ);
        let l = self.core_local();
        let ct = l.curr_thread().expect("set_irq outside a thread");

        {
            let mut table = self.lock_global();
            if enable {
                table.slots[ct].flags |= ThreadFlags::IRQ_ENABLE;
            } else {
                table.slots[ct].flags -= ThreadFlags::IRQ_ENABLE;
            }
        }

        if enable {
            let mut e = exceptions;
            e.remove(ExceptionMask::IRQ);
            self.set_exceptions(e);
        }
        // Not enabling: IRQs stay masked from the mask_exceptions above.
    }

    /// Re-applies the recorded IRQ choice of the current thread, after a
    /// path that masked IRQs behind its back.
    pub fn restore_irq(&self) {
        let exceptions = self.mask_exceptions(ExceptionMask::IRQ);
        let l = self.core_local();
        let ct = l.curr_thread().expect("restore_irq outside a thread");

        let enabled = {
            let table = self.lock_global();
            table.slots[ct].flags.contains(ThreadFlags::IRQ_ENABLE)
        };

        if enabled {
            let mut e = exceptions;
            e.remove(ExceptionMask::IRQ);
            self.set_exceptions(e);
        }
    }

    /// Enters user code on the current thread, computing the target
    /// status register from the current exception state.
    pub fn enter_user_mode(
        &self,
        a0: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        user_sp: u64,
        entry_func: u64,
        is_32bit: bool,
    ) -> UserModeExit {
        self.platform.sessions().update_utime_resume();

        let (spsr, ok) =
            spsr_for_user_entry(is_32bit, entry_func, self.get_exceptions());
        if !ok {
            return UserModeExit {
                ret: 0,
                exit_status0: 1, // panic
                exit_status1: 0xbadbadba,
            };
        }

        self.platform.enter_user_mode(UserModeEntry {
            a0,
            a1,
            a2,
            a3,
            user_sp,
            entry_func,
            spsr,
        })
    }

    /// Whether `va` lies within the current thread's kernel stack.
    pub fn addr_is_in_stack(&self, va: u64) -> bool {
        let Some(ct) = self.curr_thread_id_may_fail() else {
            return false;
        };
        let va_end = {
            let table = self.table.lock();
            table.slots[ct].stack_va_end
        };
        va < va_end && va >= va_end - self.config.stack_thread_size as u64
    }

    /// Top of the current CPU's temporary stack. IRQs must be masked.
    pub fn tmp_stack_va_end(&self) -> u64 {
        self.core_local().tmp_stack_va_end()
    }

    /// Verifies every stack canary; panics on the first mismatch.
    pub fn check_canaries(&self) {
        self.stacks.check_canaries();
    }

    /// Copies the outgoing words of a finished or suspended context into
    /// the caller's register block. A suspension carries the slot index in
    /// `a3` as the normal world's resume handle.
    fn finish_dispatch(
        &self,
        slot: usize,
        exit: ContextExit,
        args: &mut SmcArgs,
    ) {
        match exit {
            ContextExit::Completed(words) => {
                *args = words;
            }
            ContextExit::Suspended(mut words) => {
                words.a3 = slot as u64;
                *args = words;
            }
        }
    }

    // Inspection surface, mostly for the test suite and for debuggers.

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Lifecycle state of a slot.
    pub fn thread_state(&self, n: usize) -> ThreadState {
        self.table.lock().slots[n].state
    }

    /// Flag bits of a slot.
    pub fn thread_flags(&self, n: usize) -> ThreadFlags {
        self.table.lock().slots[n].flags
    }

    /// Saved register context of a slot.
    pub fn thread_regs(&self, n: usize) -> ThreadRegs {
        self.table.lock().slots[n].regs
    }

    /// Caller identity recorded at allocation.
    pub fn thread_client_id(&self, n: usize) -> u64 {
        self.table.lock().slots[n].hyp_clnt_id
    }

    /// The cached RPC argument buffer of a slot, as (pa, cookie).
    pub fn thread_rpc_buf(&self, n: usize) -> Option<(u64, u64)> {
        self.table.lock().slots[n].rpc_buf.map(|b| (b.pa, b.cookie))
    }

    /// Whether a slot has a captured user mapping.
    pub fn thread_has_user_map(&self, n: usize) -> bool {
        self.table.lock().slots[n].user_map.is_some()
    }

    /// Whether the per-thread RPC buffer cache is enabled.
    pub fn prealloc_cache_enabled(&self) -> bool {
        self.table.lock().prealloc_rpc_cache
    }
}
