// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-CPU local state.
//!
//! Each physical core that may enter the secure world gets one
//! [`CoreLocal`] block: which thread slot it is currently running, the
//! tops of its temporary and abort stacks, and how many spinlocks it
//! holds. The fields are atomics so the blocks can sit in a shared table,
//! but the access discipline is stricter than the types suggest:
//! `curr_thread` is written only under the global lock with IRQs masked on
//! the owning CPU.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::exceptions::ExceptionMask;
use crate::platform::Platform;
use crate::thread::ThreadCore;

/// Sentinel for "no current thread".
const CURR_NONE: usize = usize::MAX;

/// Per-CPU local block.
#[derive(Debug)]
pub struct CoreLocal {
    curr_thread: AtomicUsize,
    tmp_stack_va_end: AtomicU64,
    abt_stack_va_end: AtomicU64,
    spinlocks_held: AtomicUsize,
}

impl CoreLocal {
    pub(crate) fn new() -> Self {
        CoreLocal {
            curr_thread: AtomicUsize::new(CURR_NONE),
            tmp_stack_va_end: AtomicU64::new(0),
            abt_stack_va_end: AtomicU64::new(0),
            spinlocks_held: AtomicUsize::new(0),
        }
    }

    /// The thread slot this CPU is currently running, if any.
    pub fn curr_thread(&self) -> Option<usize> {
        match self.curr_thread.load(Ordering::Acquire) {
            CURR_NONE => None,
            n => Some(n),
        }
    }

    pub(crate) fn set_curr_thread(&self, slot: Option<usize>) {
        self.curr_thread
            .store(slot.unwrap_or(CURR_NONE), Ordering::Release);
    }

    /// Top of this CPU's temporary stack.
    pub fn tmp_stack_va_end(&self) -> u64 {
        self.tmp_stack_va_end.load(Ordering::Relaxed)
    }

    pub(crate) fn set_tmp_stack_va_end(&self, va: u64) {
        self.tmp_stack_va_end.store(va, Ordering::Relaxed);
    }

    /// Top of this CPU's abort stack.
    pub fn abt_stack_va_end(&self) -> u64 {
        self.abt_stack_va_end.load(Ordering::Relaxed)
    }

    pub(crate) fn set_abt_stack_va_end(&self, va: u64) {
        self.abt_stack_va_end.store(va, Ordering::Relaxed);
    }

    pub(crate) fn spinlocks_held(&self) -> usize {
        self.spinlocks_held.load(Ordering::Relaxed)
    }

    pub(crate) fn spinlock_acquired(&self) {
        self.spinlocks_held.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn spinlock_released(&self) {
        let prev = self.spinlocks_held.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }
}

impl<P: Platform> ThreadCore<P> {
    /// The local block of the CPU executing the caller.
    ///
    /// IRQs must be masked before calling this -- otherwise the caller
    /// could be migrated to a different core between reading the CPU index
    /// and using the block -- and the assertion enforces it.
    pub fn core_local(&self) -> &CoreLocal {
        assert!(
            self.get_exceptions().contains(ExceptionMask::IRQ),
            "core_local requires IRQs masked"
        );

        let cpu = self.platform.core_index();
        assert!(cpu < self.config.num_cores);
        &self.locals[cpu]
    }

    /// The local block of a specific CPU, for inspection.
    pub fn core_local_of(&self, cpu: usize) -> &CoreLocal {
        &self.locals[cpu]
    }
}
