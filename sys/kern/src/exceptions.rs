// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exception-mask bookkeeping.
//!
//! The mask covers the three asynchronous exception kinds a CPU can take
//! while in secure world. Callers save the previous mask and restore it on
//! every exit path, so the public surface is mask/unmask pairs rather than
//! raw writes. One rule is load-bearing for the whole locking scheme and
//! is asserted here: IRQs must never be unmasked while the current CPU
//! holds a spinlock.

use bitflags::bitflags;

use crate::platform::Platform;
use crate::thread::ThreadCore;

bitflags! {
    /// Asynchronous exception kinds, as maskable bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ExceptionMask: u32 {
        const FIQ = 1 << 0;
        const IRQ = 1 << 1;
        const ASYNC_ABORT = 1 << 2;
    }
}

impl ExceptionMask {
    /// Everything maskable.
    pub const ALL: Self = Self::all();
}

impl<P: Platform> ThreadCore<P> {
    /// Reads the current CPU's exception mask.
    pub fn get_exceptions(&self) -> ExceptionMask {
        self.platform.read_exceptions() & ExceptionMask::ALL
    }

    /// Writes the current CPU's exception mask.
    ///
    /// # Panics
    ///
    /// If the write would unmask IRQs while this CPU holds any spinlock.
    pub fn set_exceptions(&self, mask: ExceptionMask) {
        // IRQ must not be unmasked while holding a spinlock.
        if !mask.contains(ExceptionMask::IRQ) {
            assert_eq!(self.spinlocks_held_raw(), 0);
        }
        self.platform.write_exceptions(mask & ExceptionMask::ALL);
    }

    /// Masks the exceptions in `mask` (in addition to whatever is already
    /// masked) and returns the previous mask for a later
    /// [`unmask_exceptions`][Self::unmask_exceptions].
    pub fn mask_exceptions(&self, mask: ExceptionMask) -> ExceptionMask {
        let prev = self.get_exceptions();
        self.set_exceptions(prev | (mask & ExceptionMask::ALL));
        prev
    }

    /// Restores a mask previously returned by
    /// [`mask_exceptions`][Self::mask_exceptions].
    pub fn unmask_exceptions(&self, prev: ExceptionMask) {
        self.set_exceptions(prev & ExceptionMask::ALL);
    }

    /// Spinlock count of the current CPU, read without the IRQs-masked
    /// assertion of `core_local` -- this backs that very assertion.
    fn spinlocks_held_raw(&self) -> usize {
        let cpu = self.platform.core_index();
        self.locals[cpu].spinlocks_held()
    }
}
