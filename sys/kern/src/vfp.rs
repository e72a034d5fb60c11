// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lazy save/restore of the floating-point register file.
//!
//! Three principals can own the FPU while a secure thread runs: the normal
//! world (whose state was live when the SMC arrived), the secure kernel,
//! and the user half of a trusted application session. Saving the register
//! bank is expensive, so each save is performed lazily: entering a context
//! only *marks* the outgoing owner's state as pending, and the bank is
//! actually read the first time another principal touches the unit.
//!
//! Each save slot runs the same little state machine:
//!
//! ```text
//!   Cleared -> Pending -> Saved -> Cleared
//! ```
//!
//! `Saved` is reachable only from `Pending`, which makes the illegal
//! "finalized but never initiated" combination unrepresentable. At most
//! one of the secure-kernel and secure-user contexts is live at any
//! instant, and secure use of the unit always implies the normal-world
//! save was finalized first -- the selection order in
//! [`ThreadCore::kernel_enable_vfp`] enforces that.

use alloc::sync::{Arc, Weak};

use crate::exceptions::ExceptionMask;
use crate::platform::Platform;
use crate::thread::ThreadCore;

/// The architectural FPU register bank: 32 128-bit registers plus the
/// control and status words.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VfpBank {
    pub regs: [u64; 64],
    pub fpcr: u32,
    pub fpsr: u32,
}

impl Default for VfpBank {
    fn default() -> Self {
        VfpBank {
            regs: [0; 64],
            fpcr: 0,
            fpsr: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LazyState {
    /// Nothing outstanding; the bank content here is stale.
    Cleared,
    /// A lazy save was initiated: the unit is disabled and the owner's
    /// values are still in hardware, to be read if anyone else uses it.
    Pending,
    /// The owner's values were read out into the bank.
    Saved,
}

/// One lazy-save slot.
pub(crate) struct LazyBank {
    bank: VfpBank,
    state: LazyState,
    /// Always perform the bank read on finalize, even if laziness would
    /// permit skipping it. Set on the normal-world slot under
    /// ARM-Trusted-Firmware boots, where the firmware clobbers the FPU
    /// enable bit and the usual "did they touch it" test is meaningless.
    force_save: bool,
}

impl LazyBank {
    fn new() -> Self {
        LazyBank {
            bank: VfpBank::default(),
            state: LazyState::Cleared,
            force_save: false,
        }
    }

    /// Initiates a lazy save: disables the unit so the next use traps,
    /// leaving the owner's values in hardware.
    fn init_lazy<P: Platform>(&mut self, p: &P) {
        p.vfp_set_enabled(false);
        self.state = LazyState::Pending;
    }

    /// Completes an outstanding lazy save by reading the bank.
    fn finalize<P: Platform>(&mut self, p: &P) {
        debug_assert_eq!(self.state, LazyState::Pending);
        p.vfp_read_bank(&mut self.bank);
        self.state = LazyState::Saved;
    }

    /// Puts the owner's values back (if they were actually read out) and
    /// clears the slot.
    fn restore<P: Platform>(&mut self, p: &P) {
        if self.state == LazyState::Saved {
            p.vfp_write_bank(&self.bank);
        }
        self.state = LazyState::Cleared;
    }

    pub(crate) fn state(&self) -> LazyState {
        self.state
    }

    pub(crate) fn force_save(&self) -> bool {
        self.force_save
    }
}

/// FPU state of the user half of a trusted application session.
///
/// Owned by the session; the thread holds only a weak back-reference that
/// [`ThreadCore::user_clear_vfp`] severs when the session dies.
pub struct UserVfpState {
    pub(crate) lazy: LazyBank,
}

impl UserVfpState {
    pub fn new() -> Self {
        UserVfpState {
            lazy: LazyBank::new(),
        }
    }

    /// The saved register bank, if a completed save is held.
    pub fn saved_bank(&self) -> Option<&VfpBank> {
        match self.lazy.state {
            LazyState::Saved => Some(&self.lazy.bank),
            _ => None,
        }
    }
}

impl Default for UserVfpState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread FPU tracking: the three lazy-save layers.
pub(crate) struct VfpThreadState {
    pub(crate) ns: LazyBank,
    pub(crate) sec: LazyBank,
    pub(crate) uvfp: Weak<spin::Mutex<UserVfpState>>,
}

impl VfpThreadState {
    pub(crate) fn new() -> Self {
        VfpThreadState {
            ns: LazyBank::new(),
            sec: LazyBank::new(),
            uvfp: Weak::new(),
        }
    }
}

impl<P: Platform> ThreadCore<P> {
    /// Marks the normal world's FPU state pending-save on world entry.
    /// Runs at the start of every allocation and resume; the actual bank
    /// read happens only if secure code touches the unit.
    pub(crate) fn lazy_save_ns_vfp(&self) {
        if !self.config.vfp {
            return;
        }
        let ct = self.current_thread_id();
        let mut v = self.vfp[ct].lock();
        v.ns.force_save = self.config.arm_trusted_fw;
        v.ns.init_lazy(&self.platform);
    }

    /// Puts the normal world's FPU state back before leaving secure
    /// world. If the lazy save never finalized, the hardware still holds
    /// the normal-world values and only the marker is cleared.
    pub(crate) fn lazy_restore_ns_vfp(&self) {
        if !self.config.vfp {
            return;
        }
        let ct = self.current_thread_id();
        let mut v = self.vfp[ct].lock();
        assert_eq!(v.sec.state(), LazyState::Cleared);

        if let Some(tuv) = v.uvfp.upgrade() {
            let mut u = tuv.lock();
            if u.lazy.state() == LazyState::Pending {
                u.lazy.finalize(&self.platform);
            }
        }

        v.ns.restore(&self.platform);
    }

    /// First secure-kernel use of the FPU: completes whichever lazy save
    /// is outstanding and enables the unit. IRQs are masked for the
    /// duration of kernel FPU use; the previous mask is returned for
    /// [`kernel_disable_vfp`][Self::kernel_disable_vfp].
    ///
    /// The selection is ordered: the normal world first if its save has
    /// not finalized, else a secure-kernel save re-entered through the
    /// abort path, else the bound user state.
    pub fn kernel_enable_vfp(&self) -> ExceptionMask {
        debug_assert!(self.config.vfp);
        let exceptions = self.mask_exceptions(ExceptionMask::IRQ);
        let ct = self.current_thread_id();
        let mut v = self.vfp[ct].lock();

        assert!(!self.platform.vfp_is_enabled());

        if v.ns.state() == LazyState::Pending {
            v.ns.finalize(&self.platform);
        } else if v.sec.state() == LazyState::Pending {
            // Handling an abort taken while the thread was using the unit.
            v.sec.finalize(&self.platform);
        } else if let Some(tuv) = v.uvfp.upgrade() {
            let mut u = tuv.lock();
            if u.lazy.state() == LazyState::Pending {
                u.lazy.finalize(&self.platform);
            }
        }

        self.platform.vfp_set_enabled(true);
        exceptions
    }

    /// Ends a kernel FPU section started by
    /// [`kernel_enable_vfp`][Self::kernel_enable_vfp], restoring the IRQ
    /// bit of the saved mask.
    pub fn kernel_disable_vfp(&self, saved: ExceptionMask) {
        assert!(self.platform.vfp_is_enabled());
        self.platform.vfp_set_enabled(false);

        let mut exceptions = self.get_exceptions();
        assert!(exceptions.contains(ExceptionMask::IRQ));
        exceptions.remove(ExceptionMask::IRQ);
        exceptions |= saved & ExceptionMask::IRQ;
        self.set_exceptions(exceptions);
    }

    /// Abort-path entry: if the interrupted context had the unit live,
    /// initiate a secure-kernel lazy save.
    pub fn kernel_save_vfp(&self) {
        assert!(self.get_exceptions().contains(ExceptionMask::IRQ));
        let ct = self.current_thread_id();
        let mut v = self.vfp[ct].lock();
        if self.platform.vfp_is_enabled() {
            v.sec.init_lazy(&self.platform);
        }
    }

    /// Abort-path exit: undo [`kernel_save_vfp`][Self::kernel_save_vfp].
    pub fn kernel_restore_vfp(&self) {
        assert!(self.get_exceptions().contains(ExceptionMask::IRQ));
        assert!(!self.platform.vfp_is_enabled());
        let ct = self.current_thread_id();
        let mut v = self.vfp[ct].lock();
        if v.sec.state() != LazyState::Cleared {
            v.sec.restore(&self.platform);
        }
    }

    /// Binds `uvfp` as the user-level FPU state of the current thread and
    /// gives it the unit, saving whichever state was in the way: the
    /// normal world's if still pending, or a previously bound user state
    /// being switched away from.
    pub fn user_enable_vfp(&self, uvfp: &Arc<spin::Mutex<UserVfpState>>) {
        assert!(self.get_exceptions().contains(ExceptionMask::IRQ));
        assert!(!self.platform.vfp_is_enabled());
        let ct = self.current_thread_id();
        let mut v = self.vfp[ct].lock();

        if v.ns.state() == LazyState::Pending {
            v.ns.finalize(&self.platform);
        } else if let Some(tuv) = v.uvfp.upgrade() {
            if !Arc::ptr_eq(&tuv, uvfp) {
                let mut u = tuv.lock();
                if u.lazy.state() == LazyState::Pending {
                    u.lazy.finalize(&self.platform);
                }
            }
        }

        {
            let mut u = uvfp.lock();
            u.lazy.restore(&self.platform);
        }

        v.uvfp = Arc::downgrade(uvfp);
        self.platform.vfp_set_enabled(true);
    }

    /// Called when the thread suspends while user code was running:
    /// initiates a lazy save of the bound user state.
    pub fn user_save_vfp(&self) {
        assert!(self.get_exceptions().contains(ExceptionMask::IRQ));
        if !self.platform.vfp_is_enabled() {
            return;
        }
        let ct = self.current_thread_id();
        let v = self.vfp[ct].lock();
        let tuv = v.uvfp.upgrade().expect("user FPU use without bound state");
        let mut u = tuv.lock();
        assert_eq!(u.lazy.state(), LazyState::Cleared);
        u.lazy.init_lazy(&self.platform);
    }

    /// Unbinds `uvfp` when its owning session is destroyed.
    pub fn user_clear_vfp(&self, uvfp: &Arc<spin::Mutex<UserVfpState>>) {
        let ct = self.current_thread_id();
        let mut v = self.vfp[ct].lock();
        if Weak::as_ptr(&v.uvfp) == Arc::as_ptr(uvfp) {
            v.uvfp = Weak::new();
        }
        uvfp.lock().lazy.state = LazyState::Cleared;
    }
}
