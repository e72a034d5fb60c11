// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outgoing RPC: suspending a thread to ask the normal world for service.
//!
//! A suspension doubles as a message. The thread writes its request into
//! the per-thread shared argument buffer (or, for ALLOC/FREE, directly
//! into the register words), yields, and finds the reply in its registers
//! when it is resumed. Everything that comes back crossed the trust
//! boundary: addresses are re-validated, the argument record is re-read,
//! and buffers that fail validation are immediately handed back.

use citadel_abi::{
    self as abi, reg_pair_from_u64, reg_pair_to_u64, MsgArg, MsgParam,
    SmcArgs,
};
use citadel_kerncore::{covered_by, is_aligned, PhysSpan};
use zerocopy::{FromBytes, IntoBytes};

use crate::config::MAX_RPC_PARAMS;
use crate::exceptions::ExceptionMask;
use crate::platform::{Platform, ThreadServices};
use crate::thread::{RpcBuf, ThreadCore, ThreadFlags, ThreadState};
use crate::tsd::PGT_CACHE_ENTRIES;

/// Error from the prealloc-cache toggles: some thread slot is not FREE.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotIdle;

/// A copy-based view of a message argument record living in normal-world
/// shared memory. Reads copy out and writes copy in; nothing is borrowed
/// from the record across an access, so a concurrently scribbling caller
/// can corrupt values but not this kernel.
pub(crate) struct ArgRecord<'a> {
    bytes: &'a mut [u8],
}

impl<'a> ArgRecord<'a> {
    pub(crate) fn new(bytes: &'a mut [u8]) -> Self {
        assert!(bytes.len() >= core::mem::size_of::<MsgArg>());
        ArgRecord { bytes }
    }

    fn param_offset(&self, index: usize) -> usize {
        core::mem::size_of::<MsgArg>()
            + index * core::mem::size_of::<MsgParam>()
    }

    pub(crate) fn header(&self) -> MsgArg {
        MsgArg::read_from_prefix(self.bytes)
            .expect("record shorter than header")
            .0
    }

    pub(crate) fn set_header(&mut self, header: &MsgArg) {
        header
            .write_to_prefix(self.bytes)
            .expect("record shorter than header");
    }

    pub(crate) fn param(&self, index: usize) -> MsgParam {
        let off = self.param_offset(index);
        MsgParam::read_from_prefix(&self.bytes[off..])
            .expect("parameter outside record")
            .0
    }

    pub(crate) fn set_param(&mut self, index: usize, param: &MsgParam) {
        let off = self.param_offset(index);
        param
            .write_to_prefix(&mut self.bytes[off..])
            .expect("parameter outside record");
    }

    pub(crate) fn zero(&mut self) {
        self.bytes.fill(0);
    }
}

impl<P: Platform> ThreadCore<P> {
    /// The common suspension path: feeds jitter entropy to the PRNG,
    /// publishes the thread's context, and yields the six RPC words to
    /// the dispatcher. Returns the words delivered by the resume.
    fn rpc_out(&self, words: [u64; 6]) -> [u64; 6] {
        self.platform.add_jitter_entropy();

        let prev = self.mask_exceptions(ExceptionMask::ALL);
        let ct = self
            .core_local()
            .curr_thread()
            .expect("rpc outside a thread");
        let (spsr, pc) = {
            let table = self.table.lock();
            (table.slots[ct].regs.spsr, table.slots[ct].regs.pc)
        };

        let suspended =
            self.state_suspend(ThreadFlags::COPY_ARGS_ON_RETURN, spsr, pc);
        debug_assert_eq!(suspended, ct);

        let resumed = self.platform.context_yield(
            ct,
            SmcArgs {
                a0: words[0],
                a1: words[1],
                a2: words[2],
                a3: words[3],
                a4: words[4],
                a5: words[5],
                ..SmcArgs::default()
            },
        );

        self.unmask_exceptions(prev);
        [
            resumed.a0, resumed.a1, resumed.a2, resumed.a3, resumed.a4,
            resumed.a5,
        ]
    }

    /// Suspends to hand a foreign interrupt to the normal world. Unlike
    /// RPC replies, the resume must not deliver caller words into the
    /// thread's registers, so the copy flag stays clear.
    pub fn rpc_foreign_intr(&self) {
        self.platform.add_jitter_entropy();

        let prev = self.mask_exceptions(ExceptionMask::ALL);
        let ct = self
            .core_local()
            .curr_thread()
            .expect("interrupt outside a thread");
        let (spsr, pc) = {
            let table = self.table.lock();
            (table.slots[ct].regs.spsr, table.slots[ct].regs.pc)
        };

        self.state_suspend(ThreadFlags::EXIT_ON_FOREIGN_INTR, spsr, pc);
        let _ = self.platform.context_yield(
            ct,
            SmcArgs::with_a0(abi::RETURN_RPC_FOREIGN_INTR),
        );

        {
            let mut table = self.lock_global();
            table.slots[ct].flags -= ThreadFlags::EXIT_ON_FOREIGN_INTR;
        }
        self.unmask_exceptions(prev);
    }

    /// Whether `[pa, pa+len)` is an acceptable shared buffer: aligned and
    /// entirely inside the registered non-secure shared-memory object.
    fn check_alloced_shm(&self, pa: u64, len: u64, align: u64) -> bool {
        if pa == 0 || !is_aligned(pa, align) {
            return false;
        }
        let Ok(span) = PhysSpan::from_raw(pa, len) else {
            return false;
        };
        let region = ShmRegion(self.platform.nsec_shm_region());
        covered_by(&span, core::slice::from_ref(&region), |_| true)
    }

    /// Asks the normal world for an argument buffer of `size` bytes.
    /// Returns the validated (physical address, cookie) pair, or `None`
    /// -- in which case any buffer the normal world did hand over has
    /// already been freed by cookie.
    pub(crate) fn rpc_alloc_arg(&self, size: usize) -> Option<(u64, u64)> {
        let out =
            self.rpc_out([abi::RETURN_RPC_ALLOC, size as u64, 0, 0, 0, 0]);
        let pa = reg_pair_to_u64(out[1], out[2]);
        let cookie = reg_pair_to_u64(out[4], out[5]);

        if !self.check_alloced_shm(pa, size as u64, 8) {
            self.rpc_free_arg(cookie);
            return None;
        }
        Some((pa, cookie))
    }

    /// Returns an argument buffer to the normal world. A zero cookie is a
    /// no-op, so failed allocations can be freed unconditionally.
    pub(crate) fn rpc_free_arg(&self, cookie: u64) {
        if cookie != 0 {
            let (hi, lo) = reg_pair_from_u64(cookie);
            self.rpc_out([abi::RETURN_RPC_FREE, hi, lo, 0, 0, 0]);
        }
    }

    /// Runs `f` over the current thread's cached argument record.
    fn with_rpc_arg<R>(&self, f: impl FnOnce(&mut ArgRecord<'_>) -> R) -> R {
        let buf = self
            .with_current_slot(|t| t.rpc_buf)
            .expect("no rpc argument buffer");
        let len = abi::msg_arg_size(MAX_RPC_PARAMS);
        let ptr = self
            .platform
            .phys_to_virt_nsec(buf.pa, len)
            .expect("cached rpc buffer not mapped");

        // Safety: the span [pa, pa+len) was validated to lie inside the
        // registered non-secure shared region when the buffer was cached,
        // and the platform just confirmed a mapping covers it. The normal
        // world may race these accesses; ArgRecord only ever copies whole
        // fields in and out, so a race corrupts values, not memory safety
        // here.
        let bytes =
            unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
        f(&mut ArgRecord::new(bytes))
    }

    /// Marshals a command into the argument buffer, suspends, and copies
    /// the output parameter slots back. Returns the record's result code
    /// and its (re-read) parameter count.
    fn rpc_cmd_inner(
        &self,
        cmd: u32,
        params: &mut [MsgParam],
    ) -> (u32, u32) {
        let num_params = params.len();
        assert!(num_params <= MAX_RPC_PARAMS);
        let cookie = self
            .with_current_slot(|t| t.rpc_buf)
            .expect("no rpc argument buffer")
            .cookie;

        self.with_rpc_arg(|rec| {
            rec.zero();
            rec.set_header(&MsgArg {
                cmd,
                // In case the normal world never writes a result.
                ret: abi::TEE_ERROR_GENERIC,
                num_params: num_params as u32,
                ..MsgArg::default()
            });
            for (n, p) in params.iter().enumerate() {
                rec.set_param(n, p);
            }
        });

        let (hi, lo) = reg_pair_from_u64(cookie);
        self.rpc_out([abi::RETURN_RPC_CMD, hi, lo, 0, 0, 0]);

        self.with_rpc_arg(|rec| {
            for (n, p) in params.iter_mut().enumerate() {
                match p.attr_type() {
                    abi::ATTR_TYPE_VALUE_OUTPUT
                    | abi::ATTR_TYPE_VALUE_INOUT
                    | abi::ATTR_TYPE_RMEM_OUTPUT
                    | abi::ATTR_TYPE_RMEM_INOUT
                    | abi::ATTR_TYPE_TMEM_OUTPUT
                    | abi::ATTR_TYPE_TMEM_INOUT => *p = rec.param(n),
                    _ => (),
                }
            }
            let header = rec.header();
            (header.ret, header.num_params)
        })
    }

    /// Drains one cached argument buffer per call while turning the
    /// preallocation cache off.
    ///
    /// Returns `Ok(Some(cookie))` for each reclaimed buffer -- the caller
    /// forwards the cookie to the normal world for freeing -- and
    /// `Ok(None)` once no buffers remain and the cache flag is cleared.
    /// Fails with [`NotIdle`] unless every thread is FREE.
    pub fn disable_prealloc_rpc_cache(&self) -> Result<Option<u64>, NotIdle> {
        let prev = self.mask_exceptions(ExceptionMask::IRQ);
        let result = {
            let mut table = self.lock_global();
            if !table
                .slots
                .iter()
                .all(|t| t.state == ThreadState::Free)
            {
                Err(NotIdle)
            } else if let Some(buf) = table
                .slots
                .iter_mut()
                .find_map(|t| t.rpc_buf.take())
            {
                Ok(Some(buf.cookie))
            } else {
                table.prealloc_rpc_cache = false;
                Ok(None)
            }
        };
        self.unmask_exceptions(prev);
        result
    }

    /// Lets threads keep their argument buffer across calls. Only takes
    /// effect while every thread is FREE; enabling twice is harmless.
    pub fn enable_prealloc_rpc_cache(&self) -> Result<(), NotIdle> {
        let prev = self.mask_exceptions(ExceptionMask::IRQ);
        let result = {
            let mut table = self.lock_global();
            if table.slots.iter().all(|t| t.state == ThreadState::Free) {
                table.prealloc_rpc_cache = true;
                Ok(())
            } else {
                Err(NotIdle)
            }
        };
        self.unmask_exceptions(prev);
        result
    }

    /// Ensures the current thread has an argument buffer cached, asking
    /// the normal world for one if needed.
    pub(crate) fn ensure_rpc_arg(&self) -> bool {
        if self.with_current_slot(|t| t.rpc_buf).is_some() {
            return true;
        }
        let size = abi::msg_arg_size(MAX_RPC_PARAMS);
        match self.rpc_alloc_arg(size) {
            Some((pa, cookie)) => {
                if self.platform.phys_to_virt_nsec(pa, size).is_none() {
                    self.rpc_free_arg(cookie);
                    return false;
                }
                self.with_current_slot(|t| {
                    t.rpc_buf = Some(RpcBuf { pa, cookie })
                });
                true
            }
            None => false,
        }
    }

    /// Releases the current thread's argument buffer unless the
    /// preallocation cache keeps it.
    pub(crate) fn release_rpc_arg(&self) {
        let keep = self.table.lock().prealloc_rpc_cache;
        if keep {
            return;
        }
        if let Some(buf) = self.with_current_slot(|t| t.rpc_buf.take()) {
            self.rpc_free_arg(buf.cookie);
        }
    }
}

impl<P: Platform> ThreadServices for ThreadCore<P> {
    fn rpc_cmd(&self, cmd: u32, params: &mut [MsgParam]) -> u32 {
        self.rpc_cmd_inner(cmd, params).0
    }

    /// Allocates application shared memory through a generic command RPC,
    /// validating the returned buffer before trusting it.
    fn rpc_alloc_payload(&self, size: u64) -> Option<(u64, u64)> {
        let align = 8;
        let mut params = [MsgParam::value_input(
            abi::RPC_SHM_TYPE_APPL,
            size,
            align,
            false,
        )];
        let (ret, num_params) =
            self.rpc_cmd_inner(abi::RPC_CMD_SHM_ALLOC, &mut params);

        if ret != abi::TEE_SUCCESS || num_params != 1 {
            return None;
        }
        if params[0].attr != abi::ATTR_TYPE_TMEM_OUTPUT {
            return None;
        }
        let (pa, cookie) = (params[0].a, params[0].c);
        if !self.check_alloced_shm(pa, size, align) {
            self.rpc_free_payload(cookie);
            return None;
        }
        Some((pa, cookie))
    }

    fn rpc_free_payload(&self, cookie: u64) {
        let mut params = [MsgParam::value_input(
            abi::RPC_SHM_TYPE_APPL,
            cookie,
            0,
            false,
        )];
        self.rpc_cmd_inner(abi::RPC_CMD_SHM_FREE, &mut params);
    }

    fn fs_cache_put(&self, pa: u64, cookie: u64) {
        self.fs_cache_store(pa, cookie);
    }

    fn pgt_cache_take(&self) -> Option<u64> {
        ThreadCore::pgt_cache_take(self)
    }

    fn pgt_cache_put(&self, pgt: u64) -> bool {
        self.pgt_cache_store(pgt)
    }

    fn pgt_cache_drain(&self) -> heapless::Vec<u64, PGT_CACHE_ENTRIES> {
        ThreadCore::pgt_cache_drain(self)
    }

    fn current_session(&self) -> Option<u32> {
        ThreadCore::current_session(self)
    }
}

/// Adapter presenting the registered shared-memory object as a region
/// table entry.
struct ShmRegion((u64, u64));

impl citadel_kerncore::PhysRegion for ShmRegion {
    fn base_addr(&self) -> u64 {
        self.0 .0
    }

    fn end_addr(&self) -> u64 {
        self.0 .0 + self.0 .1
    }
}
