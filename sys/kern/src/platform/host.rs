// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side platform emulation.
//!
//! Enough machine to drive the entire SMC/RPC protocol from `cargo test`:
//! per-CPU exception-mask words, per-CPU FPU units with real register
//! banks, a block of "physical" memory standing in for the non-secure
//! shared region, a recorded pager, and -- the interesting part -- a
//! context-switch primitive built from OS threads. Each live secure
//! thread context runs on its own OS thread; `context_yield` parks it on
//! a channel and `context_resume` wakes it with the resume words, so
//! suspension and cross-CPU resumption behave exactly as the dispatch
//! core expects of the real exception-vector assembly.
//!
//! Which simulated CPU a piece of code runs on is a property of the
//! calling OS thread, set with [`set_current_cpu`]; tests acting as the
//! normal world pick a CPU with [`HostPlatform::monitor_entry`] before
//! dispatching.

use citadel_abi::SmcArgs;
use citadel_kerncore::PhysSpan;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::exceptions::ExceptionMask;
use crate::platform::{
    ContextCtx, ContextEntry, ContextExit, Platform, SessionManager,
    UserModeEntry, UserModeExit,
};
use crate::thread::UserMap;
use crate::vfp::VfpBank;

/// Token value used as the standard-SMC entry program counter.
pub const STD_SMC_ENTRY_PC: u64 = 0x0e11_0000;

std::thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
    static WORKER: RefCell<Option<WorkerEnd>> = const { RefCell::new(None) };
}

/// Binds the calling OS thread to a simulated CPU.
pub fn set_current_cpu(cpu: usize) {
    CURRENT_CPU.with(|c| c.set(cpu));
}

/// The simulated CPU of the calling OS thread.
pub fn current_cpu() -> usize {
    CURRENT_CPU.with(|c| c.get())
}

enum YieldMsg {
    Suspended(SmcArgs),
    Completed(SmcArgs),
    Panicked(Box<dyn Any + Send>),
}

enum ResumeMsg {
    Resume { cpu: usize, args: SmcArgs },
    Abort,
}

struct WorkerEnd {
    yield_tx: Sender<YieldMsg>,
    resume_rx: Receiver<ResumeMsg>,
}

struct DispatcherEnd {
    resume_tx: Sender<ResumeMsg>,
    yield_rx: Receiver<YieldMsg>,
    join: Option<JoinHandle<()>>,
}

/// Payload of the panic used to shoot down parked contexts on drop.
struct AbortToken;

struct CpuState {
    mask: AtomicU32,
}

struct VfpUnit {
    enabled: AtomicBool,
    bank: Mutex<VfpBank>,
}

/// "Physical" memory standing in for the non-secure region. Handing out
/// raw pointers while retaining the storage needs interior mutability.
struct NsMem {
    base: u64,
    store: Box<[std::cell::UnsafeCell<u8>]>,
}

// Safety: accesses through the handed-out pointers are coordinated by the
// test harness (the normal-world side only touches memory while the
// secure side is parked, mirroring the real ownership handoff).
unsafe impl Sync for NsMem {}

impl NsMem {
    fn contains(&self, pa: u64, len: u64) -> bool {
        let Ok(span) = PhysSpan::from_raw(pa, len) else {
            return false;
        };
        span.base_addr() >= self.base
            && span.end_addr() <= self.base + self.store.len() as u64
    }

    fn ptr(&self, pa: u64) -> *mut u8 {
        let off = (pa - self.base) as usize;
        self.store[off].get()
    }
}

#[derive(Copy, Clone, Debug)]
pub enum PagerEvent {
    MapStack {
        slot: usize,
        guard: u64,
        size: u64,
        va_end: u64,
    },
    Release {
        base: u64,
        len: u64,
    },
}

/// Construction knobs for the emulated machine.
#[derive(Copy, Clone, Debug)]
pub struct HostOptions {
    pub num_cpus: usize,
    pub num_slots: usize,
    pub ns_base: u64,
    pub ns_size: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        HostOptions {
            num_cpus: 4,
            num_slots: 4,
            ns_base: 0x8000_0000,
            ns_size: 0x10_0000,
        }
    }
}

pub struct HostPlatform {
    cpus: Arc<Vec<CpuState>>,
    contexts: Vec<Mutex<Option<DispatcherEnd>>>,
    vfp: Vec<VfpUnit>,
    ns: NsMem,
    user_maps: Vec<Mutex<Option<UserMap>>>,
    pager_events: Mutex<Vec<PagerEvent>>,
    user_entries: Mutex<Vec<UserModeEntry>>,
    entropy: AtomicUsize,
    sessions: Box<dyn SessionManager + Send + Sync>,
}

impl HostPlatform {
    pub fn new(
        opts: HostOptions,
        sessions: Box<dyn SessionManager + Send + Sync>,
    ) -> Self {
        let mut store = Vec::with_capacity(opts.ns_size);
        store.resize_with(opts.ns_size, || std::cell::UnsafeCell::new(0));

        let cpus = (0..opts.num_cpus)
            .map(|_| CpuState {
                mask: AtomicU32::new(ExceptionMask::ALL.bits()),
            })
            .collect();

        HostPlatform {
            cpus: Arc::new(cpus),
            contexts: (0..opts.num_slots).map(|_| Mutex::new(None)).collect(),
            vfp: (0..opts.num_cpus)
                .map(|_| VfpUnit {
                    enabled: AtomicBool::new(false),
                    bank: Mutex::new(VfpBank::default()),
                })
                .collect(),
            ns: NsMem {
                base: opts.ns_base,
                store: store.into_boxed_slice(),
            },
            user_maps: (0..opts.num_cpus).map(|_| Mutex::new(None)).collect(),
            pager_events: Mutex::new(Vec::new()),
            user_entries: Mutex::new(Vec::new()),
            entropy: AtomicUsize::new(0),
            sessions,
        }
    }

    /// Models the monitor's world entry: binds the calling OS thread to
    /// `cpu` and masks all exceptions, as the vector does.
    pub fn monitor_entry(&self, cpu: usize) {
        set_current_cpu(cpu);
        self.cpus[cpu]
            .mask
            .store(ExceptionMask::ALL.bits(), Ordering::SeqCst);
    }

    /// Blocks on the slot's channel until the context yields or finishes.
    fn wait_for_exit(&self, slot: usize) -> ContextExit {
        let msg = {
            let guard = self.contexts[slot].lock().unwrap();
            let end = guard.as_ref().expect("no live context in slot");
            end.yield_rx.recv().expect("context vanished")
        };
        match msg {
            YieldMsg::Suspended(words) => ContextExit::Suspended(words),
            YieldMsg::Completed(words) => {
                self.reap(slot);
                ContextExit::Completed(words)
            }
            YieldMsg::Panicked(payload) => {
                self.reap(slot);
                resume_unwind(payload);
            }
        }
    }

    fn reap(&self, slot: usize) {
        let end = self.contexts[slot].lock().unwrap().take();
        if let Some(mut end) = end {
            if let Some(join) = end.join.take() {
                let _ = join.join();
            }
        }
    }

    // Test inspection helpers.

    /// Copies bytes into the emulated non-secure memory.
    pub fn ns_write(&self, pa: u64, bytes: &[u8]) {
        assert!(self.ns.contains(pa, bytes.len() as u64));
        for (i, b) in bytes.iter().enumerate() {
            // Safety: in-bounds per the assert; coordination is the test
            // harness's job, as for all NsMem access.
            unsafe { *self.ns.ptr(pa + i as u64) = *b };
        }
    }

    /// Copies bytes out of the emulated non-secure memory.
    pub fn ns_read(&self, pa: u64, len: usize) -> Vec<u8> {
        assert!(self.ns.contains(pa, len as u64));
        (0..len)
            // Safety: as in ns_write.
            .map(|i| unsafe { *self.ns.ptr(pa + i as u64) })
            .collect()
    }

    /// Base and size of the emulated non-secure region.
    pub fn ns_region(&self) -> (u64, u64) {
        (self.ns.base, self.ns.store.len() as u64)
    }

    pub fn vfp_enabled(&self, cpu: usize) -> bool {
        self.vfp[cpu].enabled.load(Ordering::SeqCst)
    }

    /// Direct access to a CPU's FPU bank, for seeding and checking.
    pub fn vfp_bank(&self, cpu: usize) -> VfpBank {
        *self.vfp[cpu].bank.lock().unwrap()
    }

    pub fn set_vfp_bank(&self, cpu: usize, bank: VfpBank) {
        *self.vfp[cpu].bank.lock().unwrap() = bank;
    }

    pub fn set_vfp_enabled(&self, cpu: usize, on: bool) {
        self.vfp[cpu].enabled.store(on, Ordering::SeqCst);
    }

    pub fn pager_events(&self) -> Vec<PagerEvent> {
        self.pager_events.lock().unwrap().clone()
    }

    pub fn user_mode_entries(&self) -> Vec<UserModeEntry> {
        self.user_entries.lock().unwrap().clone()
    }

    pub fn entropy_count(&self) -> usize {
        self.entropy.load(Ordering::SeqCst)
    }

    /// Installs a user mapping on a CPU, standing in for a trusted
    /// application having been mapped there.
    pub fn install_user_map(&self, cpu: usize, map: UserMap) {
        *self.user_maps[cpu].lock().unwrap() = Some(map);
    }
}

impl Drop for HostPlatform {
    fn drop(&mut self) {
        // Shoot down any context still parked in a suspension, then join
        // it, so no worker outlives the core it references.
        for slot in &self.contexts {
            let end = slot.lock().unwrap().take();
            if let Some(mut end) = end {
                let _ = end.resume_tx.send(ResumeMsg::Abort);
                if let Some(join) = end.join.take() {
                    let _ = join.join();
                }
            }
        }
    }
}

impl Platform for HostPlatform {
    fn core_index(&self) -> usize {
        let cpu = current_cpu();
        assert!(cpu < self.cpus.len());
        cpu
    }

    fn read_exceptions(&self) -> ExceptionMask {
        let bits = self.cpus[current_cpu()].mask.load(Ordering::SeqCst);
        ExceptionMask::from_bits_truncate(bits)
    }

    fn write_exceptions(&self, mask: ExceptionMask) {
        self.cpus[current_cpu()]
            .mask
            .store(mask.bits(), Ordering::SeqCst);
    }

    fn std_smc_entry_pc(&self) -> u64 {
        STD_SMC_ENTRY_PC
    }

    fn context_spawn(
        &self,
        slot: usize,
        entry: ContextEntry,
        ctx: ContextCtx,
        args: SmcArgs,
    ) -> ContextExit {
        let (yield_tx, yield_rx) = channel();
        let (resume_tx, resume_rx) = channel();

        let cpu = current_cpu();
        let cpus = Arc::clone(&self.cpus);
        // The context word is a pointer to the core; smuggle it across the
        // thread boundary as a word. The core guarantees it outlives every
        // context (see the field-order note on ThreadCore).
        let ctx_word = ctx.0 as usize;
        let worker_yield_tx = yield_tx.clone();

        let join = std::thread::Builder::new()
            .name(format!("secure-thread-{slot}"))
            .spawn(move || {
                set_current_cpu(cpu);
                // Fresh contexts start with IRQ and asynchronous abort
                // masked, FIQ open, per the initial status register.
                cpus[cpu].mask.store(
                    (ExceptionMask::IRQ | ExceptionMask::ASYNC_ABORT).bits(),
                    Ordering::SeqCst,
                );
                WORKER.with(|w| {
                    *w.borrow_mut() = Some(WorkerEnd {
                        yield_tx: worker_yield_tx,
                        resume_rx,
                    });
                });

                let result = catch_unwind(AssertUnwindSafe(|| {
                    entry(ContextCtx(ctx_word as *const ()), args)
                }));
                match result {
                    Ok(words) => {
                        let _ = yield_tx.send(YieldMsg::Completed(words));
                    }
                    Err(payload) => {
                        if payload.downcast_ref::<AbortToken>().is_some() {
                            // Torn down by HostPlatform::drop; go quietly.
                            return;
                        }
                        let _ = yield_tx.send(YieldMsg::Panicked(payload));
                    }
                }
            })
            .expect("failed to spawn context thread");

        *self.contexts[slot].lock().unwrap() = Some(DispatcherEnd {
            resume_tx,
            yield_rx,
            join: Some(join),
        });

        self.wait_for_exit(slot)
    }

    fn context_resume(&self, slot: usize, args: SmcArgs) -> ContextExit {
        {
            let guard = self.contexts[slot].lock().unwrap();
            let end = guard.as_ref().expect("resume of dead context");
            end.resume_tx
                .send(ResumeMsg::Resume {
                    cpu: current_cpu(),
                    args,
                })
                .expect("context vanished");
        }
        self.wait_for_exit(slot)
    }

    fn context_yield(&self, _slot: usize, args: SmcArgs) -> SmcArgs {
        WORKER.with(|w| {
            let end = w.borrow();
            let end = end.as_ref().expect("yield outside a context");
            end.yield_tx
                .send(YieldMsg::Suspended(args))
                .expect("dispatcher vanished");
            match end.resume_rx.recv().expect("dispatcher vanished") {
                ResumeMsg::Resume { cpu, args } => {
                    set_current_cpu(cpu);
                    args
                }
                ResumeMsg::Abort => std::panic::panic_any(AbortToken),
            }
        })
    }

    fn vfp_is_enabled(&self) -> bool {
        self.vfp[current_cpu()].enabled.load(Ordering::SeqCst)
    }

    fn vfp_set_enabled(&self, on: bool) {
        self.vfp[current_cpu()].enabled.store(on, Ordering::SeqCst);
    }

    fn vfp_read_bank(&self, bank: &mut VfpBank) {
        *bank = *self.vfp[current_cpu()].bank.lock().unwrap();
    }

    fn vfp_write_bank(&self, bank: &VfpBank) {
        *self.vfp[current_cpu()].bank.lock().unwrap() = *bank;
    }

    fn nsec_shm_region(&self) -> (u64, u64) {
        (self.ns.base, self.ns.store.len() as u64)
    }

    fn pbuf_is_nonsec(&self, pa: u64, len: u64) -> bool {
        self.ns.contains(pa, len)
    }

    fn phys_to_virt_nsec(&self, pa: u64, len: usize) -> Option<NonNull<u8>> {
        if !self.ns.contains(pa, len as u64) {
            return None;
        }
        NonNull::new(self.ns.ptr(pa))
    }

    fn pager_map_stack(&self, slot: usize, guard: u64, size: u64) -> u64 {
        let base = 0x7000_0000 + slot as u64 * (guard + size);
        let va_end = base + guard + size;
        self.pager_events.lock().unwrap().push(PagerEvent::MapStack {
            slot,
            guard,
            size,
            va_end,
        });
        va_end
    }

    fn pager_release(&self, base: u64, len: u64) {
        self.pager_events
            .lock()
            .unwrap()
            .push(PagerEvent::Release { base, len });
    }

    fn user_map_active(&self) -> bool {
        self.user_maps[current_cpu()].lock().unwrap().is_some()
    }

    fn read_user_map(&self) -> UserMap {
        self.user_maps[current_cpu()]
            .lock()
            .unwrap()
            .expect("no active user map")
    }

    fn write_user_map(&self, map: Option<&UserMap>) {
        *self.user_maps[current_cpu()].lock().unwrap() = map.copied();
    }

    fn enter_user_mode(&self, entry: UserModeEntry) -> UserModeExit {
        self.user_entries.lock().unwrap().push(entry);
        UserModeExit::default()
    }

    fn add_jitter_entropy(&self) {
        self.entropy.fetch_add(1, Ordering::SeqCst);
    }

    fn sessions(&self) -> &dyn SessionManager {
        &*self.sessions
    }
}

/// A session layer that accepts everything and does nothing, for tests
/// that exercise the dispatch machinery rather than sessions.
pub struct StubSessions;

impl SessionManager for StubSessions {
    fn open_session(
        &self,
        _services: &dyn crate::platform::ThreadServices,
        _uuid: &citadel_abi::Uuid,
        _clnt: &citadel_abi::Identity,
        _params: &mut crate::entry::TaParams,
    ) -> Result<u32, crate::platform::SessionError> {
        Ok(1)
    }

    fn get_session(&self, id: u32, _exclusive: bool) -> Option<u32> {
        Some(id)
    }

    fn put_session(&self, _id: u32) {}

    fn close_session(
        &self,
        _services: &dyn crate::platform::ThreadServices,
        _id: u32,
    ) -> u32 {
        citadel_abi::TEE_SUCCESS
    }

    fn invoke_command(
        &self,
        _services: &dyn crate::platform::ThreadServices,
        _id: u32,
        _func: u32,
        _params: &mut crate::entry::TaParams,
    ) -> Result<(), crate::platform::SessionError> {
        Ok(())
    }

    fn cancel_command(
        &self,
        _services: &dyn crate::platform::ThreadServices,
        _id: u32,
    ) -> Result<(), crate::platform::SessionError> {
        Ok(())
    }
}

static_assertions::assert_impl_all!(HostPlatform: Sync);
static_assertions::assert_impl_all!(
    crate::thread::ThreadCore<HostPlatform>: Sync
);
