// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared harness for the dispatch tests: a recording session layer and a
//! scripted normal world that services RPCs until the call completes.

#![allow(dead_code)]

use citadel_abi::{self as abi, MsgArg, MsgParam, SmcArgs};
use citadel_kern::config::Config;
use citadel_kern::entry::TaParams;
use citadel_kern::platform::host::{HostOptions, HostPlatform};
use citadel_kern::platform::{
    Handlers, SessionError, SessionManager, ThreadServices,
};
use citadel_kern::ThreadCore;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use zerocopy::{FromBytes, IntoBytes};

/// What the mock session layer should do when a command is invoked.
#[derive(Clone)]
pub enum InvokeAction {
    /// Return success without side effects.
    Nop,
    /// Allocate a payload buffer over RPC, record the outcome, free it.
    AllocPayload { size: u64 },
    /// Allocate a payload buffer and park it in the FS-RPC cache.
    AllocAndCache { size: u64 },
    /// Reuse a cached page table if the thread has one, else fabricate a
    /// fresh handle; park it back in the cache afterwards.
    CyclePgtCache,
    /// Write recognizable values into every output parameter.
    SetOutputs,
    /// Fail with the given error.
    Fail(SessionError),
}

/// Shared recording state of the mock session layer.
pub struct SessionProbe {
    pub next_session: Mutex<u32>,
    pub live: Mutex<HashSet<u32>>,
    pub opened: Mutex<Vec<(abi::Uuid, abi::Identity, TaParams)>>,
    pub invoked: Mutex<Vec<(u32, u32, TaParams)>>,
    pub closed: Mutex<Vec<u32>>,
    pub cancelled: Mutex<Vec<u32>>,
    pub seen_sessions: Mutex<Vec<Option<u32>>>,
    pub payload_results: Mutex<Vec<Option<(u64, u64)>>>,
    pub pgt_takes: Mutex<Vec<Option<u64>>>,
    pub pgt_drained: Mutex<Vec<u64>>,
    pub next_pgt: Mutex<u64>,
    pub open_result: Mutex<Option<SessionError>>,
    pub invoke_action: Mutex<InvokeAction>,
}

impl Default for SessionProbe {
    fn default() -> Self {
        SessionProbe {
            next_session: Mutex::new(1),
            live: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
            invoked: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            seen_sessions: Mutex::new(Vec::new()),
            payload_results: Mutex::new(Vec::new()),
            pgt_takes: Mutex::new(Vec::new()),
            pgt_drained: Mutex::new(Vec::new()),
            next_pgt: Mutex::new(0x100),
            open_result: Mutex::new(None),
            invoke_action: Mutex::new(InvokeAction::Nop),
        }
    }
}

pub struct MockSessions {
    pub probe: Arc<SessionProbe>,
}

impl SessionManager for MockSessions {
    fn open_session(
        &self,
        _services: &dyn ThreadServices,
        uuid: &abi::Uuid,
        clnt: &abi::Identity,
        params: &mut TaParams,
    ) -> Result<u32, SessionError> {
        self.probe
            .opened
            .lock()
            .unwrap()
            .push((*uuid, *clnt, *params));
        if let Some(err) = *self.probe.open_result.lock().unwrap() {
            return Err(err);
        }
        let mut next = self.probe.next_session.lock().unwrap();
        let id = *next;
        *next += 1;
        self.probe.live.lock().unwrap().insert(id);
        Ok(id)
    }

    fn get_session(&self, id: u32, _exclusive: bool) -> Option<u32> {
        self.probe
            .live
            .lock()
            .unwrap()
            .contains(&id)
            .then_some(id)
    }

    fn put_session(&self, _id: u32) {}

    fn close_session(
        &self,
        services: &dyn ThreadServices,
        id: u32,
    ) -> u32 {
        // The user address space goes away with the session; reclaim any
        // page tables the thread cached for it.
        self.probe
            .pgt_drained
            .lock()
            .unwrap()
            .extend(services.pgt_cache_drain());

        self.probe.closed.lock().unwrap().push(id);
        if self.probe.live.lock().unwrap().remove(&id) {
            abi::TEE_SUCCESS
        } else {
            abi::TEE_ERROR_ITEM_NOT_FOUND
        }
    }

    fn invoke_command(
        &self,
        services: &dyn ThreadServices,
        id: u32,
        func: u32,
        params: &mut TaParams,
    ) -> Result<(), SessionError> {
        self.probe.invoked.lock().unwrap().push((id, func, *params));
        self.probe
            .seen_sessions
            .lock()
            .unwrap()
            .push(services.current_session());

        let action = self.probe.invoke_action.lock().unwrap().clone();
        match action {
            InvokeAction::Nop => Ok(()),
            InvokeAction::AllocPayload { size } => {
                let result = services.rpc_alloc_payload(size);
                self.probe.payload_results.lock().unwrap().push(result);
                if let Some((_, cookie)) = result {
                    services.rpc_free_payload(cookie);
                }
                Ok(())
            }
            InvokeAction::AllocAndCache { size } => {
                let result = services.rpc_alloc_payload(size);
                self.probe.payload_results.lock().unwrap().push(result);
                if let Some((pa, cookie)) = result {
                    services.fs_cache_put(pa, cookie);
                }
                Ok(())
            }
            InvokeAction::CyclePgtCache => {
                let taken = services.pgt_cache_take();
                self.probe.pgt_takes.lock().unwrap().push(taken);
                let handle = taken.unwrap_or_else(|| {
                    let mut next = self.probe.next_pgt.lock().unwrap();
                    *next += 1;
                    *next
                });
                assert!(services.pgt_cache_put(handle));
                Ok(())
            }
            InvokeAction::SetOutputs => {
                use citadel_kern::entry::{Dir, TaParam};
                for p in params.0.iter_mut() {
                    match p {
                        TaParam::Value { a, b, dir }
                            if *dir != Dir::In =>
                        {
                            *a = 0x1111;
                            *b = 0x2222;
                        }
                        TaParam::Mem { size, dir, .. }
                            if *dir != Dir::In =>
                        {
                            *size = 0x40;
                        }
                        _ => (),
                    }
                }
                Ok(())
            }
            InvokeAction::Fail(err) => Err(err),
        }
    }

    fn cancel_command(
        &self,
        _services: &dyn ThreadServices,
        id: u32,
    ) -> Result<(), SessionError> {
        self.probe.cancelled.lock().unwrap().push(id);
        Ok(())
    }
}

pub fn fast_noop(_: &ThreadCore<HostPlatform>, args: &mut SmcArgs) {
    args.a0 = abi::RETURN_OK;
}

pub struct Harness {
    pub core: ThreadCore<HostPlatform>,
    pub probe: Arc<SessionProbe>,
}

/// Builds a core on the emulated machine with the recording session
/// layer and default handlers, and runs per-CPU init everywhere.
pub fn harness_with(config: Config, handlers_of: Option<Handlers<HostPlatform>>) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let probe = Arc::new(SessionProbe::default());
    let platform = HostPlatform::new(
        HostOptions {
            num_cpus: config.num_cores,
            num_slots: config.num_threads,
            ..HostOptions::default()
        },
        Box::new(MockSessions {
            probe: Arc::clone(&probe),
        }),
    );
    let handlers =
        handlers_of.unwrap_or_else(|| Handlers::with_defaults(fast_noop));
    let core = ThreadCore::new(config, platform, handlers);

    for cpu in 0..core.config().num_cores {
        core.platform().monitor_entry(cpu);
        core.init_per_cpu();
    }
    core.platform().monitor_entry(0);

    Harness { core, probe }
}

pub fn harness(config: Config) -> Harness {
    harness_with(config, None)
}

/// Physical address where tests place the caller's argument record.
pub const CALLER_ARG_PA: u64 = 0x8000_0000;

/// Writes a caller argument record into emulated non-secure memory.
pub fn write_arg_record(
    platform: &HostPlatform,
    pa: u64,
    header: &MsgArg,
    params: &[MsgParam],
) {
    platform.ns_write(pa, header.as_bytes());
    for (n, p) in params.iter().enumerate() {
        platform.ns_write(pa + abi::msg_arg_size(n) as u64, p.as_bytes());
    }
}

/// Reads a caller argument record back.
pub fn read_arg_record(
    platform: &HostPlatform,
    pa: u64,
    num_params: usize,
) -> (MsgArg, Vec<MsgParam>) {
    let bytes = platform.ns_read(pa, abi::msg_arg_size(num_params));
    let header = MsgArg::read_from_prefix(&bytes).unwrap().0;
    let params = (0..num_params)
        .map(|n| {
            MsgParam::read_from_prefix(&bytes[abi::msg_arg_size(n)..])
                .unwrap()
                .0
        })
        .collect();
    (header, params)
}

/// The scripted normal world: services ALLOC/FREE/CMD RPCs out of a bump
/// allocator in the emulated shared region until the call completes.
pub struct NormalWorld<'a> {
    pub core: &'a ThreadCore<HostPlatform>,
    pub client_id: u64,
    next_alloc: Cell<u64>,
    next_cookie: Cell<u64>,
    /// Allocations handed out over the raw ALLOC RPC: (size, pa, cookie).
    pub allocs: RefCell<Vec<(u64, u64, u64)>>,
    /// Cookies freed over the raw FREE RPC.
    pub frees: RefCell<Vec<u64>>,
    /// Payload allocations handed out over CMD/SHM_ALLOC.
    pub cmd_allocs: RefCell<Vec<(u64, u64, u64)>>,
    /// Cookies freed over CMD/SHM_FREE.
    pub cmd_frees: RefCell<Vec<u64>>,
    /// Foreign-interrupt RPCs observed.
    pub foreign_intrs: Cell<usize>,
    /// Misalign the next raw ALLOC reply.
    pub misalign_next_alloc: Cell<bool>,
    /// Misalign the next CMD/SHM_ALLOC reply.
    pub misalign_next_payload: Cell<bool>,
    /// CPU on which to deliver resumes.
    pub resume_cpu: Cell<usize>,
}

impl<'a> NormalWorld<'a> {
    pub fn new(core: &'a ThreadCore<HostPlatform>, client_id: u64) -> Self {
        let (base, _) = core.platform().ns_region();
        NormalWorld {
            core,
            client_id,
            // Leave the low part of the region for caller records.
            next_alloc: Cell::new(base + 0x8000),
            next_cookie: Cell::new(0x1000),
            allocs: RefCell::new(Vec::new()),
            frees: RefCell::new(Vec::new()),
            cmd_allocs: RefCell::new(Vec::new()),
            cmd_frees: RefCell::new(Vec::new()),
            foreign_intrs: Cell::new(0),
            misalign_next_alloc: Cell::new(false),
            misalign_next_payload: Cell::new(false),
            resume_cpu: Cell::new(0),
        }
    }

    fn bump_alloc(&self, size: u64, misalign: bool) -> (u64, u64) {
        let mut pa = (self.next_alloc.get() + 7) & !7;
        if misalign {
            pa |= 1;
        }
        self.next_alloc.set(pa + size + 16);
        let cookie = self.next_cookie.get();
        self.next_cookie.set(cookie + 1);
        (pa, cookie)
    }

    /// Issues a standard call on `cpu` and services every RPC it raises,
    /// returning the final reply words.
    pub fn call(&self, cpu: usize, args: SmcArgs) -> SmcArgs {
        let mut args = args;
        self.core.platform().monitor_entry(cpu);
        self.core.handle_std_smc(&mut args);
        self.pump(args)
    }

    /// Services RPCs until the outstanding call completes.
    pub fn pump(&self, mut args: SmcArgs) -> SmcArgs {
        while abi::is_rpc_return(args.a0) {
            let mut resume = self.service_rpc(&args);
            self.core
                .platform()
                .monitor_entry(self.resume_cpu.get());
            self.core.handle_std_smc(&mut resume);
            args = resume;
        }
        args
    }

    /// Builds the resume words for one observed RPC request.
    pub fn service_rpc(&self, request: &SmcArgs) -> SmcArgs {
        let tid = request.a3;
        let mut resume = SmcArgs {
            a0: abi::CALL_RETURN_FROM_RPC,
            a3: tid,
            a7: self.client_id,
            ..SmcArgs::default()
        };

        match request.a0 {
            abi::RETURN_RPC_ALLOC => {
                let size = request.a1;
                let (pa, cookie) =
                    self.bump_alloc(size, self.misalign_next_alloc.take());
                self.allocs.borrow_mut().push((size, pa, cookie));
                let (hi, lo) = abi::reg_pair_from_u64(pa);
                resume.a1 = hi;
                resume.a2 = lo;
                let (hi, lo) = abi::reg_pair_from_u64(cookie);
                resume.a4 = hi;
                resume.a5 = lo;
            }
            abi::RETURN_RPC_FREE => {
                let cookie = abi::reg_pair_to_u64(request.a1, request.a2);
                self.frees.borrow_mut().push(cookie);
            }
            abi::RETURN_RPC_FOREIGN_INTR => {
                self.foreign_intrs.set(self.foreign_intrs.get() + 1);
            }
            abi::RETURN_RPC_CMD => {
                let carg = abi::reg_pair_to_u64(request.a1, request.a2);
                self.service_cmd(carg);
            }
            other => panic!("unexpected rpc request {other:#x}"),
        }
        resume
    }

    /// Services a generic command RPC in the argument record named by its
    /// cookie.
    fn service_cmd(&self, carg_cookie: u64) {
        let pa = self
            .allocs
            .borrow()
            .iter()
            .find(|(_, _, c)| *c == carg_cookie)
            .map(|(_, pa, _)| *pa)
            .expect("cmd rpc against unknown cookie");

        let platform = self.core.platform();
        let (mut header, mut params) = read_arg_record(platform, pa, 1);

        match header.cmd {
            abi::RPC_CMD_SHM_ALLOC => {
                let size = params[0].b;
                let (buf, cookie) = self
                    .bump_alloc(size, self.misalign_next_payload.take());
                self.cmd_allocs.borrow_mut().push((size, buf, cookie));
                params[0] = MsgParam {
                    attr: abi::ATTR_TYPE_TMEM_OUTPUT,
                    a: buf,
                    b: size,
                    c: cookie,
                };
                header.ret = abi::TEE_SUCCESS;
            }
            abi::RPC_CMD_SHM_FREE => {
                self.cmd_frees.borrow_mut().push(params[0].b);
                header.ret = abi::TEE_SUCCESS;
            }
            other => panic!("unexpected rpc command {other:#x}"),
        }

        write_arg_record(platform, pa, &header, &params);
    }
}

/// A well-formed open-session record: two meta slots plus `extra`.
pub fn open_session_record(extra: &[MsgParam]) -> (MsgArg, Vec<MsgParam>) {
    let uuid_octets: [u8; 16] = [
        0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 1, 2, 3, 4, 5, 6,
        7, 8,
    ];
    let mut params = vec![
        MsgParam {
            attr: abi::ATTR_META | abi::ATTR_TYPE_VALUE_INPUT,
            a: u64::from_le_bytes(uuid_octets[..8].try_into().unwrap()),
            b: u64::from_le_bytes(uuid_octets[8..].try_into().unwrap()),
            c: 0,
        },
        MsgParam {
            attr: abi::ATTR_META | abi::ATTR_TYPE_VALUE_INPUT,
            a: 0,
            b: 0,
            c: abi::Login::Public as u32 as u64,
        },
    ];
    params.extend_from_slice(extra);

    let header = MsgArg {
        cmd: abi::MSG_CMD_OPEN_SESSION,
        num_params: params.len() as u32,
        ..MsgArg::default()
    };
    (header, params)
}

/// The `a0..a7` block of a fresh standard call against `CALLER_ARG_PA`.
pub fn call_with_arg(client_id: u64) -> SmcArgs {
    let (hi, lo) = abi::reg_pair_from_u64(CALLER_ARG_PA);
    SmcArgs {
        a0: abi::CALL_WITH_ARG,
        a1: hi,
        a2: lo,
        a7: client_id,
        ..SmcArgs::default()
    }
}
