// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Standard-call command demultiplexer.
//!
//! One dispatched SMC carries a message argument record in non-secure
//! shared memory: open-session, close-session, invoke-command, or cancel.
//! The record's address, alignment, and full extent are validated before
//! the first read; parameters are copied in with their types checked
//! against a whitelist; and on the way out only result values and memref
//! sizes are written back -- never pointers. Validation failures return
//! `BAD_PARAMETERS` in the record (or an error code in `a0` for failures
//! of the envelope itself) and leave shared memory untouched.

use citadel_abi::{
    self as abi, reg_pair_to_u64, Identity, Login, MsgArg, MsgParam, Origin,
    SmcArgs, Uuid,
};
use citadel_kerncore::{covered_by, is_aligned, PhysRegion, PhysSpan};

use crate::config::MAX_TA_PARAMS;
use crate::platform::Platform;
use crate::rpc::ArgRecord;
use crate::thread::ThreadCore;

/// Data direction of a trusted-application parameter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Dir {
    In,
    Out,
    InOut,
}

impl Dir {
    fn copies_out(&self) -> bool {
        matches!(self, Dir::Out | Dir::InOut)
    }
}

/// One parameter as handed to the session layer: either a pair of value
/// words or a span inside the registered shared-memory object (expressed
/// as an offset, so the session layer never sees a raw pointer).
#[derive(Copy, Clone, Debug)]
pub enum TaParam {
    None,
    Value { a: u64, b: u64, dir: Dir },
    Mem { offset: u64, size: u64, dir: Dir },
}

/// The fixed parameter block of one command.
#[derive(Copy, Clone, Debug)]
pub struct TaParams(pub [TaParam; MAX_TA_PARAMS]);

impl TaParams {
    pub fn empty() -> Self {
        TaParams([TaParam::None; MAX_TA_PARAMS])
    }
}

impl Default for TaParams {
    fn default() -> Self {
        Self::empty()
    }
}

struct Shm {
    base: u64,
    size: u64,
}

impl PhysRegion for Shm {
    fn base_addr(&self) -> u64 {
        self.base
    }

    fn end_addr(&self) -> u64 {
        self.base + self.size
    }
}

/// Converts a temporary-memory reference, rejecting anything that is not
/// wholly inside the registered shared-memory object.
fn set_mem_param(param: &MsgParam, shm: &Shm, dir: Dir) -> Result<TaParam, u32> {
    let buf_ptr = param.a;
    let size = param.b;

    // A zero-size reference to a real buffer still pins one byte, so the
    // base address itself gets bounds-checked.
    let mut check_size = size;
    if buf_ptr != 0 && check_size == 0 {
        check_size = 1;
    }
    if check_size == 0 {
        return Err(abi::TEE_ERROR_BAD_PARAMETERS);
    }

    let span = PhysSpan::from_raw(buf_ptr, check_size)
        .map_err(|_| abi::TEE_ERROR_BAD_PARAMETERS)?;
    if !covered_by(&span, core::slice::from_ref(shm), |_| true) {
        return Err(abi::TEE_ERROR_BAD_PARAMETERS);
    }

    Ok(TaParam::Mem {
        offset: buf_ptr - shm.base,
        size,
        dir,
    })
}

/// Copies `count` parameter slots (starting at `first`) out of the record
/// into typed form. Meta and fragment bits are only legal in the
/// open-session meta slots, which the caller has already peeled off.
fn copy_in_params<P: Platform>(
    core: &ThreadCore<P>,
    rec: &ArgRecord<'_>,
    first: usize,
    count: usize,
) -> Result<TaParams, u32> {
    if count > MAX_TA_PARAMS {
        return Err(abi::TEE_ERROR_BAD_PARAMETERS);
    }

    let (base, size) = core.platform().nsec_shm_region();
    let shm = Shm { base, size };
    let mut out = TaParams::empty();

    for n in 0..count {
        let p = rec.param(first + n);
        if p.attr & (abi::ATTR_META | abi::ATTR_FRAGMENT) != 0 {
            return Err(abi::TEE_ERROR_BAD_PARAMETERS);
        }

        out.0[n] = match p.attr_type() {
            abi::ATTR_TYPE_NONE => TaParam::None,
            abi::ATTR_TYPE_VALUE_INPUT => value(&p, Dir::In),
            abi::ATTR_TYPE_VALUE_OUTPUT => value(&p, Dir::Out),
            abi::ATTR_TYPE_VALUE_INOUT => value(&p, Dir::InOut),
            abi::ATTR_TYPE_TMEM_INPUT => set_mem_param(&p, &shm, Dir::In)?,
            abi::ATTR_TYPE_TMEM_OUTPUT => set_mem_param(&p, &shm, Dir::Out)?,
            abi::ATTR_TYPE_TMEM_INOUT => {
                set_mem_param(&p, &shm, Dir::InOut)?
            }
            _ => return Err(abi::TEE_ERROR_BAD_PARAMETERS),
        };
    }

    Ok(out)
}

fn value(p: &MsgParam, dir: Dir) -> TaParam {
    TaParam::Value {
        a: p.a,
        b: p.b,
        dir,
    }
}

/// Writes updated values and memref sizes back to the record. Memory
/// references get their size slot refreshed and nothing else: the pointer
/// is the caller's and stays whatever the caller wrote.
fn copy_out_params(
    rec: &mut ArgRecord<'_>,
    first: usize,
    count: usize,
    params: &TaParams,
) {
    for n in 0..count {
        match params.0[n] {
            TaParam::Value { a, b, dir } if dir.copies_out() => {
                let mut p = rec.param(first + n);
                p.a = a;
                p.b = b;
                rec.set_param(first + n, &p);
            }
            TaParam::Mem { size, dir, .. } if dir.copies_out() => {
                let mut p = rec.param(first + n);
                p.b = size;
                rec.set_param(first + n, &p);
            }
            _ => (),
        }
    }
}

/// Extracts the two mandatory open-session meta parameters: the target
/// application UUID and the caller identity.
fn get_open_session_meta(
    rec: &ArgRecord<'_>,
    num_params: usize,
) -> Result<(Uuid, Identity), u32> {
    const REQ_ATTR: u64 = abi::ATTR_META | abi::ATTR_TYPE_VALUE_INPUT;

    if num_params < 2 {
        return Err(abi::TEE_ERROR_BAD_PARAMETERS);
    }
    let p0 = rec.param(0);
    let p1 = rec.param(1);
    if p0.attr != REQ_ATTR || p1.attr != REQ_ATTR {
        return Err(abi::TEE_ERROR_BAD_PARAMETERS);
    }

    let uuid = Uuid::from_octets(&p0.octets());

    let login = Login::try_from(p1.c as u32)
        .map_err(|_| abi::TEE_ERROR_BAD_PARAMETERS)?;
    let clnt_uuid = match login {
        Login::Public => Uuid::default(),
        _ => Uuid::from_octets(&p1.octets()),
    };

    Ok((
        uuid,
        Identity {
            login,
            uuid: clnt_uuid,
        },
    ))
}

/// Number of meta slots preceding the real parameters of an open-session
/// call.
const OPEN_SESSION_META: usize = 2;

fn entry_open_session<P: Platform>(
    core: &ThreadCore<P>,
    rec: &mut ArgRecord<'_>,
    num_params: usize,
) {
    let mut session = 0;
    let (ret, origin) = match get_open_session_meta(rec, num_params) {
        Err(code) => (code, Origin::Tee),
        Ok((uuid, clnt)) => match copy_in_params(
            core,
            rec,
            OPEN_SESSION_META,
            num_params - OPEN_SESSION_META,
        ) {
            Err(code) => (code, Origin::Tee),
            Ok(mut params) => {
                let result = core.platform().sessions().open_session(
                    core,
                    &uuid,
                    &clnt,
                    &mut params,
                );
                copy_out_params(
                    rec,
                    OPEN_SESSION_META,
                    num_params - OPEN_SESSION_META,
                    &params,
                );

                // Open and close arrive at unpredictable times; use that
                // to stir the PRNG.
                core.platform().add_jitter_entropy();

                match result {
                    Ok(s) => {
                        session = s;
                        (abi::TEE_SUCCESS, Origin::Tee)
                    }
                    Err(e) => (e.code, e.origin),
                }
            }
        },
    };

    let mut header = rec.header();
    header.session = session;
    header.ret = ret;
    header.ret_origin = origin as u32;
    rec.set_header(&header);
}

fn entry_close_session<P: Platform>(
    core: &ThreadCore<P>,
    rec: &mut ArgRecord<'_>,
    num_params: usize,
) {
    let ret = if num_params != 0 {
        abi::TEE_ERROR_BAD_PARAMETERS
    } else {
        core.platform().add_jitter_entropy();
        let session = rec.header().session;
        core.platform().sessions().close_session(core, session)
    };

    let mut header = rec.header();
    header.ret = ret;
    header.ret_origin = Origin::Tee as u32;
    rec.set_header(&header);
}

fn entry_invoke_command<P: Platform>(
    core: &ThreadCore<P>,
    rec: &mut ArgRecord<'_>,
    num_params: usize,
) {
    let header_in = rec.header();
    let (ret, origin) = match copy_in_params(core, rec, 0, num_params) {
        Err(code) => (code, Origin::Tee),
        Ok(mut params) => {
            match core
                .platform()
                .sessions()
                .get_session(header_in.session, true)
            {
                None => (abi::TEE_ERROR_BAD_PARAMETERS, Origin::Tee),
                Some(s) => {
                    core.push_session(s);
                    let result = core.platform().sessions().invoke_command(
                        core,
                        s,
                        header_in.func,
                        &mut params,
                    );
                    core.pop_session();
                    core.platform().sessions().put_session(s);

                    copy_out_params(rec, 0, num_params, &params);

                    match result {
                        Ok(()) => (abi::TEE_SUCCESS, Origin::Tee),
                        Err(e) => (e.code, e.origin),
                    }
                }
            }
        }
    };

    let mut header = rec.header();
    header.ret = ret;
    header.ret_origin = origin as u32;
    rec.set_header(&header);
}

fn entry_cancel<P: Platform>(
    core: &ThreadCore<P>,
    rec: &mut ArgRecord<'_>,
    num_params: usize,
) {
    let (ret, origin) = if num_params != 0 {
        (abi::TEE_ERROR_BAD_PARAMETERS, Origin::Tee)
    } else {
        let session = rec.header().session;
        match core.platform().sessions().get_session(session, false) {
            None => (abi::TEE_ERROR_BAD_PARAMETERS, Origin::Tee),
            Some(s) => {
                let result =
                    core.platform().sessions().cancel_command(core, s);
                core.platform().sessions().put_session(s);
                match result {
                    Ok(()) => (abi::TEE_SUCCESS, Origin::Tee),
                    Err(e) => (e.code, e.origin),
                }
            }
        }
    };

    let mut header = rec.header();
    header.ret = ret;
    header.ret_origin = origin as u32;
    rec.set_header(&header);
}

/// The standard-call handler: validates the argument record and routes
/// the command. Installed as `Handlers::std_smc` by
/// [`Handlers::with_defaults`][crate::platform::Handlers::with_defaults].
pub fn std_entry<P: Platform>(core: &ThreadCore<P>, args: &mut SmcArgs) {
    if args.a0 != abi::CALL_WITH_ARG {
        log::error!("unknown SMC {:#x}", args.a0);
        args.a0 = abi::RETURN_EBADCMD;
        return;
    }

    let parg = reg_pair_to_u64(args.a1, args.a2);
    let header_len = core::mem::size_of::<MsgArg>();

    if !core.platform().pbuf_is_nonsec(parg, header_len as u64)
        || !is_aligned(parg, core::mem::align_of::<MsgArg>() as u64)
    {
        log::error!("bad arg address {parg:#x}");
        args.a0 = abi::RETURN_EBADADDR;
        return;
    }

    // Read the header once to learn the parameter count, then re-validate
    // the full record extent before mapping it.
    let num_params = {
        let Some(ptr) = core.platform().phys_to_virt_nsec(parg, header_len)
        else {
            log::error!("bad arg address {parg:#x}");
            args.a0 = abi::RETURN_EBADADDR;
            return;
        };
        // Safety: [parg, parg+header_len) was just checked to lie in
        // non-secure memory and is covered by the returned mapping.
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(ptr.as_ptr(), header_len)
        };
        ArgRecord::new(bytes).header().num_params as usize
    };

    // Widened arithmetic: a hostile num_params must fail the region
    // check, not wrap the length.
    let full_len_u64 = core::mem::size_of::<MsgArg>() as u64
        + num_params as u64 * core::mem::size_of::<MsgParam>() as u64;
    if !core.platform().pbuf_is_nonsec(parg, full_len_u64) {
        log::error!("bad arg address {parg:#x}");
        args.a0 = abi::RETURN_EBADADDR;
        return;
    }
    let full_len = full_len_u64 as usize;
    let Some(ptr) = core.platform().phys_to_virt_nsec(parg, full_len) else {
        log::error!("bad arg address {parg:#x}");
        args.a0 = abi::RETURN_EBADADDR;
        return;
    };
    // Safety: the full record extent was validated non-secure and mapped.
    let bytes =
        unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), full_len) };
    let mut rec = ArgRecord::new(bytes);

    // Enable IRQ for the duration of the standard call.
    core.set_irq(true);

    let cmd = rec.header().cmd;
    match cmd {
        abi::MSG_CMD_OPEN_SESSION => {
            entry_open_session(core, &mut rec, num_params)
        }
        abi::MSG_CMD_CLOSE_SESSION => {
            entry_close_session(core, &mut rec, num_params)
        }
        abi::MSG_CMD_INVOKE_COMMAND => {
            entry_invoke_command(core, &mut rec, num_params)
        }
        abi::MSG_CMD_CANCEL => entry_cancel(core, &mut rec, num_params),
        _ => {
            log::error!("unknown cmd {cmd:#x}");
            args.a0 = abi::RETURN_EBADCMD;
            return;
        }
    }

    args.a0 = abi::RETURN_OK;
}
