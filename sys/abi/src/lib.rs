// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level definitions shared between the secure world and its normal
//! world caller.
//!
//! Everything in this crate is part of the calling convention: the SMC
//! register block, the call/return codes delivered in `a0`, the message
//! argument records placed in non-secure shared memory, and the identity
//! types carried by the open-session meta parameters. The kernel proper
//! lives in `citadel-kern`; this crate must stay free of kernel internals
//! so both worlds (and host-side tooling) can depend on it.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The SMC register block: eight general-purpose argument words.
///
/// A call arrives with `a0` holding the function code and `a1..a7` holding
/// arguments; the same block carries the reply back, with `a0` holding one
/// of the `RETURN_*` codes. The block is plain data -- it confers no
/// authority and nothing in it is trusted until validated.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct SmcArgs {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
}

impl SmcArgs {
    /// Shorthand for a block with `a0` set and everything else zero.
    pub fn with_a0(a0: u64) -> Self {
        SmcArgs {
            a0,
            ..Self::default()
        }
    }
}

/// Packs a 64-bit value into a (high, low) register pair, 32 bits each.
pub fn reg_pair_from_u64(v: u64) -> (u64, u64) {
    (v >> 32, v & 0xffff_ffff)
}

/// Recombines a (high, low) register pair. Only the low 32 bits of each
/// register participate; callers may pass full registers.
pub fn reg_pair_to_u64(hi: u64, lo: u64) -> u64 {
    (hi & 0xffff_ffff) << 32 | (lo & 0xffff_ffff)
}

/// Standard call: process the message argument record whose physical
/// address is split across `a1:a2`.
pub const CALL_WITH_ARG: u64 = 0x3200_0004;
/// Standard call: resume the suspended thread named by `a3`, asserting the
/// caller identity in `a7`.
pub const CALL_RETURN_FROM_RPC: u64 = 0x3200_0003;

/// Call completed; command-level status is in the argument record.
pub const RETURN_OK: u64 = 0x0;
/// All thread slots are busy; retry later.
pub const RETURN_ETHREAD_LIMIT: u64 = 0x1;
/// The secure world is temporarily unavailable.
pub const RETURN_EBUSY: u64 = 0x2;
/// Resume failed: no matching suspended thread.
pub const RETURN_ERESUME: u64 = 0x3;
/// The argument record address failed validation.
pub const RETURN_EBADADDR: u64 = 0x4;
/// The function or message command is not recognized.
pub const RETURN_EBADCMD: u64 = 0x5;
/// Out of memory while setting up the call.
pub const RETURN_ENOMEM: u64 = 0x6;

/// All RPC return codes carry this prefix in the upper half-word.
pub const RETURN_RPC_PREFIX: u64 = 0xffff_0000;
const RETURN_RPC_PREFIX_MASK: u64 = 0xffff_0000;

/// RPC: allocate `a1` bytes of shared memory; the reply carries the
/// physical address in `a1:a2` and the cookie in `a4:a5`.
pub const RETURN_RPC_ALLOC: u64 = RETURN_RPC_PREFIX;
/// RPC: free the shared memory named by the cookie in `a1:a2`.
pub const RETURN_RPC_FREE: u64 = RETURN_RPC_PREFIX | 2;
/// RPC: a foreign interrupt is pending for the normal world. No payload.
pub const RETURN_RPC_FOREIGN_INTR: u64 = RETURN_RPC_PREFIX | 4;
/// RPC: process the command in the cached argument record named by the
/// cookie in `a1:a2`.
pub const RETURN_RPC_CMD: u64 = RETURN_RPC_PREFIX | 5;

/// Checks whether an `a0` reply word is an RPC request rather than a final
/// return.
pub fn is_rpc_return(a0: u64) -> bool {
    a0 & RETURN_RPC_PREFIX_MASK == RETURN_RPC_PREFIX
}

/// Message commands, carried in `MsgArg::cmd` of a standard call.
pub const MSG_CMD_OPEN_SESSION: u32 = 0;
pub const MSG_CMD_INVOKE_COMMAND: u32 = 1;
pub const MSG_CMD_CLOSE_SESSION: u32 = 2;
pub const MSG_CMD_CANCEL: u32 = 3;

/// RPC commands, carried in `MsgArg::cmd` of an outgoing `RETURN_RPC_CMD`.
pub const RPC_CMD_SHM_ALLOC: u32 = 6;
pub const RPC_CMD_SHM_FREE: u32 = 7;

/// Shared-memory buffer types for the SHM_ALLOC/SHM_FREE RPC commands.
pub const RPC_SHM_TYPE_APPL: u64 = 0;
pub const RPC_SHM_TYPE_KERNEL: u64 = 1;

/// Command-level result codes, carried in `MsgArg::ret`.
pub const TEE_SUCCESS: u32 = 0x0000_0000;
pub const TEE_ERROR_GENERIC: u32 = 0xffff_0000;
pub const TEE_ERROR_BAD_PARAMETERS: u32 = 0xffff_0006;
pub const TEE_ERROR_ITEM_NOT_FOUND: u32 = 0xffff_0008;
pub const TEE_ERROR_OUT_OF_MEMORY: u32 = 0xffff_000c;
pub const TEE_ERROR_BUSY: u32 = 0xffff_000d;
pub const TEE_ERROR_TARGET_DEAD: u32 = 0xffff_3024;

/// Where a command-level result originated, carried in
/// `MsgArg::ret_origin`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Origin {
    Api = 1,
    Comms = 2,
    Tee = 3,
    TrustedApp = 4,
}

/// Header of the message argument record placed in non-secure shared
/// memory, immediately followed by `num_params` parameter slots.
///
/// The record lives in memory the normal world can rewrite at any time, so
/// nothing read from it may be trusted twice: every field is copied in,
/// validated, and only then used.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MsgArg {
    /// One of `MSG_CMD_*` (standard call) or `RPC_CMD_*` (outgoing RPC).
    pub cmd: u32,
    /// Command-specific function selector (the trusted application command
    /// id for `MSG_CMD_INVOKE_COMMAND`).
    pub func: u32,
    /// Session handle; filled in by open-session, consumed by the rest.
    pub session: u32,
    /// Identifies the operation to cancel for `MSG_CMD_CANCEL`.
    pub cancel_id: u32,
    pub pad: u32,
    /// Command-level result code (`TEE_*`).
    pub ret: u32,
    /// Origin of the result (`Origin` as u32).
    pub ret_origin: u32,
    /// Number of parameter slots following this header.
    pub num_params: u32,
}

/// One parameter slot of a message argument record.
///
/// The three payload words are interpreted per the type bits of `attr`:
/// as `{a, b, c}` for value parameters or `{buf_ptr, size, shm_ref}` for
/// temporary-memory references. All layouts are three 64-bit words, so the
/// slot is a plain struct with typed accessors rather than a union.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct MsgParam {
    pub attr: u64,
    pub a: u64,
    pub b: u64,
    pub c: u64,
}

/// Low bits of `MsgParam::attr`: the parameter type.
pub const ATTR_TYPE_MASK: u64 = 0xff;
pub const ATTR_TYPE_NONE: u64 = 0x0;
pub const ATTR_TYPE_VALUE_INPUT: u64 = 0x1;
pub const ATTR_TYPE_VALUE_OUTPUT: u64 = 0x2;
pub const ATTR_TYPE_VALUE_INOUT: u64 = 0x3;
pub const ATTR_TYPE_RMEM_INPUT: u64 = 0x5;
pub const ATTR_TYPE_RMEM_OUTPUT: u64 = 0x6;
pub const ATTR_TYPE_RMEM_INOUT: u64 = 0x7;
pub const ATTR_TYPE_TMEM_INPUT: u64 = 0x9;
pub const ATTR_TYPE_TMEM_OUTPUT: u64 = 0xa;
pub const ATTR_TYPE_TMEM_INOUT: u64 = 0xb;

/// High attribute bits. A parameter carrying either of these in a standard
/// call is rejected outright, except for the open-session meta slots which
/// must carry `ATTR_META`.
pub const ATTR_META: u64 = 1 << 8;
pub const ATTR_FRAGMENT: u64 = 1 << 9;

impl MsgParam {
    /// Extracts the type bits of `attr`.
    pub fn attr_type(&self) -> u64 {
        self.attr & ATTR_TYPE_MASK
    }

    /// Builds a value-input parameter, optionally flagged as meta.
    pub fn value_input(a: u64, b: u64, c: u64, meta: bool) -> Self {
        MsgParam {
            attr: ATTR_TYPE_VALUE_INPUT | if meta { ATTR_META } else { 0 },
            a,
            b,
            c,
        }
    }

    /// The first 16 payload bytes viewed as raw octets (used by the
    /// open-session meta slots, which smuggle a UUID through `a` and `b`).
    pub fn octets(&self) -> [u8; 16] {
        let mut out = [0; 16];
        out[..8].copy_from_slice(&self.a.to_le_bytes());
        out[8..].copy_from_slice(&self.b.to_le_bytes());
        out
    }
}

/// Size in bytes of an argument record carrying `num_params` slots.
pub const fn msg_arg_size(num_params: usize) -> usize {
    core::mem::size_of::<MsgArg>()
        + num_params * core::mem::size_of::<MsgParam>()
}

// The record layout is ABI; a drifting field would corrupt the protocol
// silently, so pin the sizes.
static_assertions::const_assert_eq!(core::mem::size_of::<MsgArg>(), 32);
static_assertions::const_assert_eq!(core::mem::size_of::<MsgParam>(), 32);

/// A trusted-application identity, in the RFC 4122 field layout.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Uuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_and_node: [u8; 8],
}

impl Uuid {
    /// Parses a UUID from its 16-octet network (big-endian) encoding.
    pub fn from_octets(octets: &[u8; 16]) -> Self {
        Uuid {
            time_low: u32::from_be_bytes([
                octets[0], octets[1], octets[2], octets[3],
            ]),
            time_mid: u16::from_be_bytes([octets[4], octets[5]]),
            time_hi_and_version: u16::from_be_bytes([octets[6], octets[7]]),
            clock_seq_and_node: [
                octets[8], octets[9], octets[10], octets[11], octets[12],
                octets[13], octets[14], octets[15],
            ],
        }
    }
}

/// Client login methods accepted in the open-session identity slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Login {
    Public = 0x0,
    User = 0x1,
    Group = 0x2,
    Application = 0x4,
    ApplicationUser = 0x5,
    ApplicationGroup = 0x6,
}

impl TryFrom<u32> for Login {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0x0 => Ok(Login::Public),
            0x1 => Ok(Login::User),
            0x2 => Ok(Login::Group),
            0x4 => Ok(Login::Application),
            0x5 => Ok(Login::ApplicationUser),
            0x6 => Ok(Login::ApplicationGroup),
            _ => Err(()),
        }
    }
}

/// The identity asserted by the normal world when opening a session.
///
/// For `Login::Public` the UUID is forced to nil; for every other login it
/// is read from the identity meta slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Identity {
    pub login: Login,
    pub uuid: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_pair_round_trip() {
        let v = 0x1234_5678_9abc_def0;
        let (hi, lo) = reg_pair_from_u64(v);
        assert_eq!(hi, 0x1234_5678);
        assert_eq!(lo, 0x9abc_def0);
        assert_eq!(reg_pair_to_u64(hi, lo), v);
        // Full registers participate only through their low halves.
        assert_eq!(reg_pair_to_u64(hi | 0xdead << 48, lo), v);
    }

    #[test]
    fn rpc_return_detection() {
        assert!(is_rpc_return(RETURN_RPC_ALLOC));
        assert!(is_rpc_return(RETURN_RPC_CMD));
        assert!(is_rpc_return(RETURN_RPC_FOREIGN_INTR));
        assert!(!is_rpc_return(RETURN_OK));
        assert!(!is_rpc_return(RETURN_ETHREAD_LIMIT));
    }

    #[test]
    fn msg_arg_size_tracks_params() {
        assert_eq!(msg_arg_size(0), 32);
        assert_eq!(msg_arg_size(4), 32 + 4 * 32);
    }

    #[test]
    fn uuid_from_octets_is_big_endian() {
        let octets = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x01, 0x02,
            0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
        ];
        let uuid = Uuid::from_octets(&octets);
        assert_eq!(uuid.time_low, 0x1234_5678);
        assert_eq!(uuid.time_mid, 0x9abc);
        assert_eq!(uuid.time_hi_and_version, 0xdef0);
        assert_eq!(&uuid.clock_seq_and_node[..], &octets[8..]);
    }

    #[test]
    fn param_octets_cover_both_words() {
        let p = MsgParam {
            attr: ATTR_TYPE_VALUE_INPUT | ATTR_META,
            a: u64::from_le_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
            b: u64::from_le_bytes([9, 10, 11, 12, 13, 14, 15, 16]),
            c: 0,
        };
        assert_eq!(
            p.octets(),
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]
        );
        assert_eq!(p.attr_type(), ATTR_TYPE_VALUE_INPUT);
    }

    #[test]
    fn login_whitelist() {
        assert_eq!(Login::try_from(0), Ok(Login::Public));
        assert_eq!(Login::try_from(6), Ok(Login::ApplicationGroup));
        assert!(Login::try_from(3).is_err());
        assert!(Login::try_from(7).is_err());
        assert!(Login::try_from(0xffff_ffff).is_err());
    }
}
