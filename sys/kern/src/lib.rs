// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Citadel secure-world kernel: the thread dispatch core.
//!
//! This is the part of the trusted execution environment that services
//! world-switch calls (SMCs) from the non-secure operating system. Each
//! incoming standard call is bound to one of a small fixed pool of secure
//! threads for the duration of its processing; a thread may suspend itself
//! to request a service from the normal world (an RPC) and be resumed
//! later, possibly on a different CPU. This crate owns the thread table and
//! its state machine, the per-CPU local blocks, stack discipline and
//! canaries, the lazy save/restore of the floating-point register file
//! across worlds, mutex ownership accounting, the RPC argument-buffer
//! lifecycle, and the entry-point demultiplexer for the standard commands.
//!
//! # Design principles
//!
//! 1. Static configuration: the thread pool, core count, and stack sizes
//!    take a single shape fixed at construction ([`config::Config`]).
//! 2. Everything the normal world hands us is a claim, not a fact. Every
//!    pointer, length, and alignment is validated before use, and shared
//!    memory is re-read rather than trusted twice.
//! 3. The hardware seam is a trait. The context-switch primitive, the
//!    exception-mask register, and the FPU bank are reached through
//!    [`platform::Platform`]; on bare metal that is backed by the
//!    exception-vector assembly, on the host by an emulation that makes
//!    the whole protocol drivable from `cargo test`.
//! 4. A strong preference for safe code; the `unsafe` that remains is the
//!    unavoidable access to normal-world memory, behind validated spans.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod entry;
pub mod exceptions;
pub mod kmutex;
pub mod platform;
pub mod rpc;
pub mod smc;
pub mod stack;
pub mod thread;
pub mod tsd;
pub mod vfp;

pub use crate::thread::ThreadCore;
