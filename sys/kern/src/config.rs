// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-shape configuration for the dispatch core.
//!
//! One struct replaces the stack of conditional sizes a port would
//! otherwise express in its build system. These values select code
//! variants, never protocol: two cores built with different configs still
//! speak the same SMC convention.

/// Maximum number of parameter slots in an RPC argument record.
pub const MAX_RPC_PARAMS: usize = 4;

/// Maximum number of trusted-application parameters per command.
pub const MAX_TA_PARAMS: usize = 4;

#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Number of secure thread slots. Fixed for the life of the core;
    /// slots are allocated, never grown.
    pub num_threads: usize,
    /// Number of physical CPUs that may enter the secure world.
    pub num_cores: usize,
    /// Bytes of per-CPU temporary stack.
    pub stack_tmp_size: usize,
    /// Bytes of per-CPU abort stack.
    pub stack_abt_size: usize,
    /// Bytes of per-thread kernel stack.
    pub stack_thread_size: usize,
    /// Pad every stack with canary words and check them on each dispatch.
    pub canaries: bool,
    /// Back thread stacks with the demand pager instead of static storage.
    pub pager: bool,
    /// Track floating-point state lazily across worlds.
    pub vfp: bool,
    /// Booted under ARM-Trusted-Firmware-style firmware, which clobbers
    /// the FPU enable across world switches; forces the normal-world
    /// register file to be preserved on every entry.
    pub arm_trusted_fw: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_threads: 4,
            num_cores: 4,
            stack_tmp_size: 2048,
            stack_abt_size: 3072,
            stack_thread_size: 8192,
            canaries: true,
            pager: false,
            vfp: true,
            arm_trusted_fw: true,
        }
    }
}
