// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stack storage and the canary protocol.
//!
//! Three stack families exist: a temporary stack and an abort stack per
//! CPU, and a kernel stack per thread slot (unless the pager owns thread
//! stacks, in which case those are virtual ranges handed out by the
//! pager). Stacks may be padded with 16 bytes of canary at both ends;
//! `check_canaries` runs at the entry of every SMC dispatch path and any
//! mismatch is fatal.
//!
//! Storage words are atomics: the stacks are machine memory shared between
//! CPUs, and the canary checker must be allowed to read them while some
//! other core is executing on the stack.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::Config;

const START_CANARY: u32 = 0xdede_dede;
const END_CANARY: u32 = 0xabab_abab;

/// Canary pad per stack end, in 32-bit words (16 bytes).
const CANARY_WORDS: usize = 4;

/// One family of equally sized stacks in a single flat allocation.
pub(crate) struct StackArray {
    name: &'static str,
    words: Box<[AtomicU32]>,
    words_per: usize,
    count: usize,
    canaries: bool,
}

impl StackArray {
    fn new(
        name: &'static str,
        count: usize,
        size_bytes: usize,
        canaries: bool,
    ) -> Self {
        // Round the usable size up to whole 64-bit units, then add the
        // canary pads.
        let usable_words = (size_bytes + 7) / 8 * 2;
        let words_per =
            usable_words + if canaries { 2 * CANARY_WORDS } else { 0 };
        let total = count * words_per;
        let mut v = alloc::vec::Vec::with_capacity(total);
        v.resize_with(total, || AtomicU32::new(0));
        StackArray {
            name,
            words: v.into_boxed_slice(),
            words_per,
            count,
            canaries,
        }
    }

    fn word(&self, stack: usize, index: usize) -> &AtomicU32 {
        &self.words[stack * self.words_per + index]
    }

    /// Writes the canary pattern into both ends of every stack. Done once
    /// by the primary CPU during init.
    fn init_canaries(&self) {
        if !self.canaries {
            return;
        }
        for n in 0..self.count {
            self.word(n, 0).store(START_CANARY, Ordering::Relaxed);
            self.word(n, self.words_per - 1)
                .store(END_CANARY, Ordering::Relaxed);
            log::debug!(
                "#Stack canaries for {}[{}] with top at {:#x}",
                self.name,
                n,
                self.va_end(n)
            );
        }
    }

    fn check_canaries(&self) {
        if !self.canaries {
            return;
        }
        for n in 0..self.count {
            if self.word(n, 0).load(Ordering::Relaxed) != START_CANARY {
                canary_died(self.name, "start", n);
            }
            let end = self.word(n, self.words_per - 1);
            if end.load(Ordering::Relaxed) != END_CANARY {
                canary_died(self.name, "end", n);
            }
        }
    }

    /// Top-of-stack address for stack `n`: the end of the usable words,
    /// just below the end canary.
    pub(crate) fn va_end(&self, n: usize) -> u64 {
        assert!(n < self.count);
        let top_index = self.words_per
            - if self.canaries { CANARY_WORDS } else { 0 };
        let base = self.word(n, 0) as *const AtomicU32 as usize;
        (base + top_index * 4) as u64
    }
}

fn canary_died(name: &str, loc: &str, n: usize) -> ! {
    log::error!("Dead canary at {loc} of '{name}[{n}]'");
    panic!("Dead canary at {loc} of '{name}[{n}]'");
}

/// All stack storage owned by the core.
pub(crate) struct StackPool {
    tmp: StackArray,
    abt: StackArray,
    /// Absent when the pager owns thread stacks.
    thread: Option<StackArray>,
}

impl StackPool {
    pub(crate) fn new(config: &Config) -> Self {
        let pool = StackPool {
            tmp: StackArray::new(
                "stack_tmp",
                config.num_cores,
                config.stack_tmp_size,
                config.canaries,
            ),
            abt: StackArray::new(
                "stack_abt",
                config.num_cores,
                config.stack_abt_size,
                config.canaries,
            ),
            thread: if config.pager {
                None
            } else {
                Some(StackArray::new(
                    "stack_thread",
                    config.num_threads,
                    config.stack_thread_size,
                    config.canaries,
                ))
            },
        };
        pool.tmp.init_canaries();
        pool.abt.init_canaries();
        if let Some(thread) = &pool.thread {
            thread.init_canaries();
        }
        pool
    }

    /// Verifies every canary in every family; panics naming the stack and
    /// position on the first mismatch.
    pub(crate) fn check_canaries(&self) {
        self.tmp.check_canaries();
        self.abt.check_canaries();
        if let Some(thread) = &self.thread {
            thread.check_canaries();
        }
    }

    pub(crate) fn tmp_va_end(&self, cpu: usize) -> u64 {
        self.tmp.va_end(cpu)
    }

    pub(crate) fn abt_va_end(&self, cpu: usize) -> u64 {
        self.abt.va_end(cpu)
    }

    /// Top of thread stack `n`. Only valid for statically allocated
    /// thread stacks; with the pager enabled the addresses live in the
    /// thread table instead.
    pub(crate) fn thread_va_end(&self, n: usize) -> u64 {
        self.thread
            .as_ref()
            .expect("thread stacks are pager-backed")
            .va_end(n)
    }

    #[cfg(test)]
    fn stomp_thread_end_canary(&self, n: usize) {
        let t = self.thread.as_ref().unwrap();
        t.word(n, t.words_per - 1).store(0, Ordering::Relaxed);
    }
}
