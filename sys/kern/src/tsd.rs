// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread-specific data.
//!
//! State that follows a secure thread across suspensions but is invisible
//! to the normal world: the stack of sessions the thread is executing on
//! behalf of, one cached shared-memory buffer for filesystem RPCs, and the
//! thread's page-table cache entries.

use heapless::Vec;

use crate::platform::{Platform, ThreadServices};
use crate::thread::{RpcBuf, ThreadCore};

/// Nesting depth of session invocations a single thread can carry.
pub const MAX_SESSION_DEPTH: usize = 8;

/// Page-table cache entries retained per thread.
pub const PGT_CACHE_ENTRIES: usize = 4;

#[derive(Debug, Default)]
pub struct Tsd {
    /// Sessions this thread is currently executing on behalf of,
    /// innermost last.
    pub(crate) sess_stack: Vec<u32, MAX_SESSION_DEPTH>,
    /// Cached shared-memory buffer for filesystem RPCs, released at the
    /// end of every standard call.
    pub(crate) fs_cache: Option<RpcBuf>,
    /// Cached user page-table handles.
    pub(crate) pgt_cache: Vec<u64, PGT_CACHE_ENTRIES>,
}

impl<P: Platform> ThreadCore<P> {
    /// The session the current thread is executing on behalf of, if any.
    pub fn current_session(&self) -> Option<u32> {
        self.with_current_slot(|t| t.tsd.sess_stack.last().copied())
    }

    pub(crate) fn push_session(&self, id: u32) {
        self.with_current_slot(|t| {
            t.tsd
                .sess_stack
                .push(id)
                .expect("session nesting too deep")
        });
    }

    pub(crate) fn pop_session(&self) {
        self.with_current_slot(|t| t.tsd.sess_stack.pop());
    }

    /// Releases the current thread's cached filesystem-RPC buffer, if
    /// any. Runs at the end of every standard call.
    pub(crate) fn fs_cache_clear(&self) {
        let cached = self.with_current_slot(|t| t.tsd.fs_cache.take());
        if let Some(buf) = cached {
            self.rpc_free_payload(buf.cookie);
        }
    }

    /// Stashes a payload buffer in the current thread's filesystem-RPC
    /// cache, releasing any previous occupant.
    pub(crate) fn fs_cache_store(&self, pa: u64, cookie: u64) {
        let prev = self
            .with_current_slot(|t| t.tsd.fs_cache.replace(RpcBuf { pa, cookie }));
        if let Some(buf) = prev {
            self.rpc_free_payload(buf.cookie);
        }
    }

    /// Takes one page-table handle out of the current thread's cache.
    pub(crate) fn pgt_cache_take(&self) -> Option<u64> {
        self.with_current_slot(|t| t.tsd.pgt_cache.pop())
    }

    /// Parks a page-table handle in the current thread's cache. Returns
    /// `false` when the cache is full; the caller keeps ownership then.
    pub(crate) fn pgt_cache_store(&self, pgt: u64) -> bool {
        self.with_current_slot(|t| t.tsd.pgt_cache.push(pgt).is_ok())
    }

    /// Empties the current thread's page-table cache, handing every entry
    /// back to the caller. The session layer runs this when it tears down
    /// the user address space the cached tables belonged to.
    pub(crate) fn pgt_cache_drain(&self) -> Vec<u64, PGT_CACHE_ENTRIES> {
        self.with_current_slot(|t| core::mem::take(&mut t.tsd.pgt_cache))
    }
}
