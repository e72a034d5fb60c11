// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mutex ownership accounting.
//!
//! The sleeping mutexes used by kernel subsystems record which thread slot
//! owns them, and each thread keeps the list of mutexes it holds, so that
//! releasing a slot can assert the "no mutex leaks on exit" invariant.
//! Ownership lives in the mutex (a nullable slot index); the per-thread
//! list holds mutex ids. Neither side owns the other.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::platform::Platform;
use crate::thread::ThreadCore;

/// Stable identity of a kernel mutex, for the per-thread held list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MutexId(u32);

const OWNER_NONE: usize = usize::MAX;

/// Ownership-tracked kernel mutex.
///
/// This is only the accounting half: the blocking/wait-queue machinery
/// lives with the platform's scheduler glue. The dispatch core cares that
/// every acquisition is recorded against the owning thread slot and every
/// release is recorded by that same slot.
#[derive(Debug)]
pub struct KMutex {
    id: MutexId,
    owner: AtomicUsize,
}

static NEXT_MUTEX_ID: AtomicU32 = AtomicU32::new(0);

impl KMutex {
    pub fn new() -> Self {
        KMutex {
            id: MutexId(NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed)),
            owner: AtomicUsize::new(OWNER_NONE),
        }
    }

    pub fn id(&self) -> MutexId {
        self.id
    }

    /// The slot currently holding this mutex, if any.
    pub fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            OWNER_NONE => None,
            n => Some(n),
        }
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> ThreadCore<P> {
    /// Records `m` as held by the current thread. IRQs must be masked.
    ///
    /// # Panics
    ///
    /// If no thread is current, the current slot is not active, or `m`
    /// already has an owner.
    pub fn add_mutex(&self, m: &KMutex) {
        let ct = self
            .core_local()
            .curr_thread()
            .expect("mutex acquired outside a thread");
        let mut table = self.lock_global();
        assert!(table.slots[ct].state.is_active());
        assert_eq!(m.owner(), None);
        m.owner.store(ct, Ordering::Release);
        table.slots[ct]
            .mutexes
            .push(m.id)
            .expect("held-mutex list overflow");
    }

    /// Records `m` as released by the current thread. IRQs must be
    /// masked.
    ///
    /// # Panics
    ///
    /// If the current slot is not active or does not own `m`.
    pub fn rem_mutex(&self, m: &KMutex) {
        let ct = self
            .core_local()
            .curr_thread()
            .expect("mutex released outside a thread");
        let mut table = self.lock_global();
        assert!(table.slots[ct].state.is_active());
        assert_eq!(m.owner(), Some(ct));
        m.owner.store(OWNER_NONE, Ordering::Release);
        let held = &mut table.slots[ct].mutexes;
        let pos = held
            .iter()
            .position(|id| *id == m.id)
            .expect("mutex not in held list");
        held.swap_remove(pos);
    }

    /// Number of mutexes the given slot currently holds. Inspection only;
    /// takes the table lock directly rather than through the accounted
    /// path, so it may be called with IRQs unmasked.
    pub fn held_mutexes(&self, slot: usize) -> usize {
        self.table.lock().slots[slot].mutexes.len()
    }
}
