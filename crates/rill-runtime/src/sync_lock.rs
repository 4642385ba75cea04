//! Address-keyed mutexes backing source-level `lock(x) { ... }` blocks.
//!
//! A fixed, power-of-two, open-addressed table maps pointer-sized addresses
//! to raw mutexes. Slots are claimed under a table-wide mutex; lock and
//! unlock arrive as separate calls from generated code, so the slots hold
//! raw mutexes rather than guard-based ones. On overflow the lock degrades
//! to a no-op with a warning rather than aborting the program.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::lock_api::RawMutex as RawMutexTrait;
use parking_lot::{Mutex, RawMutex};

use crate::handle::Handle;

/// Table capacity. Power of two; the probe mask depends on it.
pub const SYNC_LOCK_TABLE_SIZE: usize = 256;

struct Slot {
    /// Key address; 0 means empty. Written once under the table mutex.
    addr: AtomicUsize,
    mutex: RawMutex,
}

struct SyncLockTable {
    slots: [Slot; SYNC_LOCK_TABLE_SIZE],
    /// Serializes slot claims only; lock/unlock go straight to the slot.
    insert: Mutex<()>,
    initialized: AtomicBool,
}

static TABLE: SyncLockTable = SyncLockTable {
    slots: [const {
        Slot {
            addr: AtomicUsize::new(0),
            mutex: RawMutex::INIT,
        }
    }; SYNC_LOCK_TABLE_SIZE],
    insert: Mutex::new(()),
    initialized: AtomicBool::new(false),
};

/// Shift-mix the address bits away from alignment patterns.
fn slot_hash(addr: usize) -> usize {
    ((addr >> 3) ^ (addr >> 7) ^ (addr >> 11)) & (SYNC_LOCK_TABLE_SIZE - 1)
}

/// Mark the table live. Called lazily on first use; explicit calls are
/// harmless.
pub fn sync_lock_table_init() {
    TABLE.initialized.store(true, Ordering::Release);
}

/// Reset every slot. For process shutdown; all locks must be released.
pub fn sync_lock_table_cleanup() {
    if !TABLE.initialized.swap(false, Ordering::AcqRel) {
        return;
    }
    let _guard = TABLE.insert.lock();
    for slot in &TABLE.slots {
        slot.addr.store(0, Ordering::Release);
    }
}

/// Find the slot holding `addr`, or claim an empty one for it.
fn find_or_claim(addr: usize) -> Option<&'static Slot> {
    sync_lock_table_init();
    let hash = slot_hash(addr);

    // Fast path: probe for an existing entry without the insert mutex.
    for i in 0..SYNC_LOCK_TABLE_SIZE {
        let slot = &TABLE.slots[(hash + i) & (SYNC_LOCK_TABLE_SIZE - 1)];
        match slot.addr.load(Ordering::Acquire) {
            a if a == addr => return Some(slot),
            0 => break,
            _ => {}
        }
    }

    // Claim under the insert mutex, re-probing from the hash slot.
    let _guard = TABLE.insert.lock();
    for i in 0..SYNC_LOCK_TABLE_SIZE {
        let slot = &TABLE.slots[(hash + i) & (SYNC_LOCK_TABLE_SIZE - 1)];
        let current = slot.addr.load(Ordering::Acquire);
        if current == addr {
            return Some(slot);
        }
        if current == 0 {
            slot.addr.store(addr, Ordering::Release);
            return Some(slot);
        }
    }

    tracing::warn!(
        target: "rill_runtime::sync_lock",
        addr,
        "sync-lock table full; lock is a no-op"
    );
    None
}

/// Find the slot holding `addr`, never claiming.
fn find(addr: usize) -> Option<&'static Slot> {
    let hash = slot_hash(addr);
    for i in 0..SYNC_LOCK_TABLE_SIZE {
        let slot = &TABLE.slots[(hash + i) & (SYNC_LOCK_TABLE_SIZE - 1)];
        match slot.addr.load(Ordering::Acquire) {
            a if a == addr => return Some(slot),
            0 => return None,
            _ => {}
        }
    }
    None
}

/// Acquire the mutex for `addr`, creating its slot on first use. A full
/// table makes this a warned no-op.
pub fn sync_lock(addr: usize) {
    if let Some(slot) = find_or_claim(addr) {
        slot.mutex.lock();
    }
}

/// Release the mutex for `addr`. Unlocking an address that was never locked
/// is a warned no-op.
pub fn sync_unlock(addr: usize) {
    match find(addr) {
        // SAFETY: generated code pairs every unlock with a prior lock on the
        // same address from the same thread.
        Some(slot) => unsafe { slot.mutex.unlock() },
        None => {
            tracing::warn!(
                target: "rill_runtime::sync_lock",
                addr,
                "sync-unlock on unknown address; ignored"
            );
        }
    }
}

/// Lock the slot keyed by a handle's identity, the form `lock(var)` blocks
/// lower to.
pub fn sync_lock_handle(handle: Handle) {
    sync_lock(handle.into_word());
}

/// Unlock the slot keyed by a handle's identity.
pub fn sync_unlock_handle(handle: Handle) {
    sync_unlock(handle.into_word());
}
