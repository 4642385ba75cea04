//! Thread identification for the runtime.
//!
//! One process-wide counter hands out unique monotonic ids. The main thread
//! picks its id up lazily on first read; worker threads get theirs assigned
//! at spawn time and installed into the thread-local cell by the thread
//! runtime. Id 0 means "unassigned".

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_ID: Cell<u64> = const { Cell::new(0) };
}

/// The calling thread's id, assigning a fresh one on first read.
pub fn current_thread_id() -> u64 {
    CURRENT_ID.with(|cell| {
        let mut id = cell.get();
        if id == 0 {
            id = allocate_thread_id();
            cell.set(id);
        }
        id
    })
}

/// Reserve a fresh id without touching the thread-local cell. Infallible.
pub fn allocate_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::AcqRel)
}

/// Install `id` as the calling thread's id. Used by the thread runtime when
/// a worker starts with a pre-assigned id.
pub fn set_current_thread_id(id: u64) {
    CURRENT_ID.with(|cell| cell.set(id));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_sticky() {
        let first = current_thread_id();
        assert_ne!(first, 0);
        assert_eq!(current_thread_id(), first);

        let fresh = allocate_thread_id();
        assert_ne!(fresh, first);
    }

    #[test]
    fn worker_threads_get_distinct_ids() {
        let main_id = current_thread_id();
        let worker_id = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(main_id, worker_id);
    }

    #[test]
    fn set_overrides_lazy_assignment() {
        std::thread::spawn(|| {
            set_current_thread_id(4096);
            assert_eq!(current_thread_id(), 4096);
        })
        .join()
        .unwrap();
    }
}
