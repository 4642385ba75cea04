//! Managed-arena memory runtime for the Rill language.
//!
//! Generated code lowers source-level scopes onto hierarchical arenas and
//! calls into this crate for every allocation, string, array, thread and
//! cross-call value promotion. The pieces:
//!
//! - [`arena`] — arena tree, allocator surface, promotion, cleanup hooks
//! - [`handle`] — fat handles, flags, callbacks, transactions
//! - [`gc`] — stop-the-world collector and the background GC thread
//! - [`hooks`] / [`redirect`] — thread-local malloc interception into arenas
//! - [`thread`] — worker lifecycle tied to arena lifecycle, panic capture
//! - [`sync_lock`] — address-keyed mutexes for `lock(x) { ... }` blocks
//! - [`stats`] — per-arena observability
//! - [`tid`] — process-wide thread ids
//!
//! Debug output follows the standard `RUST_LOG` environment filter through
//! `tracing`; the per-arena GC log line is additionally gated by
//! [`Arena::enable_gc_log`].

pub mod arena;
pub mod gc;
pub mod handle;
pub mod hooks;
pub mod redirect;
pub mod stats;
pub mod sync_lock;
pub mod thread;
pub mod tid;

pub use arena::{
    Arena, ArenaMode, CleanupCallback, CLEANUP_PRIORITY_HIGH, CLEANUP_PRIORITY_LOW,
    CLEANUP_PRIORITY_NORMAL,
};
pub use gc::{
    gc, gc_flush, gc_thread_running, gc_thread_start, gc_thread_stop, GcReport,
    DEFAULT_GC_INTERVAL, MIN_GC_INTERVAL,
};
pub use handle::{free, CopyCallback, FreeCallback, Handle, Txn};
pub use hooks::MallocHandler;
pub use redirect::{redirect_current, redirect_pop, redirect_push, REDIRECT_STACK_DEPTH};
pub use stats::{ArenaStats, Metric};
pub use sync_lock::{sync_lock, sync_lock_handle, sync_unlock, sync_unlock_handle};
pub use thread::{
    runtime_panic, thread_args, thread_arena, thread_create, thread_current, thread_dispose,
    thread_set_args, thread_set_result, thread_signal_done, thread_start, thread_sync,
    thread_sync_all, ThreadMode, ThreadWrapper,
};
pub use tid::{allocate_thread_id, current_thread_id, set_current_thread_id};
