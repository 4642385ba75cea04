//! Stop-the-world collection over one arena tree.
//!
//! A cycle runs three phases:
//!
//! 1. **Dead-arena drain** — atomically swap out the root's condemned LIFO
//!    and run each condemned arena's cleanup callbacks. Handle structs stay
//!    alive so later phases can still read them.
//! 2. **Dead-handle collection** — walk the live tree unlinking dead
//!    handles, build the known-handle set and a reference-count table by
//!    scanning live handle data word by word, rescue dead handles that are
//!    still referenced, then cascade into children owned exclusively by the
//!    dying handles and free everything that remains dead.
//! 3. **Condemned finalization** — free every handle of each condemned
//!    arena, orphan its remaining children, and release the arena struct.
//!
//! The cycle serializes with itself through the root's `gc_running` flag; a
//! concurrent entry returns immediately and is counted as a skip. Collection
//! is stop-the-world per root tree only: independent roots collect
//! independently.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::arena::{self, Arena, ArenaInner};
use crate::handle::{self, Handle, HandleInner, WORD};
use crate::hooks;
use crate::stats;

/// What one GC cycle reclaimed, plus the process-wide entry counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    /// Handles freed this cycle: dead handles collected from live arenas
    /// (Phase 2) plus every handle of a finalized condemned arena (Phase 3).
    pub handles_freed: usize,
    /// Data bytes of the freed handles.
    pub bytes_freed: usize,
    /// Condemned arenas destroyed (Phases 1 and 3).
    pub arenas_freed: usize,
    /// Bytes released with condemned arenas, handle and arena structs
    /// included (Phase 3).
    pub arena_bytes_freed: usize,
    /// Cumulative GC entry attempts.
    pub gc_calls: usize,
    /// Cumulative entries skipped because a cycle was already running.
    pub gc_skips: usize,
}

static GC_CALLS: AtomicUsize = AtomicUsize::new(0);
static GC_SKIPS: AtomicUsize = AtomicUsize::new(0);

/// Run one GC cycle on `root`'s tree.
///
/// Re-entrant-safe: if a cycle is already running on this root the call
/// returns an empty report and counts as a skip.
pub fn gc(root: Arena) -> GcReport {
    GC_CALLS.fetch_add(1, Ordering::AcqRel);

    let inner = root.inner();
    inner.lock_raw();
    if inner.gc_running.get() {
        GC_SKIPS.fetch_add(1, Ordering::AcqRel);
        // SAFETY: locked above.
        unsafe { inner.unlock_raw() };
        return GcReport {
            gc_calls: GC_CALLS.load(Ordering::Acquire),
            gc_skips: GC_SKIPS.load(Ordering::Acquire),
            ..GcReport::default()
        };
    }
    inner.gc_running.set(true);
    // SAFETY: locked above.
    unsafe { inner.unlock_raw() };

    // Park this thread's malloc redirect for the duration of the cycle.
    // Foreign allocations made from cleanup callbacks must not land in the
    // arenas being collected, and arena data was allocated by the original
    // allocator, so freeing it with the original allocator stays correct.
    let saved_handler = hooks::take_handler();

    let mut report = GcReport::default();

    // Phase 1: drain the condemned queue, run cleanup callbacks. Handle
    // free callbacks are NOT run here; cross-arena references would be
    // invalidated too early.
    let condemned = drain_condemned(root);
    for &dead in &condemned {
        // SAFETY: condemned arenas are owned by this cycle once drained.
        unsafe { run_cleanups(dead) };
    }

    // Phase 2: dead-handle collection in the live tree.
    collect_dead_handles(root, &mut report);

    // Phase 3: free condemned arenas' handles and structs.
    for &dead in &condemned {
        // SAFETY: drained by this cycle, unreachable from the live tree.
        unsafe { finalize_condemned(dead, &mut report) };
    }
    report.arenas_freed = condemned.len();

    report.gc_calls = GC_CALLS.load(Ordering::Acquire);
    report.gc_skips = GC_SKIPS.load(Ordering::Acquire);
    stats::record_gc(root, &report);

    if let Some(handler) = saved_handler {
        hooks::set_handler(handler);
    }

    inner.lock_raw();
    inner.gc_running.set(false);
    // SAFETY: locked above.
    unsafe { inner.unlock_raw() };

    report
}

/// Run GC cycles until one frees no handles.
pub fn gc_flush(root: Arena) {
    while gc(root).handles_freed > 0 {}
}

// ============================================================================
// Phase 1: condemned queue
// ============================================================================

/// Atomically swap out the root's condemned LIFO and return the arenas in
/// drain order. O(condemned), not O(tree).
fn drain_condemned(root: Arena) -> Vec<*mut ArenaInner> {
    let head = root
        .inner()
        .condemned_head
        .swap(std::ptr::null_mut(), Ordering::AcqRel);

    let mut out = Vec::new();
    let mut cur = head;
    // SAFETY: nodes on the queue are condemned arenas that only this drain
    // may touch; links were published by the condemning CAS.
    while let Some(a) = unsafe { cur.as_ref() } {
        let next = a.condemned_next.swap(std::ptr::null_mut(), Ordering::AcqRel);
        out.push(cur);
        cur = next;
    }
    out
}

/// Run and clear an arena's cleanup callbacks, in priority order.
///
/// # Safety
/// `arena` must be live or owned by the running cycle.
unsafe fn run_cleanups(arena: *mut ArenaInner) {
    let a = &*arena;
    let cleanups = a.with_state(|s| mem::take(&mut s.cleanups));
    for entry in cleanups {
        (entry.callback)(entry.subject);
    }
}

// ============================================================================
// Phase 2: dead handles in live arenas
// ============================================================================

fn collect_dead_handles(root: Arena, report: &mut GcReport) {
    // Unlink every dead handle in the tree into the cycle's dead set.
    let mut dead: Vec<Handle> = Vec::new();
    unlink_dead(root, &mut dead, report);
    if dead.is_empty() {
        return;
    }

    // Known-handle set: live handles plus the dead set. This filters the
    // conservative word scan so non-handle pointers (arena metadata, stray
    // integers) can never look like references.
    let mut handle_set: HashSet<usize> = HashSet::new();
    build_handle_set(root, &mut handle_set);
    for h in &dead {
        handle_set.insert(h.into_word());
    }

    // Reference counts from live handles only; the dead set is already
    // unlinked and does not contribute.
    let mut counts: HashMap<usize, usize> = HashMap::new();
    build_refcounts(root, &handle_set, &mut counts);

    // Rescue pass: a dead handle still stored in live data would become a
    // use-after-free if collected. Revive it instead.
    let mut truly_dead: Vec<Handle> = Vec::new();
    for h in dead {
        if counts.get(&h.into_word()).copied().unwrap_or(0) > 0 {
            tracing::trace!(
                target: "rill_runtime::gc",
                handle = h.into_word(),
                "rescue: still referenced by live data"
            );
            h.clear_dead();
            h.owner()
                .inner()
                .with_state(|s| handle::link(&mut s.handles_head, h.inner()));
            report.handles_freed -= 1;
            report.bytes_freed -= h.size();
        } else {
            truly_dead.push(h);
        }
    }

    // Cascade: children reachable only through the dying handles die with
    // them, in this same cycle. A child with a surviving reference count is
    // shared with live data and is left alone.
    let roots = truly_dead.len();
    for i in 0..roots {
        let h = truly_dead[i];
        for word in scan_words(h) {
            if handle_set.contains(&word) && counts.get(&word).copied().unwrap_or(0) == 0 {
                // SAFETY: a member of the handle set is a live handle struct.
                if let Some(child) = unsafe { Handle::from_word(word) } {
                    if !child.is_dead() {
                        cascade_kill(child, &handle_set, &mut counts, &mut truly_dead, report);
                    }
                }
            }
        }
    }

    // Free what stayed dead: data (unless externally owned) and the handle
    // struct itself.
    for h in truly_dead {
        tracing::trace!(
            target: "rill_runtime::gc",
            handle = h.into_word(),
            size = h.size(),
            "free dead handle"
        );
        // SAFETY: unlinked, unreferenced from live data, owned by the cycle.
        unsafe { arena::free_handle(h) };
    }
}

/// Kill a handle that was live when the count table was built: unlink it,
/// mark it dead, and withdraw the counts its data contributed, recursing
/// into any child whose count drops to zero.
fn cascade_kill(
    h: Handle,
    handle_set: &HashSet<usize>,
    counts: &mut HashMap<usize, usize>,
    truly_dead: &mut Vec<Handle>,
    report: &mut GcReport,
) {
    tracing::trace!(
        target: "rill_runtime::gc",
        handle = h.into_word(),
        "cascade: exclusively owned by dead data"
    );
    h.mark_dead();
    h.owner()
        .inner()
        .with_state(|s| handle::unlink(&mut s.handles_head, h.inner()));
    report.handles_freed += 1;
    report.bytes_freed += h.size();
    truly_dead.push(h);

    for word in scan_words(h) {
        if !handle_set.contains(&word) {
            continue;
        }
        let count = counts.entry(word).or_insert(0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            // SAFETY: member of the handle set.
            if let Some(child) = unsafe { Handle::from_word(word) } {
                if !child.is_dead() {
                    cascade_kill(child, handle_set, counts, truly_dead, report);
                }
            }
        }
    }
}

/// Unlink dead (non-root-flagged) handles from every arena in the tree.
/// Each arena's list is edited under its own lock; children are walked from
/// a snapshot taken under the lock and released before recursing, so the
/// descent never holds a parent lock while taking a child's.
fn unlink_dead(arena: Arena, dead: &mut Vec<Handle>, report: &mut GcReport) {
    arena.inner().with_state(|s| {
        let mut cur = s.handles_head;
        // SAFETY: list nodes are live handle structs under this arena's lock.
        while let Some(hi) = unsafe { cur.as_ref() } {
            let next = hi.next.get();
            let h = Handle::from_inner(NonNull::from(hi));
            if h.is_dead() && !h.is_gc_root() {
                handle::unlink(&mut s.handles_head, hi);
                report.handles_freed += 1;
                report.bytes_freed += hi.size;
                dead.push(h);
            }
            cur = next;
        }
    });
    for child in arena.children_snapshot() {
        unlink_dead(child, dead, report);
    }
}

fn build_handle_set(arena: Arena, set: &mut HashSet<usize>) {
    arena.inner().with_state(|s| {
        let mut cur = s.handles_head;
        // SAFETY: as in `unlink_dead`.
        while let Some(hi) = unsafe { cur.as_ref() } {
            set.insert(cur as usize);
            cur = hi.next.get();
        }
    });
    for child in arena.children_snapshot() {
        build_handle_set(child, set);
    }
}

fn build_refcounts(arena: Arena, handle_set: &HashSet<usize>, counts: &mut HashMap<usize, usize>) {
    arena.inner().with_state(|s| {
        let mut cur = s.handles_head;
        // SAFETY: as in `unlink_dead`; data scan stays within each handle's
        // allocation.
        while let Some(hi) = unsafe { cur.as_ref() } {
            let h = Handle::from_inner(NonNull::from(hi));
            for word in scan_words(h) {
                if handle_set.contains(&word) {
                    *counts.entry(word).or_insert(0) += 1;
                }
            }
            cur = hi.next.get();
        }
    });
    for child in arena.children_snapshot() {
        build_refcounts(child, handle_set, counts);
    }
}

/// Iterate a handle's data as pointer-sized words, skipping zeros.
fn scan_words(h: Handle) -> impl Iterator<Item = usize> {
    let inner = h.inner();
    let base = inner.ptr as *const usize;
    let slots = if inner.ptr.is_null() {
        0
    } else {
        inner.size / WORD
    };
    // SAFETY: in-bounds aligned reads of the handle's own allocation; host
    // allocations are word-aligned.
    (0..slots)
        .map(move |i| unsafe { *base.add(i) })
        .filter(|&w| w != 0)
}

// ============================================================================
// Phase 3: condemned-arena finalization
// ============================================================================

/// Free all of a condemned arena's handles and the arena struct. Remaining
/// children are orphaned; their creating scopes condemn them individually
/// and a later cycle sweeps them.
///
/// # Safety
/// `arena` must come from this cycle's condemned drain.
unsafe fn finalize_condemned(arena: *mut ArenaInner, report: &mut GcReport) {
    let a = &*arena;

    a.lock_raw();
    let mut child = a.first_child.replace(std::ptr::null_mut());
    while let Some(c) = child.as_ref() {
        c.parent.set(std::ptr::null_mut());
        child = c.next_sibling.replace(std::ptr::null_mut());
    }
    a.unlock_raw();

    let mut bytes = mem::size_of::<ArenaInner>();
    let head = a.with_state(|s| {
        let h = s.handles_head;
        s.handles_head = std::ptr::null_mut();
        h
    });
    let mut cur = head;
    while let Some(hi) = cur.as_ref() {
        let next = hi.next.get();
        bytes += hi.size + mem::size_of::<HandleInner>();
        report.handles_freed += 1;
        report.bytes_freed += hi.size;
        arena::free_handle(Handle::from_inner(NonNull::new_unchecked(cur)));
        cur = next;
    }
    report.arena_bytes_freed += bytes;

    tracing::trace!(
        target: "rill_runtime::gc",
        name = a.debug_name(),
        bytes,
        "condemned arena finalized"
    );
    drop(Box::from_raw(arena));
}

// ============================================================================
// Background GC thread
// ============================================================================

/// Default sleep between background cycles.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_millis(100);
/// Shortest accepted sleep between background cycles.
pub const MIN_GC_INTERVAL: Duration = Duration::from_millis(1);

struct GcThread {
    root: Arena,
    running: Arc<AtomicBool>,
    join: thread::JoinHandle<()>,
}

static GC_THREAD: Mutex<Option<GcThread>> = Mutex::new(None);

/// Start the background GC thread on `root`, cycling every `interval`.
/// Idempotent: a second start while one runs is ignored. A zero interval
/// selects the default; anything shorter than [`MIN_GC_INTERVAL`] is
/// clamped up.
pub fn gc_thread_start(root: Arena, interval: Duration) {
    let mut slot = GC_THREAD.lock();
    if slot.is_some() {
        return;
    }
    let interval = if interval.is_zero() {
        DEFAULT_GC_INTERVAL
    } else {
        interval.max(MIN_GC_INTERVAL)
    };

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let spawned = thread::Builder::new()
        .name("rill-gc".into())
        .spawn(move || {
            while flag.load(Ordering::Acquire) {
                thread::sleep(interval);
                if !flag.load(Ordering::Acquire) {
                    break;
                }
                gc(root);
            }
        });
    match spawned {
        Ok(join) => {
            *slot = Some(GcThread {
                root,
                running,
                join,
            });
        }
        Err(err) => {
            tracing::warn!(target: "rill_runtime::gc", %err, "failed to spawn GC thread");
        }
    }
}

/// Stop the background GC thread: one final cycle drains the condemned
/// queue, then the thread is joined. No-op when none is running.
pub fn gc_thread_stop() {
    let taken = GC_THREAD.lock().take();
    let Some(t) = taken else { return };

    gc(t.root);
    t.running.store(false, Ordering::Release);
    let _ = t.join.join();
}

/// True while the background GC thread is running.
pub fn gc_thread_running() -> bool {
    GC_THREAD.lock().is_some()
}

/// Root the background GC owns, if any. Synchronous destruction of arenas
/// under this root converts to condemnation.
pub(crate) fn gc_thread_root() -> Option<Arena> {
    GC_THREAD.lock().as_ref().map(|t| t.root)
}
