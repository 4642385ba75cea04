//! Arena observability: on-demand snapshots and per-cycle GC records.
//!
//! Stats are recomputed when asked for, walking the arena's handle list and
//! children; the GC only updates the small per-arena record of its last
//! cycle. Nothing here is on any hot path.

use std::fmt;
use std::ptr::NonNull;

use crate::arena::Arena;
use crate::gc::GcReport;
use crate::handle::Handle;

/// Counters the GC maintains per arena, kept across snapshot recomputes.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GcRecord {
    pub(crate) gc_runs: usize,
    pub(crate) last_handles_freed: usize,
    pub(crate) last_bytes_freed: usize,
    pub(crate) total_handles_freed: usize,
    pub(crate) total_bytes_freed: usize,
    pub(crate) total_arenas_freed: usize,
}

/// A count with local/children/total breakdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metric {
    /// This arena only.
    pub local: usize,
    /// Sum over child arenas, recursive.
    pub children: usize,
    /// `local + children`.
    pub total: usize,
}

/// Snapshot of one arena's memory behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArenaStats {
    /// Live handle counts.
    pub handles: Metric,
    /// Live byte counts.
    pub bytes: Metric,
    /// Dead handles awaiting collection (local).
    pub dead_handles: usize,
    /// Bytes held by dead handles (local).
    pub dead_bytes: usize,
    /// GC cycles recorded on this arena.
    pub gc_runs: usize,
    /// Handles freed by the last recorded cycle.
    pub last_handles_freed: usize,
    /// Bytes freed by the last recorded cycle.
    pub last_bytes_freed: usize,
    /// Handles freed across all recorded cycles.
    pub total_handles_freed: usize,
    /// Bytes freed across all recorded cycles.
    pub total_bytes_freed: usize,
    /// Condemned arenas finalized across all recorded cycles.
    pub total_arenas_freed: usize,
    /// Wasted-space ratio. Always 0.0: storage is per-allocation, no bump
    /// space is tracked.
    pub fragmentation: f64,
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  Handles:       {} live ({} local, {} children), {} dead",
            self.handles.total, self.handles.local, self.handles.children, self.dead_handles
        )?;
        writeln!(
            f,
            "  Bytes:         {} live ({} local, {} children), {} dead",
            self.bytes.total, self.bytes.local, self.bytes.children, self.dead_bytes
        )?;
        writeln!(
            f,
            "  GC:            {} runs, last freed {} handles / {} bytes",
            self.gc_runs, self.last_handles_freed, self.last_bytes_freed
        )?;
        writeln!(
            f,
            "  GC totals:     {} handles / {} bytes, {} arenas",
            self.total_handles_freed, self.total_bytes_freed, self.total_arenas_freed
        )?;
        write!(f, "  Fragmentation: {:.1}%", self.fragmentation * 100.0)
    }
}

/// Live/dead handle and byte counts of one arena's own list.
fn local_counts(arena: Arena) -> (usize, usize, usize, usize) {
    arena.inner().with_state(|s| {
        let mut live = 0usize;
        let mut live_bytes = 0usize;
        let mut dead = 0usize;
        let mut dead_bytes = 0usize;
        let mut cur = s.handles_head;
        // SAFETY: list nodes are live handle structs under this arena's lock.
        while let Some(hi) = unsafe { cur.as_ref() } {
            let h = Handle::from_inner(NonNull::from(hi));
            if h.is_valid() {
                live += 1;
                live_bytes += hi.size;
            } else {
                dead += 1;
                dead_bytes += hi.size;
            }
            cur = hi.next.get();
        }
        (live, live_bytes, dead, dead_bytes)
    })
}

impl Arena {
    /// Recompute and return this arena's stats, children included.
    pub fn stats(&self) -> ArenaStats {
        let (live, live_bytes, dead, dead_bytes) = local_counts(*self);

        let mut child_handles = 0usize;
        let mut child_bytes = 0usize;
        for child in self.children_snapshot() {
            let cs = child.stats();
            child_handles += cs.handles.total;
            child_bytes += cs.bytes.total;
        }

        let record = self.inner().with_state(|s| s.gc_record);
        ArenaStats {
            handles: Metric {
                local: live,
                children: child_handles,
                total: live + child_handles,
            },
            bytes: Metric {
                local: live_bytes,
                children: child_bytes,
                total: live_bytes + child_bytes,
            },
            dead_handles: dead,
            dead_bytes,
            gc_runs: record.gc_runs,
            last_handles_freed: record.last_handles_freed,
            last_bytes_freed: record.last_bytes_freed,
            total_handles_freed: record.total_handles_freed,
            total_bytes_freed: record.total_bytes_freed,
            total_arenas_freed: record.total_arenas_freed,
            fragmentation: 0.0,
        }
    }

    /// Print a human-readable summary to stderr.
    pub fn print_stats(&self) {
        let stats = self.stats();
        eprintln!("Arena '{}' stats:", self.inner().debug_name());
        eprintln!("{}", stats);
    }

    /// Print a per-handle breakdown of this arena to stderr.
    pub fn print_snapshot(&self) {
        eprintln!("=== Arena Snapshot: '{}' ===", self.inner().debug_name());
        let (live, live_bytes, dead, dead_bytes) = local_counts(*self);
        eprintln!(
            "  {} live handles ({} bytes), {} dead handles ({} bytes)",
            live, live_bytes, dead, dead_bytes
        );
        for child in self.children_snapshot() {
            child.print_snapshot();
        }
    }
}

/// Record a completed cycle on the collected root: bump counters and, when
/// the per-arena flag asks for it, emit the one-line report.
pub(crate) fn record_gc(root: Arena, report: &GcReport) {
    root.inner().with_state(|s| {
        s.gc_record.gc_runs += 1;
        s.gc_record.last_handles_freed = report.handles_freed;
        s.gc_record.last_bytes_freed = report.bytes_freed;
        s.gc_record.total_handles_freed += report.handles_freed;
        s.gc_record.total_bytes_freed += report.bytes_freed;
        s.gc_record.total_arenas_freed += report.arenas_freed;
    });

    tracing::debug!(
        target: "rill_runtime::gc",
        arena = root.inner().debug_name(),
        handles_freed = report.handles_freed,
        bytes_freed = report.bytes_freed,
        arenas_freed = report.arenas_freed,
        arena_bytes_freed = report.arena_bytes_freed,
        "gc cycle"
    );

    if root.inner().gc_log.load(std::sync::atomic::Ordering::Relaxed) {
        let stats = root.stats();
        eprintln!(
            "[GC] arena={} handles={}/{} bytes={}/{} freed={}/{} arenas={}",
            root.inner().debug_name(),
            stats.handles.local,
            stats.handles.total,
            stats.bytes.local,
            stats.bytes.total,
            report.handles_freed,
            report.bytes_freed,
            report.arenas_freed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaMode;
    use crate::gc::gc;
    use crate::handle::free;

    #[test]
    fn stats_count_live_and_dead() {
        let root = Arena::create(None, ArenaMode::Default, Some("stats"));
        let child = Arena::create(Some(root), ArenaMode::Default, None);
        let _a = root.alloc(10).unwrap();
        let b = root.alloc(20).unwrap();
        let _c = child.alloc(40).unwrap();
        free(Some(b));

        let stats = root.stats();
        assert_eq!(stats.handles.local, 1);
        assert_eq!(stats.handles.children, 1);
        assert_eq!(stats.handles.total, 2);
        assert_eq!(stats.bytes.local, 10);
        assert_eq!(stats.bytes.children, 40);
        assert_eq!(stats.dead_handles, 1);
        assert_eq!(stats.dead_bytes, 20);
        assert_eq!(stats.fragmentation, 0.0);

        root.destroy();
    }

    #[test]
    fn gc_updates_record() {
        let root = Arena::create(None, ArenaMode::Default, None);
        let h = root.alloc(64).unwrap();
        free(Some(h));

        let runs_before = root.stats().gc_runs;
        gc(root);
        let stats = root.stats();
        assert_eq!(stats.gc_runs, runs_before + 1);
        assert_eq!(stats.last_handles_freed, 1);
        assert_eq!(stats.last_bytes_freed, 64);
        assert!(stats.total_handles_freed >= 1);

        root.destroy();
    }
}
