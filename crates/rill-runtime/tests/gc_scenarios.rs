//! Collector behavior over handle graphs: mark/sweep, rescue, cascade.

use pretty_assertions::assert_eq;

use rill_runtime::{free, gc, gc_flush, Arena, ArenaMode, Handle};

fn fresh_root(name: &str) -> Arena {
    Arena::create(None, ArenaMode::Default, Some(name))
}

#[test]
fn tiny_alloc_free_cycle() {
    let root = fresh_root("tiny");
    let h = root.alloc(100).unwrap();

    assert_eq!(h.size(), 100);
    assert_eq!(h.owner(), root);
    assert!(h.is_valid());

    free(Some(h));
    let report = gc(root);
    assert_eq!(report.handles_freed, 1);
    assert_eq!(report.bytes_freed, 100);

    root.destroy();
}

#[test]
fn gc_with_nothing_dead_frees_nothing() {
    let root = fresh_root("idle");
    let _a = root.alloc(16).unwrap();
    let _b = root.strdup("still alive").unwrap();

    let report = gc(root);
    assert_eq!(report.handles_freed, 0);
    assert_eq!(report.bytes_freed, 0);
    assert_eq!(root.stats().handles.local, 2);

    root.destroy();
}

#[test]
fn dead_child_is_rescued_by_live_reference() {
    let root = fresh_root("rescue");
    let a = root.calloc(1, 8).unwrap();
    let b = root.calloc(1, 8).unwrap();

    // b holds the only reference to a.
    {
        let mut txn = b.begin();
        txn.set_handle(0, Some(a));
    }
    free(Some(a));

    let report = gc(root);
    assert_eq!(report.handles_freed, 0);
    assert!(a.is_valid(), "rescued handle must be live again");

    // Once b stops referencing a, the next mark sticks.
    {
        let mut txn = b.begin();
        txn.set_handle(0, None);
    }
    free(Some(a));
    let report = gc(root);
    assert_eq!(report.handles_freed, 1);

    root.destroy();
}

#[test]
fn cascade_frees_exclusively_owned_children() {
    let root = fresh_root("cascade");
    let parent = root.calloc(2, 8).unwrap();
    let c1 = root.calloc(1, 8).unwrap();
    let c2 = root.calloc(1, 8).unwrap();

    {
        let mut txn = parent.begin();
        txn.set_handle(0, Some(c1));
        txn.set_handle(1, Some(c2));
    }
    free(Some(parent));

    let report = gc(root);
    assert_eq!(report.handles_freed, 3);
    assert_eq!(report.bytes_freed, 32);
    assert_eq!(root.stats().handles.local, 0);

    root.destroy();
}

#[test]
fn shared_child_survives_cascade() {
    let root = fresh_root("shared-child");
    let parent = root.calloc(2, 8).unwrap();
    let c1 = root.calloc(1, 8).unwrap();
    let c2 = root.calloc(1, 8).unwrap();
    let keeper = root.calloc(1, 8).unwrap();

    {
        let mut txn = parent.begin();
        txn.set_handle(0, Some(c1));
        txn.set_handle(1, Some(c2));
    }
    {
        let mut txn = keeper.begin();
        txn.set_handle(0, Some(c1));
    }
    free(Some(parent));

    let report = gc(root);
    assert_eq!(report.handles_freed, 2, "parent and c2 only");
    assert!(c1.is_valid());
    assert!(keeper.is_valid());

    root.destroy();
}

#[test]
fn cascade_recurses_through_nested_graphs() {
    // outer -> middle -> inner, all exclusively owned.
    let root = fresh_root("nested");
    let inner = root.calloc(1, 8).unwrap();
    let middle = root.calloc(1, 8).unwrap();
    let outer = root.calloc(1, 8).unwrap();

    {
        let mut txn = middle.begin();
        txn.set_handle(0, Some(inner));
    }
    {
        let mut txn = outer.begin();
        txn.set_handle(0, Some(middle));
    }
    free(Some(outer));

    let report = gc(root);
    assert_eq!(report.handles_freed, 3);

    root.destroy();
}

#[test]
fn sibling_reference_between_dead_graphs_does_not_leak_live_data() {
    // Two dead parents sharing one live child: the child has a live
    // reference from neither, so it cascades exactly once.
    let root = fresh_root("two-parents");
    let shared = root.calloc(1, 8).unwrap();
    let p1 = root.calloc(1, 8).unwrap();
    let p2 = root.calloc(1, 8).unwrap();

    {
        let mut txn = p1.begin();
        txn.set_handle(0, Some(shared));
    }
    {
        let mut txn = p2.begin();
        txn.set_handle(0, Some(shared));
    }
    free(Some(p1));
    free(Some(p2));

    let report = gc(root);
    assert_eq!(report.handles_freed, 3);
    assert_eq!(root.stats().handles.local, 0);

    root.destroy();
}

#[test]
fn unique_data_pointers_across_live_handles() {
    let root = fresh_root("unique");
    let handles: Vec<Handle> = (0..64).map(|_| root.alloc(24).unwrap()).collect();

    let mut seen = std::collections::HashSet::new();
    for h in &handles {
        let txn = h.begin();
        assert!(seen.insert(txn.bytes().as_ptr() as usize));
    }

    root.destroy();
}

#[test]
fn clone_twice_is_bytewise_identity_for_plain_data() {
    let root = fresh_root("p7");
    let h = root.alloc(32).unwrap();
    {
        let mut txn = h.begin();
        for (i, b) in txn.bytes_mut().iter_mut().enumerate() {
            *b = i as u8;
        }
    }

    let once = root.clone_handle(h).unwrap();
    let twice = root.clone_handle(once).unwrap();
    assert_eq!(h.begin().bytes(), twice.begin().bytes());

    root.destroy();
}

#[test]
fn gc_flush_drains_chained_garbage() {
    let root = fresh_root("flush");
    for _ in 0..10 {
        let h = root.alloc(8).unwrap();
        free(Some(h));
    }

    gc_flush(root);
    let stats = root.stats();
    assert_eq!(stats.handles.local, 0);
    assert_eq!(stats.dead_handles, 0);

    root.destroy();
}

#[test]
fn dead_handles_in_child_arenas_are_collected_from_the_root() {
    let root = fresh_root("tree");
    let child = Arena::create(Some(root), ArenaMode::Default, Some("leaf"));
    let grandchild = Arena::create(Some(child), ArenaMode::Default, None);

    let h1 = child.alloc(10).unwrap();
    let h2 = grandchild.alloc(20).unwrap();
    free(Some(h1));
    free(Some(h2));

    let report = gc(root);
    assert_eq!(report.handles_freed, 2);
    assert_eq!(report.bytes_freed, 30);

    root.destroy();
}

#[test]
fn rescue_does_not_resurrect_across_cycles() {
    // Monotone mortality: once collected, a fresh mark on a new handle is a
    // new lifetime; the freed one never comes back.
    let root = fresh_root("monotone");
    let a = root.calloc(1, 8).unwrap();
    free(Some(a));
    assert_eq!(gc(root).handles_freed, 1);

    let b = root.calloc(1, 8).unwrap();
    assert!(b.is_valid());
    free(Some(b));
    assert_eq!(gc(root).handles_freed, 1);

    root.destroy();
}
