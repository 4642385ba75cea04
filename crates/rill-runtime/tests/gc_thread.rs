//! Background GC thread: periodic sweeps, shutdown drain, destroy
//! conversion. These tests own process-global state and run serially.

use std::time::Duration;

use serial_test::serial;

use rill_runtime::{
    gc_thread_running, gc_thread_start, gc_thread_stop, Arena, ArenaMode,
};

mod common;

#[test]
#[serial]
fn background_gc_condemns_then_sweeps() {
    common::init_tracing();
    let root = Arena::create(None, ArenaMode::Default, Some("bg"));
    gc_thread_start(root, Duration::from_millis(20));
    assert!(gc_thread_running());

    let child = Arena::create(Some(root), ArenaMode::Default, Some("bulk"));
    for _ in 0..100 {
        child.alloc(32).unwrap();
    }
    child.condemn();

    std::thread::sleep(Duration::from_millis(100));
    gc_thread_stop();
    assert!(!gc_thread_running());

    let stats = root.stats();
    assert!(stats.total_arenas_freed >= 1);
    assert_eq!(stats.total_handles_freed, 100);

    root.destroy();
}

#[test]
#[serial]
fn start_is_idempotent_and_stop_drains() {
    let root = Arena::create(None, ArenaMode::Default, Some("idem"));
    gc_thread_start(root, Duration::from_millis(50));
    gc_thread_start(root, Duration::from_millis(5)); // ignored

    let child = Arena::create(Some(root), ArenaMode::Default, None);
    child.alloc(8).unwrap();
    child.condemn();

    // Stop immediately: the final cycle must drain the queue even if the
    // interval never elapsed.
    gc_thread_stop();
    let stats = root.stats();
    assert!(stats.total_arenas_freed >= 1);

    gc_thread_stop(); // no-op
    root.destroy();
}

#[test]
#[serial]
fn destroy_converts_to_condemn_while_gc_owns_the_root() {
    let root = Arena::create(None, ArenaMode::Default, Some("owned"));
    gc_thread_start(root, Duration::from_millis(10));

    let child = Arena::create(Some(root), ArenaMode::Default, Some("converted"));
    child.alloc(16).unwrap();
    // Synchronous destroy is unavailable while the collector owns this
    // root; the call must quietly become a condemnation.
    child.destroy();

    std::thread::sleep(Duration::from_millis(60));
    gc_thread_stop();

    let stats = root.stats();
    assert!(stats.total_arenas_freed >= 1);
    assert_eq!(stats.handles.total, 0);

    root.destroy();
}

#[test]
#[serial]
fn unrelated_roots_still_destroy_synchronously() {
    let gc_root = Arena::create(None, ArenaMode::Default, Some("gc-root"));
    gc_thread_start(gc_root, Duration::from_millis(50));

    // A different tree is not stop-the-world for this collector.
    let other = Arena::create(None, ArenaMode::Default, Some("other"));
    let child = Arena::create(Some(other), ArenaMode::Default, None);
    child.alloc(8).unwrap();
    child.destroy();
    assert!(other.children_snapshot().is_empty());
    other.destroy();

    gc_thread_stop();
    gc_root.destroy();
}

#[test]
#[serial]
fn destroying_the_gc_root_itself_is_refused_while_running() {
    let root = Arena::create(None, ArenaMode::Default, Some("refused"));
    gc_thread_start(root, Duration::from_millis(50));

    root.destroy(); // misuse no-op
    assert!(gc_thread_running());

    gc_thread_stop();
    root.destroy();
}
