//! Malloc redirection windows: foreign alloc/realloc/free against an arena.

use pretty_assertions::assert_eq;

use rill_runtime::hooks::{hooked_free, hooked_malloc, hooked_realloc};
use rill_runtime::{gc, redirect_current, redirect_pop, redirect_push, Arena, ArenaMode};

#[test]
fn malloc_write_realloc_free_round_trip() {
    let arena = Arena::create(None, ArenaMode::Default, Some("window"));

    redirect_push(arena);
    assert_eq!(redirect_current(), Some(arena));

    let p = hooked_malloc(64);
    assert!(!p.is_null());
    // Foreign code writes a recognizable pattern.
    for i in 0..64 {
        unsafe { *p.add(i) = (i as u8) ^ 0x5A };
    }

    let q = unsafe { hooked_realloc(p, 256) };
    assert!(!q.is_null());
    for i in 0..64 {
        assert_eq!(unsafe { *q.add(i) }, (i as u8) ^ 0x5A);
    }

    unsafe { hooked_free(q) };
    redirect_pop();
    assert_eq!(redirect_current(), None);

    gc(arena);
    let stats = arena.stats();
    assert_eq!(stats.handles.local, 0, "allocation count back to zero");
    assert_eq!(stats.dead_handles, 0, "no bytes leaked");

    arena.destroy();
}

#[test]
fn realloc_null_and_zero_follow_malloc_free_equivalences() {
    let arena = Arena::create(None, ArenaMode::Default, None);

    redirect_push(arena);
    // realloc(NULL, n) == malloc(n)
    let p = unsafe { hooked_realloc(std::ptr::null_mut(), 32) };
    assert!(!p.is_null());
    assert_eq!(arena.stats().handles.local, 1);

    // realloc(p, 0) == free(p)
    let q = unsafe { hooked_realloc(p, 0) };
    assert!(q.is_null());
    redirect_pop();

    gc(arena);
    assert_eq!(arena.stats().handles.local, 0);

    arena.destroy();
}

#[test]
fn thread_exit_marks_unfreed_redirected_allocations_dead() {
    let arena = Arena::create(None, ArenaMode::Default, Some("leaky-thread"));

    let worker_arena = arena;
    std::thread::spawn(move || {
        redirect_push(worker_arena);
        let p = hooked_malloc(48);
        assert!(!p.is_null());
        // Exit without free and without pop: the thread destructor sweeps.
    })
    .join()
    .unwrap();

    let report = gc(arena);
    assert_eq!(report.handles_freed, 1);
    assert_eq!(report.bytes_freed, 48);

    arena.destroy();
}

#[test]
fn redirects_are_not_inherited_by_spawned_threads() {
    let arena = Arena::create(None, ArenaMode::Default, None);

    redirect_push(arena);
    let child_saw = std::thread::spawn(redirect_current).join().unwrap();
    redirect_pop();

    assert_eq!(child_saw, None);
    arena.destroy();
}

#[test]
fn nested_windows_restore_the_outer_arena() {
    let outer = Arena::create(None, ArenaMode::Default, Some("outer"));
    let inner = Arena::create(Some(outer), ArenaMode::Default, Some("inner"));

    redirect_push(outer);
    redirect_push(inner);
    let p = hooked_malloc(16);
    assert_eq!(inner.stats().handles.local, 1);
    redirect_pop();

    let q = hooked_malloc(16);
    assert_eq!(outer.stats().handles.local, 1);

    // Both frees resolve through the window's pointer map while the handler
    // is still installed.
    unsafe {
        hooked_free(p);
        hooked_free(q);
    }
    redirect_pop();

    gc(outer);
    assert_eq!(outer.stats().handles.total, 0);
    outer.destroy();
}
