//! Thread lifecycle tied to arena lifecycle.
//!
//! A thread record lives inside a handle allocated in the *caller's* arena.
//! Generated code drives the four-step lifecycle: `thread_create`,
//! `thread_start` with a wrapper function, `thread_sync` (or
//! `thread_dispose` for fire-and-forget). The wrapper runs on the worker,
//! unpacks its argument struct, calls the user function against the thread's
//! arena, stores the result via [`thread_set_result`] and signals done.
//!
//! Arena wiring per mode: DEFAULT gets a fresh child arena under the caller
//! and promotes its result on sync; SHARED reuses the caller's arena;
//! PRIVATE gets an isolated root arena and may only return primitives (the
//! type system enforces that; the runtime just clones what it gets).
//!
//! Panics in user code are captured at the wrapper boundary and re-raised in
//! the caller at sync time.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr;
use std::thread::{Builder, JoinHandle};

use parking_lot::{Condvar, Mutex};
use strum_macros::{Display, IntoStaticStr};

use rill_error::Result;

use crate::arena::{Arena, ArenaMode};
use crate::handle::Handle;
use crate::tid;

/// Entry point generated code hands to [`thread_start`]. Receives the thread
/// record's handle.
pub type ThreadWrapper = fn(thread: Handle);

/// How a thread's allocations relate to its spawner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ThreadMode {
    /// Own arena (child of the caller); the result is promoted on sync.
    Default,
    /// Use the caller's arena directly.
    Shared,
    /// Isolated arena; only primitives or void cross back.
    Private,
}

/// Mutable thread state, guarded by the record's own mutex (never by an
/// arena lock: sync must be able to wait while the worker signals).
struct ThreadState {
    done: bool,
    disposed: bool,
    args: Option<Handle>,
    result: Option<Handle>,
    panic_msg: Option<String>,
    join: Option<JoinHandle<()>>,
}

/// The record stored inside the thread handle's data. Fields other than
/// `state` are fixed once `thread_create` returns (a promotion rewrites them
/// wholesale in the copy callback).
struct ThreadRecord {
    thread_id: u64,
    mode: ThreadMode,
    caller: Arena,
    arena: Option<Arena>,
    state: Mutex<ThreadState>,
    cond: Condvar,
}

thread_local! {
    static CURRENT_THREAD: Cell<Option<Handle>> = const { Cell::new(None) };
}

/// The calling worker's thread handle, if this thread was started by the
/// runtime.
pub fn thread_current() -> Option<Handle> {
    CURRENT_THREAD.with(|c| c.get())
}

/// View a thread handle's data as its record.
///
/// # Safety
/// `handle` must come from [`thread_create`] and must not have been freed by
/// the collector.
unsafe fn record<'a>(handle: &'a Handle) -> &'a ThreadRecord {
    &*(handle.inner().ptr as *const ThreadRecord)
}

fn thread_arena_for(mode: ThreadMode, caller: Arena) -> Option<Arena> {
    match mode {
        ThreadMode::Shared => None,
        ThreadMode::Default => Some(Arena::create(
            Some(caller),
            ArenaMode::Default,
            Some("thread"),
        )),
        ThreadMode::Private => Some(Arena::create(None, ArenaMode::Private, Some("thread_private"))),
    }
}

/// Deep-copy hook for promoted thread records: fresh primitives, fresh
/// thread id, fresh arena wiring, and the args/result handles promoted
/// along.
fn thread_copy_callback(dest: Arena, cloned: Handle) {
    let txn = cloned.begin();
    // SAFETY: `cloned` is a byte copy of a thread record; reads below only
    // touch plain fields and the copied state behind its (unlocked) mutex,
    // and every non-plain field is overwritten via `ptr::write` without
    // dropping the aliased copy.
    unsafe {
        let rec = txn.handle().inner().ptr as *mut ThreadRecord;
        let (args, result, panic_msg) = {
            let st = &*(*rec).state.data_ptr();
            (st.args, st.result, st.panic_msg.clone())
        };

        (*rec).thread_id = tid::allocate_thread_id();
        (*rec).caller = dest;
        (*rec).arena = thread_arena_for((*rec).mode, dest);

        let target = (*rec).arena.unwrap_or(dest);
        let args = args.and_then(|h| target.promote(h).ok());
        let result = result.and_then(|h| target.promote(h).ok());

        ptr::write(
            &mut (*rec).state,
            Mutex::new(ThreadState {
                done: false,
                disposed: false,
                args,
                result,
                panic_msg,
                join: None,
            }),
        );
        ptr::write(&mut (*rec).cond, Condvar::new());
    }
    drop(txn);
}

fn thread_free_callback(handle: Handle) {
    thread_dispose(handle);
}

/// Allocate a thread record in the caller's arena and wire its arena per
/// `mode`.
pub fn thread_create(caller: Arena, mode: ThreadMode) -> Result<Handle> {
    let handle = caller
        .alloc(std::mem::size_of::<ThreadRecord>())
        .map_err(|e| e.with_operation("thread::create"))?;

    let arena = thread_arena_for(mode, caller);
    let txn = handle.begin();
    // SAFETY: freshly allocated, correctly sized and host-aligned storage;
    // written exactly once before any read.
    unsafe {
        ptr::write(
            txn.handle().inner().ptr as *mut ThreadRecord,
            ThreadRecord {
                thread_id: tid::allocate_thread_id(),
                mode,
                caller,
                arena,
                state: Mutex::new(ThreadState {
                    done: false,
                    disposed: false,
                    args: None,
                    result: None,
                    panic_msg: None,
                    join: None,
                }),
                cond: Condvar::new(),
            },
        );
    }
    drop(txn);

    handle.set_copy_callback(Some(thread_copy_callback));
    handle.set_free_callback(Some(thread_free_callback));
    Ok(handle)
}

/// Start the worker. The wrapper receives the thread handle, not the record.
pub fn thread_start(thread: Handle, wrapper: ThreadWrapper) {
    // SAFETY: `thread` comes from `thread_create` per the API contract.
    let rec = unsafe { record(&thread) };
    let worker_id = rec.thread_id;

    let spawned = Builder::new()
        .name(format!("rill-worker-{worker_id}"))
        .spawn(move || {
            // SAFETY: the record outlives the worker; sync/dispose wait for
            // `done` before tearing anything down.
            let rec = unsafe { record(&thread) };
            tid::set_current_thread_id(rec.thread_id);
            CURRENT_THREAD.with(|c| c.set(Some(thread)));

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| wrapper(thread)));
            if let Err(payload) = outcome {
                let msg = panic_message(payload);
                let mut st = rec.state.lock();
                if st.panic_msg.is_none() {
                    st.panic_msg = Some(msg);
                }
            }

            rec.state.lock().done = true;
            rec.cond.notify_all();
            CURRENT_THREAD.with(|c| c.set(None));
        });

    match spawned {
        Ok(join) => {
            rec.state.lock().join = Some(join);
        }
        Err(err) => {
            tracing::warn!(target: "rill_runtime::thread", %err, "failed to spawn worker");
            thread_dispose(thread);
        }
    }
}

/// Wait for the worker, promote its result into the caller's arena, condemn
/// the thread's arena and dispose the record. Re-raises a captured panic in
/// the caller. A second sync on the same thread is a misuse no-op.
pub fn thread_sync(thread: Handle) -> Option<Handle> {
    // SAFETY: API contract as in `thread_start`.
    let rec = unsafe { record(&thread) };

    let (join, panic_msg, result) = {
        let mut st = rec.state.lock();
        if st.disposed {
            tracing::warn!(
                target: "rill_runtime::thread",
                "sync on a disposed thread; ignored"
            );
            return None;
        }
        while !st.done {
            rec.cond.wait(&mut st);
        }
        (st.join.take(), st.panic_msg.take(), st.result.take())
    };

    if let Some(join) = join {
        let _ = join.join();
    }

    let promoted = result.and_then(|r| {
        if rec.mode == ThreadMode::Shared {
            Some(r)
        } else {
            match rec.caller.promote(r) {
                Ok(p) => Some(p),
                Err(err) => {
                    tracing::warn!(
                        target: "rill_runtime::thread",
                        %err,
                        "result promotion failed"
                    );
                    None
                }
            }
        }
    });

    thread_dispose(thread);

    if let Some(msg) = panic_msg {
        // Re-raise in the caller: the runtime's panic surface is one line to
        // stderr and a non-zero exit.
        eprintln!("panic: {msg}");
        process::exit(1);
    }

    promoted
}

/// Sync a batch of void-returning threads.
pub fn thread_sync_all(threads: &[Handle]) {
    for &t in threads {
        thread_sync(t);
    }
}

/// Fire-and-forget cleanup: signal done, condemn the thread's arena, mark
/// the record handle dead. Idempotent under the record's disposed latch.
pub fn thread_dispose(thread: Handle) {
    // SAFETY: API contract as in `thread_start`.
    let rec = unsafe { record(&thread) };

    let join = {
        let mut st = rec.state.lock();
        if st.disposed {
            return;
        }
        st.disposed = true;
        st.done = true;
        st.args = None;
        st.result = None;
        st.panic_msg = None;
        st.join.take()
    };
    rec.cond.notify_all();

    if let Some(join) = join {
        if join.thread().id() == std::thread::current().id() {
            // Self-dispose from the worker's own wrapper: dropping the join
            // handle detaches; joining ourselves would deadlock.
            drop(join);
        } else {
            // The record must not be touched by the worker once the caller
            // may tear the owning arena down.
            let _ = join.join();
        }
    }

    if let Some(arena) = rec.arena {
        match rec.mode {
            // Private arenas are their own roots; no collector ever drains
            // them, so dispose tears them down directly.
            ThreadMode::Private => arena.destroy(),
            _ => arena.condemn(),
        }
    }

    thread.mark_dead();
}

/// The arena the worker should allocate into: its own, or the caller's for
/// SHARED threads.
pub fn thread_arena(thread: Handle) -> Arena {
    // SAFETY: API contract as in `thread_start`.
    let rec = unsafe { record(&thread) };
    rec.arena.unwrap_or(rec.caller)
}

/// Store the packed-argument handle. Called by generated code before start.
pub fn thread_set_args(thread: Handle, args: Option<Handle>) {
    // SAFETY: API contract as in `thread_start`.
    let rec = unsafe { record(&thread) };
    rec.state.lock().args = args;
}

/// The packed-argument handle, read by the wrapper on the worker.
pub fn thread_args(thread: Handle) -> Option<Handle> {
    // SAFETY: API contract as in `thread_start`.
    let rec = unsafe { record(&thread) };
    rec.state.lock().args
}

/// Store the worker's result handle.
pub fn thread_set_result(thread: Handle, result: Option<Handle>) {
    // SAFETY: API contract as in `thread_start`.
    let rec = unsafe { record(&thread) };
    rec.state.lock().result = result;
}

/// Signal completion: sets the done flag and wakes any syncer.
pub fn thread_signal_done(thread: Handle) {
    // SAFETY: API contract as in `thread_start`.
    let rec = unsafe { record(&thread) };
    rec.state.lock().done = true;
    rec.cond.notify_all();
}

/// Raise a runtime panic.
///
/// Inside a runtime-started worker the message is captured on the thread
/// record and re-raised when the spawner syncs. Outside one, the message
/// goes to stderr and the process exits with status 1.
pub fn runtime_panic(msg: &str) -> ! {
    if thread_current().is_some() {
        panic::panic_any(RuntimePanic(msg.to_owned()));
    }
    eprintln!("panic: {msg}");
    process::exit(1);
}

/// Payload type [`runtime_panic`] unwinds with inside a worker.
struct RuntimePanic(String);

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(rt) = payload.downcast_ref::<RuntimePanic>() {
        return rt.0.clone();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    "(no message)".to_string()
}

/// Convert an error into a runtime panic, the way generated code reacts to
/// a refused allocation.
pub fn panic_on_error<T>(result: Result<T>) -> T {
    match result {
        Ok(v) => v,
        Err(err) => runtime_panic(&err.to_string()),
    }
}
