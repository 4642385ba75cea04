//! Hierarchical arenas: regions with parent/child lifetime and a handle list.
//!
//! Generated code creates an arena per source-level scope, allocates handles
//! into it, and drops the scope either by condemning the arena (deferred to
//! the next GC cycle) or destroying it synchronously when no background GC
//! owns the tree. Every arena knows its root; condemned arenas are pushed
//! onto the root's lock-free LIFO and drained once per cycle.
//!
//! Lock discipline for the tree links: an arena's own lock guards its
//! `parent` pointer, its `first_child` head and its handle list; a child's
//! `next_sibling` link is guarded by the *parent's* lock, because the sibling
//! chain is the parent's list. Destruction paths own their subtree
//! exclusively (synchronous destroy runs only without a background GC; GC
//! finalization owns condemned arenas outright) and may walk links freely.

use std::cell::{Cell, RefCell};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, Ordering};

use smallvec::SmallVec;
use strum_macros::{Display, IntoStaticStr};

use rill_error::{Error, Result};

use crate::gc;
use crate::handle::{self, Handle, HandleInner, FLAG_EXTERN};
use crate::stats::GcRecord;

/// Re-entrant per-arena lock: transactions, the allocator and the collector
/// all serialize on it, and a thread may nest acquisitions freely.
type ArenaLock =
    parking_lot::lock_api::RawReentrantMutex<parking_lot::RawMutex, parking_lot::RawThreadId>;

pub(crate) const ARENA_DEAD: u16 = 1 << 0;

/// Cleanup callbacks with priority `HIGH` run before `NORMAL`, which run
/// before `LOW`. Lower value fires first.
pub const CLEANUP_PRIORITY_HIGH: i32 = 0;
pub const CLEANUP_PRIORITY_NORMAL: i32 = 100;
pub const CLEANUP_PRIORITY_LOW: i32 = 200;

/// Before-destroy hook registered on an arena. Receives the subject handle
/// the registration named, if any.
pub type CleanupCallback = fn(subject: Option<Handle>);

/// How an arena relates to the scope that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ArenaMode {
    /// Own arena; values escape by promotion into the caller.
    Default,
    /// Reuse the caller's arena.
    Shared,
    /// Isolated arena, destroyed on exit; only primitives may escape.
    Private,
}

pub(crate) struct CleanupEntry {
    pub(crate) subject: Option<Handle>,
    pub(crate) callback: CleanupCallback,
    pub(crate) priority: i32,
}

/// Arena state guarded by the arena's own lock.
pub(crate) struct ArenaState {
    pub(crate) handles_head: *mut HandleInner,
    pub(crate) cleanups: SmallVec<[CleanupEntry; 4]>,
    pub(crate) gc_record: GcRecord,
}

pub(crate) struct ArenaInner {
    pub(crate) name: Option<String>,
    pub(crate) mode: ArenaMode,
    lock: ArenaLock,
    /// Guarded by `lock`; borrows are kept short so re-entrant callers can
    /// take fresh ones.
    state: RefCell<ArenaState>,
    // Tree links. See the module docs for the lock discipline.
    pub(crate) parent: Cell<*mut ArenaInner>,
    pub(crate) first_child: Cell<*mut ArenaInner>,
    pub(crate) next_sibling: Cell<*mut ArenaInner>,
    pub(crate) flags: AtomicU16,
    /// True while a GC cycle owns this tree. Only mutated under `lock`.
    pub(crate) gc_running: Cell<bool>,
    pub(crate) gc_log: AtomicBool,
    /// Nearest ancestor with no parent. Fixed at creation; equals self for
    /// roots.
    pub(crate) root: Cell<*mut ArenaInner>,
    /// Condemned LIFO head. Only meaningful on root arenas.
    pub(crate) condemned_head: AtomicPtr<ArenaInner>,
    pub(crate) condemned_next: AtomicPtr<ArenaInner>,
}

// SAFETY: all state behind the pointer is guarded by the arena lock
// discipline above or is atomic; arenas are shared across threads by design.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

impl ArenaInner {
    #[inline]
    pub(crate) fn lock_raw(&self) {
        self.lock.lock();
    }

    /// # Safety
    /// The current thread must hold the lock via a prior `lock_raw`.
    #[inline]
    pub(crate) unsafe fn unlock_raw(&self) {
        self.lock.unlock();
    }

    /// Run `f` on the arena state with the lock held. The `RefCell` borrow
    /// ends before the lock is released, and `f` must not re-enter
    /// `with_state` on the same arena.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ArenaState) -> R) -> R {
        self.lock_raw();
        let r = {
            let mut state = self.state.borrow_mut();
            f(&mut state)
        };
        // SAFETY: locked two lines up.
        unsafe { self.unlock_raw() };
        r
    }

    pub(crate) fn is_condemned(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ARENA_DEAD != 0
    }

    pub(crate) fn debug_name(&self) -> &str {
        self.name.as_deref().unwrap_or("(unnamed)")
    }

    /// Detach and return the whole child list. Caller must hold the lock or
    /// own the arena exclusively.
    fn take_children(&self) -> Vec<*mut ArenaInner> {
        let mut out = Vec::new();
        let mut child = self.first_child.replace(ptr::null_mut());
        // SAFETY: child chain links are non-null until the chain ends and
        // point at live arenas while the parent holds them.
        while let Some(c) = unsafe { child.as_ref() } {
            out.push(child);
            child = c.next_sibling.replace(ptr::null_mut());
        }
        out
    }
}

/// A region that owns a set of handles, with a parent/child lifetime.
///
/// `Arena` is a plain copyable reference. Lifetimes are explicit: generated
/// code condemns or destroys each arena exactly once when its scope ends.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Arena {
    inner: NonNull<ArenaInner>,
}

// SAFETY: see `ArenaInner`.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.inner().debug_name())
            .field("mode", &self.inner().mode)
            .finish()
    }
}

thread_local! {
    static CURRENT_ARENA: Cell<Option<Arena>> = const { Cell::new(None) };
}

impl Arena {
    /// Create an arena. With a parent, the new arena links into the parent's
    /// child list, inherits its root and its GC-log flag; without one it
    /// starts a new root tree.
    pub fn create(parent: Option<Arena>, mode: ArenaMode, name: Option<&str>) -> Arena {
        let inner = Box::into_raw(Box::new(ArenaInner {
            name: name.map(str::to_owned),
            mode,
            lock: ArenaLock::INIT,
            state: RefCell::new(ArenaState {
                handles_head: ptr::null_mut(),
                cleanups: SmallVec::new(),
                gc_record: GcRecord::default(),
            }),
            parent: Cell::new(parent.map_or(ptr::null_mut(), |p| p.raw())),
            first_child: Cell::new(ptr::null_mut()),
            next_sibling: Cell::new(ptr::null_mut()),
            flags: AtomicU16::new(0),
            gc_running: Cell::new(false),
            gc_log: AtomicBool::new(false),
            root: Cell::new(ptr::null_mut()),
            condemned_head: AtomicPtr::new(ptr::null_mut()),
            condemned_next: AtomicPtr::new(ptr::null_mut()),
        }));

        // SAFETY: freshly boxed, nothing shares it yet.
        let arena = unsafe { Arena::from_raw(inner) };
        match parent {
            Some(p) => {
                arena.inner().root.set(p.inner().root.get());
                let log = p.inner().gc_log.load(Ordering::Relaxed);
                arena.inner().gc_log.store(log, Ordering::Relaxed);
                tracing::trace!(
                    target: "rill_runtime::arena",
                    name = arena.inner().debug_name(),
                    parent = p.inner().debug_name(),
                    %mode,
                    "arena created"
                );
                // Link at the head of the parent's child list.
                p.inner().lock_raw();
                arena.inner().next_sibling.set(p.inner().first_child.get());
                p.inner().first_child.set(inner);
                // SAFETY: locked three lines up.
                unsafe { p.inner().unlock_raw() };
            }
            None => arena.inner().root.set(inner),
        }
        arena
    }

    /// # Safety
    /// `raw` must point at a live `ArenaInner`.
    pub(crate) unsafe fn from_raw(raw: *mut ArenaInner) -> Arena {
        Arena {
            inner: NonNull::new_unchecked(raw),
        }
    }

    #[inline]
    pub(crate) fn raw(&self) -> *mut ArenaInner {
        self.inner.as_ptr()
    }

    #[inline]
    pub(crate) fn inner(&self) -> &ArenaInner {
        // SAFETY: arena structs stay alive until destroyed/finalized, at
        // which point no live `Arena` copy may be used per the crate
        // contract.
        unsafe { self.inner.as_ref() }
    }

    /// Optional debug name given at creation.
    pub fn name(&self) -> Option<&str> {
        self.inner().name.as_deref()
    }

    /// The arena's mode.
    pub fn mode(&self) -> ArenaMode {
        self.inner().mode
    }

    /// The root of this arena's tree (self for roots). Fixed at creation.
    pub fn root(&self) -> Arena {
        // SAFETY: `root` is set at creation and the root outlives its tree.
        unsafe { Arena::from_raw(self.inner().root.get()) }
    }

    /// Current parent, if any. Condemned and reparented arenas change
    /// parents; roots never have one.
    pub fn parent(&self) -> Option<Arena> {
        let inner = self.inner();
        inner.lock_raw();
        let p = inner.parent.get();
        // SAFETY: locked above.
        unsafe { inner.unlock_raw() };
        NonNull::new(p).map(|nn| Arena { inner: nn })
    }

    /// The calling thread's current arena, used by generated code between
    /// calls.
    pub fn current() -> Option<Arena> {
        CURRENT_ARENA.with(|c| c.get())
    }

    /// Install the calling thread's current arena.
    pub fn set_current(arena: Option<Arena>) {
        CURRENT_ARENA.with(|c| c.set(arena));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Flag the arena dead and push it onto its root's condemned LIFO. The
    /// next GC cycle (or a synchronous destroy at shutdown) reclaims it.
    /// Safe from any thread; idempotent.
    pub fn condemn(&self) {
        let inner = self.inner();
        if inner.flags.fetch_or(ARENA_DEAD, Ordering::AcqRel) & ARENA_DEAD != 0 {
            return;
        }
        if inner.gc_log.load(Ordering::Relaxed) {
            tracing::debug!(
                target: "rill_runtime::arena",
                name = inner.debug_name(),
                "arena condemned"
            );
        }

        // Detach from the tree so the collector's live walk no longer sees
        // this arena. Children keep their parent pointer until Phase 3
        // orphans them.
        inner.lock_raw();
        let parent = inner.parent.replace(ptr::null_mut());
        // SAFETY: locked above.
        unsafe { inner.unlock_raw() };
        if let Some(p) = unsafe { parent.as_ref() } {
            p.lock_raw();
            unlink_child(p, self.raw());
            // SAFETY: locked above.
            unsafe { p.unlock_raw() };
        }

        // LIFO push onto the root's condemned list.
        // SAFETY: the root outlives every arena of its tree.
        let root = unsafe { &*inner.root.get() };
        let mut head = root.condemned_head.load(Ordering::Acquire);
        loop {
            inner.condemned_next.store(head, Ordering::Relaxed);
            match root.condemned_head.compare_exchange_weak(
                head,
                self.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Synchronously destroy the arena, its children, and every handle.
    ///
    /// While a background GC owns this root, destruction is converted into
    /// [`Arena::condemn`] so the collector and the destroyer cannot race.
    /// Destroying the GC root itself while the GC thread runs is a misuse
    /// no-op; stop the thread first.
    pub fn destroy(&self) {
        if self.inner().is_condemned() {
            // Already queued for the collector (or for the root's own
            // synchronous drain); destroying it again would double-free.
            return;
        }
        if let Some(gc_root) = gc::gc_thread_root() {
            if gc_root == self.root() {
                if gc_root == *self {
                    tracing::warn!(
                        target: "rill_runtime::arena",
                        name = self.inner().debug_name(),
                        "destroy of the GC root while the GC thread runs; stop it first"
                    );
                    return;
                }
                self.condemn();
                return;
            }
        }
        // SAFETY: no GC owns this tree, so nothing else can observe the
        // arena while it is torn down.
        unsafe { destroy_internal(self.raw(), true) }
    }

    // ========================================================================
    // Cleanup callbacks
    // ========================================================================

    /// Register a before-destroy hook, ordered by ascending priority. Equal
    /// priorities have no relative order guarantee.
    pub fn on_cleanup(&self, subject: Option<Handle>, callback: CleanupCallback, priority: i32) {
        self.inner().with_state(|s| {
            let at = s
                .cleanups
                .iter()
                .position(|e| e.priority > priority)
                .unwrap_or(s.cleanups.len());
            s.cleanups.insert(
                at,
                CleanupEntry {
                    subject,
                    callback,
                    priority,
                },
            );
        });
    }

    /// Remove the first cleanup entry registered for `subject`.
    pub fn remove_cleanup(&self, subject: Option<Handle>) {
        self.inner().with_state(|s| {
            if let Some(at) = s.cleanups.iter().position(|e| e.subject == subject) {
                s.cleanups.remove(at);
            }
        });
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate `size` bytes and return the owning handle, linked at the head
    /// of this arena's handle list.
    pub fn alloc(&self, size: usize) -> Result<Handle> {
        if size == 0 {
            return Err(Error::misuse("zero-size allocation").with_operation("arena::alloc"));
        }
        // SAFETY: plain host allocation; null return handled below.
        let data = unsafe { libc::malloc(size) } as *mut u8;
        if data.is_null() {
            return Err(Error::out_of_memory(size).with_operation("arena::alloc"));
        }
        Ok(self.adopt(data, size, 0))
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn calloc(&self, count: usize, size: usize) -> Result<Handle> {
        let total = count
            .checked_mul(size)
            .ok_or_else(|| Error::out_of_memory(usize::MAX).with_operation("arena::calloc"))?;
        let h = self.alloc(total)?;
        // SAFETY: fresh allocation of `total` bytes.
        unsafe { ptr::write_bytes(h.inner().ptr, 0, total) };
        Ok(h)
    }

    /// Allocate a new handle of `new_size`, copy the common prefix of the old
    /// data, and mark the old handle dead.
    pub fn realloc(&self, old: Handle, new_size: usize) -> Result<Handle> {
        let new = self.alloc(new_size)?;
        {
            let mut dst = new.begin();
            let src = old.begin();
            let n = src.bytes().len().min(new_size);
            dst.bytes_mut()[..n].copy_from_slice(&src.bytes()[..n]);
        }
        old.mark_dead();
        Ok(new)
    }

    /// Copy a string into the arena, NUL-terminated the way generated code
    /// expects its byte strings.
    pub fn strdup(&self, s: &str) -> Result<Handle> {
        let h = self.alloc(s.len() + 1)?;
        let mut txn = h.begin();
        let bytes = txn.bytes_mut();
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        bytes[s.len()] = 0;
        drop(txn);
        Ok(h)
    }

    /// Wrap externally owned memory in a handle. The collector tracks it but
    /// never frees the data pointer.
    pub fn wrap_external(&self, data: *mut u8, size: usize) -> Handle {
        self.adopt(data, size, FLAG_EXTERN)
    }

    fn adopt(&self, data: *mut u8, size: usize, flags: u16) -> Handle {
        let inner = Box::into_raw(Box::new(HandleInner {
            ptr: data,
            size,
            arena: self.raw(),
            flags: AtomicU16::new(flags),
            copy_cb: Cell::new(None),
            free_cb: Cell::new(None),
            prev: Cell::new(ptr::null_mut()),
            next: Cell::new(ptr::null_mut()),
        }));
        self.inner().with_state(|s| {
            // SAFETY: just boxed above.
            handle::link(&mut s.handles_head, unsafe { &*inner });
        });
        // SAFETY: `inner` is non-null by construction.
        Handle::from_inner(unsafe { NonNull::new_unchecked(inner) })
    }

    // ========================================================================
    // Promotion
    // ========================================================================

    /// Clone `src` into this arena: same size, same bytes, same callbacks.
    /// If `src` carries a copy callback it is invoked afterwards, with no
    /// arena lock held, to deep-copy the embedded handle graph.
    pub fn clone_handle(&self, src: Handle) -> Result<Handle> {
        let new = self.alloc(src.size())?;
        {
            // Destination-then-source lock order, fixed crate-wide.
            let mut dst = new.begin();
            let s = src.begin();
            dst.bytes_mut().copy_from_slice(s.bytes());
            new.set_copy_callback(src.copy_callback());
            new.set_free_callback(src.free_callback());
        }
        if let Some(cb) = src.copy_callback() {
            cb(*self, new);
        }
        Ok(new)
    }

    /// Move `src` into this arena: clone, then mark the old handle dead.
    /// A handle already owned by this arena is returned unchanged. On error
    /// the old graph is untouched.
    pub fn promote(&self, src: Handle) -> Result<Handle> {
        if src.owner() == *self {
            return Ok(src);
        }
        let new = self.clone_handle(src)?;
        src.mark_dead();
        Ok(new)
    }

    /// Move this arena under a new parent. Used when a local arena must
    /// outlive its frame by being adopted into the caller's hierarchy. The
    /// `root` reference stays fixed.
    pub fn reparent(&self, new_parent: Arena) {
        // Child-then-parent order, same as promotion takes dest-then-source.
        let inner = self.inner();
        inner.lock_raw();
        let old = inner.parent.replace(new_parent.raw());
        // SAFETY: locked above.
        unsafe { inner.unlock_raw() };

        if let Some(p) = unsafe { old.as_ref() } {
            p.lock_raw();
            unlink_child(p, self.raw());
            // SAFETY: locked above.
            unsafe { p.unlock_raw() };
        }

        let np = new_parent.inner();
        np.lock_raw();
        inner.next_sibling.set(np.first_child.get());
        np.first_child.set(self.raw());
        // SAFETY: locked above.
        unsafe { np.unlock_raw() };
    }

    // ========================================================================
    // GC logging
    // ========================================================================

    /// Enable the one-line human-readable report per GC cycle. Children
    /// created afterwards inherit the flag.
    pub fn enable_gc_log(&self) {
        self.inner().gc_log.store(true, Ordering::Relaxed);
    }

    pub fn disable_gc_log(&self) {
        self.inner().gc_log.store(false, Ordering::Relaxed);
    }

    /// Snapshot of this arena's immediate children, taken under the lock.
    pub fn children_snapshot(&self) -> Vec<Arena> {
        let inner = self.inner();
        inner.lock_raw();
        let mut out = Vec::new();
        let mut child = inner.first_child.get();
        // SAFETY: child links point at live arenas while the parent's lock
        // is held.
        while let Some(c) = unsafe { child.as_ref() } {
            out.push(unsafe { Arena::from_raw(child) });
            child = c.next_sibling.get();
        }
        // SAFETY: locked above.
        unsafe { inner.unlock_raw() };
        out
    }
}

/// Remove `child` from `parent`'s child chain. Caller holds the parent lock.
fn unlink_child(parent: &ArenaInner, child: *mut ArenaInner) {
    let mut prev: *mut ArenaInner = ptr::null_mut();
    let mut cur = parent.first_child.get();
    while !cur.is_null() {
        // SAFETY: non-null link in a chain the held parent lock guards.
        let cur_ref = unsafe { &*cur };
        if cur == child {
            let next = cur_ref.next_sibling.replace(ptr::null_mut());
            match unsafe { prev.as_ref() } {
                Some(p) => p.next_sibling.set(next),
                None => parent.first_child.set(next),
            }
            return;
        }
        prev = cur;
        cur = cur_ref.next_sibling.get();
    }
}

/// Tear an arena down synchronously: cleanups first, then children, then
/// handle callbacks and data, then the struct itself.
///
/// # Safety
/// No GC cycle may be able to observe `arena`, and no other thread may use
/// it or its descendants concurrently.
pub(crate) unsafe fn destroy_internal(arena: *mut ArenaInner, unlink_from_parent: bool) {
    if arena.is_null() {
        return;
    }
    let a = Arena::from_raw(arena);
    let inner = a.inner();

    // Cleanup callbacks run first, with no lock held: thread-join hooks must
    // complete while the children those threads use are still alive.
    let cleanups = inner.with_state(|s| std::mem::take(&mut s.cleanups));
    for entry in cleanups {
        (entry.callback)(entry.subject);
    }

    // Handle free callbacks next, before any child arena goes away: a
    // dispose-style callback condemns its thread's child arena, which must
    // still be live at that point. The lock stays held across the callbacks
    // (it is re-entrant, and the callbacks re-enter this arena), but the
    // state borrow does not.
    inner.lock_raw();
    let handles = {
        let state = inner.state.borrow();
        let mut out = Vec::new();
        let mut h = state.handles_head;
        while let Some(hi) = h.as_ref() {
            out.push(Handle::from_inner(NonNull::new_unchecked(h)));
            h = hi.next.get();
        }
        out
    };
    for h in &handles {
        if let Some(cb) = h.free_callback() {
            h.set_free_callback(None);
            cb(*h);
        }
    }
    inner.state.borrow_mut().handles_head = ptr::null_mut();
    inner.unlock_raw();

    // Children. Snapshot under the lock, tear down outside it.
    inner.lock_raw();
    let children = inner.take_children();
    for &child in &children {
        (*child).parent.set(ptr::null_mut());
    }
    inner.unlock_raw();
    for child in children {
        destroy_internal(child, false);
    }

    // A root also owns its condemned queue. With no collector running, the
    // synchronous path drains it here so condemned descendants do not leak.
    // Destroying a drained arena can condemn further arenas onto the queue,
    // so drain until it stays empty.
    if inner.root.get() == arena {
        loop {
            let mut condemned = inner.condemned_head.swap(ptr::null_mut(), Ordering::AcqRel);
            if condemned.is_null() {
                break;
            }
            while let Some(c) = condemned.as_ref() {
                let next = c.condemned_next.swap(ptr::null_mut(), Ordering::AcqRel);
                destroy_internal(condemned, false);
                condemned = next;
            }
        }
    }

    for h in handles {
        free_handle(h);
    }

    if unlink_from_parent {
        inner.lock_raw();
        let parent = inner.parent.replace(ptr::null_mut());
        inner.unlock_raw();
        if let Some(p) = parent.as_ref() {
            p.lock_raw();
            unlink_child(p, arena);
            p.unlock_raw();
        }
    }

    drop(Box::from_raw(arena));
}

/// Release a handle's data (unless externally owned) and its struct.
///
/// # Safety
/// The handle must be unlinked and unreachable: no live data references it
/// and no further `Handle` copy will be dereferenced.
pub(crate) unsafe fn free_handle(h: Handle) {
    let inner = h.inner_ptr();
    if !h.is_extern() {
        libc::free((*inner).ptr as *mut libc::c_void);
    }
    drop(Box::from_raw(inner));
}
