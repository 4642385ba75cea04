//! Thread-local allocation handler plumbing.
//!
//! Foreign code running under a redirect window reaches the runtime through
//! a per-thread handler triple `{malloc, free, realloc}`. Each hook sets a
//! `handled` flag: true means "use my result", false means "fall through to
//! the original allocator". The platform shim that rebinds the C allocator
//! symbols to [`hooked_malloc`] and friends is an external collaborator;
//! this module owns only the handler contract and the original-allocator
//! entry points.

use std::cell::Cell;

/// Handler for an intercepted `malloc`. Sets `*handled` and returns the
/// pointer when it served the allocation.
pub type HookMallocFn = fn(size: usize, handled: &mut bool, user_data: *mut ()) -> *mut u8;
/// Handler for an intercepted `free`.
pub type HookFreeFn = fn(ptr: *mut u8, handled: &mut bool, user_data: *mut ());
/// Handler for an intercepted `realloc` (also used for `calloc` growth).
pub type HookReallocFn =
    fn(ptr: *mut u8, size: usize, handled: &mut bool, user_data: *mut ()) -> *mut u8;

/// Bundle of handler functions. `None` entries always fall through.
#[derive(Clone, Copy)]
pub struct MallocHandler {
    pub malloc_fn: Option<HookMallocFn>,
    pub free_fn: Option<HookFreeFn>,
    pub realloc_fn: Option<HookReallocFn>,
    pub user_data: *mut (),
}

impl MallocHandler {
    pub const fn new() -> Self {
        Self {
            malloc_fn: None,
            free_fn: None,
            realloc_fn: None,
            user_data: std::ptr::null_mut(),
        }
    }
}

impl Default for MallocHandler {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static HANDLER: Cell<Option<MallocHandler>> = const { Cell::new(None) };
}

/// Install the calling thread's handler. One handler per thread at a time.
pub fn set_handler(handler: MallocHandler) {
    HANDLER.with(|h| h.set(Some(handler)));
}

/// Clear the calling thread's handler. Safe to call during thread teardown.
pub fn clear_handler() {
    let _ = HANDLER.try_with(|h| h.set(None));
}

/// The calling thread's handler, if any.
pub fn get_handler() -> Option<MallocHandler> {
    HANDLER.with(|h| h.get())
}

/// Remove and return the calling thread's handler. The GC parks the handler
/// here for the length of a cycle.
pub fn take_handler() -> Option<MallocHandler> {
    HANDLER.with(|h| h.take())
}

// ============================================================================
// Intercepted entry points
// ============================================================================

/// `malloc` as seen by hooked foreign code.
pub fn hooked_malloc(size: usize) -> *mut u8 {
    if let Some(handler) = get_handler() {
        if let Some(malloc_fn) = handler.malloc_fn {
            let mut handled = false;
            let ptr = malloc_fn(size, &mut handled, handler.user_data);
            if handled {
                return ptr;
            }
        }
    }
    orig_malloc(size)
}

/// `free` as seen by hooked foreign code.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by this allocation
/// surface and not yet freed.
pub unsafe fn hooked_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    if let Some(handler) = get_handler() {
        if let Some(free_fn) = handler.free_fn {
            let mut handled = false;
            free_fn(ptr, &mut handled, handler.user_data);
            if handled {
                return;
            }
        }
    }
    orig_free(ptr)
}

/// `realloc` as seen by hooked foreign code.
///
/// # Safety
/// As [`hooked_free`].
pub unsafe fn hooked_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    if let Some(handler) = get_handler() {
        if let Some(realloc_fn) = handler.realloc_fn {
            let mut handled = false;
            let out = realloc_fn(ptr, size, &mut handled, handler.user_data);
            if handled {
                return out;
            }
        }
    }
    orig_realloc(ptr, size)
}

// ============================================================================
// Original allocator, for handlers that fall through
// ============================================================================

pub fn orig_malloc(size: usize) -> *mut u8 {
    // SAFETY: plain host allocation.
    unsafe { libc::malloc(size) as *mut u8 }
}

/// # Safety
/// `ptr` must be null or an unfreed host allocation.
pub unsafe fn orig_free(ptr: *mut u8) {
    libc::free(ptr as *mut libc::c_void)
}

/// # Safety
/// `ptr` must be null or an unfreed host allocation.
pub unsafe fn orig_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    libc::realloc(ptr as *mut libc::c_void, size) as *mut u8
}
