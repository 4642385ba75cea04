//! Thread-local malloc redirection into a chosen arena.
//!
//! While a redirect window is open, foreign allocations on this thread are
//! served from the top-of-stack arena and tracked in a per-thread map from
//! raw pointer to handle, so later `free`/`realloc` calls can find their
//! handles. Pointers the map does not know fall through to the original
//! allocator. Redirect state is strictly thread-local and is not inherited
//! by spawned threads; on thread exit every still-tracked allocation is
//! marked dead for the collector.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;

use crate::arena::Arena;
use crate::handle::Handle;
use crate::hooks::{self, MallocHandler};

/// Fixed depth of the per-thread redirect stack.
pub const REDIRECT_STACK_DEPTH: usize = 16;

struct RedirectState {
    stack: [Option<Arena>; REDIRECT_STACK_DEPTH],
    depth: usize,
    /// Raw pointer → owning handle for allocations served by a redirect.
    map: HashMap<usize, Handle>,
}

impl RedirectState {
    fn new() -> Self {
        Self {
            stack: [None; REDIRECT_STACK_DEPTH],
            depth: 0,
            map: HashMap::new(),
        }
    }
}

impl Drop for RedirectState {
    fn drop(&mut self) {
        // Thread exit: anything foreign code never freed belongs to the GC
        // now.
        for handle in self.map.values() {
            handle.mark_dead();
        }
        hooks::clear_handler();
    }
}

thread_local! {
    static REDIRECT: RefCell<RedirectState> = RefCell::new(RedirectState::new());
}

const REDIRECT_HANDLER: MallocHandler = MallocHandler {
    malloc_fn: Some(redirect_malloc),
    free_fn: Some(redirect_free),
    realloc_fn: Some(redirect_realloc),
    user_data: ptr::null_mut(),
};

/// Open a redirect window onto `arena`. The first push installs this
/// thread's allocation handler; pushes beyond the fixed depth are ignored.
pub fn redirect_push(arena: Arena) {
    REDIRECT.with(|r| {
        let mut state = r.borrow_mut();
        if state.depth >= REDIRECT_STACK_DEPTH {
            tracing::warn!(
                target: "rill_runtime::redirect",
                "redirect stack full; push ignored"
            );
            return;
        }
        let depth = state.depth;
        state.stack[depth] = Some(arena);
        state.depth += 1;
        if state.depth == 1 {
            hooks::set_handler(REDIRECT_HANDLER);
        }
    });
}

/// Close the innermost redirect window. The last pop uninstalls the
/// handler; popping an empty stack is ignored.
pub fn redirect_pop() {
    REDIRECT.with(|r| {
        let mut state = r.borrow_mut();
        if state.depth == 0 {
            tracing::warn!(
                target: "rill_runtime::redirect",
                "redirect pop on empty stack; ignored"
            );
            return;
        }
        state.depth -= 1;
        let depth = state.depth;
        state.stack[depth] = None;
        if state.depth == 0 {
            hooks::clear_handler();
        }
    });
}

/// The arena currently receiving this thread's redirected allocations.
pub fn redirect_current() -> Option<Arena> {
    REDIRECT.with(|r| {
        let state = r.borrow();
        if state.depth > 0 {
            state.stack[state.depth - 1]
        } else {
            None
        }
    })
}

// ============================================================================
// Handler bodies
// ============================================================================

fn redirect_malloc(size: usize, handled: &mut bool, _user_data: *mut ()) -> *mut u8 {
    let Some(arena) = redirect_current() else {
        *handled = false;
        return ptr::null_mut();
    };

    match arena.alloc(size) {
        Ok(handle) => {
            let data = handle.inner().ptr;
            REDIRECT.with(|r| r.borrow_mut().map.insert(data as usize, handle));
            *handled = true;
            data
        }
        Err(_) => {
            // We tried; report the failure rather than falling through.
            *handled = true;
            ptr::null_mut()
        }
    }
}

fn redirect_free(data: *mut u8, handled: &mut bool, _user_data: *mut ()) {
    let found = REDIRECT.with(|r| r.borrow_mut().map.remove(&(data as usize)));
    match found {
        Some(handle) => {
            handle.mark_dead();
            *handled = true;
        }
        None => *handled = false,
    }
}

fn redirect_realloc(data: *mut u8, size: usize, handled: &mut bool, user_data: *mut ()) -> *mut u8 {
    if data.is_null() {
        return redirect_malloc(size, handled, user_data);
    }
    if size == 0 {
        redirect_free(data, handled, user_data);
        return ptr::null_mut();
    }

    let found = REDIRECT.with(|r| r.borrow().map.get(&(data as usize)).copied());
    let Some(old) = found else {
        *handled = false;
        return ptr::null_mut();
    };

    match old.owner().realloc(old, size) {
        Ok(new) => {
            let new_data = new.inner().ptr;
            REDIRECT.with(|r| {
                let mut state = r.borrow_mut();
                state.map.remove(&(data as usize));
                state.map.insert(new_data as usize, new);
            });
            *handled = true;
            new_data
        }
        Err(_) => {
            *handled = true;
            ptr::null_mut()
        }
    }
}
