//! Error kinds for Rill runtime operations

use strum_macros::{Display, IntoStaticStr};

/// The kind of error that occurred.
///
/// This enum categorizes errors so callers (mostly generated code) can
/// decide how to react: abort via panic, recover, or ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr, Display)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // Allocation errors
    // =========================================================================
    /// The host allocator refused an allocation
    OutOfMemory,

    // =========================================================================
    // Handle errors
    // =========================================================================
    /// A null or dead handle was passed to an operation that needs a live one
    InvalidHandle,

    // =========================================================================
    // API misuse
    // =========================================================================
    /// An operation was called in a state where it cannot take effect
    /// (double sync, empty redirect pop, destroying a busy arena)
    Misuse,

    // =========================================================================
    // Lock errors
    // =========================================================================
    /// The sync-lock table has no free slot for a new address
    LockTableFull,

    // =========================================================================
    // User code
    // =========================================================================
    /// A panic raised by user code through the runtime
    Panic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::OutOfMemory.to_string(), "OutOfMemory");
        assert_eq!(ErrorKind::LockTableFull.to_string(), "LockTableFull");
    }

    #[test]
    fn test_kind_static_str() {
        let s: &'static str = ErrorKind::Misuse.into();
        assert_eq!(s, "Misuse");
    }
}
