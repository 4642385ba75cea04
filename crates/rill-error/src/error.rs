//! The main Error type for the Rill runtime.

use crate::ErrorKind;
use std::fmt;

/// Unified error type for all runtime operations.
pub struct Error {
    kind: ErrorKind,
    message: String,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
}

impl Error {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            operation: "",
            context: Vec::new(),
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the operation that caused this error
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Get the context key-value pairs
    pub fn context(&self) -> &[(&'static str, String)] {
        &self.context
    }

    /// Set the operation that caused this error.
    ///
    /// If an operation was already set, the previous one is moved to context
    /// as "called" to preserve the call chain.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.kind, self.operation)?;

        if !self.context.is_empty() {
            write!(f, ", context {{ ")?;
            for (i, (key, value)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", key, value)?;
            }
            write!(f, " }}")?;
        }

        if !self.message.is_empty() {
            write!(f, " => {}", self.message)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} at {}", self.kind, self.operation)?;

        if !self.message.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Message: {}", self.message)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            writeln!(f, "    Context:")?;
            for (key, value) in &self.context {
                writeln!(f, "        {}: {}", key, value)?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create an OutOfMemory error for a refused allocation.
    pub fn out_of_memory(size: usize) -> Self {
        Self::new(
            ErrorKind::OutOfMemory,
            format!("host allocator refused {} bytes", size),
        )
        .with_context("size", size.to_string())
    }

    /// Create an InvalidHandle error
    pub fn invalid_handle(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidHandle, message)
    }

    /// Create a Misuse error
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Misuse, message)
    }

    /// Create a LockTableFull error
    pub fn lock_table_full() -> Self {
        Self::new(ErrorKind::LockTableFull, "sync-lock table has no free slot")
    }

    /// Create a Panic error carrying a user panic message
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Panic, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::new(ErrorKind::OutOfMemory, "refused");
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(err.message(), "refused");
    }

    #[test]
    fn test_error_with_context() {
        let err = Error::out_of_memory(128)
            .with_operation("arena::alloc")
            .with_context("arena", "scratch");

        assert_eq!(err.operation(), "arena::alloc");
        assert_eq!(err.context().len(), 2);
        assert_eq!(err.context()[0], ("size", "128".to_string()));
    }

    #[test]
    fn test_operation_chaining() {
        let err = Error::misuse("double sync")
            .with_operation("thread::sync")
            .with_operation("thread::sync_all");

        assert_eq!(err.operation(), "thread::sync_all");
        assert_eq!(err.context().len(), 1);
        assert_eq!(err.context()[0], ("called", "thread::sync".to_string()));
    }

    #[test]
    fn test_display() {
        let err = Error::lock_table_full().with_operation("sync_lock::lock");

        let display = format!("{}", err);
        assert!(display.contains("LockTableFull"));
        assert!(display.contains("sync_lock::lock"));
    }
}
