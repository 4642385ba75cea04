//! # rill-error
//!
//! Unified error handling for the Rill runtime.
//!
//! ## Design Philosophy
//!
//! - **ErrorKind**: Know what error occurred (e.g., OutOfMemory, Misuse)
//! - **Error Context**: Assist in locating the cause with rich context
//!
//! ## Usage
//!
//! ```rust
//! use rill_error::{Error, ErrorKind};
//!
//! fn example() -> Result<(), Error> {
//!     Err(Error::new(ErrorKind::OutOfMemory, "host allocator refused 64 bytes")
//!         .with_operation("arena::alloc")
//!         .with_context("arena", "request"))
//! }
//! ```
//!
//! ## Principles
//!
//! - Fallible runtime operations return `Result<T, rill_error::Error>`
//! - Recoverable misuse is logged and absorbed at the call site, never thrown
//! - A panic crossing a thread boundary travels through the thread record,
//!   not through this type

mod error;
mod kind;

pub use error::Error;
pub use kind::ErrorKind;

/// Result type alias using the Rill runtime Error
pub type Result<T> = std::result::Result<T, Error>;
