//! The error taxonomy surfaced at the public boundary.
//!
//! Leaf modules (e.g. [`crate::frame::JumpError`]) define small hand-written
//! error types in the style of the reference workspace's `kasync::error`
//! (manual `Display`/`Error` impls, no derive machinery, for closed sets of
//! two or three variants). `TaskletError` aggregates those plus its own
//! variants and is the one type this crate derives with `thiserror`, since
//! at this boundary there are enough variants and `#[from]` conversions that
//! hand-written impls would be pure boilerplate.

use thiserror::Error;

use crate::frame::JumpError;
use crate::tasklet::TaskletId;

/// The error kinds named in `spec.md` §6/§7.
#[derive(Debug, Error)]
pub enum TaskletError {
    /// A free-list or arena allocation failed, or the profiler's sticky
    /// `NOMEMORY` flag was set by a prior event.
    #[error("memory exhausted")]
    MemoryExhausted,

    /// Wrong thread, double-init, missing main, or another contract
    /// violation not covered by a more specific variant.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A bad argument value (unknown tasklet id, negative watchdog timeout,
    /// ...).
    ///
    /// The reference implementation's `TypeError` (a non-callable object
    /// supplied where a callable was required) has no counterpart here:
    /// every tasklet body is a statically typed Rust closure, so that error
    /// class can't arise.
    #[error("value error: {0}")]
    Value(String),

    /// `schedule` was attempted while `switch_trap` is non-zero.
    #[error("switch trapped")]
    SwitchTrapped,

    /// A trace-driven line jump violated one of the §4.4.1 legality rules.
    #[error(transparent)]
    Jump(#[from] JumpError),

    /// An exception escaped a tasklet's top frame and reached main with no
    /// handler installed (or the handler itself failed).
    #[error("tasklet {0:?} terminated with an unhandled exception")]
    Bomb(TaskletId),
}

pub type Result<T> = std::result::Result<T, TaskletError>;
