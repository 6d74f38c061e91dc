//! A cooperative micro-threading runtime: user-space "tasklets" scheduled
//! within a single OS thread, with an optional call-graph profiler that
//! correctly attributes time across tasklet switches.
//!
//! A [`Runtime`] handle gives access to the thread-local scheduler:
//!
//! ```no_run
//! use tasklets::{Runtime, Step, Value};
//!
//! Runtime::with(|rt| {
//!     rt.new_stepped(Box::new(|resumed| {
//!         println!("resumed with {resumed:?}");
//!         Step::Done(Value::Unit)
//!     }));
//!     let _ = rt.schedule(Value::Unit);
//! });
//! ```
//!
//! Tasklets never migrate between OS threads; each thread that touches a
//! [`Runtime`] gets its own independent scheduler, ready queue, and
//! profiler, lazily constructed on first use.

pub mod channel;
pub mod error;
pub mod frame;
pub mod profiler;
pub mod runtime;
pub mod tasklet;
pub mod value;
pub mod watchdog;

pub use channel::{Channel, ObserverCallback};
pub use error::{Result, TaskletError};
pub use frame::{Block, BlockKind, CFrame, CodeId, Frame, FrameChain, FrameFreeList, JumpError, TraceEvent};
pub use profiler::{CallableKind, EntryKey, EntryStats, Profiler, SubEntryStats};
pub use runtime::{AtomicGuard, Runtime, RuntimeConfig, TaskletRuntimeState};
pub use tasklet::{Step, TaskletBody, TaskletFlags, TaskletId};
pub use value::{Bomb, Value};
pub use watchdog::WatchdogFlags;
