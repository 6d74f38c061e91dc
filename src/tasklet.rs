//! The `Tasklet` data model: identity, ready-queue links, flags, and body.
//!
//! Tasklets live in `Runtime`'s arena addressed by [`TaskletId`] rather than
//! through `Rc`/pointers, breaking the tasklet↔frame cyclic-ownership hazard
//! named in `spec.md` §9.

use bitflags::bitflags;
use std::num::NonZeroU64;

use crate::frame::FrameChain;
use crate::value::Value;
use tasklet_fiber::Fiber;
use tasklet_fiber::stack::DefaultFiberStack;

/// A stackful tasklet body, used whenever the tasklet's callable may invoke
/// `schedule` from a nested Rust call frame it cannot itself unwind out of.
pub type FiberBody = Fiber<Value, Value, Value, DefaultFiberStack>;

bitflags! {
    /// Per-tasklet flags, matching `spec.md` §3's `{atomic, ignore_nesting,
    /// blocked, pending_irq, is_main}` set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskletFlags: u32 {
        const ATOMIC          = 1 << 0;
        const IGNORE_NESTING  = 1 << 1;
        const BLOCKED         = 1 << 2;
        const PENDING_IRQ     = 1 << 3;
        const IS_MAIN         = 1 << 4;
    }
}

/// A stable, thread-local-scoped tasklet identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskletId(NonZeroU64);

impl TaskletId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(NonZeroU64::new(raw).expect("tasklet id counter must never yield zero"))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

/// Outcome of a single step of a [`TaskletBody::Stepped`] body.
pub enum Step {
    /// The body cooperatively yielded; it remains runnable and will be
    /// called again with the next resume value.
    Yield(Value),
    /// The body ran to completion.
    Done(Value),
}

/// How a tasklet's computation is represented.
///
/// A `Stepped` body is always soft-switchable: calling it and getting back
/// a `Step` *is* "unwinding to the dispatch loop," realized as an ordinary
/// Rust call return rather than a sentinel value. A `Fiber` body always
/// hard-switches once started, since only a real stack-copy can suspend it
/// mid-call.
pub enum TaskletBody {
    Stepped(Box<dyn FnMut(Value) -> Step>),
    Fiber(FiberBody),
    /// The tasklet has terminated; its body has been dropped.
    Finished,
}

impl TaskletBody {
    #[must_use]
    pub fn is_soft_switchable(&self) -> bool {
        matches!(self, TaskletBody::Stepped(_))
    }
}

/// A scheduled unit of computation.
pub struct Tasklet {
    pub id: TaskletId,
    pub flags: TaskletFlags,
    pub body: TaskletBody,
    /// The frame chain backing this tasklet's current activation, if it has
    /// one (a not-yet-started tasklet has none).
    pub frame: Option<FrameChain>,
    /// Value to be delivered as the result of this tasklet's previously
    /// suspended `schedule` call, on next resume.
    pub temp_value: Value,
    pub prev: Option<TaskletId>,
    pub next: Option<TaskletId>,
}

impl Tasklet {
    pub(crate) fn new(id: TaskletId, body: TaskletBody, is_main: bool) -> Self {
        let mut flags = TaskletFlags::empty();
        if is_main {
            flags |= TaskletFlags::IS_MAIN;
        }
        Self {
            id,
            flags,
            body,
            frame: None,
            temp_value: Value::Unit,
            prev: None,
            next: None,
        }
    }

    #[must_use]
    pub fn is_main(&self) -> bool {
        self.flags.contains(TaskletFlags::IS_MAIN)
    }

    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.flags.contains(TaskletFlags::ATOMIC)
    }

    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.flags.contains(TaskletFlags::BLOCKED)
    }

    /// Whether this tasklet is in the ready queue (non-trivial neighbor
    /// links, or a singleton queue of just itself).
    #[must_use]
    pub fn in_queue(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}
