//! The cooperative scheduler: ready queue, current/main distinction,
//! soft/hard switch selection, atomic sections, switch-trap, and
//! termination/bomb handling.
//!
//! Per `spec.md` §9, the runtime is a thread-local handle to a
//! heap-allocated [`TaskletRuntimeState`], constructed lazily on first use
//! and destroyed at thread exit — the idiomatic realization of the
//! original's per-OS-thread global mutable state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use tasklet_fiber::Fiber;
use tasklet_fiber::stack::DefaultFiberStack;
use tasklet_time::TimeSource;
use tracing::{debug, trace, warn};

use crate::error::{Result, TaskletError};
use crate::profiler::Profiler;
use crate::tasklet::{FiberBody, Step, Tasklet, TaskletBody, TaskletFlags, TaskletId};
use crate::value::{Bomb, Value};
use crate::watchdog::{WatchdogDriver, WatchdogFlags};

/// Tunable capacities/policy for a [`Runtime`]; see `spec.md` §9's "bounded
/// recycler with explicit capacity (suggested 200)."
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    pub frame_free_list_capacity: usize,
    pub fiber_stack_recycler_capacity: usize,
    pub fiber_stack_size: usize,
    pub softswitch_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            frame_free_list_capacity: crate::frame::DEFAULT_FREE_LIST_CAPACITY,
            fiber_stack_recycler_capacity: 200,
            fiber_stack_size: 1024 * 1024,
            softswitch_enabled: true,
        }
    }
}

type ScheduleCallback = Box<dyn FnMut(Option<TaskletId>, Option<TaskletId>)>;
type ErrorHandler = Box<dyn FnMut(TaskletId, &Bomb) -> std::result::Result<(), ()>>;

/// Per-OS-thread runtime state, per `spec.md` §3's `TaskletRuntimeState`.
pub struct TaskletRuntimeState {
    pub(crate) config: RuntimeConfig,
    tasklets: HashMap<TaskletId, Tasklet>,
    next_id: u64,
    main: Option<TaskletId>,
    current: Option<TaskletId>,
    runcount: u32,
    switch_trap: i32,
    schedlock: u32,
    pub(crate) nesting_level: u32,
    softswitch_enabled: bool,
    last_switch_was_soft: bool,
    schedule_callback: Option<ScheduleCallback>,
    error_handler: Option<ErrorHandler>,
    pub(crate) watchdog: WatchdogDriver,
    /// Stacks reclaimed from `Fiber` tasklets on termination (see
    /// `recycle_fiber_stack`), up to `config.fiber_stack_recycler_capacity`;
    /// `new_fiber` pops from here before allocating fresh.
    stack_recycler: Vec<DefaultFiberStack>,
    pub(crate) time: TimeSource,
    pub(crate) profiler: Profiler,
}

impl TaskletRuntimeState {
    fn new(config: RuntimeConfig) -> Self {
        let softswitch_enabled = config.softswitch_enabled;
        Self {
            config,
            tasklets: HashMap::new(),
            next_id: 1,
            main: None,
            current: None,
            runcount: 0,
            switch_trap: 0,
            schedlock: 0,
            nesting_level: 0,
            softswitch_enabled,
            last_switch_was_soft: false,
            schedule_callback: None,
            error_handler: None,
            watchdog: WatchdogDriver::new(),
            stack_recycler: Vec::new(),
            time: TimeSource::monotonic(),
            profiler: Profiler::new(),
        }
    }

    /// The current timestamp from this runtime's `TimeSource`, in ticks.
    /// Shared by the watchdog and by callers driving profiler events.
    pub fn time_now(&mut self) -> i64 {
        self.time.now()
    }

    /// The profiler instance for this thread's runtime. Its data structures
    /// belong to this thread alone and must never be shared, per
    /// `spec.md` §5.
    pub fn profiler(&mut self) -> &mut Profiler {
        &mut self.profiler
    }

    fn mint_id(&mut self) -> TaskletId {
        let id = TaskletId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn ensure_main(&mut self) -> TaskletId {
        if let Some(main) = self.main {
            return main;
        }
        let id = self.mint_id();
        let tasklet = Tasklet::new(id, TaskletBody::Finished, true);
        self.tasklets.insert(id, tasklet);
        self.main = Some(id);
        self.current = Some(id);
        self.insert_into_queue(id);
        debug!(tasklet = id.as_u64(), "main tasklet initialized");
        id
    }

    fn insert_into_queue(&mut self, id: TaskletId) {
        let Some(current) = self.current else {
            let t = self.tasklets.get_mut(&id).unwrap();
            t.prev = Some(id);
            t.next = Some(id);
            self.current = Some(id);
            self.runcount += 1;
            return;
        };
        if current == id {
            let t = self.tasklets.get_mut(&id).unwrap();
            if t.prev.is_none() {
                t.prev = Some(id);
                t.next = Some(id);
                self.runcount += 1;
            }
            return;
        }
        let tail = self.tasklets.get(&current).unwrap().prev.unwrap_or(current);
        self.tasklets.get_mut(&tail).unwrap().next = Some(id);
        self.tasklets.get_mut(&current).unwrap().prev = Some(id);
        {
            let t = self.tasklets.get_mut(&id).unwrap();
            t.prev = Some(tail);
            t.next = Some(current);
        }
        self.runcount += 1;
    }

    fn remove_from_queue(&mut self, id: TaskletId) {
        let (prev, next) = {
            let Some(t) = self.tasklets.get(&id) else {
                return;
            };
            let Some(prev) = t.prev else { return };
            let next = t.next.unwrap();
            (prev, next)
        };
        if prev == id {
            // Singleton queue.
            if self.current == Some(id) {
                self.current = None;
            }
        } else {
            self.tasklets.get_mut(&prev).unwrap().next = Some(next);
            self.tasklets.get_mut(&next).unwrap().prev = Some(prev);
            if self.current == Some(id) {
                self.current = Some(next);
            }
        }
        let t = self.tasklets.get_mut(&id).unwrap();
        t.prev = None;
        t.next = None;
        self.runcount -= 1;
    }

    /// Creates a new `Stepped` tasklet bound to `body`, inserted at the
    /// ready-queue tail.
    pub fn new_stepped(&mut self, body: Box<dyn FnMut(Value) -> Step>) -> TaskletId {
        self.ensure_main();
        let id = self.mint_id();
        let tasklet = Tasklet::new(id, TaskletBody::Stepped(body), false);
        self.tasklets.insert(id, tasklet);
        self.insert_into_queue(id);
        trace!(tasklet = id.as_u64(), "stepped tasklet created");
        id
    }

    /// Creates a new `Fiber`-bodied tasklet running `func` once started,
    /// inserted at the ready-queue tail.
    pub fn new_fiber<F>(&mut self, func: F) -> TaskletId
    where
        F: FnOnce(Value, &tasklet_fiber::Suspend<Value, Value>) -> Value + 'static,
    {
        self.ensure_main();
        let id = self.mint_id();
        let stack = self
            .stack_recycler
            .pop()
            .unwrap_or_else(|| DefaultFiberStack::new(self.config.fiber_stack_size).expect("stack allocation"));
        let fiber = Fiber::with_stack(stack, func);
        let tasklet = Tasklet::new(id, TaskletBody::Fiber(fiber), false);
        self.tasklets.insert(id, tasklet);
        self.insert_into_queue(id);
        trace!(tasklet = id.as_u64(), "fiber tasklet created");
        id
    }

    #[must_use]
    pub fn current(&self) -> Option<TaskletId> {
        self.current
    }

    #[must_use]
    pub fn main(&self) -> Option<TaskletId> {
        self.main
    }

    #[must_use]
    pub fn runcount(&self) -> u32 {
        self.runcount
    }

    pub fn set_schedule_callback(&mut self, cb: Option<ScheduleCallback>) -> Option<ScheduleCallback> {
        std::mem::replace(&mut self.schedule_callback, cb)
    }

    pub fn set_error_handler(&mut self, handler: Option<ErrorHandler>) -> Option<ErrorHandler> {
        std::mem::replace(&mut self.error_handler, handler)
    }

    /// `spec.md` §6's `enable_softswitch`: sets (or, if `flag` is `None`,
    /// merely queries) the global soft-switch policy, returning the
    /// previous value.
    pub fn enable_softswitch(&mut self, flag: Option<bool>) -> bool {
        let previous = self.softswitch_enabled;
        if let Some(flag) = flag {
            self.softswitch_enabled = flag;
        }
        previous
    }

    /// Whether the most recently completed `schedule` call switched via a
    /// soft (unwind-to-dispatch-loop) or hard (fiber stack-copy) path.
    /// `false` before the first switch on this runtime.
    #[must_use]
    pub fn last_switch_was_soft(&self) -> bool {
        self.last_switch_was_soft
    }

    /// `spec.md` §6's `switch_trap`: adjusts the counter by `delta`,
    /// returning its previous value.
    pub fn switch_trap(&mut self, delta: i32) -> i32 {
        let previous = self.switch_trap;
        self.switch_trap += delta;
        previous
    }

    #[must_use]
    pub fn switch_trap_level(&self) -> i32 {
        self.switch_trap
    }

    /// Raises `id`'s atomic flag, returning its prior value for a matching
    /// [`TaskletRuntimeState::restore_atomic`] call, per `spec.md` §4.5.
    /// Prefer [`TaskletRuntimeState::atomic_guard`] over pairing these two
    /// calls by hand.
    ///
    /// # Errors
    ///
    /// Returns [`TaskletError::Value`] if `id` doesn't name a tasklet
    /// currently known to this runtime.
    pub fn enter_atomic(&mut self, id: TaskletId) -> Result<bool> {
        let t = self
            .tasklets
            .get_mut(&id)
            .ok_or_else(|| TaskletError::Value(format!("no such tasklet: {id:?}")))?;
        let was = t.is_atomic();
        t.flags |= TaskletFlags::ATOMIC;
        Ok(was)
    }

    pub fn restore_atomic(&mut self, id: TaskletId, was: bool) {
        if let Some(t) = self.tasklets.get_mut(&id) {
            t.flags.set(TaskletFlags::ATOMIC, was);
        }
    }

    /// Scoped wrapper around [`TaskletRuntimeState::enter_atomic`]/
    /// [`TaskletRuntimeState::restore_atomic`]: raises `id`'s atomic flag
    /// immediately and restores the prior value when the returned guard is
    /// dropped, including on an early return or a panic unwind.
    ///
    /// # Errors
    ///
    /// Returns [`TaskletError::Value`] if `id` doesn't name a tasklet
    /// currently known to this runtime.
    pub fn atomic_guard(&mut self, id: TaskletId) -> Result<AtomicGuard<'_>> {
        let was = self.enter_atomic(id)?;
        Ok(AtomicGuard { rt: self, id, was })
    }

    pub(crate) fn is_atomic(&self, id: TaskletId) -> bool {
        self.tasklets.get(&id).is_some_and(Tasklet::is_atomic)
    }

    pub(crate) fn set_pending_irq(&mut self, id: TaskletId) {
        if let Some(t) = self.tasklets.get_mut(&id) {
            t.flags |= TaskletFlags::PENDING_IRQ;
        }
    }

    pub(crate) fn take_pending_irq(&mut self, id: TaskletId) -> bool {
        if let Some(t) = self.tasklets.get_mut(&id) {
            let had = t.flags.contains(TaskletFlags::PENDING_IRQ);
            t.flags.remove(TaskletFlags::PENDING_IRQ);
            had
        } else {
            false
        }
    }

    /// Whether `id` has a watchdog interrupt deferred against it, per
    /// `spec.md` §4.6's `PENDING_IRQ` flag. Does not clear the flag; see
    /// [`TaskletRuntimeState::take_pending_irq`] for that.
    #[must_use]
    pub fn has_pending_irq(&self, id: TaskletId) -> bool {
        self.tasklets.get(&id).is_some_and(|t| t.flags.contains(TaskletFlags::PENDING_IRQ))
    }

    pub(crate) fn schedlock(&self) -> u32 {
        self.schedlock
    }

    /// The core switch primitive from `spec.md` §4.5.
    pub fn schedule(&mut self, retval: Value) -> Result<Value> {
        self.schedule_inner(retval, false)
    }

    pub fn schedule_remove(&mut self, retval: Value) -> Result<Value> {
        self.schedule_inner(retval, true)
    }

    fn schedule_inner(&mut self, retval: Value, remove_current: bool) -> Result<Value> {
        if self.switch_trap != 0 {
            return Err(TaskletError::SwitchTrapped);
        }
        let Some(from) = self.current else {
            return Err(TaskletError::Runtime("no current tasklet to schedule from".into()));
        };

        let to = self.next_runnable(from, remove_current).ok_or_else(|| {
            TaskletError::Runtime("no runnable tasklet to switch to".into())
        })?;

        self.schedlock += 1;
        self.invoke_schedule_callback(Some(from), Some(to));
        self.schedlock -= 1;

        if remove_current {
            self.remove_from_queue(from);
        }
        self.tasklets.get_mut(&from).unwrap().temp_value = retval;
        self.current = Some(to);

        let soft = self.softswitch_enabled
            && self
                .tasklets
                .get(&from)
                .is_some_and(|t| t.body.is_soft_switchable());
        self.last_switch_was_soft = soft;

        if soft {
            trace!(from = from.as_u64(), to = to.as_u64(), "soft switch");
            self.run_until_suspended(to)
        } else {
            // A hard switch is a real stack copy, not an unwind back to a
            // dispatch loop: for the duration of the switched-to tasklet's
            // run, this thread is nested one level deeper than the watchdog's
            // per-call tick granularity can observe between `schedule` calls.
            trace!(from = from.as_u64(), to = to.as_u64(), "hard switch");
            self.nesting_level += 1;
            let result = self.run_until_suspended(to);
            self.nesting_level -= 1;
            result
        }
    }

    /// Picks the next tasklet to run: the ready queue's successor of
    /// `from`, skipping `from` itself unless it is the only runnable
    /// tasklet and is not being removed.
    fn next_runnable(&self, from: TaskletId, remove_current: bool) -> Option<TaskletId> {
        let t = self.tasklets.get(&from)?;
        let next = t.next?;
        if next == from {
            return if remove_current { None } else { Some(from) };
        }
        Some(next)
    }

    /// Drives `to` (a `Stepped` body runs one step; a `Fiber` body is
    /// resumed). If it suspends, its yielded value is returned directly
    /// (the original caller of `schedule` is waiting for whatever `to`
    /// hands back). If it terminates instead, termination is handled and
    /// the value delivered is whichever tasklet is now current's own
    /// previously-stored temp-value.
    fn run_until_suspended(&mut self, to: TaskletId) -> Result<Value> {
        let input = self.tasklets.get_mut(&to).unwrap().temp_value.take();
        let body = std::mem::replace(&mut self.tasklets.get_mut(&to).unwrap().body, TaskletBody::Finished);

        match body {
            TaskletBody::Stepped(mut step_fn) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| step_fn(input)));
                match outcome {
                    Ok(Step::Yield(value)) => {
                        if let Some(t) = self.tasklets.get_mut(&to) {
                            t.body = TaskletBody::Stepped(step_fn);
                        }
                        Ok(value)
                    }
                    Ok(Step::Done(value)) => {
                        self.terminate(to, value)?;
                        self.deliver_current()
                    }
                    Err(_) => {
                        let bomb = Value::Bomb(Box::new(Bomb {
                            message: format!("tasklet {} panicked", to.as_u64()),
                        }));
                        self.terminate(to, bomb)?;
                        self.deliver_current()
                    }
                }
            }
            TaskletBody::Fiber(mut fiber) => {
                let result = fiber.resume(input);
                match result {
                    tasklet_fiber::FiberResult::Yield(value) => {
                        if let Some(t) = self.tasklets.get_mut(&to) {
                            t.body = TaskletBody::Fiber(fiber);
                        }
                        Ok(value)
                    }
                    tasklet_fiber::FiberResult::Return(value) => {
                        self.recycle_fiber_stack(fiber);
                        self.terminate(to, value)?;
                        self.deliver_current()
                    }
                }
            }
            TaskletBody::Finished => self.deliver_current(),
        }
    }

    /// Reclaims a finished fiber's stack for reuse by a later `new_fiber`
    /// call, up to `config.fiber_stack_recycler_capacity`; past that, the
    /// stack is simply dropped.
    fn recycle_fiber_stack(&mut self, fiber: FiberBody) {
        if self.stack_recycler.len() < self.config.fiber_stack_recycler_capacity {
            self.stack_recycler.push(fiber.into_stack());
        }
    }

    /// After a termination forced an implicit re-schedule, deliver the
    /// (possibly new) current tasklet's temp-value as if it had just
    /// resumed from its own suspended `schedule` call.
    fn deliver_current(&mut self) -> Result<Value> {
        let Some(current) = self.current else {
            return Ok(Value::Unit);
        };
        Ok(self.tasklets.get_mut(&current).unwrap().temp_value.take())
    }

    fn terminate(&mut self, id: TaskletId, final_value: Value) -> Result<()> {
        self.remove_from_queue(id);
        debug!(tasklet = id.as_u64(), "tasklet terminated");

        if final_value.is_bomb() {
            self.dispatch_bomb(id, final_value)?;
        } else if let Some(t) = self.tasklets.get_mut(&id) {
            t.temp_value = final_value;
        }
        self.tasklets.remove(&id);
        Ok(())
    }

    /// Exception-bomb delivery per `spec.md` §4.5/§7/§9(c): routed to the
    /// error handler unless the bombed tasklet is main itself, in which
    /// case it surfaces directly without invoking the handler.
    fn dispatch_bomb(&mut self, id: TaskletId, bomb: Value) -> Result<()> {
        let Value::Bomb(inner) = bomb else {
            unreachable!("dispatch_bomb called with a non-bomb value")
        };

        if self.main == Some(id) {
            return Err(TaskletError::Bomb(id));
        }

        if let Some(mut handler) = self.error_handler.take() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(id, &inner)));
            self.error_handler = Some(handler);
            match outcome {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(())) | Err(_) => {
                    warn!(tasklet = id.as_u64(), "error handler failed; re-raising on main");
                }
            }
        }

        let Some(main) = self.main else {
            return Err(TaskletError::Bomb(id));
        };
        if let Some(t) = self.tasklets.get_mut(&main) {
            t.temp_value = Value::Bomb(inner);
        }
        Ok(())
    }

    fn invoke_schedule_callback(&mut self, prev: Option<TaskletId>, next: Option<TaskletId>) {
        if let Some(mut cb) = self.schedule_callback.take() {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(prev, next))).is_err() {
                warn!("schedule callback panicked; ignoring");
            }
            self.schedule_callback = Some(cb);
        }
    }

    /// `spec.md` §6's `get_thread_info`-equivalent surface: `(main,
    /// current, runcount)`.
    #[must_use]
    pub fn thread_info(&self) -> (Option<TaskletId>, Option<TaskletId>, u32) {
        (self.main, self.current, self.runcount)
    }

    /// Runs the watchdog for `timeout` ticks with `flags`, per `spec.md`
    /// §4.6. Must be called from the main tasklet.
    ///
    /// # Errors
    ///
    /// Returns [`TaskletError::Value`] if `timeout` is negative, or
    /// [`TaskletError::Runtime`] if called from any tasklet other than main.
    pub fn run_watchdog(&mut self, timeout: i64, flags: WatchdogFlags) -> Result<Option<TaskletId>> {
        if timeout < 0 {
            return Err(TaskletError::Value(format!("watchdog timeout must be non-negative, got {timeout}")));
        }
        let main = self.ensure_main();
        if self.current != Some(main) {
            return Err(TaskletError::Runtime("run() must be called from the main tasklet".into()));
        }
        if self.runcount <= 1 {
            return Ok(None);
        }

        self.watchdog.arm(timeout, flags);
        // `remove_from_queue` advances `current` to main's successor, which
        // becomes "the first runnable peer" the watchdog switches to.
        self.remove_from_queue(main);

        let victim = WatchdogDriver::run(self);

        self.insert_into_queue(main);
        self.current = Some(main);
        Ok(victim)
    }

    pub(crate) fn tasklet_ids_in_order(&self) -> Vec<TaskletId> {
        let Some(start) = self.current else { return Vec::new() };
        let mut ids = Vec::new();
        let mut cur = start;
        loop {
            ids.push(cur);
            let next = self.tasklets.get(&cur).and_then(|t| t.next);
            match next {
                Some(n) if n != start => cur = n,
                _ => break,
            }
        }
        ids
    }
}

/// Scoped atomic-section guard returned by [`TaskletRuntimeState::atomic_guard`],
/// per `spec.md`'s `AtomicGuard` component.
pub struct AtomicGuard<'a> {
    rt: &'a mut TaskletRuntimeState,
    id: TaskletId,
    was: bool,
}

impl Drop for AtomicGuard<'_> {
    fn drop(&mut self) {
        self.rt.restore_atomic(self.id, self.was);
    }
}

impl std::ops::Deref for AtomicGuard<'_> {
    type Target = TaskletRuntimeState;
    fn deref(&self) -> &Self::Target {
        self.rt
    }
}

impl std::ops::DerefMut for AtomicGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.rt
    }
}

thread_local! {
    static RUNTIME: RefCell<Option<TaskletRuntimeState>> = const { RefCell::new(None) };
}

/// A handle to the thread-local runtime, lazily constructed on first use.
#[derive(Clone, Copy, Debug, Default)]
pub struct Runtime;

impl Runtime {
    /// Accesses the thread-local runtime, constructing it with
    /// [`RuntimeConfig::default`] if this is the first call on this thread.
    pub fn with<R>(f: impl FnOnce(&mut TaskletRuntimeState) -> R) -> R {
        Self::with_config(RuntimeConfig::default(), f)
    }

    pub fn with_config<R>(config: RuntimeConfig, f: impl FnOnce(&mut TaskletRuntimeState) -> R) -> R {
        RUNTIME.with(|cell| {
            let mut slot = cell.borrow_mut();
            let state = slot.get_or_insert_with(|| TaskletRuntimeState::new(config));
            f(state)
        })
    }

    /// Non-reentrant, non-constructing variant of [`Runtime::with`], used by
    /// [`crate::channel::Channel`] to detect whether it is safe to
    /// cooperatively schedule on this thread right now.
    ///
    /// Returns `None` (rather than panicking) if this thread has no runtime
    /// yet, or if the thread-local is already mutably borrowed — which
    /// happens when this is called from inside a tasklet body that is itself
    /// being driven by an outer `Runtime::with`/`with_config` call, since
    /// that call holds the borrow for its entire duration. A caller nested
    /// inside an active tasklet dispatch must not attempt to schedule
    /// reentrantly; it falls back to purely OS-level blocking instead.
    pub(crate) fn try_with<R>(f: impl FnOnce(&mut TaskletRuntimeState) -> R) -> Option<R> {
        RUNTIME.with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            slot.as_mut().map(f)
        })
    }
}
