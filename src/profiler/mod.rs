//! The call-graph profiler: per-tasklet profile stacks whose time accounting
//! stays correct across cooperative switches, per `spec.md` §4.3.
//!
//! Grounded on `examples/original_source/Modules/_lsprof.c`: the
//! enter/leave event handling, stack-selection/paused-time distribution, and
//! recursion classification below are the same algorithm, replacing pointer
//! identity with [`EntryKey`]/[`TaskletId`] and a malloc free-list with a
//! plain `Vec` stack per tasklet.

pub mod context;
pub mod entry;

use tasklet_map::OrderedMap;
use tracing::{trace, warn};

pub use context::{ProfilerContext, ProfilerStack};
pub use entry::{CallableKind, EntryKey, ProfilerEntry, ProfilerSubEntry};

use crate::error::{Result, TaskletError};
use crate::tasklet::TaskletId;

/// A snapshot of one entry's statistics, scaled to seconds by the active
/// `TimeSource` unit, per `spec.md` §6's 6-tuple record.
#[derive(Clone, Debug)]
pub struct EntryStats {
    pub user_obj: String,
    pub call_count: u64,
    pub recursive_call_count: u64,
    pub total_time: f64,
    pub inline_time: f64,
    pub subcalls: Option<Vec<SubEntryStats>>,
}

/// A snapshot of one sub-entry's statistics, per `spec.md` §6's 5-tuple
/// record.
#[derive(Clone, Debug)]
pub struct SubEntryStats {
    pub user_obj: String,
    pub call_count: u64,
    pub recursive_call_count: u64,
    pub total_time: f64,
    pub inline_time: f64,
}

/// The call-graph profiler. One instance lives in each thread's runtime;
/// its data structures are never shared across threads (`spec.md` §5).
pub struct Profiler {
    enabled: bool,
    subcalls: bool,
    builtins: bool,
    entries: OrderedMap<EntryKey, ProfilerEntry>,
    /// Insertion order of `entries`, since the splay tree's own order is
    /// explicitly unspecified (`spec.md` §4.2) but `getstats()` must be
    /// deterministic across runs of the same event sequence.
    creation_order: Vec<EntryKey>,
    stacks: OrderedMap<TaskletId, ProfilerStack>,
    current_tasklet: Option<TaskletId>,
    nomemory: bool,
}

impl Profiler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            subcalls: false,
            builtins: true,
            entries: OrderedMap::new(),
            creation_order: Vec::new(),
            stacks: OrderedMap::new(),
            current_tasklet: None,
            nomemory: false,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Installs the profiler as the per-thread call/return observer.
    /// Idempotent with respect to re-enabling: calling it again just
    /// updates `subcalls`/`builtins` without discarding collected stats.
    ///
    /// # Errors
    ///
    /// Returns [`TaskletError::MemoryExhausted`] (clearing the sticky flag)
    /// if a prior `enter`/`leave` event dropped itself for lack of arena
    /// space, per `spec.md` §4.3; the profiler is left disabled in that case.
    pub fn enable(&mut self, subcalls: bool, builtins: bool) -> Result<()> {
        self.check_memory_exhausted()?;
        self.enabled = true;
        self.subcalls = subcalls;
        self.builtins = builtins;
        trace!(subcalls, builtins, "profiler enabled");
        Ok(())
    }

    /// Uninstalls the profiler, flushing every open context on every
    /// tasklet's profile stack as synthetic returns at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskletError::MemoryExhausted`] (clearing the sticky flag)
    /// if a prior `enter`/`leave` event dropped itself for lack of arena
    /// space; the flush and disable still happen first so nothing already
    /// recorded is lost.
    pub fn disable(&mut self, now: i64) -> Result<()> {
        self.flush_unmatched(now);
        self.enabled = false;
        self.stacks.clear();
        self.current_tasklet = None;
        trace!("profiler disabled");
        self.check_memory_exhausted()
    }

    /// Discards all collected statistics and frees all contexts and
    /// entries, after flushing any still-open contexts at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskletError::MemoryExhausted`] (clearing the sticky flag)
    /// if a prior `enter`/`leave` event dropped itself for lack of arena
    /// space; the clear still happens first, so the sticky condition itself
    /// is among the state discarded.
    pub fn clear(&mut self, now: i64) -> Result<()> {
        self.flush_unmatched(now);
        self.entries.clear();
        self.creation_order.clear();
        self.stacks.clear();
        self.current_tasklet = None;
        self.nomemory = false;
        trace!("profiler cleared");
        Ok(())
    }

    /// Returns `true` (and clears the flag) if a memory-exhaustion
    /// condition was recorded by an event handler since the last check.
    pub fn take_memory_exhausted(&mut self) -> bool {
        std::mem::take(&mut self.nomemory)
    }

    fn check_memory_exhausted(&mut self) -> Result<()> {
        if self.take_memory_exhausted() {
            return Err(TaskletError::MemoryExhausted);
        }
        Ok(())
    }

    /// Records a CALL event. `now` must come from the same `TimeSource`
    /// used for every other event on this profiler.
    pub fn enter(&mut self, tasklet: TaskletId, key: EntryKey, kind: CallableKind, user_obj: &str, now: i64) {
        if !self.enabled {
            return;
        }
        if kind == CallableKind::Native && !self.builtins {
            return;
        }
        if self.entries.len() >= u32::MAX as usize {
            self.nomemory = true;
            warn!("profiler entry arena exhausted; dropping event");
            return;
        }

        self.refresh_current_stack(tasklet, now);

        if self.entries.get(&key).is_none() {
            self.entries.add(key, ProfilerEntry::new(user_obj.to_string()));
            self.creation_order.push(key);
        }

        let caller_key = self
            .stacks
            .get(&tasklet)
            .and_then(|s| s.stack.last())
            .map(|c| c.entry);

        if self.subcalls {
            if let Some(caller_key) = caller_key {
                if let Some(caller_entry) = self.entries.get_mut(&caller_key) {
                    if caller_entry.subentries.get(&key).is_none() {
                        caller_entry.subentries.add(key, ProfilerSubEntry::new(user_obj.to_string()));
                    }
                }
            }
        }

        let recursion_level = {
            let entry = self.entries.get_mut(&key).expect("entry just ensured present");
            entry.recursion_level += 1;
            entry.recursion_level
        };

        if self.stacks.get(&tasklet).is_none() {
            self.stacks.add(tasklet, ProfilerStack::new());
        }
        let stack = self.stacks.get_mut(&tasklet).expect("stack just ensured present");

        let (is_recursion, is_subcall_recursion) =
            classify_recursion(&stack.stack, key, caller_key, recursion_level, self.subcalls);

        stack.stack.push(ProfilerContext {
            entry: key,
            caller: caller_key,
            t0: now,
            subt: 0,
            paused: 0,
            is_recursion,
            is_subcall_recursion,
        });
    }

    /// Records a RETURN event for `key`, which must match the innermost
    /// context pushed by the matching `enter` on `tasklet`.
    pub fn leave(&mut self, tasklet: TaskletId, key: EntryKey, now: i64) {
        if !self.enabled {
            return;
        }
        self.refresh_current_stack(tasklet, now);

        let Some(ctx) = self.stacks.get_mut(&tasklet).and_then(|s| s.stack.pop()) else {
            return;
        };
        debug_assert_eq!(ctx.entry, key, "leave() key must match the innermost enter()");
        self.record_return(tasklet, ctx, now);
    }

    /// Snapshots statistics in entry-creation order, scaling raw ticks by
    /// `unit` (seconds per tick).
    ///
    /// # Errors
    ///
    /// Returns [`TaskletError::MemoryExhausted`] (clearing the sticky flag)
    /// if a prior `enter`/`leave` event dropped itself for lack of arena
    /// space; no snapshot is taken in that case, since it would be missing
    /// the dropped event.
    pub fn getstats(&mut self, unit: f64) -> Result<Vec<EntryStats>> {
        self.check_memory_exhausted()?;
        let order = self.creation_order.clone();
        let subcalls_enabled = self.subcalls;
        let mut out = Vec::with_capacity(order.len());

        for key in order {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };

            let subcalls = if subcalls_enabled {
                let mut sub_keys = Vec::new();
                entry.subentries.enumerate(|k, _| sub_keys.push(*k));
                let mut subs = Vec::with_capacity(sub_keys.len());
                for sub_key in sub_keys {
                    if let Some(sub) = entry.subentries.get_mut(&sub_key) {
                        subs.push(SubEntryStats {
                            user_obj: sub.user_obj.clone(),
                            call_count: sub.call_count,
                            recursive_call_count: sub.recursive_call_count,
                            total_time: sub.total_time as f64 * unit,
                            inline_time: sub.inline_time as f64 * unit,
                        });
                    }
                }
                Some(subs)
            } else {
                None
            };

            out.push(EntryStats {
                user_obj: entry.user_obj.clone(),
                call_count: entry.call_count,
                recursive_call_count: entry.recursive_call_count,
                total_time: entry.total_time as f64 * unit,
                inline_time: entry.inline_time as f64 * unit,
                subcalls,
            });
        }

        Ok(out)
    }

    /// Stack selection per `spec.md` §4.3: if the tasklet currently driving
    /// events differs from last time, the previously-current stack records
    /// when it stopped being current, and the newly-current stack's
    /// innermost context absorbs the elapsed time as `paused`.
    fn refresh_current_stack(&mut self, tasklet: TaskletId, now: i64) {
        if self.current_tasklet == Some(tasklet) {
            return;
        }
        if let Some(prev_id) = self.current_tasklet {
            if let Some(prev_stack) = self.stacks.get_mut(&prev_id) {
                prev_stack.t0_snapshot = now;
            }
        }
        if self.stacks.get(&tasklet).is_none() {
            self.stacks.add(tasklet, ProfilerStack::new());
        }
        let new_stack = self.stacks.get_mut(&tasklet).expect("stack just ensured present");
        if let Some(ctx) = new_stack.stack.last_mut() {
            ctx.paused = ctx.paused.saturating_add(now.saturating_sub(new_stack.t0_snapshot));
        }
        self.current_tasklet = Some(tasklet);
    }

    fn flush_unmatched(&mut self, now: i64) {
        let tasklet_ids: Vec<TaskletId> = {
            let mut ids = Vec::new();
            self.stacks.enumerate(|k, _| ids.push(*k));
            ids
        };
        for tasklet in tasklet_ids {
            while let Some(ctx) = self.stacks.get_mut(&tasklet).and_then(|s| s.stack.pop()) {
                self.record_return(tasklet, ctx, now);
            }
        }
    }

    fn record_return(&mut self, tasklet: TaskletId, ctx: ProfilerContext, now: i64) {
        let tt = (now - ctx.t0 - ctx.paused).max(0);
        let it = (tt - ctx.subt).max(0);

        if let Some(entry) = self.entries.get_mut(&ctx.entry) {
            entry.recursion_level = entry.recursion_level.saturating_sub(1);
            entry.call_count = entry.call_count.saturating_add(1);
            entry.inline_time = entry.inline_time.saturating_add(it);
            if ctx.is_recursion {
                entry.recursive_call_count = entry.recursive_call_count.saturating_add(1);
            } else {
                entry.total_time = entry.total_time.saturating_add(tt);
            }
        }

        if self.subcalls {
            if let Some(caller_key) = ctx.caller {
                if let Some(caller_entry) = self.entries.get_mut(&caller_key) {
                    if let Some(sub) = caller_entry.subentries.get_mut(&ctx.entry) {
                        sub.call_count = sub.call_count.saturating_add(1);
                        sub.inline_time = sub.inline_time.saturating_add(it);
                        if ctx.is_subcall_recursion {
                            sub.recursive_call_count = sub.recursive_call_count.saturating_add(1);
                        } else {
                            sub.total_time = sub.total_time.saturating_add(tt);
                        }
                    }
                }
            }
        }

        if let Some(stack) = self.stacks.get_mut(&tasklet) {
            if let Some(parent) = stack.stack.last_mut() {
                parent.subt = parent.subt.saturating_add(tt);
            }
        }
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursion classification per `spec.md` §4.3: given the freshly
/// incremented `recursion_level`, scans the tasklet's own stack for an
/// ancestor pointing at the same entry, additionally checking the
/// ancestor's caller for subcall-recursion.
fn classify_recursion(
    stack: &[ProfilerContext],
    key: EntryKey,
    caller_key: Option<EntryKey>,
    recursion_level: u32,
    subcalls: bool,
) -> (bool, bool) {
    if recursion_level <= 1 {
        return (false, false);
    }
    for ctx in stack.iter().rev() {
        if ctx.entry == key {
            let is_subcall_recursion = subcalls && ctx.caller == caller_key;
            return (true, is_subcall_recursion);
        }
    }
    (false, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasklet::TaskletId;

    fn tasklet(n: u64) -> TaskletId {
        TaskletId::new(n)
    }

    #[test]
    fn simple_call_return_records_time() {
        let mut profiler = Profiler::new();
        profiler.enable(true, true).unwrap();
        let t1 = tasklet(1);
        let f = EntryKey(1);

        profiler.enter(t1, f, CallableKind::Interpreted, "f", 0);
        profiler.leave(t1, f, 100);

        let stats = profiler.getstats(1.0).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].call_count, 1);
        assert_eq!(stats[0].total_time, 100.0);
        assert_eq!(stats[0].inline_time, 100.0);
    }

    #[test]
    fn nested_call_subtracts_subcall_time_from_inline() {
        let mut profiler = Profiler::new();
        profiler.enable(true, true).unwrap();
        let t1 = tasklet(1);
        let f = EntryKey(1);
        let g = EntryKey(2);

        profiler.enter(t1, f, CallableKind::Interpreted, "f", 0);
        profiler.enter(t1, g, CallableKind::Interpreted, "g", 10);
        profiler.leave(t1, g, 40);
        profiler.leave(t1, f, 100);

        let stats = profiler.getstats(1.0).unwrap();
        let f_stats = stats.iter().find(|e| e.user_obj == "f").unwrap();
        let g_stats = stats.iter().find(|e| e.user_obj == "g").unwrap();
        assert_eq!(g_stats.total_time, 30.0);
        assert_eq!(f_stats.total_time, 100.0);
        assert_eq!(f_stats.inline_time, 70.0);
        assert_eq!(g_stats.total_time + f_stats.inline_time, f_stats.total_time);

        let subcalls = f_stats.subcalls.as_ref().unwrap();
        assert_eq!(subcalls.len(), 1);
        assert_eq!(subcalls[0].user_obj, "g");
        assert_eq!(subcalls[0].total_time, 30.0);
    }

    #[test]
    fn switching_tasklet_pauses_the_other_stacks_time() {
        let mut profiler = Profiler::new();
        profiler.enable(false, true).unwrap();
        let t1 = tasklet(1);
        let t2 = tasklet(2);
        let f = EntryKey(1);
        let h = EntryKey(2);

        profiler.enter(t1, f, CallableKind::Interpreted, "f", 0);
        // T1 yields to T2 at t=10; T2 runs h() for 50 ticks, then T1 resumes.
        profiler.enter(t2, h, CallableKind::Interpreted, "h", 10);
        profiler.leave(t2, h, 60);
        profiler.enter(t1, EntryKey(99), CallableKind::Interpreted, "noop", 60);
        profiler.leave(t1, EntryKey(99), 60);
        profiler.leave(t1, f, 70);

        let stats = profiler.getstats(1.0).unwrap();
        let f_stats = stats.iter().find(|e| e.user_obj == "f").unwrap();
        let h_stats = stats.iter().find(|e| e.user_obj == "h").unwrap();
        // f ran 0..10 and 60..70: 20 ticks of its own wall time, excluding
        // the 50 ticks it spent paused while T2's h() ran.
        assert_eq!(f_stats.total_time, 20.0);
        assert_eq!(h_stats.total_time, 50.0);
    }

    #[test]
    fn direct_recursion_only_counts_outermost_total_time() {
        let mut profiler = Profiler::new();
        profiler.enable(false, true).unwrap();
        let t1 = tasklet(1);
        let f = EntryKey(1);

        profiler.enter(t1, f, CallableKind::Interpreted, "f", 0);
        profiler.enter(t1, f, CallableKind::Interpreted, "f", 5);
        profiler.leave(t1, f, 15);
        profiler.leave(t1, f, 20);

        let stats = profiler.getstats(1.0).unwrap();
        let f_stats = &stats[0];
        assert_eq!(f_stats.call_count, 2);
        assert_eq!(f_stats.recursive_call_count, 1);
        assert_eq!(f_stats.total_time, 20.0);
    }

    #[test]
    fn disable_flushes_open_contexts_and_clears_recursion_level() {
        let mut profiler = Profiler::new();
        profiler.enable(false, true).unwrap();
        let t1 = tasklet(1);
        let f = EntryKey(1);
        profiler.enter(t1, f, CallableKind::Interpreted, "f", 0);
        profiler.disable(50).unwrap();

        let stats = profiler.getstats(1.0).unwrap();
        assert_eq!(stats[0].call_count, 1);
        assert_eq!(stats[0].total_time, 50.0);
    }

    #[test]
    fn builtins_false_ignores_native_events() {
        let mut profiler = Profiler::new();
        profiler.enable(false, false).unwrap();
        let t1 = tasklet(1);
        let native = EntryKey(1);
        profiler.enter(t1, native, CallableKind::Native, "native_fn", 0);
        profiler.leave(t1, native, 10);
        assert!(profiler.getstats(1.0).unwrap().is_empty());
    }

    #[test]
    fn sticky_memory_exhausted_is_reported_once_and_clears() {
        let mut profiler = Profiler::new();
        profiler.enable(true, true).unwrap();
        profiler.nomemory = true;

        let err = profiler.getstats(1.0).unwrap_err();
        assert!(matches!(err, TaskletError::MemoryExhausted));
        // The flag is sticky-once: the next call sees it cleared and
        // proceeds normally.
        assert!(profiler.getstats(1.0).is_ok());

        profiler.nomemory = true;
        let err = profiler.enable(true, true).unwrap_err();
        assert!(matches!(err, TaskletError::MemoryExhausted));
        assert!(profiler.enable(true, true).is_ok());

        profiler.nomemory = true;
        // disable() still performs its flush/uninstall before surfacing the
        // error, so the profiler is left disabled either way.
        let err = profiler.disable(0).unwrap_err();
        assert!(matches!(err, TaskletError::MemoryExhausted));
        assert!(!profiler.is_enabled());
    }
}
