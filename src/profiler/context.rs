//! Per-tasklet profile stacks: [`ProfilerContext`] (one per active call) and
//! [`ProfilerStack`] (one per tasklet), per `spec.md` §3.

use crate::profiler::entry::EntryKey;

/// One active call frame on a tasklet's profile stack.
pub struct ProfilerContext {
    pub entry: EntryKey,
    /// The caller's entry, if this call was observed with a caller on the
    /// same tasklet's stack; used to attribute the sub-entry edge.
    pub caller: Option<EntryKey>,
    /// Timestamp this context was pushed.
    pub t0: i64,
    /// Time consumed by completed sub-calls, accumulated as children return.
    pub subt: i64,
    /// Time accumulated while the owning tasklet was not the current one.
    pub paused: i64,
    pub is_recursion: bool,
    pub is_subcall_recursion: bool,
}

/// The profile stack belonging to one tasklet.
pub struct ProfilerStack {
    pub stack: Vec<ProfilerContext>,
    /// Timestamp at which this stack last became non-current; used to
    /// compute how long its innermost context was paused once it resumes.
    pub t0_snapshot: i64,
}

impl ProfilerStack {
    pub(crate) fn new() -> Self {
        Self {
            stack: Vec::new(),
            t0_snapshot: 0,
        }
    }
}

impl Default for ProfilerStack {
    fn default() -> Self {
        Self::new()
    }
}
