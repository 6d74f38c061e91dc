//! Per-callable statistics: [`ProfilerEntry`] (one per observed callable) and
//! its nested [`ProfilerSubEntry`] (one per distinct caller→callee edge),
//! per `spec.md` §3/§4.3.

use tasklet_map::OrderedMap;

/// Opaque identity of an observed callable, supplied by whoever drives
/// `enter`/`leave` events (an interpreted code identity or a native
/// callable's registration id). Must be unique per distinct callable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey(pub u64);

/// Whether an observed callable is interpreted or native, used to apply the
/// `builtins` filter from `enable(subcalls, builtins)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallableKind {
    Interpreted,
    Native,
}

/// Call-graph statistics for one callable, keyed by [`EntryKey`] in
/// [`super::Profiler`]'s top-level `OrderedMap`.
pub struct ProfilerEntry {
    pub user_obj: String,
    /// Cumulative total time including subcalls, in ticks.
    pub total_time: i64,
    /// Cumulative inline time excluding subcalls, in ticks.
    pub inline_time: i64,
    pub call_count: u64,
    pub recursive_call_count: u64,
    /// Active call depth on any tasklet's stack; `0` outside any call.
    pub recursion_level: u32,
    pub subentries: OrderedMap<EntryKey, ProfilerSubEntry>,
}

impl ProfilerEntry {
    pub(crate) fn new(user_obj: String) -> Self {
        Self {
            user_obj,
            total_time: 0,
            inline_time: 0,
            call_count: 0,
            recursive_call_count: 0,
            recursion_level: 0,
            subentries: OrderedMap::new(),
        }
    }
}

/// Statistics for one caller→callee edge, nested inside the caller's
/// [`ProfilerEntry`].
pub struct ProfilerSubEntry {
    pub user_obj: String,
    pub total_time: i64,
    pub inline_time: i64,
    pub call_count: u64,
    pub recursive_call_count: u64,
}

impl ProfilerSubEntry {
    pub(crate) fn new(user_obj: String) -> Self {
        Self {
            user_obj,
            total_time: 0,
            inline_time: 0,
            call_count: 0,
            recursive_call_count: 0,
        }
    }
}
