//! Tick-based cooperative preemption, per `spec.md` §4.6.
//!
//! Grounded against `examples/original_source/Stackless/module/stacklessmodule.c`'s
//! `interrupt_timeout_return` / `PyStackless_RunWatchdog`: the interrupt
//! hook's deferral-condition ordering (atomic, `schedlock`, nesting,
//! `switch_trap`, `SOFT` mode) and the hard/soft return-value distinction
//! are carried over unchanged.

use bitflags::bitflags;
use tracing::trace;

use crate::runtime::TaskletRuntimeState;
use crate::tasklet::TaskletId;
use crate::value::Value;

bitflags! {
    /// `run(timeout, flags)`'s watchdog mode flags, per `spec.md` §4.6.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct WatchdogFlags: u32 {
        /// The thread may block waiting for cross-thread channel wake-ups
        /// when no runnables remain.
        const THREADBLOCK    = 1 << 0;
        /// Never hard-interrupt; only cooperative yields observe the
        /// deadline.
        const SOFT           = 1 << 1;
        /// Treat `nesting_level` as zero for interrupt purposes.
        const IGNORE_NESTING = 1 << 2;
        /// `timeout` is a wall-clock budget for the entire run, not a
        /// per-tasklet slice.
        const TOTALTIMEOUT   = 1 << 3;
    }
}

/// Per-runtime watchdog state: `ticker`/`interval` countdown, active mode
/// flags, and the interrupted victim (if any), per `spec.md` §3.
#[derive(Debug, Default)]
pub struct WatchdogDriver {
    pub(crate) ticker: i64,
    pub(crate) interval: i64,
    pub(crate) runflags: WatchdogFlags,
    pub(crate) interrupted: Option<TaskletId>,
    armed: bool,
}

impl WatchdogDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm(&mut self, timeout: i64, flags: WatchdogFlags) {
        self.ticker = timeout;
        self.interval = timeout;
        self.runflags = flags;
        self.interrupted = None;
        self.armed = timeout > 0;
    }

    fn interrupt_hook(rt: &mut TaskletRuntimeState, current: TaskletId) {
        let defer = rt.is_atomic(current)
            || rt.schedlock() != 0
            || (!rt.watchdog.runflags.contains(WatchdogFlags::IGNORE_NESTING) && rt.nesting_level != 0)
            || rt.switch_trap_level() != 0
            || rt.watchdog.runflags.contains(WatchdogFlags::SOFT);

        if defer {
            trace!(tasklet = current.as_u64(), "watchdog deferred, tasklet not at a safe point");
            rt.set_pending_irq(current);
            rt.watchdog.ticker = rt.watchdog.interval;
            return;
        }

        trace!(tasklet = current.as_u64(), "watchdog interrupt delivered");
        rt.watchdog.interrupted = Some(current);
        rt.watchdog.armed = false;
    }

    /// Runs the watchdog loop: repeatedly schedules runnable peers (`main`
    /// has already been removed from the queue by the caller), ticking the
    /// watchdog after each switch. Returns as soon as either no runnable
    /// peers remain, the ticker is exhausted and the interrupt is actually
    /// delivered, or the ticker is exhausted but deferred — a deferral
    /// returns `None` immediately rather than re-arming and spinning inside
    /// this same call, so `run` is always bounded by `timeout` switches.
    pub(crate) fn run(rt: &mut TaskletRuntimeState) -> Option<TaskletId> {
        loop {
            if rt.runcount() == 0 {
                rt.watchdog.armed = false;
                return None;
            }

            if rt.schedule(Value::Unit).is_err() {
                rt.watchdog.armed = false;
                return None;
            }

            if !rt.watchdog.armed {
                continue;
            }

            let Some(now_current) = rt.current() else {
                return None;
            };

            rt.watchdog.ticker -= 1;
            if rt.watchdog.ticker > 0 {
                continue;
            }

            Self::interrupt_hook(rt, now_current);

            if let Some(victim) = rt.watchdog.interrupted.take() {
                if rt.watchdog.runflags.contains(WatchdogFlags::SOFT) {
                    // Soft mode: victim is left in place, `None` is
                    // returned, per `spec.md` §4.6.
                    return None;
                }
                return Some(victim);
            }

            // Deferred: the caller may `run()` again to keep watching: the
            // ticker was already reset by `interrupt_hook`.
            return None;
        }
    }
}
