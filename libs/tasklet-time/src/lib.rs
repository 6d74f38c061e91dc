// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The monotonic clock shared by the profiler and the watchdog.
//!
//! By default [`TimeSource`] wraps [`std::time::Instant`]. Callers may instead
//! install a user-supplied timer callable, matching the `externalTimer` hook
//! of a call-graph profiler: the callable either returns raw integer ticks
//! (interpreted using a caller-supplied `unit`) or a floating point number of
//! seconds (scaled to ticks with a fixed precision so it is comparable to the
//! default clock's resolution).
//!
//! A panicking or misbehaving user timer must never abort the observation it
//! is backing: failures are reported through `tracing` and the sample is
//! substituted with zero, matching the "unraisable" diagnostic discipline
//! used throughout the rest of the runtime.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

/// Precision used to convert a user timer's floating point seconds sample
/// into integer ticks: `2**32`.
pub const DOUBLE_TIMER_PRECISION: f64 = 4_294_967_296.0;

/// A single sample returned by a user-supplied timer callable.
#[derive(Debug, Clone, Copy)]
pub enum UserSample {
    /// Raw ticks, interpreted using the [`TimeSource`]'s configured `unit`.
    Ticks(i64),
    /// Seconds, scaled internally by [`DOUBLE_TIMER_PRECISION`].
    Seconds(f64),
}

enum Mode {
    Monotonic { epoch: Instant },
    User {
        sample: Box<dyn FnMut() -> UserSample + Send>,
        expects_ticks: bool,
        unit: f64,
    },
}

/// A monotonic high-resolution time source, optionally backed by a
/// user-supplied timer.
pub struct TimeSource {
    mode: Mode,
}

impl fmt::Debug for TimeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            Mode::Monotonic { .. } => f.debug_struct("TimeSource").field("mode", &"monotonic").finish(),
            Mode::User { unit, .. } => f
                .debug_struct("TimeSource")
                .field("mode", &"user")
                .field("unit", unit)
                .finish(),
        }
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::monotonic()
    }
}

impl TimeSource {
    /// Creates a time source backed by the platform's monotonic clock.
    #[must_use]
    pub fn monotonic() -> Self {
        Self {
            mode: Mode::Monotonic {
                epoch: Instant::now(),
            },
        }
    }

    /// Installs a user-supplied timer that returns raw integer ticks.
    ///
    /// `unit` is the number of seconds represented by one tick and must be
    /// positive; [`TimeSource::unit`] reports it back for callers that scale
    /// reported statistics (e.g. the profiler's `getstats`).
    pub fn with_integer_timer(unit: f64, timer: impl FnMut() -> UserSample + Send + 'static) -> Self {
        assert!(unit > 0.0, "timer unit must be positive");
        Self {
            mode: Mode::User {
                sample: Box::new(timer),
                expects_ticks: true,
                unit,
            },
        }
    }

    /// Installs a user-supplied timer that returns a floating point number of
    /// seconds. Samples are scaled by [`DOUBLE_TIMER_PRECISION`] into ticks.
    pub fn with_float_timer(timer: impl FnMut() -> UserSample + Send + 'static) -> Self {
        Self {
            mode: Mode::User {
                sample: Box::new(timer),
                expects_ticks: false,
                unit: 1.0 / DOUBLE_TIMER_PRECISION,
            },
        }
    }

    /// Returns the current time in ticks. Strictly non-decreasing within a
    /// single call thread for the monotonic mode; a user timer's return value
    /// is taken on faith (the profiler does not require it to be monotonic,
    /// only that differences are meaningful).
    pub fn now(&mut self) -> i64 {
        match &mut self.mode {
            Mode::Monotonic { epoch } => {
                i64::try_from(epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
            }
            Mode::User {
                sample,
                expects_ticks,
                ..
            } => {
                let expects_ticks = *expects_ticks;
                match panic::catch_unwind(AssertUnwindSafe(|| sample())) {
                    Ok(UserSample::Ticks(ticks)) if expects_ticks => ticks,
                    Ok(UserSample::Seconds(secs)) if !expects_ticks => {
                        #[allow(clippy::cast_possible_truncation, reason = "ticks intentionally truncate sub-tick fractional precision")]
                        let ticks = (secs * DOUBLE_TIMER_PRECISION) as i64;
                        ticks
                    }
                    Ok(_) => {
                        tracing::warn!(
                            "user timer returned a sample that doesn't match its configured unit; substituting 0"
                        );
                        0
                    }
                    Err(_) => {
                        tracing::warn!("user timer panicked; substituting 0 for this sample");
                        0
                    }
                }
            }
        }
    }

    /// Seconds represented by one tick of [`TimeSource::now`].
    #[must_use]
    pub fn unit(&self) -> f64 {
        match &self.mode {
            Mode::Monotonic { .. } => 1e-9,
            Mode::User { unit, .. } => *unit,
        }
    }
}
