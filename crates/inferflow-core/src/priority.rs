//! Effective-priority encoding for packages and pool tasks.
//!
//! Smaller values dispatch first. A package priority is a single `i64` with
//! three fields packed into it:
//!
//! - the session's base priority in the high bits (dominates everything),
//! - a pipeline-stage tier in the middle (a package already inside the
//!   pipeline drains ahead of same-base new arrivals),
//! - a per-request offset in the low bits (the cache passes `-request_id`,
//!   so older requests sort ahead at equal base).
//!
//! The stage step is strictly smaller than one base unit, so advancing a
//! package through its stages can never cross a base-priority boundary.

const BASE_SHIFT: u32 = 48;
const STAGE_STEP: i64 = 1 << 40;
/// Offsets are clamped below the stage tier.
const OFFSET_MAX: i64 = (1 << 39) - 1;

/// Base priority of one executor, fixed at session-description time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    base: i32,
}

impl Priority {
    /// Create a base priority. Smaller is higher; the base is clamped to
    /// `[-127, 127]` so the packed encoding cannot overflow.
    #[must_use]
    pub fn new(base: i32) -> Self {
        Self {
            base: base.clamp(-127, 127),
        }
    }

    /// Effective priority for a package with the given offset.
    ///
    /// Callers pass `-request_id`: the subtraction turns that into
    /// `+request_id`, so older (smaller id) requests get smaller values and
    /// dispatch first at equal base.
    #[must_use]
    pub fn get(&self, offset: i64) -> i64 {
        (i64::from(self.base) << BASE_SHIFT) - offset.clamp(-OFFSET_MAX, OFFSET_MAX)
    }

    /// Advance a package one pipeline tier: later stages dispatch ahead of
    /// same-base packages still waiting to enter the pipeline.
    #[must_use]
    pub fn next(effective: i64) -> i64 {
        effective - STAGE_STEP
    }

    #[must_use]
    pub fn base(&self) -> i32 {
        self.base
    }
}
