//! Per-credential-set quota bookkeeping. The external API allots a fixed
//! number of calls per window; polling a given account costs a known number
//! of calls per cycle, so the next safe poll time can be spread evenly over
//! what is left of the window instead of burning the whole allotment at the
//! window's start.

use crate::twitter::RateLimitStatus;

/// Computes the earliest timestamp (epoch ms) at which the account may be
/// polled again without exceeding quota.
///
/// With `remaining_checks = remaining_calls / calls_per_cycle` full cycles
/// left in the window, the next check lands at
/// `now + (reset_at - now) / (remaining_checks + 1)`, pulled back by the
/// safety margin so a check never races the reset boundary. With no full
/// cycle left, the next check is exactly the reset time.
pub fn next_check_at(
    remaining_calls: u64,
    reset_at_ms: i64,
    calls_per_cycle: u64,
    now_ms: i64,
    safety_margin_ms: i64,
) -> i64 {
    let remaining_checks = remaining_calls / calls_per_cycle.max(1);
    if remaining_checks == 0 {
        return reset_at_ms;
    }

    let window_ms = (reset_at_ms - now_ms).max(0);
    let spread = window_ms / (remaining_checks as i64 + 1);
    let at = now_ms + spread - safety_margin_ms;

    // Never before now, never past the margin-adjusted reset.
    at.clamp(now_ms + 1, (reset_at_ms - safety_margin_ms).max(now_ms + 1))
}

/// Rate-limit view of one credential set during a single polling pass, fed
/// from the latest response headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaWindow {
    pub remaining: Option<u64>,
    pub reset_at_ms: Option<i64>,
}

impl QuotaWindow {
    pub fn update(&mut self, status: RateLimitStatus) {
        if status.remaining.is_some() {
            self.remaining = status.remaining;
        }
        if status.reset_at_ms.is_some() {
            self.reset_at_ms = status.reset_at_ms;
        }
    }

    /// True once the headers say no calls are left in this window.
    pub fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Reset time to wait for when this window is exhausted; falls back to
    /// `default_ms` when no header was ever seen.
    pub fn reset_or(&self, default_ms: i64) -> i64 {
        self.reset_at_ms.unwrap_or(default_ms)
    }
}
