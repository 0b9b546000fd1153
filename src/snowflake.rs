//! Follower-list pagination cursors in this API family are snowflake-like
//! identifiers: the upper bits carry the creation time of the follow edge the
//! cursor points at. Converting a cursor back to a timestamp gives a coarse
//! "when did this person follow" estimate for followers the precise-time
//! cache has not reached.
//!
//! Precision limits: the embedded time is when the follow *edge* was created,
//! so unfollowing and re-following resets it; cursors predating the epoch
//! constant carry no time at all; and the value dates the page boundary, not
//! any individual list entry, so it is only an approximation for the entry
//! adjacent to the boundary. It is a display fallback, never an input to the
//! glitch filter when a directly observed timestamp exists.

/// Epoch (ms) that snowflake identifiers count from.
const SNOWFLAKE_EPOCH_MS: i64 = 1_288_834_974_657;

/// Number of low bits holding worker/sequence data rather than time.
const SNOWFLAKE_TIME_SHIFT: u32 = 22;

/// Extract the coarse follow-edge creation time (epoch ms) embedded in a
/// pagination cursor. Returns `None` for non-numeric, non-positive, or
/// pre-snowflake cursors (including the sentinel values "-1" and "0").
pub fn follow_time_from_cursor(cursor: &str) -> Option<i64> {
    let raw: i64 = cursor.parse().ok()?;
    if raw <= 0 {
        return None;
    }
    let ms = (raw >> SNOWFLAKE_TIME_SHIFT) + SNOWFLAKE_EPOCH_MS;
    // A cursor whose time field is zero is not a snowflake at all.
    if ms <= SNOWFLAKE_EPOCH_MS {
        return None;
    }
    Some(ms)
}
