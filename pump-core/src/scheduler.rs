//! Scheduling: reconnection backoff and bounded, resumable history-log fetch plans.
//!
//! Everything here is a pure function of its inputs so the host can compute delays and
//! batches without shared counters beyond its own session.

use std::time::Duration;

/// Attempts in the fast (exponential) reconnection phase.
pub const FAST_RECONNECT_ATTEMPTS: u32 = 10;

/// Exponent cap for the fast phase: delays stop growing after 2^5 seconds.
const FAST_BACKOFF_MAX_EXPONENT: u32 = 5;
const FAST_BACKOFF_BASE_MS: u64 = 1000;
const FAST_BACKOFF_CAP_MS: u64 = 32_000;

/// Fixed retry period once the fast phase is exhausted.
pub const SLOW_RECONNECT_INTERVAL: Duration = Duration::from_secs(120);

/// How many of the most recent history indices a fetch cycle considers.
pub const HISTORY_LOOKBACK_INDICES: u32 = 500;

/// Largest batch the pump accepts in one history-log request.
pub const MAX_HISTORY_BATCH: u8 = 20;

/// Fast-phase delay: `min(1000 * 2^min(attempt, 5), 32000)` ms.
pub fn fast_backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(FAST_BACKOFF_MAX_EXPONENT);
    let ms = (FAST_BACKOFF_BASE_MS << exponent).min(FAST_BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

/// Delay before reconnection attempt `attempt` (1-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    if attempt <= FAST_RECONNECT_ATTEMPTS {
        fast_backoff_delay(attempt)
    } else {
        SLOW_RECONNECT_INTERVAL
    }
}

/// Index range the pump reports as available (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct HistoryRange {
    pub count: u32,
    pub first: u32,
    pub last: u32,
}

impl HistoryRange {
    /// First index of the lookback window: the last `lookback` indices, clamped to what exists.
    pub fn window_start(&self, lookback: u32) -> u32 {
        let span = lookback.max(1) - 1;
        self.last.saturating_sub(span).max(self.first)
    }
}

/// Where the next fetch should begin, or `None` when the saved cursor is already caught up.
///
/// A saved index inside `[window_start, last]` is resumed; anything else (stale, or the
/// range moved under us) restarts at the window boundary.
pub fn history_fetch_start(range: HistoryRange, saved: Option<u32>, lookback: u32) -> Option<u32> {
    if range.count == 0 {
        return None;
    }
    let window_start = range.window_start(lookback);
    match saved {
        Some(next) if next >= window_start && next <= range.last => Some(next),
        Some(next) if range.last.checked_add(1) == Some(next) => None,
        _ => Some(window_start),
    }
}

/// One history-log request: `count` indices starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryBatch {
    pub start: u32,
    pub count: u8,
}

impl HistoryBatch {
    /// History-log request cargo: `start(u32 LE) | count(u8)`.
    pub fn cargo(&self) -> [u8; 5] {
        let s = self.start.to_le_bytes();
        [s[0], s[1], s[2], s[3], self.count]
    }

    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.count as u32)
    }
}

/// Split `[start, last]` into batches of at most `batch_size`, covering at most `max_records`.
pub fn plan_history_batches(
    start: u32,
    last: u32,
    batch_size: u8,
    max_records: u32,
) -> Vec<HistoryBatch> {
    let batch_size = batch_size.clamp(1, MAX_HISTORY_BATCH) as u32;
    if start > last || max_records == 0 {
        return vec![];
    }
    let total = (last - start).saturating_add(1).min(max_records);
    let mut out = Vec::with_capacity(total.div_ceil(batch_size) as usize);
    let mut offset = 0u32;
    while offset < total {
        let count = batch_size.min(total - offset);
        out.push(HistoryBatch {
            start: start + offset,
            count: count as u8,
        });
        offset += count;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_phase_delays() {
        let delays: Vec<u64> = (1..=FAST_RECONNECT_ATTEMPTS)
            .map(|a| reconnect_delay(a).as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![2000, 4000, 8000, 16000, 32000, 32000, 32000, 32000, 32000, 32000]
        );
        assert_eq!(delays.iter().sum::<u64>(), 222_000);
    }

    #[test]
    fn slow_phase_after_fast_exhausted() {
        assert_eq!(reconnect_delay(11), SLOW_RECONNECT_INTERVAL);
        assert_eq!(reconnect_delay(500), Duration::from_secs(120));
        assert_eq!(fast_backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(fast_backoff_delay(u32::MAX), Duration::from_millis(32_000));
    }

    fn range(first: u32, last: u32) -> HistoryRange {
        HistoryRange {
            count: last - first + 1,
            first,
            last,
        }
    }

    #[test]
    fn resume_inside_window() {
        let r = range(0, 1000);
        assert_eq!(r.window_start(100), 901);
        assert_eq!(history_fetch_start(r, Some(950), 100), Some(950));
        assert_eq!(history_fetch_start(r, Some(901), 100), Some(901));
        assert_eq!(history_fetch_start(r, Some(1000), 100), Some(1000));
    }

    #[test]
    fn restart_outside_window() {
        let r = range(0, 1000);
        assert_eq!(history_fetch_start(r, Some(10), 100), Some(901));
        assert_eq!(history_fetch_start(r, Some(5000), 100), Some(901));
        assert_eq!(history_fetch_start(r, None, 100), Some(901));
    }

    #[test]
    fn caught_up_cursor_fetches_nothing() {
        assert_eq!(history_fetch_start(range(0, 1000), Some(1001), 100), None);
        let empty = HistoryRange {
            count: 0,
            first: 0,
            last: 0,
        };
        assert_eq!(history_fetch_start(empty, None, 100), None);
    }

    #[test]
    fn window_clamped_to_first_index() {
        let r = range(40, 60);
        assert_eq!(r.window_start(500), 40);
        assert_eq!(history_fetch_start(r, Some(39), 500), Some(40));
    }

    #[test]
    fn batches_respect_size_and_record_cap() {
        let batches = plan_history_batches(100, 149, 20, 200);
        assert_eq!(
            batches,
            vec![
                HistoryBatch { start: 100, count: 20 },
                HistoryBatch { start: 120, count: 20 },
                HistoryBatch { start: 140, count: 10 },
            ]
        );
        let capped = plan_history_batches(0, 999, 50, 45);
        assert_eq!(capped.iter().map(|b| b.count as u32).sum::<u32>(), 45);
        assert!(capped.iter().all(|b| b.count <= MAX_HISTORY_BATCH));
        assert!(plan_history_batches(10, 9, 20, 200).is_empty());
    }

    #[test]
    fn batch_cargo_layout() {
        let b = HistoryBatch {
            start: 0x0102_0304,
            count: 20,
        };
        assert_eq!(b.cargo(), [0x04, 0x03, 0x02, 0x01, 20]);
        assert_eq!(b.end(), 0x0102_0304 + 20);
    }
}
