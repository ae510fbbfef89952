//! Poll cursor for the long-poll feed.
//!
//! Telegram confirms every update with `update_id < offset`, so the cursor
//! always requests `last_seen_id + 1`. Ids only grow while the feed is live;
//! after a week without updates Telegram may restart numbering, so a stale
//! cursor adopts whatever id arrives next instead of keeping the maximum.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Offset requested before any update has been seen.
pub const INITIAL_OFFSET: i64 = 1;

#[derive(Debug, Clone)]
pub struct OffsetTracker {
    offset: i64,
    last_seen_id: i64,
    last_seen_at: Option<DateTime<Utc>>,
    reset_window: chrono::Duration,
}

impl OffsetTracker {
    pub fn new(reset_window: Duration) -> Self {
        Self {
            offset: INITIAL_OFFSET,
            last_seen_id: 0,
            last_seen_at: None,
            reset_window: chrono::Duration::from_std(reset_window)
                .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100)),
        }
    }

    /// Record one update. Must be called once per update, in arrival order.
    pub fn advance(&mut self, update_id: i64, event_time: Option<DateTime<Utc>>) {
        self.advance_at(update_id, event_time, Utc::now());
    }

    /// [`advance`](Self::advance) against an explicit clock.
    pub fn advance_at(
        &mut self,
        update_id: i64,
        event_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let fresh = match self.last_seen_at {
            None => true,
            Some(at) => now.signed_duration_since(at) <= self.reset_window,
        };
        self.last_seen_id = if fresh {
            self.last_seen_id.max(update_id)
        } else {
            update_id
        };
        if event_time.is_some() {
            self.last_seen_at = event_time;
        }
        self.offset = self.last_seen_id + 1;
    }

    pub fn current_offset(&self) -> i64 {
        self.offset
    }

    pub fn last_seen_id(&self) -> i64 {
        self.last_seen_id
    }

    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.last_seen_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn starts_at_initial_offset() {
        let tracker = OffsetTracker::new(WEEK);
        assert_eq!(tracker.current_offset(), INITIAL_OFFSET);
        assert_eq!(tracker.last_seen_at(), None);
    }

    #[test]
    fn increasing_ids_end_at_max_plus_one() {
        let mut tracker = OffsetTracker::new(WEEK);
        for (i, id) in [10, 11, 15, 40].into_iter().enumerate() {
            tracker.advance_at(id, Some(at(i as i64)), at(i as i64 + 1));
        }
        assert_eq!(tracker.current_offset(), 41);
        assert_eq!(tracker.last_seen_id(), 40);
    }

    #[test]
    fn reordering_within_window_keeps_maximum() {
        let mut tracker = OffsetTracker::new(WEEK);
        tracker.advance_at(20, Some(at(0)), at(1));
        tracker.advance_at(18, Some(at(1)), at(2));
        assert_eq!(tracker.current_offset(), 21);
    }

    #[test]
    fn stale_cursor_adopts_next_id_as_baseline() {
        let mut tracker = OffsetTracker::new(WEEK);
        tracker.advance_at(5_000, Some(at(0)), at(0));
        let eight_days = 8 * 24 * 60 * 60;
        tracker.advance_at(12, Some(at(eight_days)), at(eight_days));
        assert_eq!(tracker.last_seen_id(), 12);
        assert_eq!(tracker.current_offset(), 13);
    }

    #[test]
    fn cursor_exactly_at_window_edge_is_still_fresh() {
        let mut tracker = OffsetTracker::new(Duration::from_secs(60));
        tracker.advance_at(100, Some(at(0)), at(0));
        tracker.advance_at(3, Some(at(60)), at(60));
        assert_eq!(tracker.current_offset(), 101);
    }

    #[test]
    fn update_without_timestamp_keeps_previous_time() {
        let mut tracker = OffsetTracker::new(WEEK);
        tracker.advance_at(7, Some(at(0)), at(0));
        tracker.advance_at(8, None, at(1));
        assert_eq!(tracker.last_seen_at(), Some(at(0)));
        assert_eq!(tracker.current_offset(), 9);
    }

    #[test]
    fn later_updates_in_a_batch_see_earlier_state() {
        // The first update of the batch refreshes the clock, so the second
        // one is merged monotonically even though the cursor was stale.
        let mut tracker = OffsetTracker::new(Duration::from_secs(60));
        tracker.advance_at(900, Some(at(0)), at(0));
        tracker.advance_at(4, Some(at(3_600)), at(3_600));
        tracker.advance_at(2, Some(at(3_601)), at(3_601));
        assert_eq!(tracker.current_offset(), 5);
    }
}
