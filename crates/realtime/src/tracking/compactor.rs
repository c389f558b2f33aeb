// Session list compaction for daily presence records.
//
// Zero-duration sessions are discarded, which includes any session still
// open. If more than `MAX_SESSIONS` remain, everything except the
// `KEEP_RECENT` latest (by connect time) folds into a single merged entry
// at the front. Total duration is conserved either way.

use atelier_common::usage::Session;

pub const MAX_SESSIONS: usize = 10;
pub const KEEP_RECENT: usize = MAX_SESSIONS - 1;

pub fn compact(sessions: &[Session]) -> Vec<Session> {
    let mut live: Vec<Session> =
        sessions.iter().filter(|session| session.duration_ms() != 0).cloned().collect();
    if live.len() <= MAX_SESSIONS {
        return live;
    }

    live.sort_by_key(Session::connect_time);
    let recent = live.split_off(live.len() - KEEP_RECENT);

    let mut compacted = Vec::with_capacity(MAX_SESSIONS);
    compacted.push(merge(&live));
    compacted.extend(recent);
    compacted
}

/// Folds a non-empty run of closed sessions into one merged session.
fn merge(sessions: &[Session]) -> Session {
    let connect_time = sessions.iter().map(Session::connect_time).min().unwrap_or_default();
    let disconnect_time = sessions
        .iter()
        .filter_map(Session::disconnect_time)
        .max()
        .unwrap_or(connect_time);

    Session::Merged {
        connect_time,
        disconnect_time,
        duration_ms: sessions.iter().map(Session::duration_ms).sum(),
        merged_count: sessions.iter().map(Session::merged_count).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::{compact, KEEP_RECENT, MAX_SESSIONS};
    use atelier_common::usage::{total_duration_ms, Session};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 8, 0, 0).unwrap()
    }

    fn closed(start_minute: i64, length_minutes: i64) -> Session {
        let connect = t0() + Duration::minutes(start_minute);
        Session::open(connect).close(connect + Duration::minutes(length_minutes))
    }

    #[test]
    fn short_lists_only_lose_zero_duration_sessions() {
        let sessions = vec![
            closed(0, 5),
            closed(10, 0),
            closed(20, 3),
            Session::open(t0() + Duration::minutes(30)),
        ];

        let compacted = compact(&sessions);
        assert_eq!(compacted, vec![closed(0, 5), closed(20, 3)]);
    }

    #[test]
    fn exactly_ten_sessions_are_left_alone() {
        let sessions: Vec<_> = (0..10).map(|i| closed(i * 10, 1)).collect();
        assert_eq!(compact(&sessions), sessions);
    }

    #[test]
    fn twelve_sessions_fold_the_oldest_three() {
        let sessions: Vec<_> = (0..12).map(|i| closed(i * 10, 1)).collect();

        let compacted = compact(&sessions);

        assert_eq!(compacted.len(), MAX_SESSIONS);
        let merged = &compacted[0];
        assert!(merged.is_merged());
        assert_eq!(merged.merged_count(), 3);
        assert_eq!(merged.duration_ms(), 3 * 60_000);
        assert_eq!(merged.connect_time(), t0());
        assert_eq!(merged.disconnect_time(), Some(t0() + Duration::minutes(21)));
        assert_eq!(&compacted[1..], &sessions[3..]);
        assert_eq!(total_duration_ms(&compacted), 12 * 60_000);
    }

    #[test]
    fn recency_is_by_connect_time_not_position() {
        let mut sessions: Vec<_> = (0..11).map(|i| closed(i * 10, 2)).collect();
        sessions.reverse();

        let compacted = compact(&sessions);

        assert_eq!(compacted.len(), MAX_SESSIONS);
        assert_eq!(compacted[0].connect_time(), t0());
        assert_eq!(compacted[0].merged_count(), 2);
        assert_eq!(compacted[1].connect_time(), t0() + Duration::minutes(20));
    }

    #[test]
    fn merging_an_existing_merged_entry_accumulates_its_count() {
        let previous = Session::Merged {
            connect_time: t0(),
            disconnect_time: t0() + Duration::minutes(50),
            duration_ms: 600_000,
            merged_count: 5,
        };
        let mut sessions = vec![previous];
        sessions.extend((1..=10).map(|i| closed(60 + i * 10, 1)));

        let compacted = compact(&sessions);

        assert_eq!(compacted.len(), MAX_SESSIONS);
        assert_eq!(compacted[0].merged_count(), 6);
        assert_eq!(compacted[0].duration_ms(), 600_000 + 60_000);
        assert_eq!(compacted[1..].len(), KEEP_RECENT);
    }

    proptest! {
        #[test]
        fn compaction_conserves_duration_and_bounds_length(
            lengths in prop::collection::vec(0_i64..90, 0..40)
        ) {
            let sessions: Vec<_> = lengths
                .iter()
                .enumerate()
                .map(|(i, len)| closed(i as i64 * 100, *len))
                .collect();

            let compacted = compact(&sessions);

            prop_assert_eq!(total_duration_ms(&compacted), total_duration_ms(&sessions));
            prop_assert!(compacted.len() <= MAX_SESSIONS);
            prop_assert!(compacted.iter().all(|session| session.duration_ms() > 0));
            prop_assert!(compacted.iter().skip(1).all(|session| !session.is_merged()));
            prop_assert_eq!(compact(&compacted), compacted.clone());
        }
    }
}
