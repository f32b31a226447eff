//! Consecutive-activity-day tracking
//!
//! Activity timestamps are reduced to a calendar day in the user's
//! timezone (UTC when unknown) before being compared with the last
//! recorded activity day.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Streak fields of a user aggregate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakState {
    pub streak_days: i64,
    pub best_streak: i64,
    pub last_activity_date: Option<NaiveDate>,
}

/// Calendar day of `at` for a user `utc_offset_minutes` away from UTC
pub fn activity_day(at: DateTime<Utc>, utc_offset_minutes: Option<i32>) -> NaiveDate {
    match utc_offset_minutes.and_then(|m| FixedOffset::east_opt(m * 60)) {
        Some(offset) => at.with_timezone(&offset).date_naive(),
        None => at.date_naive(),
    }
}

/// Apply one qualifying activity on `day`
pub fn advance(state: StreakState, day: NaiveDate) -> StreakState {
    let Some(last) = state.last_activity_date else {
        return StreakState {
            streak_days: 1,
            best_streak: state.best_streak.max(1),
            last_activity_date: Some(day),
        };
    };

    let streak_days = if day == last || day < last {
        // Same day or a late-arriving older event: nothing to extend
        state.streak_days
    } else if day == last + Duration::days(1) {
        state.streak_days + 1
    } else {
        1
    };

    StreakState {
        streak_days,
        best_streak: state.best_streak.max(streak_days),
        last_activity_date: Some(day.max(last)),
    }
}

/// Replay a set of activity days from scratch
pub fn replay<I>(days: I) -> StreakState
where
    I: IntoIterator<Item = NaiveDate>,
{
    let mut days: Vec<NaiveDate> = days.into_iter().collect();
    days.sort();
    days.into_iter().fold(StreakState::default(), advance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_first_activity() {
        let s = advance(StreakState::default(), d(2024, 1, 15));
        assert_eq!(s.streak_days, 1);
        assert_eq!(s.best_streak, 1);
        assert_eq!(s.last_activity_date, Some(d(2024, 1, 15)));
    }

    #[test]
    fn test_consecutive_then_gap() {
        let mut s = StreakState::default();
        for day in [d(2024, 1, 15), d(2024, 1, 16), d(2024, 1, 17)] {
            s = advance(s, day);
        }
        assert_eq!(s.streak_days, 3);

        s = advance(s, d(2024, 1, 19));
        assert_eq!(s.streak_days, 1);
        assert_eq!(s.best_streak, 3);
    }

    #[test]
    fn test_same_day_does_not_inflate() {
        let s = advance(advance(StreakState::default(), d(2024, 1, 15)), d(2024, 1, 15));
        assert_eq!(s.streak_days, 1);
    }

    #[test]
    fn test_month_and_year_rollover() {
        let s = advance(advance(StreakState::default(), d(2024, 1, 31)), d(2024, 2, 1));
        assert_eq!(s.streak_days, 2);
        let s = advance(advance(StreakState::default(), d(2023, 12, 31)), d(2024, 1, 1));
        assert_eq!(s.streak_days, 2);
    }

    #[test]
    fn test_older_event_keeps_latest_date() {
        let s = advance(advance(StreakState::default(), d(2024, 1, 15)), d(2024, 1, 16));
        let s = advance(s, d(2024, 1, 10));
        assert_eq!(s.streak_days, 2);
        assert_eq!(s.last_activity_date, Some(d(2024, 1, 16)));
    }

    #[test]
    fn test_activity_day_respects_offset() {
        let at = DateTime::parse_from_rfc3339("2024-03-02T02:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(activity_day(at, None), d(2024, 3, 2));
        assert_eq!(activity_day(at, Some(-300)), d(2024, 3, 1));
        assert_eq!(activity_day(at, Some(60)), d(2024, 3, 2));
    }

    #[test]
    fn test_replay_matches_incremental() {
        let days = vec![d(2024, 1, 3), d(2024, 1, 1), d(2024, 1, 2), d(2024, 1, 2), d(2024, 1, 6)];
        let replayed = replay(days);
        assert_eq!(replayed.streak_days, 1);
        assert_eq!(replayed.best_streak, 3);
        assert_eq!(replayed.last_activity_date, Some(d(2024, 1, 6)));
    }
}
