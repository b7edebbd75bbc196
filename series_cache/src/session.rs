//! Trading-session calendar.
//!
//! The calendar answers two questions for the rest of the crate:
//! - [`TradingSession::is_active`]: is the symbol's market currently updating?
//!   During the active period the bucket in progress must be re-fetched from
//!   upstream instead of served from the store.
//! - [`TradingSession::next_open_after`]: when does the next session start?
//!   Daily cache entries expire at that instant.
//!
//! Session hours are wall-clock times in an IANA time zone. Converting them to
//! UTC goes through [`local_to_utc`], which resolves DST edge cases
//! deterministically:
//! - ambiguous wall times ("fall back") take the earlier instant,
//! - nonexistent wall times ("spring forward") shift forward minute by minute
//!   to the first valid instant (capped at 2 hours).

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use thiserror::Error;

use crate::{bucket, resolution::Resolution};

/// Errors building a [`TradingSession`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Open must be strictly before close on the same local day.
    #[error("session open {open} is not before close {close}")]
    EmptySession {
        /// Local open time.
        open: NaiveTime,
        /// Local close time.
        close: NaiveTime,
    },
}

/// Daily trading window in a local time zone.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingSession {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    weekdays_only: bool,
    always_open: bool,
}

impl TradingSession {
    /// A session open `[open, close)` local time in `tz`.
    pub fn new(
        tz: Tz,
        open: NaiveTime,
        close: NaiveTime,
        weekdays_only: bool,
    ) -> Result<Self, SessionError> {
        if open >= close {
            return Err(SessionError::EmptySession { open, close });
        }
        Ok(Self {
            tz,
            open,
            close,
            weekdays_only,
            always_open: false,
        })
    }

    /// A market that never closes (crypto, sentiment feeds). Sessions roll at
    /// UTC midnight.
    pub fn always_open() -> Self {
        Self {
            tz: chrono_tz::UTC,
            open: NaiveTime::MIN,
            close: NaiveTime::MIN,
            weekdays_only: false,
            always_open: true,
        }
    }

    /// US equities regular hours: 09:30 to 16:00 America/New_York, Monday to Friday.
    pub fn us_equities() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
            weekdays_only: true,
            always_open: false,
        }
    }

    /// Time zone the session hours are expressed in.
    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// True while the market is updating.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.always_open {
            return true;
        }
        let local = now.with_timezone(&self.tz);
        if self.weekdays_only && is_weekend(local.weekday()) {
            return false;
        }
        let t = local.time();
        self.open <= t && t < self.close
    }

    /// First session open strictly after `now`.
    pub fn next_open_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.always_open {
            return bucket::align_up(now + Duration::seconds(1), Resolution::Day1);
        }
        let mut day = now.with_timezone(&self.tz).date_naive();
        // a week always contains a trading day, even weekdays-only
        for _ in 0..8 {
            if !(self.weekdays_only && is_weekend(day.weekday())) {
                if let Some(open) = local_to_utc(day.and_time(self.open), self.tz) {
                    if open > now {
                        return open;
                    }
                }
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        now + Duration::days(1)
    }
}

impl Default for TradingSession {
    fn default() -> Self {
        Self::us_equities()
    }
}

fn is_weekend(d: Weekday) -> bool {
    matches!(d, Weekday::Sat | Weekday::Sun)
}

/// Convert a naive local timestamp to UTC, resolving DST edge cases.
///
/// Returns `None` only if no valid instant exists within two hours after
/// `naive`, which no real time zone produces.
pub fn local_to_utc(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Utc>> {
    use chrono::offset::LocalResult;
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let mut t = naive;
            for _ in 0..120 {
                t += Duration::minutes(1);
                if let LocalResult::Single(dt) = tz.from_local_datetime(&t) {
                    return Some(dt.with_timezone(&Utc));
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn us_equities_active_during_regular_hours() {
        let s = TradingSession::us_equities();
        // 2024-01-15 is a Monday; EST is UTC-5.
        assert!(s.is_active(utc(2024, 1, 15, 14, 30)));
        assert!(s.is_active(utc(2024, 1, 15, 20, 59)));
        assert!(!s.is_active(utc(2024, 1, 15, 21, 0)));
        assert!(!s.is_active(utc(2024, 1, 15, 14, 29)));
    }

    #[test]
    fn weekends_are_inactive() {
        let s = TradingSession::us_equities();
        // Saturday noon New York time
        assert!(!s.is_active(utc(2024, 1, 20, 17, 0)));
    }

    #[test]
    fn next_open_skips_the_weekend() {
        let s = TradingSession::us_equities();
        // Friday 2024-01-19 after the close -> Monday 09:30 EST
        let got = s.next_open_after(utc(2024, 1, 19, 22, 0));
        assert_eq!(got, utc(2024, 1, 22, 14, 30));
    }

    #[test]
    fn next_open_tracks_dst() {
        let s = TradingSession::us_equities();
        // DST starts Sunday 2024-03-10; Monday opens at 09:30 EDT = 13:30Z.
        let got = s.next_open_after(utc(2024, 3, 8, 22, 0));
        assert_eq!(got, utc(2024, 3, 11, 13, 30));
    }

    #[test]
    fn next_open_same_day_before_the_bell() {
        let s = TradingSession::us_equities();
        let got = s.next_open_after(utc(2024, 1, 16, 12, 0));
        assert_eq!(got, utc(2024, 1, 16, 14, 30));
    }

    #[test]
    fn always_open_rolls_at_utc_midnight() {
        let s = TradingSession::always_open();
        assert!(s.is_active(utc(2024, 1, 20, 3, 0)));
        assert_eq!(s.next_open_after(utc(2024, 1, 20, 3, 0)), utc(2024, 1, 21, 0, 0));
        assert_eq!(s.next_open_after(utc(2024, 1, 21, 0, 0)), utc(2024, 1, 22, 0, 0));
    }

    #[test]
    fn empty_session_rejected() {
        let t = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let err = TradingSession::new(chrono_tz::UTC, t, t, true).unwrap_err();
        assert!(matches!(err, SessionError::EmptySession { .. }));
    }

    #[test]
    fn spring_forward_gap_shifts_to_first_valid_minute() {
        // 02:30 does not exist in New York on 2024-03-10; lands on 03:00 EDT.
        let naive = NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();
        let got = local_to_utc(naive, chrono_tz::America::New_York).unwrap();
        assert_eq!(got, utc(2024, 3, 10, 7, 0));
    }

    #[test]
    fn fall_back_ambiguity_prefers_earliest() {
        // 01:30 happens twice on 2024-11-03; EDT occurrence is 05:30Z.
        let naive = NaiveDate::from_ymd_opt(2024, 11, 3)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        let got = local_to_utc(naive, chrono_tz::America::New_York).unwrap();
        assert_eq!(got, utc(2024, 11, 3, 5, 30));
    }
}
