// Day keys for daily records.
//
// "Today" is the calendar date of an instant in the configured boundary.
// Without an explicit offset the server's local zone decides, so moving a
// deployment between zones moves the day boundary with it.

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Offset, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayBoundary {
    ServerLocal,
    Fixed(FixedOffset),
}

impl DayBoundary {
    pub fn from_offset(offset: Option<FixedOffset>) -> Self {
        offset.map_or(Self::ServerLocal, Self::Fixed)
    }

    pub fn utc() -> Self {
        Self::Fixed(Utc.fix())
    }

    pub fn day_of(self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::ServerLocal => at.with_timezone(&Local).date_naive(),
            Self::Fixed(offset) => at.with_timezone(&offset).date_naive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DayBoundary;
    use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};

    #[test]
    fn utc_boundary_uses_utc_calendar_date() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 23, 59, 59).unwrap();
        assert_eq!(DayBoundary::utc().day_of(at), NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
    }

    #[test]
    fn fixed_offset_shifts_the_day() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 2, 0, 0).unwrap();
        let new_york_winter = DayBoundary::Fixed(FixedOffset::west_opt(5 * 3600).unwrap());
        let tokyo = DayBoundary::Fixed(FixedOffset::east_opt(9 * 3600).unwrap());

        assert_eq!(new_york_winter.day_of(at), NaiveDate::from_ymd_opt(2026, 3, 13).unwrap());
        assert_eq!(tokyo.day_of(at), NaiveDate::from_ymd_opt(2026, 3, 14).unwrap());
    }

    #[test]
    fn missing_offset_falls_back_to_server_local() {
        assert_eq!(DayBoundary::from_offset(None), DayBoundary::ServerLocal);
        let offset = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(DayBoundary::from_offset(Some(offset)), DayBoundary::Fixed(offset));
    }
}
