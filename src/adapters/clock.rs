use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};

use crate::ports::clock::ClockPort;

/// Wall clock, with calendar dates taken at a fixed UTC offset
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// Returns `None` if the offset is out of range
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(Self::new)
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl ClockPort for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }
}

/// Clock frozen at a given instant
///
/// Used to replay a weekly close for a past date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    now: DateTime<Utc>,
    offset: FixedOffset,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        Self { now, offset }
    }

    pub fn at_utc(now: DateTime<Utc>) -> Self {
        Self::new(now, Utc.fix())
    }
}

impl ClockPort for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn today(&self) -> NaiveDate {
        self.now.with_timezone(&self.offset).date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::*;
    use speculoos::prelude::*;

    #[rstest]
    #[case(0, (2024, 6, 9))]
    #[case(120, (2024, 6, 10))]
    #[case(-300, (2024, 6, 9))]
    fn test_fixed_clock_today(#[case] offset_minutes: i32, #[case] expected: (i32, u32, u32)) {
        // GIVEN a clock frozen on Sunday 23:00 UTC
        let now = Utc.with_ymd_and_hms(2024, 6, 9, 23, 0, 0).unwrap();
        let clock = FixedClock::new(now, FixedOffset::east_opt(offset_minutes * 60).unwrap());

        // WHEN reading the local date
        let res = clock.today();

        // THEN it follows the offset
        let (y, m, d) = expected;
        assert_that!(res).is_equal_to(NaiveDate::from_ymd_opt(y, m, d).unwrap());
    }

    #[test]
    fn test_system_clock_rejects_bad_offset() {
        assert_that!(SystemClock::from_offset_minutes(24 * 60).is_none()).is_true();
        assert_that!(SystemClock::from_offset_minutes(-180).is_some()).is_true();
    }
}
