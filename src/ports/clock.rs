use chrono::{DateTime, NaiveDate, Utc};

/// Source of the current time
///
/// Week boundaries are computed on local calendar dates, which is why this exposes `today` on top
/// of `now`.
#[mockall::automock]
pub trait ClockPort: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    /// Local calendar date
    fn today(&self) -> NaiveDate;
}
