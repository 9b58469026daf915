use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{InvalidAmount, Metadata, Side, UserProfile};

/// A Monday to Sunday compensation period
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Week {
    start: NaiveDate,
    end: NaiveDate,
}

impl Week {
    /// The week that contains `date`
    pub fn containing(date: NaiveDate) -> Self {
        let start = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        Self {
            start,
            end: start + Duration::days(6),
        }
    }

    /// Returns `None` if `start` is not a Monday
    pub fn starting(start: NaiveDate) -> Option<Self> {
        let week = Self::containing(start);
        (week.start == start).then_some(week)
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn previous(&self) -> Self {
        Self::containing(self.start - Duration::days(7))
    }

    pub fn next(&self) -> Self {
        Self::containing(self.start + Duration::days(7))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeStatus {
    Pending,
    Processed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("weekly volume {0} is no longer pending")]
pub struct NotPending(pub Uuid);

/// Binary volume accumulated by one user during one week
///
/// Rows form an append-only chain per user: once settled a row never changes again, and whatever
/// it carries over lives on in the row of the following week.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeeklyVolume {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub user_name: Option<String>,
    left_volume: Decimal,
    right_volume: Decimal,
    commission_earned: Option<Decimal>,
    pub week: Week,
    status: VolumeStatus,
    selected_side: Option<Side>,
    processed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WeeklyVolume {
    pub fn new(profile: &UserProfile, week: Week, metadata: Metadata, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: profile.user_id,
            user_email: profile.email.clone(),
            user_name: profile.name.clone(),
            left_volume: Decimal::ZERO,
            right_volume: Decimal::ZERO,
            commission_earned: None,
            week,
            status: VolumeStatus::Pending,
            selected_side: None,
            processed_at: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            user_id: self.user_id,
            email: self.user_email.clone(),
            name: self.user_name.clone(),
        }
    }

    pub fn left_volume(&self) -> Decimal {
        self.left_volume
    }

    pub fn right_volume(&self) -> Decimal {
        self.right_volume
    }

    pub fn volume(&self, side: Side) -> Decimal {
        match side {
            Side::Left => self.left_volume,
            Side::Right => self.right_volume,
        }
    }

    pub fn total_volume(&self) -> Decimal {
        self.left_volume + self.right_volume
    }

    pub fn status(&self) -> VolumeStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == VolumeStatus::Pending
    }

    pub fn selected_side(&self) -> Option<Side> {
        self.selected_side
    }

    pub fn commission_earned(&self) -> Option<Decimal> {
        self.commission_earned
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    /// The leg with less volume, or `None` when both legs are equal
    pub fn weaker_side(&self) -> Option<Side> {
        match self.left_volume.cmp(&self.right_volume) {
            std::cmp::Ordering::Less => Some(Side::Left),
            std::cmp::Ordering::Greater => Some(Side::Right),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Accumulate volume on one leg
    ///
    /// Callers must check [`WeeklyVolume::is_pending`] first.
    pub fn add(&mut self, side: Side, amount: Decimal) -> Result<(), InvalidAmount> {
        if amount < Decimal::ZERO {
            return Err(InvalidAmount::new(format!(
                "volume cannot be negative, got {amount}"
            )));
        }
        match side {
            Side::Left => self.left_volume += amount,
            Side::Right => self.right_volume += amount,
        }
        Ok(())
    }

    /// Mark the row as paid on `selected_side`
    pub fn settle(
        &mut self,
        selected_side: Side,
        commission: Decimal,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<(), NotPending> {
        self.ensure_pending()?;
        self.status = VolumeStatus::Processed;
        self.selected_side = Some(selected_side);
        self.commission_earned = Some(commission);
        self.processed_at = Some(now);
        self.metadata = metadata;
        Ok(())
    }

    /// Mark the row as ineligible for payment
    pub fn cancel(&mut self, metadata: Metadata, now: DateTime<Utc>) -> Result<(), NotPending> {
        self.ensure_pending()?;
        self.status = VolumeStatus::Cancelled;
        self.processed_at = Some(now);
        self.metadata = metadata;
        Ok(())
    }

    fn ensure_pending(&self) -> Result<(), NotPending> {
        if !self.is_pending() {
            return Err(NotPending(self.id));
        }
        Ok(())
    }
}

/// One increment applied to a [`WeeklyVolume`]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeeklyVolumeHistory {
    pub id: Uuid,
    pub weekly_volume_id: Uuid,
    pub side: Side,
    pub volume: Decimal,
    /// Payment that generated this volume, used to attribute commissions
    pub payment_id: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

impl WeeklyVolumeHistory {
    pub fn new(
        weekly_volume_id: Uuid,
        side: Side,
        volume: Decimal,
        payment_id: Option<String>,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidAmount> {
        if volume < Decimal::ZERO {
            return Err(InvalidAmount::new("volume cannot be negative"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            weekly_volume_id,
            side,
            volume,
            payment_id,
            metadata,
            created_at: now,
        })
    }
}
