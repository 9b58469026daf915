use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{
    ledger::{LedgerUpdate, UserLedger},
    InvalidAmount, Metadata, PointsPool, PointsTransaction, PointsTransactionPayment, Side,
    TransactionStatus, TransactionType, UserPoints, UserProfile, VolumeStatus, Week, WeeklyVolume,
    WeeklyVolumeHistory,
};

#[mockall::automock]
#[async_trait::async_trait]
pub trait DatabasePort: Send + Sync {
    async fn get_user_points(&self, user_id: Uuid) -> Result<Option<UserPoints>, Error>;

    /// Balance and every transaction of a user, or `None` if the user has no points row yet
    async fn load_ledger(&self, user_id: Uuid) -> Result<Option<UserLedger>, Error>;

    async fn get_transaction(&self, id: Uuid) -> Result<Option<PointsTransaction>, Error>;

    /// Matching transactions, newest first
    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PointsTransaction>, Error>;

    async fn list_transaction_payments(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<PointsTransactionPayment>, Error>;

    /// Add volume to the user's row for the week and append the matching history entry
    ///
    /// Both writes happen atomically. The row is created from `accrual.profile` if it does not
    /// exist yet.
    async fn record_volume(&self, accrual: VolumeAccrual) -> Result<RecordedVolume, Error>;

    async fn find_weekly_volume(
        &self,
        user_id: Uuid,
        week: Week,
    ) -> Result<Option<WeeklyVolume>, Error>;

    async fn get_weekly_volume(&self, id: Uuid) -> Result<Option<WeeklyVolume>, Error>;

    /// Matching rows, newest first
    async fn list_weekly_volumes(&self, filter: VolumeFilter) -> Result<Vec<WeeklyVolume>, Error>;

    /// History of a row, newest first
    async fn list_volume_history(
        &self,
        weekly_volume_id: Uuid,
    ) -> Result<Vec<WeeklyVolumeHistory>, Error>;

    /// Write every change of a single operation, or none of them
    async fn commit(&self, changes: ChangeSet) -> Result<(), Error>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
    pub user_id: Option<Uuid>,
    pub transaction_type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub pool: Option<PointsPool>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<VolumeStatus>,
    pub week: Option<Week>,
    /// Lower bound on the first day of the week
    pub starts_on_or_after: Option<NaiveDate>,
    /// Upper bound on the last day of the week
    pub ends_on_or_before: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAccrual {
    pub user_id: Uuid,
    pub week: Week,
    pub side: Side,
    pub amount: Decimal,
    pub payment_id: Option<String>,
    /// Needed only when the row for the week does not exist yet
    pub profile: Option<UserProfile>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccrualAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedVolume {
    pub volume: WeeklyVolume,
    pub history: WeeklyVolumeHistory,
    pub action: AccrualAction,
}

/// Volume moved into the row of a later week
#[derive(Debug, Clone, PartialEq)]
pub struct CarryOver {
    pub week: Week,
    pub left: Decimal,
    pub right: Decimal,
    /// Used when the row for `week` does not exist yet
    pub profile: UserProfile,
    pub metadata: Metadata,
    pub now: DateTime<Utc>,
}

/// A settled or cancelled row along with what it hands over to the next week
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeClose {
    /// The row in its final state; the stored copy must still be pending
    pub row: WeeklyVolume,
    pub carry_over: CarryOver,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub ledger: Option<LedgerUpdate>,
    pub volume: Option<VolumeClose>,
    /// Stamped on every written row
    pub now: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The ledger changed since it was loaded
    ///
    /// The operation can be retried on a fresh snapshot.
    #[error("ledger of user {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("weekly volume {0} is no longer pending")]
    VolumeNotPending(Uuid),

    #[error("weekly volume {0} does not exist")]
    VolumeDoesNotExist(Uuid),

    /// A row had to be created but no profile was provided
    #[error("no profile to create a weekly volume for user {0}")]
    MissingProfile(Uuid),

    #[error(transparent)]
    InvalidAmount(#[from] InvalidAmount),

    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}
