use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{InvalidAmount, Metadata, UserProfile};

/// Which balance a transaction moves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PointsPool {
    Points,
    Lot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    BinaryCommission,
    DirectBonus,
    Withdrawal,
    PaymentDeduction,
    LotBinaryCommission,
    LotDirectBonus,
    LotWithdrawal,
}

impl TransactionType {
    pub fn pool(self) -> PointsPool {
        match self {
            TransactionType::BinaryCommission
            | TransactionType::DirectBonus
            | TransactionType::Withdrawal
            | TransactionType::PaymentDeduction => PointsPool::Points,
            TransactionType::LotBinaryCommission
            | TransactionType::LotDirectBonus
            | TransactionType::LotWithdrawal => PointsPool::Lot,
        }
    }

    /// Earnings that a withdrawal can draw from
    pub fn is_withdrawable_earning(self) -> bool {
        match self {
            TransactionType::BinaryCommission | TransactionType::DirectBonus => true,
            TransactionType::Withdrawal
            | TransactionType::PaymentDeduction
            | TransactionType::LotBinaryCommission
            | TransactionType::LotDirectBonus
            | TransactionType::LotWithdrawal => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Cancelled,
    Failed,
}

/// Aggregate balance of a user
///
/// This is the single source of truth for what a user can spend. Amounts can only move through the
/// methods below, which refuse any change that would break an invariant.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserPoints {
    pub user_id: Uuid,
    pub user_email: String,
    pub user_name: Option<String>,
    available_points: Decimal,
    total_earned_points: Decimal,
    total_withdrawn_points: Decimal,
    available_lot_points: Decimal,
    total_earned_lot_points: Decimal,
    total_withdrawn_lot_points: Decimal,
    /// Optimistic concurrency counter
    ///
    /// `0` means the row has never been stored. The store bumps it on every commit.
    version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserPoints {
    pub fn new(profile: &UserProfile, now: DateTime<Utc>) -> Self {
        Self {
            user_id: profile.user_id,
            user_email: profile.email.clone(),
            user_name: profile.name.clone(),
            available_points: Decimal::ZERO,
            total_earned_points: Decimal::ZERO,
            total_withdrawn_points: Decimal::ZERO,
            available_lot_points: Decimal::ZERO,
            total_earned_lot_points: Decimal::ZERO,
            total_withdrawn_lot_points: Decimal::ZERO,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn available_points(&self) -> Decimal {
        self.available_points
    }

    pub fn total_earned_points(&self) -> Decimal {
        self.total_earned_points
    }

    pub fn total_withdrawn_points(&self) -> Decimal {
        self.total_withdrawn_points
    }

    pub fn available_lot_points(&self) -> Decimal {
        self.available_lot_points
    }

    pub fn total_earned_lot_points(&self) -> Decimal {
        self.total_earned_lot_points
    }

    pub fn total_withdrawn_lot_points(&self) -> Decimal {
        self.total_withdrawn_lot_points
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn can_withdraw(&self, amount: Decimal) -> bool {
        amount > Decimal::ZERO && self.available_points >= amount
    }

    /// Adds earned points to the main pool
    pub fn credit(&mut self, amount: Decimal) -> Result<(), InvalidAmount> {
        ensure_positive(amount)?;
        self.apply(|p| {
            p.available_points += amount;
            p.total_earned_points += amount;
        })
    }

    /// Spends points from the main pool, e.g. to pay for an order
    pub fn debit(&mut self, amount: Decimal) -> Result<(), InvalidAmount> {
        ensure_positive(amount)?;
        self.apply(|p| {
            p.available_points -= amount;
            p.total_withdrawn_points += amount;
        })
    }

    /// Moves points out of the available balance for a withdrawal awaiting review
    pub fn reserve_withdrawal(&mut self, amount: Decimal) -> Result<(), InvalidAmount> {
        ensure_positive(amount)?;
        self.apply(|p| {
            p.available_points -= amount;
            p.total_withdrawn_points += amount;
        })
    }

    /// Gives back the points of a rejected withdrawal
    pub fn restore_withdrawal(&mut self, amount: Decimal) -> Result<(), InvalidAmount> {
        ensure_not_negative(amount)?;
        self.apply(|p| {
            p.available_points += amount;
            p.total_withdrawn_points -= amount;
        })
    }

    /// Gives back reserved points, never taking the withdrawn total below zero
    pub fn restore_withdrawal_floored(&mut self, amount: Decimal) -> Result<(), InvalidAmount> {
        ensure_not_negative(amount)?;
        self.apply(|p| {
            p.available_points += amount;
            p.total_withdrawn_points = (p.total_withdrawn_points - amount).max(Decimal::ZERO);
        })
    }

    pub fn credit_lot(&mut self, amount: Decimal) -> Result<(), InvalidAmount> {
        ensure_positive(amount)?;
        self.apply(|p| {
            p.available_lot_points += amount;
            p.total_earned_lot_points += amount;
        })
    }

    /// Run a mutation on a copy and keep it only if every invariant still holds
    fn apply(&mut self, mutate: impl FnOnce(&mut Self)) -> Result<(), InvalidAmount> {
        let mut next = self.clone();
        mutate(&mut next);
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn validate(&self) -> Result<(), InvalidAmount> {
        for (value, label) in [
            (self.available_points, "available points"),
            (self.total_earned_points, "total earned points"),
            (self.total_withdrawn_points, "total withdrawn points"),
            (self.available_lot_points, "available lot points"),
            (self.total_earned_lot_points, "total earned lot points"),
            (self.total_withdrawn_lot_points, "total withdrawn lot points"),
        ] {
            if value < Decimal::ZERO {
                return Err(InvalidAmount::new(format!("{label} cannot be negative")));
            }
        }
        if self.total_withdrawn_points > self.total_earned_points {
            return Err(InvalidAmount::new(
                "withdrawn points cannot exceed earned points",
            ));
        }
        if self.total_withdrawn_lot_points > self.total_earned_lot_points {
            return Err(InvalidAmount::new(
                "withdrawn lot points cannot exceed earned lot points",
            ));
        }
        Ok(())
    }
}

/// One ledger event
///
/// `amount` is the face value and never changes. `pending_amount` and `withdrawn_amount` move over
/// the life of the transaction while a withdrawal draws from it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PointsTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub user_email: String,
    pub user_name: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    amount: Decimal,
    pending_amount: Decimal,
    withdrawn_amount: Decimal,
    pub status: TransactionStatus,
    is_archived: bool,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PointsTransaction {
    pub fn new(
        owner: &UserProfile,
        transaction_type: TransactionType,
        amount: Decimal,
        status: TransactionStatus,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidAmount> {
        ensure_not_negative(amount)?;
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: owner.user_id,
            user_email: owner.email.clone(),
            user_name: owner.name.clone(),
            transaction_type,
            amount,
            pending_amount: Decimal::ZERO,
            withdrawn_amount: Decimal::ZERO,
            status,
            is_archived: false,
            metadata,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn pending_amount(&self) -> Decimal {
        self.pending_amount
    }

    pub fn withdrawn_amount(&self) -> Decimal {
        self.withdrawn_amount
    }

    pub fn is_archived(&self) -> bool {
        self.is_archived
    }

    /// Face value that is neither reserved nor collected
    pub fn available(&self) -> Decimal {
        self.amount - self.pending_amount - self.withdrawn_amount
    }

    /// Whether a withdrawal may draw from this transaction
    pub fn is_reservable(&self) -> bool {
        self.transaction_type.is_withdrawable_earning()
            && self.status == TransactionStatus::Completed
            && !self.is_archived
    }

    /// Hold part of the available amount for a withdrawal
    pub fn reserve(&mut self, amount: Decimal) -> Result<(), InvalidAmount> {
        ensure_positive(amount)?;
        self.apply(|t| t.pending_amount += amount)
    }

    /// Undo a single reservation, never going below zero
    pub fn release(&mut self, amount: Decimal) -> Result<(), InvalidAmount> {
        ensure_not_negative(amount)?;
        self.apply(|t| t.pending_amount = (t.pending_amount - amount).max(Decimal::ZERO))
    }

    /// Drop every hold on this transaction
    pub fn release_all(&mut self) {
        self.pending_amount = Decimal::ZERO;
    }

    /// Collect `amount_used` for an approved withdrawal
    ///
    /// All pending holds are cleared. The transaction is archived once its whole face value has
    /// been withdrawn.
    pub fn settle(&mut self, amount_used: Decimal) -> Result<(), InvalidAmount> {
        ensure_not_negative(amount_used)?;
        self.apply(|t| {
            t.withdrawn_amount += amount_used;
            t.pending_amount = Decimal::ZERO;
            if t.amount == t.withdrawn_amount {
                t.is_archived = true;
            }
        })
    }

    /// Close a pending transaction, merging `notes` into its metadata
    pub fn resolve(&mut self, status: TransactionStatus, notes: Metadata) {
        self.status = status;
        self.metadata.extend(notes);
    }

    fn apply(&mut self, mutate: impl FnOnce(&mut Self)) -> Result<(), InvalidAmount> {
        let mut next = self.clone();
        mutate(&mut next);
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn validate(&self) -> Result<(), InvalidAmount> {
        if self.amount < Decimal::ZERO {
            return Err(InvalidAmount::new("amount cannot be negative"));
        }
        if self.pending_amount < Decimal::ZERO {
            return Err(InvalidAmount::new("pending amount cannot be negative"));
        }
        if self.withdrawn_amount < Decimal::ZERO {
            return Err(InvalidAmount::new("withdrawn amount cannot be negative"));
        }
        if self.withdrawn_amount > self.amount {
            return Err(InvalidAmount::new(format!(
                "withdrawn amount {} exceeds amount {}",
                self.withdrawn_amount, self.amount
            )));
        }
        if self.pending_amount + self.withdrawn_amount > self.amount {
            return Err(InvalidAmount::new(format!(
                "pending {} plus withdrawn {} exceeds amount {}",
                self.pending_amount, self.withdrawn_amount, self.amount
            )));
        }
        Ok(())
    }
}

/// Links a transaction to the external payment that generated it
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PointsTransactionPayment {
    pub id: Uuid,
    pub points_transaction_id: Uuid,
    pub payment_id: String,
    pub amount: Decimal,
    pub payment_reference: Option<String>,
    pub payment_method: Option<String>,
    pub notes: Option<String>,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
}

/// Payment details supplied by callers, before being linked to a transaction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PaymentLink {
    pub payment_id: String,
    pub amount: Decimal,
    pub payment_reference: Option<String>,
    pub payment_method: Option<String>,
    pub notes: Option<String>,
}

impl PointsTransactionPayment {
    pub fn new(
        points_transaction_id: Uuid,
        link: PaymentLink,
        now: DateTime<Utc>,
    ) -> Result<Self, InvalidAmount> {
        ensure_positive(link.amount)?;
        Ok(Self {
            id: Uuid::new_v4(),
            points_transaction_id,
            payment_id: link.payment_id,
            amount: link.amount,
            payment_reference: trimmed(link.payment_reference),
            payment_method: trimmed(link.payment_method),
            notes: trimmed(link.notes),
            metadata: None,
            created_at: now,
        })
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn ensure_positive(amount: Decimal) -> Result<(), InvalidAmount> {
    if amount <= Decimal::ZERO {
        return Err(InvalidAmount::new(format!(
            "amount must be greater than zero, got {amount}"
        )));
    }
    Ok(())
}

fn ensure_not_negative(amount: Decimal) -> Result<(), InvalidAmount> {
    if amount < Decimal::ZERO {
        return Err(InvalidAmount::new(format!(
            "amount cannot be negative, got {amount}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use speculoos::prelude::*;

    fn profile() -> UserProfile {
        UserProfile::new(Uuid::new_v4(), "user@example.com", Some("Test User"))
    }

    fn commission(amount: Decimal) -> PointsTransaction {
        PointsTransaction::new(
            &profile(),
            TransactionType::BinaryCommission,
            amount,
            TransactionStatus::Completed,
            Metadata::new(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_can_withdraw() {
        let mut points = UserPoints::new(&profile(), Utc::now());
        points.credit(dec!(50)).unwrap();

        assert_that!(points.can_withdraw(dec!(50))).is_true();
        assert_that!(points.can_withdraw(dec!(50.01))).is_false();
        assert_that!(points.can_withdraw(dec!(0))).is_false();
    }

    #[test]
    fn test_user_points_credit_and_reserve() {
        let mut points = UserPoints::new(&profile(), Utc::now());
        points.credit(dec!(100)).unwrap();
        points.reserve_withdrawal(dec!(40)).unwrap();

        assert_that!(points.available_points()).is_equal_to(dec!(60));
        assert_that!(points.total_earned_points()).is_equal_to(dec!(100));
        assert_that!(points.total_withdrawn_points()).is_equal_to(dec!(40));
    }

    #[test]
    fn test_user_points_reject_overdraw() {
        let mut points = UserPoints::new(&profile(), Utc::now());
        points.credit(dec!(10)).unwrap();

        assert_that!(points.debit(dec!(10.01))).is_err();
        // Failed mutations leave the row untouched
        assert_that!(points.available_points()).is_equal_to(dec!(10));
        assert_that!(points.total_withdrawn_points()).is_equal_to(dec!(0));
    }

    #[test]
    fn test_user_points_restore_floored() {
        let mut points = UserPoints::new(&profile(), Utc::now());
        points.credit(dec!(50)).unwrap();
        points.reserve_withdrawal(dec!(20)).unwrap();

        points.restore_withdrawal_floored(dec!(30)).unwrap();
        assert_that!(points.total_withdrawn_points()).is_equal_to(dec!(0));
        assert_that!(points.available_points()).is_equal_to(dec!(60));

        // The exact variant refuses to go below zero
        assert_that!(points.restore_withdrawal(dec!(1))).is_err();
    }

    #[test]
    fn test_user_points_rejects_non_positive_credit() {
        let mut points = UserPoints::new(&profile(), Utc::now());
        assert_that!(points.credit(dec!(0))).is_err();
        assert_that!(points.credit_lot(dec!(-1))).is_err();
    }

    #[test]
    fn test_transaction_reserve_bounds() {
        let mut transaction = commission(dec!(100));
        transaction.reserve(dec!(60)).unwrap();

        assert_that!(transaction.available()).is_equal_to(dec!(40));
        assert_that!(transaction.reserve(dec!(41))).is_err();
        assert_that!(transaction.pending_amount()).is_equal_to(dec!(60));
    }

    #[test]
    fn test_transaction_settle_archives_when_drained() {
        let mut transaction = commission(dec!(100));
        transaction.reserve(dec!(100)).unwrap();
        transaction.settle(dec!(100)).unwrap();

        assert_that!(transaction.withdrawn_amount()).is_equal_to(dec!(100));
        assert_that!(transaction.pending_amount()).is_equal_to(dec!(0));
        assert_that!(transaction.is_archived()).is_true();
        assert_that!(transaction.is_reservable()).is_false();
    }

    #[test]
    fn test_transaction_settle_partial_keeps_active() {
        let mut transaction = commission(dec!(100));
        transaction.reserve(dec!(30)).unwrap();
        transaction.settle(dec!(30)).unwrap();

        assert_that!(transaction.is_archived()).is_false();
        assert_that!(transaction.available()).is_equal_to(dec!(70));
        assert_that!(transaction.settle(dec!(71))).is_err();
    }

    #[test]
    fn test_transaction_release_is_floored() {
        let mut transaction = commission(dec!(100));
        transaction.reserve(dec!(30)).unwrap();
        transaction.release(dec!(50)).unwrap();

        assert_that!(transaction.pending_amount()).is_equal_to(dec!(0));
    }

    #[test]
    fn test_payment_requires_positive_amount() {
        let res = PointsTransactionPayment::new(
            Uuid::new_v4(),
            PaymentLink {
                payment_id: "42".to_string(),
                amount: dec!(0),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_that!(res).is_err();

        let res = PointsTransactionPayment::new(
            Uuid::new_v4(),
            PaymentLink {
                payment_id: "42".to_string(),
                amount: dec!(12.5),
                notes: Some("  linked  ".to_string()),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_that!(res)
            .is_ok()
            .matches(|payment| payment.notes.as_deref() == Some("linked"));
    }
}
