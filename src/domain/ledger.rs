//! Ledger state transitions.
//!
//! A [`UserLedger`] is a snapshot of one user's balance and transactions. Every operation works on
//! that snapshot and returns a [`LedgerUpdate`]: the complete set of rows to write back in one
//! atomic commit. The update carries the version of the snapshot it was computed from, so the store
//! can refuse it if anything changed in between.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{
    points::{ensure_positive, PaymentLink},
    InvalidAmount, Metadata, PointsTransaction, PointsTransactionPayment, TransactionStatus,
    to_metadata, TransactionType, UserPoints, UserProfile,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient balance: {available} available, {requested} requested")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    /// The balance covers the request but the earnings it can be drawn from do not
    #[error("insufficient reservable funds: {reservable} reservable across transactions, {available_points} available points, {requested} requested")]
    InsufficientReservableFunds {
        available_points: Decimal,
        reservable: Decimal,
        requested: Decimal,
    },

    #[error("points transaction {0} does not exist for this user")]
    UnknownTransaction(Uuid),

    #[error(transparent)]
    InvalidAmount(#[from] InvalidAmount),
}

/// Earnings that can be credited to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Earning {
    BinaryCommission,
    DirectBonus,
    LotBinaryCommission,
    LotDirectBonus,
}

impl Earning {
    pub fn transaction_type(self) -> TransactionType {
        match self {
            Earning::BinaryCommission => TransactionType::BinaryCommission,
            Earning::DirectBonus => TransactionType::DirectBonus,
            Earning::LotBinaryCommission => TransactionType::LotBinaryCommission,
            Earning::LotDirectBonus => TransactionType::LotDirectBonus,
        }
    }
}

/// Amount drawn from one transaction by a withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub points_transaction_id: Uuid,
    pub amount_used: Decimal,
}

/// Allocation along with the state of the transaction right after the reservation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservedTransaction {
    pub points_transaction_id: Uuid,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub pending_amount: Decimal,
    pub amount_used: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<&ReservedTransaction> for Allocation {
    fn from(reserved: &ReservedTransaction) -> Self {
        Self {
            points_transaction_id: reserved.points_transaction_id,
            amount_used: reserved.amount_used,
        }
    }
}

/// Rows to write back for one ledger operation
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerUpdate {
    pub user_id: Uuid,
    /// Version of the snapshot this update was computed from
    pub expected_version: u64,
    pub points: UserPoints,
    /// New or modified transactions
    pub upserted: Vec<PointsTransaction>,
    pub removed: Vec<Uuid>,
    pub payments: Vec<PointsTransactionPayment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credit {
    pub transaction: PointsTransaction,
    pub update: LedgerUpdate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub reserved: Vec<ReservedTransaction>,
    pub withdrawal_transaction_id: Uuid,
    pub update: LedgerUpdate,
}

/// Result of approving or rejecting a withdrawal
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Placeholder withdrawal transaction that was closed, if one was found
    pub withdrawal_transaction_id: Option<Uuid>,
    pub update: LedgerUpdate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rollback {
    pub restored: Decimal,
    /// Allocations that pointed at transactions this user does not have
    pub skipped: Vec<Uuid>,
    pub removed_withdrawal: Option<Uuid>,
    pub update: LedgerUpdate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserLedger {
    pub points: UserPoints,
    pub transactions: Vec<PointsTransaction>,
}

impl UserLedger {
    /// Ledger of a user that has never been stored
    pub fn empty(profile: &UserProfile, now: DateTime<Utc>) -> Self {
        Self {
            points: UserPoints::new(profile, now),
            transactions: Vec::new(),
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            user_id: self.points.user_id,
            email: self.points.user_email.clone(),
            name: self.points.user_name.clone(),
        }
    }

    pub fn transaction(&self, id: Uuid) -> Option<&PointsTransaction> {
        self.transactions.iter().find(|t| t.id == id)
    }

    /// Sum of what withdrawals could still draw from
    pub fn reservable(&self) -> Decimal {
        self.transactions
            .iter()
            .filter(|t| t.is_reservable())
            .map(|t| t.available().max(Decimal::ZERO))
            .sum()
    }

    /// Most recent withdrawal still waiting for review
    pub fn latest_pending_withdrawal(&self) -> Option<&PointsTransaction> {
        self.transactions
            .iter()
            .filter(|t| {
                t.transaction_type == TransactionType::Withdrawal
                    && t.status == TransactionStatus::Pending
            })
            .max_by_key(|t| t.created_at)
    }

    fn update(&self, points: UserPoints) -> LedgerUpdate {
        LedgerUpdate {
            user_id: self.points.user_id,
            expected_version: self.points.version(),
            points,
            upserted: Vec::new(),
            removed: Vec::new(),
            payments: Vec::new(),
        }
    }

    /// Credit earned points and record them as a completed transaction
    pub fn credit(
        &self,
        earning: Earning,
        amount: Decimal,
        metadata: Metadata,
        payments: Vec<PaymentLink>,
        now: DateTime<Utc>,
    ) -> Result<Credit, LedgerError> {
        let mut points = self.points.clone();
        match earning {
            Earning::BinaryCommission | Earning::DirectBonus => points.credit(amount)?,
            Earning::LotBinaryCommission | Earning::LotDirectBonus => points.credit_lot(amount)?,
        }

        let transaction = PointsTransaction::new(
            &self.profile(),
            earning.transaction_type(),
            amount,
            TransactionStatus::Completed,
            metadata,
            now,
        )?;
        let payments = payments
            .into_iter()
            .map(|link| PointsTransactionPayment::new(transaction.id, link, now))
            .collect::<Result<Vec<_>, _>>()?;

        let mut update = self.update(points);
        update.upserted.push(transaction.clone());
        update.payments = payments;
        Ok(Credit {
            transaction,
            update,
        })
    }

    fn ensure_balance(&self, amount: Decimal) -> Result<(), LedgerError> {
        if !self.points.can_withdraw(amount) {
            return Err(LedgerError::InsufficientBalance {
                available: self.points.available_points(),
                requested: amount,
            });
        }
        Ok(())
    }

    /// Spend points from the available balance
    pub fn debit(
        &self,
        amount: Decimal,
        metadata: Metadata,
        payment: Option<PaymentLink>,
        now: DateTime<Utc>,
    ) -> Result<Credit, LedgerError> {
        ensure_positive(amount)?;
        self.ensure_balance(amount)?;

        let mut points = self.points.clone();
        points.debit(amount)?;
        let transaction = PointsTransaction::new(
            &self.profile(),
            TransactionType::PaymentDeduction,
            amount,
            TransactionStatus::Completed,
            metadata,
            now,
        )?;
        let payments = payment
            .map(|link| PointsTransactionPayment::new(transaction.id, link, now))
            .transpose()?;

        let mut update = self.update(points);
        update.upserted.push(transaction.clone());
        update.payments.extend(payments);
        Ok(Credit {
            transaction,
            update,
        })
    }

    /// Hold `amount` for a withdrawal, drawing from the oldest earnings first
    pub fn reserve(&self, amount: Decimal, now: DateTime<Utc>) -> Result<Reservation, LedgerError> {
        ensure_positive(amount)?;
        self.ensure_balance(amount)?;
        let available_before = self.points.available_points();

        let mut eligible: Vec<&PointsTransaction> =
            self.transactions.iter().filter(|t| t.is_reservable()).collect();
        // Stable, so equal timestamps keep their insertion order
        eligible.sort_by_key(|t| t.created_at);

        let mut remaining = amount;
        let mut touched = Vec::new();
        let mut reserved = Vec::new();
        for transaction in eligible {
            if remaining <= Decimal::ZERO {
                break;
            }
            let available = transaction.available();
            if available <= Decimal::ZERO {
                continue;
            }

            let deduct = remaining.min(available);
            let mut transaction = transaction.clone();
            transaction.reserve(deduct)?;
            reserved.push(ReservedTransaction {
                points_transaction_id: transaction.id,
                transaction_type: transaction.transaction_type,
                amount: transaction.amount(),
                pending_amount: transaction.pending_amount(),
                amount_used: deduct,
                created_at: transaction.created_at,
            });
            touched.push(transaction);
            remaining -= deduct;
        }

        if remaining > Decimal::ZERO {
            return Err(LedgerError::InsufficientReservableFunds {
                available_points: available_before,
                reservable: amount - remaining,
                requested: amount,
            });
        }

        let mut points = self.points.clone();
        points.reserve_withdrawal(amount)?;
        let withdrawal = PointsTransaction::new(
            &self.profile(),
            TransactionType::Withdrawal,
            amount,
            TransactionStatus::Pending,
            to_metadata(json!({
                "requestedAmount": amount,
                "availablePointsBefore": available_before,
                "requestedAt": now,
            })),
            now,
        )?;

        let withdrawal_transaction_id = withdrawal.id;
        let mut update = self.update(points);
        update.upserted = touched;
        update.upserted.push(withdrawal);
        Ok(Reservation {
            reserved,
            withdrawal_transaction_id,
            update,
        })
    }

    /// Turn reserved amounts into withdrawn amounts and complete the pending withdrawal
    pub fn approve(
        &self,
        allocations: &[Allocation],
        notes: Metadata,
    ) -> Result<Resolution, LedgerError> {
        let mut touched = Vec::new();
        for allocation in allocations {
            let index = self
                .working_index(&mut touched, allocation.points_transaction_id)
                .ok_or(LedgerError::UnknownTransaction(
                    allocation.points_transaction_id,
                ))?;
            touched[index].settle(allocation.amount_used)?;
        }

        let withdrawal_transaction_id =
            self.resolve_withdrawal(&mut touched, TransactionStatus::Completed, notes);

        let mut update = self.update(self.points.clone());
        update.upserted = touched;
        Ok(Resolution {
            withdrawal_transaction_id,
            update,
        })
    }

    /// Release reserved amounts, cancel the pending withdrawal and give the points back
    pub fn reject(
        &self,
        amount: Decimal,
        allocations: &[Allocation],
        notes: Metadata,
    ) -> Result<Resolution, LedgerError> {
        let mut touched = Vec::new();
        for allocation in allocations {
            let index = self
                .working_index(&mut touched, allocation.points_transaction_id)
                .ok_or(LedgerError::UnknownTransaction(
                    allocation.points_transaction_id,
                ))?;
            touched[index].release_all();
        }

        let withdrawal_transaction_id =
            self.resolve_withdrawal(&mut touched, TransactionStatus::Cancelled, notes);

        let mut points = self.points.clone();
        points.restore_withdrawal(amount)?;

        let mut update = self.update(points);
        update.upserted = touched;
        Ok(Resolution {
            withdrawal_transaction_id,
            update,
        })
    }

    /// Undo a reservation whose withdrawal never reached a review decision
    ///
    /// Only the recorded amounts are subtracted, so other reservations on the same transactions
    /// stay in place.
    pub fn rollback(&self, allocations: &[Allocation]) -> Result<Rollback, LedgerError> {
        let mut touched = Vec::new();
        let mut skipped = Vec::new();
        let mut restored = Decimal::ZERO;
        for allocation in allocations {
            match self.working_index(&mut touched, allocation.points_transaction_id) {
                Some(index) => {
                    touched[index].release(allocation.amount_used)?;
                    restored += allocation.amount_used;
                }
                None => skipped.push(allocation.points_transaction_id),
            }
        }

        let mut points = self.points.clone();
        points.restore_withdrawal_floored(restored)?;

        let removed_withdrawal = self
            .transactions
            .iter()
            .filter(|t| {
                t.transaction_type == TransactionType::Withdrawal
                    && t.status == TransactionStatus::Pending
                    && t.amount() == restored
            })
            .max_by_key(|t| t.created_at)
            .map(|t| t.id);

        let mut update = self.update(points);
        update.upserted = touched;
        update.removed.extend(removed_withdrawal);
        Ok(Rollback {
            restored,
            skipped,
            removed_withdrawal,
            update,
        })
    }

    fn resolve_withdrawal(
        &self,
        touched: &mut Vec<PointsTransaction>,
        status: TransactionStatus,
        notes: Metadata,
    ) -> Option<Uuid> {
        let id = self.latest_pending_withdrawal()?.id;
        let index = self.working_index(touched, id)?;
        touched[index].resolve(status, notes);
        Some(id)
    }

    /// Position of the working copy of a transaction, cloning it into `touched` on first use
    fn working_index(&self, touched: &mut Vec<PointsTransaction>, id: Uuid) -> Option<usize> {
        if let Some(index) = touched.iter().position(|t| t.id == id) {
            return Some(index);
        }
        let transaction = self.transaction(id)?;
        touched.push(transaction.clone());
        Some(touched.len() - 1)
    }
}
