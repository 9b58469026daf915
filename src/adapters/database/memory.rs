use crate::{
    domain::{
        ledger::{LedgerUpdate, UserLedger},
        to_metadata, Metadata, PointsTransaction, PointsTransactionPayment, UserPoints, Week,
        WeeklyVolume, WeeklyVolumeHistory,
    },
    ports::database::{
        AccrualAction, ChangeSet, DatabasePort, Error, RecordedVolume, TransactionFilter,
        VolumeAccrual, VolumeClose, VolumeFilter,
    },
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use uuid::Uuid;

/// Storage adapter keeping everything in process memory
///
/// A single mutex guards all tables, so every call is atomic with respect to every other call.
#[derive(Clone, Debug, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    user_points: HashMap<Uuid, UserPoints>,
    /// Insertion order is kept, which breaks ties between equal timestamps
    transactions: Vec<PointsTransaction>,
    payments: Vec<PointsTransactionPayment>,
    volumes: Vec<WeeklyVolume>,
    history: Vec<WeeklyVolumeHistory>,
}

impl State {
    fn volume_for(&self, user_id: Uuid, week: Week) -> Option<&WeeklyVolume> {
        self.volumes
            .iter()
            .find(|v| v.user_id == user_id && v.week == week)
    }

    fn check_version(&self, update: &LedgerUpdate) -> Result<(), Error> {
        let current = self
            .user_points
            .get(&update.user_id)
            .map_or(0, UserPoints::version);
        if current != update.expected_version {
            return Err(Error::Conflict(update.user_id));
        }
        Ok(())
    }

    /// Final state of the closed row and of its successor, without writing anything
    fn prepare_close(
        &self,
        close: VolumeClose,
        now: DateTime<Utc>,
    ) -> Result<(WeeklyVolume, WeeklyVolume), Error> {
        let stored = self
            .volumes
            .iter()
            .find(|v| v.id == close.row.id)
            .ok_or(Error::VolumeDoesNotExist(close.row.id))?;
        if !stored.is_pending() {
            return Err(Error::VolumeNotPending(stored.id));
        }

        let carry = close.carry_over;
        let mut successor = match self.volume_for(close.row.user_id, carry.week) {
            Some(existing) if !existing.is_pending() => {
                return Err(Error::VolumeNotPending(existing.id))
            }
            Some(existing) => existing.clone(),
            None => WeeklyVolume::new(&carry.profile, carry.week, carry.metadata, carry.now),
        };
        successor.add(crate::domain::Side::Left, carry.left)?;
        successor.add(crate::domain::Side::Right, carry.right)?;
        successor.updated_at = now;

        let mut row = close.row;
        row.updated_at = now;
        Ok((row, successor))
    }

    fn write_volume(&mut self, volume: WeeklyVolume) {
        match self.volumes.iter_mut().find(|v| v.id == volume.id) {
            Some(existing) => *existing = volume,
            None => self.volumes.push(volume),
        }
    }

    fn write_ledger(&mut self, update: LedgerUpdate, now: DateTime<Utc>) {
        let mut points = update.points;
        points.set_version(update.expected_version + 1);
        points.updated_at = now;
        self.user_points.insert(update.user_id, points);

        for mut transaction in update.upserted {
            transaction.updated_at = now;
            match self
                .transactions
                .iter_mut()
                .find(|t| t.id == transaction.id)
            {
                Some(existing) => *existing = transaction,
                None => self.transactions.push(transaction),
            }
        }
        self.transactions.retain(|t| !update.removed.contains(&t.id));
        self.payments.extend(update.payments);
    }
}

#[async_trait::async_trait]
impl DatabasePort for MemoryDatabase {
    async fn get_user_points(&self, user_id: Uuid) -> Result<Option<UserPoints>, Error> {
        Ok(self.state.lock()?.user_points.get(&user_id).cloned())
    }

    async fn load_ledger(&self, user_id: Uuid) -> Result<Option<UserLedger>, Error> {
        let state = self.state.lock()?;
        let ledger = state.user_points.get(&user_id).map(|points| UserLedger {
            points: points.clone(),
            transactions: state
                .transactions
                .iter()
                .filter(|t| t.user_id == user_id)
                .cloned()
                .collect(),
        });

        Ok(ledger)
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<PointsTransaction>, Error> {
        Ok(self
            .state
            .lock()?
            .transactions
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PointsTransaction>, Error> {
        let state = self.state.lock()?;
        let mut transactions: Vec<_> = state
            .transactions
            .iter()
            .rev()
            .filter(|t| filter.user_id.map_or(true, |id| t.user_id == id))
            .filter(|t| {
                filter
                    .transaction_type
                    .map_or(true, |kind| t.transaction_type == kind)
            })
            .filter(|t| filter.status.map_or(true, |status| t.status == status))
            .filter(|t| {
                filter
                    .pool
                    .map_or(true, |pool| t.transaction_type.pool() == pool)
            })
            .filter(|t| filter.created_from.map_or(true, |from| t.created_at >= from))
            .filter(|t| {
                filter
                    .created_until
                    .map_or(true, |until| t.created_at <= until)
            })
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(transactions)
    }

    async fn list_transaction_payments(
        &self,
        transaction_id: Uuid,
    ) -> Result<Vec<PointsTransactionPayment>, Error> {
        Ok(self
            .state
            .lock()?
            .payments
            .iter()
            .filter(|p| p.points_transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn record_volume(&self, accrual: VolumeAccrual) -> Result<RecordedVolume, Error> {
        let mut state = self.state.lock()?;
        let (mut volume, action) = match state.volume_for(accrual.user_id, accrual.week) {
            Some(existing) if !existing.is_pending() => {
                return Err(Error::VolumeNotPending(existing.id))
            }
            Some(existing) => (existing.clone(), AccrualAction::Updated),
            None => {
                let profile = accrual
                    .profile
                    .as_ref()
                    .ok_or(Error::MissingProfile(accrual.user_id))?;
                let metadata = to_metadata(json!({
                    "createdBy": "volume_assignment",
                    "createdAt": accrual.now,
                }));
                (
                    WeeklyVolume::new(profile, accrual.week, metadata, accrual.now),
                    AccrualAction::Created,
                )
            }
        };

        volume.add(accrual.side, accrual.amount)?;
        volume.updated_at = accrual.now;
        let history = WeeklyVolumeHistory::new(
            volume.id,
            accrual.side,
            accrual.amount,
            accrual.payment_id,
            Metadata::new(),
            accrual.now,
        )?;

        state.write_volume(volume.clone());
        state.history.push(history.clone());

        Ok(RecordedVolume {
            volume,
            history,
            action,
        })
    }

    async fn find_weekly_volume(
        &self,
        user_id: Uuid,
        week: Week,
    ) -> Result<Option<WeeklyVolume>, Error> {
        Ok(self.state.lock()?.volume_for(user_id, week).cloned())
    }

    async fn get_weekly_volume(&self, id: Uuid) -> Result<Option<WeeklyVolume>, Error> {
        Ok(self
            .state
            .lock()?
            .volumes
            .iter()
            .find(|v| v.id == id)
            .cloned())
    }

    async fn list_weekly_volumes(&self, filter: VolumeFilter) -> Result<Vec<WeeklyVolume>, Error> {
        let state = self.state.lock()?;
        let mut volumes: Vec<_> = state
            .volumes
            .iter()
            .rev()
            .filter(|v| filter.user_id.map_or(true, |id| v.user_id == id))
            .filter(|v| filter.status.map_or(true, |status| v.status() == status))
            .filter(|v| filter.week.map_or(true, |week| v.week == week))
            .filter(|v| {
                filter
                    .starts_on_or_after
                    .map_or(true, |date| v.week.start() >= date)
            })
            .filter(|v| {
                filter
                    .ends_on_or_before
                    .map_or(true, |date| v.week.end() <= date)
            })
            .cloned()
            .collect();
        volumes.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(volumes)
    }

    async fn list_volume_history(
        &self,
        weekly_volume_id: Uuid,
    ) -> Result<Vec<WeeklyVolumeHistory>, Error> {
        let state = self.state.lock()?;
        let mut history: Vec<_> = state
            .history
            .iter()
            .rev()
            .filter(|h| h.weekly_volume_id == weekly_volume_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(history)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), Error> {
        let mut state = self.state.lock()?;
        let now = changes.now;

        // Check everything before writing anything
        if let Some(update) = &changes.ledger {
            state.check_version(update)?;
        }
        let close = changes
            .volume
            .map(|close| state.prepare_close(close, now))
            .transpose()?;

        if let Some(update) = changes.ledger {
            state.write_ledger(update, now);
        }
        if let Some((row, successor)) = close {
            state.write_volume(row);
            state.write_volume(successor);
        }

        Ok(())
    }
}

/// Erased [`PoisonError`]
///
/// `PoisonError` keeps the `MutexGuard` internally, which is not send. Thus we erase the error
/// and only keep the string representation instead.
#[derive(Debug, thiserror::Error)]
#[error("poison error: {0}")]
pub struct ErasedPoisonError(String);

/// We need to create a custom `From` implementation here for an error that's specific to this
/// adapter.
impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Self::Adapter(Box::new(ErasedPoisonError(err.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{
            ledger::Earning, Side, TransactionStatus, TransactionType,
            UserProfile, VolumeStatus,
        },
        ports::database::CarryOver,
    };
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use speculoos::prelude::*;

    fn profile() -> UserProfile {
        UserProfile::new(Uuid::new_v4(), "user@example.com", Some("Jane Doe"))
    }

    fn week() -> Week {
        Week::containing(NaiveDate::from_ymd_opt(2024, 6, 12).unwrap())
    }

    fn accrual(profile: &UserProfile, side: Side, amount: Decimal) -> VolumeAccrual {
        VolumeAccrual {
            user_id: profile.user_id,
            week: week(),
            side,
            amount,
            payment_id: Some("pay-1".to_string()),
            profile: Some(profile.clone()),
            now: Utc::now(),
        }
    }

    async fn credited(database: &MemoryDatabase, profile: &UserProfile, amount: Decimal) {
        let ledger = UserLedger::empty(profile, Utc::now());
        let credit = ledger
            .credit(
                Earning::BinaryCommission,
                amount,
                Metadata::new(),
                vec![],
                Utc::now(),
            )
            .unwrap();
        database
            .commit(ChangeSet {
                ledger: Some(credit.update),
                volume: None,
                now: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_retrieve_ledger() {
        let database = MemoryDatabase::default();
        let profile = profile();

        credited(&database, &profile, dec!(25)).await;

        let res = database.load_ledger(profile.user_id).await;
        assert_that!(res).is_ok().is_some().matches(|ledger| {
            ledger.points.available_points() == dec!(25)
                && ledger.points.version() == 1
                && ledger.transactions.len() == 1
        });
    }

    #[tokio::test]
    async fn test_commit_stale_version_conflicts() {
        let database = MemoryDatabase::default();
        let profile = profile();
        credited(&database, &profile, dec!(25)).await;

        // Computed from an empty snapshot while the stored row is already at version 1
        let stale = UserLedger::empty(&profile, Utc::now())
            .credit(
                Earning::DirectBonus,
                dec!(5),
                Metadata::new(),
                vec![],
                Utc::now(),
            )
            .unwrap();
        let res = database
            .commit(ChangeSet {
                ledger: Some(stale.update),
                volume: None,
                now: Utc::now(),
            })
            .await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::Conflict(id) if *id == profile.user_id));
        let points = database.get_user_points(profile.user_id).await.unwrap();
        assert_that!(points)
            .is_some()
            .matches(|p| p.available_points() == dec!(25));
    }

    #[tokio::test]
    async fn test_commit_stamps_change_set_time() {
        let database = MemoryDatabase::default();
        let profile = profile();
        let recorded = database
            .record_volume(accrual(&profile, Side::Left, dec!(100)))
            .await
            .unwrap();
        let replayed_at = Utc.with_ymd_and_hms(2024, 6, 17, 0, 5, 0).unwrap();

        let credit = UserLedger::empty(&profile, replayed_at)
            .credit(
                Earning::BinaryCommission,
                dec!(8),
                Metadata::new(),
                vec![],
                replayed_at,
            )
            .unwrap();
        let mut row = recorded.volume.clone();
        row.settle(Side::Right, dec!(8), Metadata::new(), replayed_at)
            .unwrap();
        database
            .commit(ChangeSet {
                ledger: Some(credit.update),
                volume: Some(VolumeClose {
                    row,
                    carry_over: CarryOver {
                        week: week().next(),
                        left: dec!(100),
                        right: dec!(0),
                        profile: profile.clone(),
                        metadata: Metadata::new(),
                        now: replayed_at,
                    },
                }),
                now: replayed_at,
            })
            .await
            .unwrap();

        // Every written row carries the caller's time, not the wall clock
        let points = database.get_user_points(profile.user_id).await.unwrap();
        assert_that!(points)
            .is_some()
            .matches(|p| p.updated_at == replayed_at);
        let closed = database.get_weekly_volume(recorded.volume.id).await.unwrap();
        assert_that!(closed)
            .is_some()
            .matches(|v| v.updated_at == replayed_at);
        let successor = database
            .find_weekly_volume(profile.user_id, week().next())
            .await
            .unwrap();
        assert_that!(successor)
            .is_some()
            .matches(|v| v.created_at == replayed_at && v.updated_at == replayed_at);
    }

    #[tokio::test]
    async fn test_record_volume_creates_then_updates() {
        let database = MemoryDatabase::default();
        let profile = profile();

        let first = database
            .record_volume(accrual(&profile, Side::Left, dec!(100)))
            .await
            .unwrap();
        let mut second_accrual = accrual(&profile, Side::Right, dec!(40));
        second_accrual.profile = None;
        let second = database.record_volume(second_accrual).await.unwrap();

        assert_that!(first.action).is_equal_to(AccrualAction::Created);
        assert_that!(second.action).is_equal_to(AccrualAction::Updated);
        assert_that!(second.volume.id).is_equal_to(first.volume.id);
        assert_that!(second.volume.left_volume()).is_equal_to(dec!(100));
        assert_that!(second.volume.right_volume()).is_equal_to(dec!(40));
        let history = database.list_volume_history(first.volume.id).await.unwrap();
        assert_that!(history).has_length(2);
    }

    #[tokio::test]
    async fn test_record_volume_requires_profile_for_new_row() {
        let database = MemoryDatabase::default();
        let mut accrual = accrual(&profile(), Side::Left, dec!(1));
        accrual.profile = None;

        let res = database.record_volume(accrual).await;

        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::MissingProfile(_)));
    }

    #[tokio::test]
    async fn test_close_refuses_settled_row() {
        let database = MemoryDatabase::default();
        let profile = profile();
        let recorded = database
            .record_volume(accrual(&profile, Side::Left, dec!(100)))
            .await
            .unwrap();

        let mut row = recorded.volume.clone();
        row.cancel(Metadata::new(), Utc::now()).unwrap();
        let close = VolumeClose {
            row,
            carry_over: CarryOver {
                week: week().next(),
                left: dec!(100),
                right: dec!(0),
                profile: profile.clone(),
                metadata: Metadata::new(),
                now: Utc::now(),
            },
        };

        let res = database
            .commit(ChangeSet {
                ledger: None,
                volume: Some(close.clone()),
                now: Utc::now(),
            })
            .await;
        assert_that!(res).is_ok();
        let res = database
            .commit(ChangeSet {
                ledger: None,
                volume: Some(close),
                now: Utc::now(),
            })
            .await;
        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::VolumeNotPending(_)));

        // The successor only received the carry once
        let successor = database
            .find_weekly_volume(profile.user_id, week().next())
            .await
            .unwrap();
        assert_that!(successor).is_some().matches(|v| {
            v.left_volume() == dec!(100) && v.status() == VolumeStatus::Pending
        });
    }

    #[tokio::test]
    async fn test_failed_commit_writes_nothing() {
        let database = MemoryDatabase::default();
        let profile = profile();
        let recorded = database
            .record_volume(accrual(&profile, Side::Left, dec!(100)))
            .await
            .unwrap();
        credited(&database, &profile, dec!(10)).await;

        // Ledger part is stale, volume part is fine
        let stale = UserLedger::empty(&profile, Utc::now())
            .credit(
                Earning::BinaryCommission,
                dec!(5),
                Metadata::new(),
                vec![],
                Utc::now(),
            )
            .unwrap();
        let mut row = recorded.volume.clone();
        row.settle(Side::Right, dec!(5), Metadata::new(), Utc::now())
            .unwrap();
        let res = database
            .commit(ChangeSet {
                ledger: Some(stale.update),
                volume: Some(VolumeClose {
                    row,
                    carry_over: CarryOver {
                        week: week().next(),
                        left: dec!(50),
                        right: dec!(0),
                        profile: profile.clone(),
                        metadata: Metadata::new(),
                        now: Utc::now(),
                    },
                }),
                now: Utc::now(),
            })
            .await;

        assert_that!(res).is_err();
        let stored = database.get_weekly_volume(recorded.volume.id).await.unwrap();
        assert_that!(stored)
            .is_some()
            .matches(|v| v.status() == VolumeStatus::Pending);
        let successor = database
            .find_weekly_volume(profile.user_id, week().next())
            .await
            .unwrap();
        assert_that!(successor).is_none();
    }

    #[tokio::test]
    async fn test_list_transactions_filters() {
        let database = MemoryDatabase::default();
        let profile = profile();
        credited(&database, &profile, dec!(10)).await;
        let ledger = database
            .load_ledger(profile.user_id)
            .await
            .unwrap()
            .unwrap();
        let lot = ledger
            .credit(
                Earning::LotDirectBonus,
                dec!(3),
                Metadata::new(),
                vec![],
                Utc::now(),
            )
            .unwrap();
        database
            .commit(ChangeSet {
                ledger: Some(lot.update),
                volume: None,
                now: Utc::now(),
            })
            .await
            .unwrap();

        let all = database
            .list_transactions(TransactionFilter {
                user_id: Some(profile.user_id),
                ..Default::default()
            })
            .await
            .unwrap();
        let lots = database
            .list_transactions(TransactionFilter {
                user_id: Some(profile.user_id),
                pool: Some(crate::domain::PointsPool::Lot),
                ..Default::default()
            })
            .await
            .unwrap();
        let cancelled = database
            .list_transactions(TransactionFilter {
                user_id: Some(profile.user_id),
                status: Some(TransactionStatus::Cancelled),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_that!(all).has_length(2);
        // Newest first
        assert_that!(all[0].transaction_type).is_equal_to(TransactionType::LotDirectBonus);
        assert_that!(lots).has_length(1);
        assert_that!(cancelled).is_empty();
    }
}
