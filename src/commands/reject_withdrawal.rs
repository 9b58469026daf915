use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::{ledger::Allocation, to_metadata},
    ports::{
        database::{ChangeSet, DatabasePort},
        directory::DirectoryPort,
        membership::MembershipPort,
    },
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tower::Service;
use tracing::{info, warn};
use uuid::Uuid;

use super::{DomainLogic, Error};

/// Review decision refusing a withdrawal and giving the points back
#[derive(Debug, Clone, PartialEq)]
pub struct RejectWithdrawalRequest {
    pub withdrawal_id: String,
    pub user_id: Uuid,
    /// Amount that was reserved
    pub amount: Decimal,
    pub reviewer_id: String,
    pub reviewer_email: String,
    pub reason: Option<String>,
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectWithdrawalResponse {
    pub withdrawal_id: String,
    pub withdrawal_transaction_id: Option<Uuid>,
    pub restored_points: Decimal,
    pub available_points: Decimal,
}

impl<D, U, M> Service<RejectWithdrawalRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = RejectWithdrawalResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RejectWithdrawalRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let this = &this;
            let req = &req;

            let resolution = this
                .with_ledger_retry(req.user_id, || async move {
                    let now = this.clock.now();
                    let ledger = this.existing_ledger(req.user_id).await?;
                    let notes = to_metadata(json!({
                        "withdrawalId": req.withdrawal_id,
                        "rejectedBy": req.reviewer_id,
                        "rejectedByEmail": req.reviewer_email,
                        "rejectedAt": now,
                        "rejectionReason": req.reason,
                    }));
                    let resolution = ledger.reject(req.amount, &req.allocations, notes)?;
                    this.database
                        .commit(ChangeSet {
                            ledger: Some(resolution.update.clone()),
                            volume: None,
                            now,
                        })
                        .await?;
                    Ok::<_, Error>(resolution)
                })
                .await?;

            if resolution.withdrawal_transaction_id.is_none() {
                warn!(
                    user_id = %req.user_id,
                    withdrawal_id = %req.withdrawal_id,
                    "no pending withdrawal transaction to cancel"
                );
            }
            info!(
                user_id = %req.user_id,
                withdrawal_id = %req.withdrawal_id,
                amount = %req.amount,
                "withdrawal rejected"
            );
            Ok(RejectWithdrawalResponse {
                withdrawal_id: req.withdrawal_id.clone(),
                withdrawal_transaction_id: resolution.withdrawal_transaction_id,
                restored_points: req.amount,
                available_points: resolution.update.points.available_points(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::database::memory::MemoryDatabase,
        commands::{
            credit_points::CreditPointsRequest,
            reserve_withdrawal::ReserveWithdrawalRequest,
            testing::{domain, user},
        },
        domain::{ledger::Earning, Metadata, TransactionStatus},
        ports::{directory::MockDirectoryPort, membership::MockMembershipPort},
    };
    use mockall::predicate::*;
    use rstest::*;
    use rust_decimal_macros::dec;
    use speculoos::prelude::*;
    use tower::{BoxError, ServiceExt};

    #[fixture]
    fn user_id() -> Uuid {
        Uuid::new_v4()
    }

    #[rstest]
    #[tokio::test]
    async fn test_reject_restores_points(user_id: Uuid) -> Result<(), BoxError> {
        // GIVEN 100 earned with 60 reserved
        let mut directory = MockDirectoryPort::new();
        directory
            .expect_get_user()
            .with(eq(user_id))
            .returning(|id| Ok(user(id)));
        let database = MemoryDatabase::default();
        let mut domain = domain(database.clone(), directory, MockMembershipPort::new());
        let earning = ServiceExt::<CreditPointsRequest>::ready(&mut domain)
            .await?
            .call(CreditPointsRequest {
                user_id,
                amount: dec!(100),
                kind: Earning::DirectBonus,
                metadata: Metadata::new(),
                payment: None,
            })
            .await?;
        let reservation = ServiceExt::<ReserveWithdrawalRequest>::ready(&mut domain)
            .await?
            .call(ReserveWithdrawalRequest {
                user_id,
                amount: dec!(60),
            })
            .await?;

        // WHEN rejecting the withdrawal
        let res = ServiceExt::<RejectWithdrawalRequest>::ready(&mut domain)
            .await?
            .call(RejectWithdrawalRequest {
                withdrawal_id: "wd-2".to_string(),
                user_id,
                amount: dec!(60),
                reviewer_id: "admin-9".to_string(),
                reviewer_email: "admin@example.com".to_string(),
                reason: Some("bank details do not match".to_string()),
                allocations: reservation.allocations.iter().map(Allocation::from).collect(),
            })
            .await;

        // THEN
        // * the points are available again
        // * the hold on the earning is gone
        // * the withdrawal transaction is cancelled with the reason
        assert_that!(res).is_ok().matches(|r| {
            r.available_points == dec!(100)
                && r.withdrawal_transaction_id == Some(reservation.withdrawal_transaction_id)
        });
        let points = database.get_user_points(user_id).await?;
        assert_that!(points).is_some().matches(|p| {
            p.available_points() == dec!(100) && p.total_withdrawn_points() == dec!(0)
        });
        let earning = database.get_transaction(earning.id).await?;
        assert_that!(earning)
            .is_some()
            .matches(|t| t.pending_amount() == dec!(0) && t.available() == dec!(100));
        let withdrawal = database
            .get_transaction(reservation.withdrawal_transaction_id)
            .await?;
        assert_that!(withdrawal).is_some().matches(|t| {
            t.status == TransactionStatus::Cancelled
                && t.metadata.get("rejectionReason")
                    == Some(&serde_json::Value::from("bank details do not match"))
        });

        Ok(())
    }
}
