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
use serde::Serialize;
use serde_json::json;
use tower::Service;
use tracing::{info, warn};
use uuid::Uuid;

use super::{DomainLogic, Error};

/// Review decision accepting a withdrawal
#[derive(Debug, Clone, PartialEq)]
pub struct ApproveWithdrawalRequest {
    /// Identifier of the withdrawal in the approval workflow
    pub withdrawal_id: String,
    pub user_id: Uuid,
    pub reviewer_id: String,
    pub reviewer_email: String,
    /// Allocations returned when the points were reserved
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApproveWithdrawalResponse {
    pub withdrawal_id: String,
    pub withdrawal_transaction_id: Option<Uuid>,
    pub transactions_updated: usize,
}

impl<D, U, M> Service<ApproveWithdrawalRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = ApproveWithdrawalResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApproveWithdrawalRequest) -> Self::Future {
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
                        "approvedBy": req.reviewer_id,
                        "approvedByEmail": req.reviewer_email,
                        "approvedAt": now,
                    }));
                    let resolution = ledger.approve(&req.allocations, notes)?;
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
                    "no pending withdrawal transaction to complete"
                );
            }
            info!(
                user_id = %req.user_id,
                withdrawal_id = %req.withdrawal_id,
                reviewer_id = %req.reviewer_id,
                "withdrawal approved"
            );
            Ok(ApproveWithdrawalResponse {
                withdrawal_id: req.withdrawal_id.clone(),
                withdrawal_transaction_id: resolution.withdrawal_transaction_id,
                transactions_updated: req.allocations.len(),
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
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use speculoos::prelude::*;
    use tower::{BoxError, ServiceExt};

    type Domain = DomainLogic<MemoryDatabase, MockDirectoryPort, MockMembershipPort>;

    #[fixture]
    fn user_id() -> Uuid {
        Uuid::new_v4()
    }

    fn setup(user_id: Uuid) -> (MemoryDatabase, Domain) {
        let mut directory = MockDirectoryPort::new();
        directory
            .expect_get_user()
            .with(eq(user_id))
            .returning(|id| Ok(user(id)));
        let database = MemoryDatabase::default();
        let domain = domain(database.clone(), directory, MockMembershipPort::new());
        (database, domain)
    }

    async fn earn(domain: &mut Domain, user_id: Uuid, amount: Decimal) -> Uuid {
        ServiceExt::<CreditPointsRequest>::ready(domain)
            .await
            .unwrap()
            .call(CreditPointsRequest {
                user_id,
                amount,
                kind: Earning::BinaryCommission,
                metadata: Metadata::new(),
                payment: None,
            })
            .await
            .unwrap()
            .id
    }

    fn approval(user_id: Uuid, allocations: Vec<Allocation>) -> ApproveWithdrawalRequest {
        ApproveWithdrawalRequest {
            withdrawal_id: "wd-1".to_string(),
            user_id,
            reviewer_id: "admin-9".to_string(),
            reviewer_email: "admin@example.com".to_string(),
            allocations,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_approve_archives_drained_transaction(user_id: Uuid) -> Result<(), BoxError> {
        // GIVEN 100 earned and fully reserved
        let (database, mut domain) = setup(user_id);
        let earning = earn(&mut domain, user_id, dec!(100)).await;
        let reservation = ServiceExt::<ReserveWithdrawalRequest>::ready(&mut domain)
            .await?
            .call(ReserveWithdrawalRequest {
                user_id,
                amount: dec!(100),
            })
            .await?;
        let allocations = reservation.allocations.iter().map(Allocation::from).collect();

        // WHEN approving the withdrawal
        let res = ServiceExt::<ApproveWithdrawalRequest>::ready(&mut domain)
            .await?
            .call(approval(user_id, allocations))
            .await;

        // THEN
        // * the earning is collected and archived
        // * the withdrawal transaction is completed with reviewer details
        // * the balance is untouched by the approval
        assert_that!(res).is_ok().is_equal_to(ApproveWithdrawalResponse {
            withdrawal_id: "wd-1".to_string(),
            withdrawal_transaction_id: Some(reservation.withdrawal_transaction_id),
            transactions_updated: 1,
        });
        let earning = database.get_transaction(earning).await?;
        assert_that!(earning).is_some().matches(|t| {
            t.withdrawn_amount() == dec!(100) && t.pending_amount() == dec!(0) && t.is_archived()
        });
        let withdrawal = database
            .get_transaction(reservation.withdrawal_transaction_id)
            .await?;
        assert_that!(withdrawal).is_some().matches(|t| {
            t.status == TransactionStatus::Completed
                && t.metadata.get("approvedBy") == Some(&serde_json::Value::from("admin-9"))
        });
        let points = database.get_user_points(user_id).await?;
        assert_that!(points).is_some().matches(|p| {
            p.available_points() == dec!(0) && p.total_withdrawn_points() == dec!(100)
        });

        Ok(())
    }

    #[rstest]
    #[tokio::test]
    async fn test_approve_unknown_transaction(user_id: Uuid) -> Result<(), BoxError> {
        // GIVEN a user with a reservation
        let (database, mut domain) = setup(user_id);
        earn(&mut domain, user_id, dec!(50)).await;
        let reservation = ServiceExt::<ReserveWithdrawalRequest>::ready(&mut domain)
            .await?
            .call(ReserveWithdrawalRequest {
                user_id,
                amount: dec!(20),
            })
            .await?;

        // WHEN approving with an allocation that is not theirs
        let res = ServiceExt::<ApproveWithdrawalRequest>::ready(&mut domain)
            .await?
            .call(approval(
                user_id,
                vec![Allocation {
                    points_transaction_id: Uuid::new_v4(),
                    amount_used: dec!(20),
                }],
            ))
            .await;

        // THEN nothing is committed
        assert_that!(res)
            .is_err()
            .matches(|err| matches!(err, Error::NotFound(_)));
        let withdrawal = database
            .get_transaction(reservation.withdrawal_transaction_id)
            .await?;
        assert_that!(withdrawal)
            .is_some()
            .matches(|t| t.status == TransactionStatus::Pending);

        Ok(())
    }
}
