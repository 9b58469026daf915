use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::{ledger::ReservedTransaction, points::ensure_positive},
    ports::{
        database::{ChangeSet, DatabasePort},
        directory::DirectoryPort,
        membership::MembershipPort,
    },
};
use rust_decimal::Decimal;
use serde::Serialize;
use tower::Service;
use tracing::info;
use uuid::Uuid;

use super::{DomainLogic, Error};

/// Hold points for a withdrawal request awaiting review
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReserveWithdrawalRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReserveWithdrawalResponse {
    /// Transactions the amount was drawn from, oldest first
    pub allocations: Vec<ReservedTransaction>,
    pub withdrawal_transaction_id: Uuid,
}

impl<D, U, M> Service<ReserveWithdrawalRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = ReserveWithdrawalResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ReserveWithdrawalRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.reserve_for_withdrawal(req).await })
    }
}

impl<D, U, M> DomainLogic<D, U, M>
where
    D: DatabasePort,
    U: DirectoryPort,
{
    #[tracing::instrument(
        name = "points.reserve_withdrawal",
        skip_all,
        fields(user_id = %req.user_id, amount = %req.amount)
    )]
    async fn reserve_for_withdrawal(
        &self,
        req: ReserveWithdrawalRequest,
    ) -> Result<ReserveWithdrawalResponse, Error> {
        ensure_positive(req.amount)?;

        let reservation = self
            .with_ledger_retry(req.user_id, || async move {
                let now = self.clock.now();
                let ledger = self.existing_ledger(req.user_id).await?;
                let reservation = ledger.reserve(req.amount, now)?;
                self.database
                    .commit(ChangeSet {
                        ledger: Some(reservation.update.clone()),
                        volume: None,
                        now,
                    })
                    .await?;
                Ok::<_, Error>(reservation)
            })
            .await?;

        info!(
            withdrawal_transaction_id = %reservation.withdrawal_transaction_id,
            transactions = reservation.reserved.len(),
            "points reserved for withdrawal"
        );
        Ok(ReserveWithdrawalResponse {
            allocations: reservation.reserved,
            withdrawal_transaction_id: reservation.withdrawal_transaction_id,
        })
    }
}
