use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::ledger::Allocation,
    ports::{
        database::{ChangeSet, DatabasePort},
        directory::DirectoryPort,
        membership::MembershipPort,
    },
};
use rust_decimal::Decimal;
use serde::Serialize;
use tower::Service;
use tracing::{info, warn};
use uuid::Uuid;

use super::{DomainLogic, Error};

/// Undo a reservation whose withdrawal could not be created downstream
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReservedPointsRequest {
    pub user_id: Uuid,
    pub allocations: Vec<Allocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackReservedPointsResponse {
    pub restored_points: Decimal,
    /// Allocations pointing at unknown transactions
    pub skipped: Vec<Uuid>,
    pub removed_withdrawal_transaction_id: Option<Uuid>,
}

impl<D, U, M> Service<RollbackReservedPointsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = RollbackReservedPointsResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RollbackReservedPointsRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let this = &this;
            let req = &req;

            let rollback = this
                .with_ledger_retry(req.user_id, || async move {
                    let now = this.clock.now();
                    let ledger = this.existing_ledger(req.user_id).await?;
                    let rollback = ledger.rollback(&req.allocations)?;
                    this.database
                        .commit(ChangeSet {
                            ledger: Some(rollback.update.clone()),
                            volume: None,
                            now,
                        })
                        .await?;
                    Ok::<_, Error>(rollback)
                })
                .await?;

            for id in &rollback.skipped {
                warn!(
                    user_id = %req.user_id,
                    points_transaction_id = %id,
                    "rollback skipped unknown transaction"
                );
            }
            info!(
                user_id = %req.user_id,
                restored = %rollback.restored,
                "reserved points rolled back"
            );
            Ok(RollbackReservedPointsResponse {
                restored_points: rollback.restored,
                skipped: rollback.skipped,
                removed_withdrawal_transaction_id: rollback.removed_withdrawal,
            })
        })
    }
}
