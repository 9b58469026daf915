use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::{
        ledger::Earning,
        points::{ensure_positive, PaymentLink},
        to_metadata, Metadata, PointsTransaction,
    },
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
use tracing::info;
use uuid::Uuid;

use super::{DomainLogic, Error};

/// Credit earned points, e.g. a direct bonus granted by another service
#[derive(Debug, Clone, PartialEq)]
pub struct CreditPointsRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub kind: Earning,
    pub metadata: Metadata,
    pub payment: Option<PaymentLink>,
}

/// Spend points, e.g. to pay for an order
#[derive(Debug, Clone, PartialEq)]
pub struct DebitPointsRequest {
    pub user_id: Uuid,
    pub amount: Decimal,
    pub metadata: Metadata,
    pub payment: Option<PaymentLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreditLotPointsRequest {
    pub user_id: Uuid,
    pub points: Decimal,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditLotPointsResponse {
    pub user_id: Uuid,
    pub available_lot_points: Decimal,
    pub total_earned_lot_points: Decimal,
    pub transaction: PointsTransaction,
}

impl<D, U, M> Service<CreditPointsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = PointsTransaction;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreditPointsRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            ensure_positive(req.amount)?;
            let this = &this;
            let req = &req;

            let transaction = this
                .with_ledger_retry(req.user_id, || async move {
                    let now = this.clock.now();
                    let ledger = this.ledger_or_empty(req.user_id).await?;
                    let credit = ledger.credit(
                        req.kind,
                        req.amount,
                        req.metadata.clone(),
                        req.payment.iter().cloned().collect(),
                        now,
                    )?;
                    this.database
                        .commit(ChangeSet {
                            ledger: Some(credit.update),
                            volume: None,
                            now,
                        })
                        .await?;
                    Ok::<_, Error>(credit.transaction)
                })
                .await?;

            info!(
                user_id = %req.user_id,
                amount = %req.amount,
                kind = ?req.kind,
                transaction_id = %transaction.id,
                "points credited"
            );
            Ok(transaction)
        })
    }
}

impl<D, U, M> Service<DebitPointsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = PointsTransaction;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: DebitPointsRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            ensure_positive(req.amount)?;
            let this = &this;
            let req = &req;

            let transaction = this
                .with_ledger_retry(req.user_id, || async move {
                    let now = this.clock.now();
                    let ledger = this.ledger_or_empty(req.user_id).await?;
                    let debit = ledger.debit(
                        req.amount,
                        req.metadata.clone(),
                        req.payment.clone(),
                        now,
                    )?;
                    this.database
                        .commit(ChangeSet {
                            ledger: Some(debit.update),
                            volume: None,
                            now,
                        })
                        .await?;
                    Ok::<_, Error>(debit.transaction)
                })
                .await?;

            info!(
                user_id = %req.user_id,
                amount = %req.amount,
                transaction_id = %transaction.id,
                "points debited"
            );
            Ok(transaction)
        })
    }
}

impl<D, U, M> Service<CreditLotPointsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = CreditLotPointsResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CreditLotPointsRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            ensure_positive(req.points)?;
            let this = &this;
            let req = &req;

            let response = this
                .with_ledger_retry(req.user_id, || async move {
                    let now = this.clock.now();
                    let ledger = this.ledger_or_empty(req.user_id).await?;
                    let metadata = req
                        .reference
                        .as_ref()
                        .map(|reference| to_metadata(json!({ "reference": reference })))
                        .unwrap_or_default();
                    let credit = ledger.credit(
                        Earning::LotDirectBonus,
                        req.points,
                        metadata,
                        Vec::new(),
                        now,
                    )?;
                    let points = credit.update.points.clone();
                    this.database
                        .commit(ChangeSet {
                            ledger: Some(credit.update),
                            volume: None,
                            now,
                        })
                        .await?;
                    Ok::<_, Error>(CreditLotPointsResponse {
                        user_id: req.user_id,
                        available_lot_points: points.available_lot_points(),
                        total_earned_lot_points: points.total_earned_lot_points(),
                        transaction: credit.transaction,
                    })
                })
                .await?;

            info!(user_id = %req.user_id, points = %req.points, "lot points credited");
            Ok(response)
        })
    }
}
