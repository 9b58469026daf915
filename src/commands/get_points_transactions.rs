use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::{
        PointsPool, PointsTransaction, PointsTransactionPayment, TransactionStatus, TransactionType,
    },
    ports::{
        database::{DatabasePort, TransactionFilter},
        directory::DirectoryPort,
        membership::MembershipPort,
    },
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tower::Service;
use uuid::Uuid;

use super::{DomainLogic, Error};

/// Ledger history of a user
///
/// Dates are calendar days in UTC; `end_date` includes the whole day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetPointsTransactionsRequest {
    pub user_id: Uuid,
    pub transaction_type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub pool: Option<PointsPool>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl GetPointsTransactionsRequest {
    fn filter(&self) -> TransactionFilter {
        TransactionFilter {
            user_id: Some(self.user_id),
            transaction_type: self.transaction_type,
            status: self.status,
            pool: self.pool,
            created_from: self.start_date.map(start_of_day),
            created_until: self.end_date.map(end_of_day),
        }
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let last = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN);
    date.and_time(last).and_utc()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetTransactionPaymentsRequest {
    pub transaction_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionPaymentsResponse {
    pub transaction: PointsTransaction,
    pub payments: Vec<PointsTransactionPayment>,
}

impl<D, U, M> Service<GetPointsTransactionsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = Vec<PointsTransaction>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: GetPointsTransactionsRequest) -> Self::Future {
        let database = self.database.clone();
        Box::pin(async move {
            if let (Some(start), Some(end)) = (req.start_date, req.end_date) {
                if start > end {
                    return Err(Error::InvalidState(
                        format!("start date {start} is after end date {end}").into(),
                    ));
                }
            }
            Ok(database.list_transactions(req.filter()).await?)
        })
    }
}

impl<D, U, M> Service<GetTransactionPaymentsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = TransactionPaymentsResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: GetTransactionPaymentsRequest) -> Self::Future {
        let database = self.database.clone();
        Box::pin(async move {
            // Transactions of other users are reported as missing
            let transaction = database
                .get_transaction(req.transaction_id)
                .await?
                .filter(|t| t.user_id == req.user_id)
                .ok_or_else(|| {
                    Error::NotFound(format!("points transaction {}", req.transaction_id).into())
                })?;
            let payments = database.list_transaction_payments(transaction.id).await?;

            Ok(TransactionPaymentsResponse {
                transaction,
                payments,
            })
        })
    }
}
