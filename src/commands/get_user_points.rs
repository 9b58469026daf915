use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::{ledger::LedgerUpdate, UserPoints},
    ports::{
        database::{ChangeSet, DatabasePort},
        directory::DirectoryPort,
        membership::MembershipPort,
    },
};
use rust_decimal::Decimal;
use serde::Serialize;
use tower::Service;
use tracing::warn;
use uuid::Uuid;

use super::{upstream, DomainLogic, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetUserPointsRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPointsResponse {
    pub user_id: Uuid,
    pub user_email: String,
    pub user_name: Option<String>,
    pub available_points: Decimal,
    pub total_earned_points: Decimal,
    pub total_withdrawn_points: Decimal,
    pub membership_plan: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetLotPointsRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotPointsResponse {
    pub user_id: Uuid,
    pub available_lot_points: Decimal,
    pub total_earned_lot_points: Decimal,
    pub total_withdrawn_lot_points: Decimal,
    pub membership_plan: Option<String>,
}

impl<D, U, M> Service<GetUserPointsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = UserPointsResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: GetUserPointsRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let points = this.open_points(req.user_id).await?;
            let membership_plan = this.plan_name(req.user_id).await;

            Ok(UserPointsResponse {
                user_id: points.user_id,
                user_email: points.user_email.clone(),
                user_name: points.user_name.clone(),
                available_points: points.available_points(),
                total_earned_points: points.total_earned_points(),
                total_withdrawn_points: points.total_withdrawn_points(),
                membership_plan,
            })
        })
    }
}

impl<D, U, M> Service<GetLotPointsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = LotPointsResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: GetLotPointsRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            this.profile(req.user_id).await?;
            let points = this
                .database
                .get_user_points(req.user_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("points of user {}", req.user_id).into()))?;
            let membership_plan = this.plan_name(req.user_id).await;

            Ok(LotPointsResponse {
                user_id: points.user_id,
                available_lot_points: points.available_lot_points(),
                total_earned_lot_points: points.total_earned_lot_points(),
                total_withdrawn_lot_points: points.total_withdrawn_lot_points(),
                membership_plan,
            })
        })
    }
}

impl<D, U, M> DomainLogic<D, U, M>
where
    D: DatabasePort,
    U: DirectoryPort,
    M: MembershipPort,
{
    /// Points row of a user, created empty on first reference
    async fn open_points(&self, user_id: Uuid) -> Result<UserPoints, Error> {
        let profile = self.profile(user_id).await?;
        if let Some(points) = self.database.get_user_points(user_id).await? {
            return Ok(points);
        }

        let now = self.clock.now();
        let opened = self
            .database
            .commit(ChangeSet {
                ledger: Some(LedgerUpdate {
                    user_id,
                    expected_version: 0,
                    points: UserPoints::new(&profile, now),
                    upserted: Vec::new(),
                    removed: Vec::new(),
                    payments: Vec::new(),
                }),
                volume: None,
                now,
            })
            .await;
        match opened {
            // Someone else opened it first
            Err(err) if err.is_conflict() => {}
            res => res?,
        }

        self.database
            .get_user_points(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("points of user {user_id}").into()))
    }

    /// Name of the user's membership plan, if the membership service can tell
    async fn plan_name(&self, user_id: Uuid) -> Option<String> {
        let info = upstream(
            self.upstream_timeout(),
            "membership",
            self.membership.get_user_membership_info(user_id),
        )
        .await;
        match info {
            Ok(info) => info.plan.map(|plan| plan.name),
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "membership plan unavailable");
                None
            }
        }
    }
}
