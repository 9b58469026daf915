use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::{VolumeStatus, Week, WeeklyVolume, WeeklyVolumeHistory},
    ports::{
        database::{DatabasePort, VolumeFilter},
        directory::DirectoryPort,
        membership::MembershipPort,
    },
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tower::Service;
use uuid::Uuid;

use super::{DomainLogic, Error};

/// Rows of a user, newest first
///
/// `start_date` bounds the first day of each week and `end_date` its last day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetUserWeeklyVolumesRequest {
    pub user_id: Uuid,
    pub status: Option<VolumeStatus>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetWeeklyVolumeDetailRequest {
    pub id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetWeeklyVolumeHistoryRequest {
    pub weekly_volume_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetWeeklyVolumeStatsRequest {
    pub week: Week,
}

/// Totals over every row of a week
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeeklyVolumeStats {
    pub week: Week,
    pub records: usize,
    pub total_left: Decimal,
    pub total_right: Decimal,
    pub total_volume: Decimal,
    pub pending: usize,
    pub processed: usize,
    pub cancelled: usize,
}

impl WeeklyVolumeStats {
    fn new(week: Week, rows: &[WeeklyVolume]) -> Self {
        let count = |status| rows.iter().filter(|v| v.status() == status).count();
        let total_left = rows.iter().map(WeeklyVolume::left_volume).sum::<Decimal>();
        let total_right = rows.iter().map(WeeklyVolume::right_volume).sum::<Decimal>();

        Self {
            week,
            records: rows.len(),
            total_left,
            total_right,
            total_volume: total_left + total_right,
            pending: count(VolumeStatus::Pending),
            processed: count(VolumeStatus::Processed),
            cancelled: count(VolumeStatus::Cancelled),
        }
    }
}

impl<D, U, M> Service<GetUserWeeklyVolumesRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = Vec<WeeklyVolume>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: GetUserWeeklyVolumesRequest) -> Self::Future {
        let database = self.database.clone();
        Box::pin(async move {
            if let (Some(start), Some(end)) = (req.start_date, req.end_date) {
                if start > end {
                    return Err(Error::InvalidState(
                        format!("start date {start} is after end date {end}").into(),
                    ));
                }
            }
            let filter = VolumeFilter {
                user_id: Some(req.user_id),
                status: req.status,
                week: None,
                starts_on_or_after: req.start_date,
                ends_on_or_before: req.end_date,
            };
            Ok(database.list_weekly_volumes(filter).await?)
        })
    }
}

impl<D, U, M> Service<GetWeeklyVolumeDetailRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = WeeklyVolume;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: GetWeeklyVolumeDetailRequest) -> Self::Future {
        let database = self.database.clone();
        Box::pin(async move {
            database
                .get_weekly_volume(req.id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("weekly volume {}", req.id).into()))
        })
    }
}

impl<D, U, M> Service<GetWeeklyVolumeHistoryRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = Vec<WeeklyVolumeHistory>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: GetWeeklyVolumeHistoryRequest) -> Self::Future {
        let database = self.database.clone();
        Box::pin(async move {
            let id = req.weekly_volume_id;
            if database.get_weekly_volume(id).await?.is_none() {
                return Err(Error::NotFound(format!("weekly volume {id}").into()));
            }
            Ok(database.list_volume_history(id).await?)
        })
    }
}

impl<D, U, M> Service<GetWeeklyVolumeStatsRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = WeeklyVolumeStats;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: GetWeeklyVolumeStatsRequest) -> Self::Future {
        let database = self.database.clone();
        Box::pin(async move {
            let rows = database
                .list_weekly_volumes(VolumeFilter {
                    week: Some(req.week),
                    ..Default::default()
                })
                .await?;
            Ok(WeeklyVolumeStats::new(req.week, &rows))
        })
    }
}
