use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::{points::ensure_positive, Side, Week},
    ports::{
        database::{AccrualAction, DatabasePort, VolumeAccrual},
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

/// Volume generated by one payment, credited to one leg of each listed user
#[derive(Debug, Clone, PartialEq)]
pub struct AddVolumeRequest {
    pub amount: Decimal,
    pub assignments: Vec<VolumeAssignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeAssignment {
    pub user_id: Uuid,
    pub side: Side,
    pub payment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddVolumeResponse {
    pub processed: Vec<ProcessedVolume>,
    pub failed: Vec<FailedVolume>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedVolume {
    pub user_id: Uuid,
    pub side: Side,
    pub volume_added: Decimal,
    pub action: AccrualAction,
    pub weekly_volume_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedVolume {
    pub user_id: Uuid,
    pub reason: String,
}

impl<D, U, M> Service<AddVolumeRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = AddVolumeResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: AddVolumeRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            ensure_positive(req.amount)?;
            let week = Week::containing(this.clock.today());

            // Each assignment stands on its own: one failure does not undo the others
            let mut processed = Vec::with_capacity(req.assignments.len());
            let mut failed = Vec::new();
            for assignment in req.assignments {
                let user_id = assignment.user_id;
                match this.accrue(week, req.amount, assignment).await {
                    Ok(item) => processed.push(item),
                    Err(err) => {
                        warn!(user_id = %user_id, error = %err, "could not add volume");
                        failed.push(FailedVolume {
                            user_id,
                            reason: err.to_string(),
                        });
                    }
                }
            }

            info!(
                week_start = %week.start(),
                processed = processed.len(),
                failed = failed.len(),
                "volume added"
            );
            Ok(AddVolumeResponse { processed, failed })
        })
    }
}

impl<D, U, M> DomainLogic<D, U, M>
where
    D: DatabasePort,
    U: DirectoryPort,
{
    async fn accrue(
        &self,
        week: Week,
        amount: Decimal,
        assignment: VolumeAssignment,
    ) -> Result<ProcessedVolume, Error> {
        // Display fields are only needed to open the row of the week
        let profile = match self
            .database
            .find_weekly_volume(assignment.user_id, week)
            .await?
        {
            Some(_) => None,
            None => Some(self.profile(assignment.user_id).await?),
        };

        let recorded = self
            .database
            .record_volume(VolumeAccrual {
                user_id: assignment.user_id,
                week,
                side: assignment.side,
                amount,
                payment_id: assignment.payment_id,
                profile,
                now: self.clock.now(),
            })
            .await?;

        Ok(ProcessedVolume {
            user_id: assignment.user_id,
            side: assignment.side,
            volume_added: amount,
            action: recorded.action,
            weekly_volume_id: recorded.volume.id,
        })
    }
}
