use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::{
    domain::{
        commission::{self, Ineligibility, Settlement},
        ledger::{Earning, UserLedger},
        points::PaymentLink,
        to_metadata, Side, VolumeStatus, Week, WeeklyVolume,
    },
    ports::{
        database::{CarryOver, ChangeSet, DatabasePort, VolumeClose, VolumeFilter},
        directory::DirectoryPort,
        membership::{MembershipInfo, MembershipPort},
    },
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tower::Service;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{upstream, DomainLogic, Error};

const PAYMENT_METHOD: &str = "MEMBERSHIP_PAYMENT";

/// Settle every pending row of the week before `as_of`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseWeeklyVolumesRequest {
    /// Defaults to today on the service clock
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseWeeklyVolumesResponse {
    pub week: Week,
    /// Pending rows found for the week
    pub processed: usize,
    /// Rows paid, including balanced rows paying nothing
    pub successful: usize,
    /// Rows left pending after an error
    pub failed: usize,
    /// Ineligible rows
    pub cancelled: usize,
    pub total_points: Decimal,
}

/// What happened to one row
#[derive(Debug, Clone, Copy, PartialEq)]
enum RowOutcome {
    Paid(Decimal),
    Cancelled,
}

impl<D, U, M> Service<CloseWeeklyVolumesRequest> for DomainLogic<D, U, M>
where
    D: DatabasePort + 'static,
    U: DirectoryPort + 'static,
    M: MembershipPort + 'static,
{
    type Response = CloseWeeklyVolumesResponse;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CloseWeeklyVolumesRequest) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.close_weekly_volumes(req).await })
    }
}

impl<D, U, M> DomainLogic<D, U, M>
where
    D: DatabasePort,
    U: DirectoryPort,
    M: MembershipPort,
{
    #[tracing::instrument(name = "volume.close_weekly", skip_all, fields(as_of = ?req.as_of))]
    async fn close_weekly_volumes(
        &self,
        req: CloseWeeklyVolumesRequest,
    ) -> Result<CloseWeeklyVolumesResponse, Error> {
        let current = Week::containing(req.as_of.unwrap_or_else(|| self.clock.today()));
        let week = current.previous();

        let mut rows = self
            .database
            .list_weekly_volumes(VolumeFilter {
                status: Some(VolumeStatus::Pending),
                week: Some(week),
                ..Default::default()
            })
            .await?;
        // Oldest first
        rows.reverse();

        let mut response = CloseWeeklyVolumesResponse {
            week,
            processed: rows.len(),
            successful: 0,
            failed: 0,
            cancelled: 0,
            total_points: Decimal::ZERO,
        };
        info!(week_start = %week.start(), rows = rows.len(), "closing weekly volumes");

        for row in rows {
            let (id, user_id) = (row.id, row.user_id);
            match self.close_row(row, current).await {
                Ok(RowOutcome::Paid(commission)) => {
                    response.successful += 1;
                    response.total_points += commission;
                }
                Ok(RowOutcome::Cancelled) => response.cancelled += 1,
                Err(err) => {
                    error!(weekly_volume_id = %id, user_id = %user_id, error = %err, "weekly volume close failed");
                    response.failed += 1;
                }
            }
        }

        info!(
            week_start = %week.start(),
            successful = response.successful,
            cancelled = response.cancelled,
            failed = response.failed,
            total_points = %response.total_points,
            "weekly volumes closed"
        );
        Ok(response)
    }

    async fn close_row(&self, row: WeeklyVolume, successor: Week) -> Result<RowOutcome, Error> {
        let now = self.clock.now();
        let membership = upstream(
            self.upstream_timeout(),
            "membership",
            self.membership.get_user_membership_info(row.user_id),
        )
        .await?;

        if let Some(ineligibility) = self.ineligibility(&row, &membership).await? {
            let mut closed = row.clone();
            closed.cancel(commission::cancelled_metadata(&row, ineligibility, now), now)?;
            let carry_over = carry_over(&row, successor, row.left_volume(), row.right_volume(), now);
            self.database
                .commit(ChangeSet {
                    ledger: None,
                    volume: Some(VolumeClose {
                        row: closed,
                        carry_over,
                    }),
                    now,
                })
                .await?;

            warn!(
                weekly_volume_id = %row.id,
                user_id = %row.user_id,
                reason = ineligibility.reason(),
                "weekly volume cancelled, volume passed on to the next week"
            );
            return Ok(RowOutcome::Cancelled);
        }

        if row.weaker_side().is_none() {
            return self.close_balanced(row, successor, now).await;
        }

        let directs = upstream(
            self.upstream_timeout(),
            "directory",
            self.directory.get_direct_referrals(row.user_id),
        )
        .await?;
        let active_directs = directs.iter().filter(|d| d.active).count();
        let active_directs = u32::try_from(active_directs).unwrap_or(u32::MAX);
        let percentage = self.commission_percentage(row.user_id, &membership).await;

        let settlement = commission::settle(&row, active_directs, percentage)
            .ok_or_else(|| Error::InvalidState("legs are balanced".into()))?;
        self.pay(row, settlement, successor, now).await
    }

    /// Why a row cannot be paid, or `None` if it can
    async fn ineligibility(
        &self,
        row: &WeeklyVolume,
        membership: &MembershipInfo,
    ) -> Result<Option<Ineligibility>, Error> {
        if !membership.is_active() {
            return Ok(Some(Ineligibility::InactiveMembership));
        }
        let has_left = self.has_active_leg(row.user_id, Side::Left).await?;
        let has_right = self.has_active_leg(row.user_id, Side::Right).await?;
        Ok(Ineligibility::from_legs(has_left, has_right))
    }

    /// Whether someone in the leg holds an active membership under the user's referral code
    async fn has_active_leg(&self, user_id: Uuid, side: Side) -> Result<bool, Error> {
        let timeout = self.upstream_timeout();
        let Some(node) = upstream(
            timeout,
            "directory",
            self.directory.get_user_with_children(user_id),
        )
        .await?
        else {
            debug!(user_id = %user_id, "user missing from the tree");
            return Ok(false);
        };
        let Some(referral_code) = node.referral_code.clone().filter(|code| !code.is_empty())
        else {
            debug!(user_id = %user_id, "user has no referral code");
            return Ok(false);
        };
        let Some(child) = node.child(side) else {
            debug!(user_id = %user_id, side = %side, "no child on leg");
            return Ok(false);
        };

        let descendants = upstream(
            timeout,
            "directory",
            self.directory.get_descendants_in_leg(child, side),
        )
        .await?;
        if descendants.is_empty() {
            debug!(user_id = %user_id, side = %side, "leg has no descendants");
            return Ok(false);
        }

        let active = upstream(
            timeout,
            "directory",
            self.directory
                .check_active_memberships_in_leg(descendants, referral_code),
        )
        .await?;
        debug!(user_id = %user_id, side = %side, active, "leg checked");
        Ok(active)
    }

    /// Percentage of the user's plan, or the configured default when it cannot be resolved
    async fn commission_percentage(&self, user_id: Uuid, membership: &MembershipInfo) -> Decimal {
        let default = self.settings.volume.default_commission_percentage;
        let Some(plan) = &membership.plan else {
            warn!(user_id = %user_id, %default, "membership has no plan, using default percentage");
            return default;
        };

        let res = upstream(
            self.upstream_timeout(),
            "membership",
            self.membership.get_membership_plan(plan.id, user_id),
        )
        .await;
        match res {
            Ok(plan) => plan.commission_percentage,
            Err(err) => {
                warn!(
                    user_id = %user_id,
                    plan_id = plan.id,
                    error = %err,
                    %default,
                    "membership plan unavailable, using default percentage"
                );
                default
            }
        }
    }

    /// Legs are equal: nothing to pay and nothing to carry
    async fn close_balanced(
        &self,
        row: WeeklyVolume,
        successor: Week,
        now: DateTime<Utc>,
    ) -> Result<RowOutcome, Error> {
        let mut closed = row.clone();
        closed.settle(
            Side::Left,
            Decimal::ZERO,
            commission::balanced_metadata(&row, now),
            now,
        )?;
        let carry_over = carry_over(&row, successor, Decimal::ZERO, Decimal::ZERO, now);
        self.database
            .commit(ChangeSet {
                ledger: None,
                volume: Some(VolumeClose {
                    row: closed,
                    carry_over,
                }),
                now,
            })
            .await?;

        info!(weekly_volume_id = %row.id, user_id = %row.user_id, "balanced weekly volume settled");
        Ok(RowOutcome::Paid(Decimal::ZERO))
    }

    async fn pay(
        &self,
        row: WeeklyVolume,
        settlement: Settlement,
        successor: Week,
        now: DateTime<Utc>,
    ) -> Result<RowOutcome, Error> {
        let mut closed = row.clone();
        closed.settle(
            settlement.selected_side,
            settlement.commission,
            commission::processed_metadata(&row, &settlement, now),
            now,
        )?;

        let (left, right) = match settlement.stronger_side {
            Side::Left => (settlement.carry, Decimal::ZERO),
            Side::Right => (Decimal::ZERO, settlement.carry),
        };
        let carry_over = carry_over(&row, successor, left, right, now);

        let payments = self
            .database
            .list_volume_history(row.id)
            .await?
            .into_iter()
            .filter(|h| h.side == settlement.selected_side && h.volume > Decimal::ZERO)
            .filter_map(|h| {
                Some(PaymentLink {
                    payment_id: h.payment_id?,
                    amount: h.volume,
                    payment_reference: None,
                    payment_method: Some(PAYMENT_METHOD.to_string()),
                    notes: Some(format!(
                        "binary volume from the {} leg",
                        settlement.selected_side
                    )),
                })
            })
            .collect::<Vec<_>>();

        let row = &row;
        let settlement = &settlement;
        let closed = &closed;
        let carry_over = &carry_over;
        let payments = &payments;
        self.with_ledger_retry(row.user_id, || async move {
            let ledger = if settlement.commission > Decimal::ZERO {
                let ledger = self
                    .database
                    .load_ledger(row.user_id)
                    .await?
                    .unwrap_or_else(|| UserLedger::empty(&row.profile(), now));
                let credit = ledger.credit(
                    Earning::BinaryCommission,
                    settlement.commission,
                    commission::transaction_metadata(row, settlement),
                    payments.clone(),
                    now,
                )?;
                Some(credit.update)
            } else {
                None
            };

            self.database
                .commit(ChangeSet {
                    ledger,
                    volume: Some(VolumeClose {
                        row: closed.clone(),
                        carry_over: carry_over.clone(),
                    }),
                    now,
                })
                .await?;
            Ok::<_, Error>(())
        })
        .await?;

        info!(
            weekly_volume_id = %row.id,
            user_id = %row.user_id,
            selected_side = %settlement.selected_side,
            commission = %settlement.commission,
            carry = %settlement.carry,
            "weekly volume paid"
        );
        Ok(RowOutcome::Paid(settlement.commission))
    }
}

fn carry_over(
    row: &WeeklyVolume,
    week: Week,
    left: Decimal,
    right: Decimal,
    now: DateTime<Utc>,
) -> CarryOver {
    CarryOver {
        week,
        left,
        right,
        profile: row.profile(),
        metadata: to_metadata(json!({
            "createdBy": "weekly_close",
            "carriedFrom": row.id,
        })),
        now,
    }
}
