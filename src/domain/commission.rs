//! Binary commission arithmetic for the weekly close.
//!
//! Everything here is pure: the close command gathers the inputs from the directory and
//! membership services, and these functions decide what happens to a pending row.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde_json::json;

use super::{
    volume_limit::{effective_volume, VolumeLimit},
    to_metadata, Metadata, Side, WeeklyVolume,
};

/// Why a pending row is cancelled instead of paid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligibility {
    InactiveMembership,
    NoActiveLegs,
    NoActiveLeftLeg,
    NoActiveRightLeg,
}

impl Ineligibility {
    /// Gate on leg occupancy, once the membership is known to be active
    pub fn from_legs(has_left: bool, has_right: bool) -> Option<Self> {
        match (has_left, has_right) {
            (true, true) => None,
            (false, false) => Some(Ineligibility::NoActiveLegs),
            (false, true) => Some(Ineligibility::NoActiveLeftLeg),
            (true, false) => Some(Ineligibility::NoActiveRightLeg),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Ineligibility::InactiveMembership => "inactive membership",
            Ineligibility::NoActiveLegs => "no active direct on either leg",
            Ineligibility::NoActiveLeftLeg => "no active direct on the left leg",
            Ineligibility::NoActiveRightLeg => "no active direct on the right leg",
        }
    }
}

/// Outcome of paying a row on its weaker leg
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub selected_side: Side,
    pub stronger_side: Side,
    /// Volume of the weaker leg before any cap
    pub raw_volume: Decimal,
    pub stronger_volume: Decimal,
    pub limit: VolumeLimit,
    pub active_directs: u32,
    pub commission_percentage: Decimal,
    pub commission: Decimal,
    /// Unpaid excess of the stronger leg, moved to the next week
    pub carry: Decimal,
}

/// `effective × percentage / 100`, kept at two decimal places
pub fn commission_amount(effective: Decimal, percentage: Decimal) -> Decimal {
    (effective * percentage / dec!(100))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Compute the payment for a row, or `None` when both legs hold the same volume
pub fn settle(
    row: &WeeklyVolume,
    active_directs: u32,
    commission_percentage: Decimal,
) -> Option<Settlement> {
    let selected_side = row.weaker_side()?;
    let stronger_side = selected_side.other();
    let raw_volume = row.volume(selected_side);
    let stronger_volume = row.volume(stronger_side);
    let limit = effective_volume(raw_volume, active_directs);
    let commission = commission_amount(limit.effective_volume, commission_percentage);

    Some(Settlement {
        selected_side,
        stronger_side,
        raw_volume,
        stronger_volume,
        limit,
        active_directs,
        commission_percentage,
        commission,
        carry: (stronger_volume - raw_volume).max(Decimal::ZERO),
    })
}

/// Metadata stored on a processed row
pub fn processed_metadata(row: &WeeklyVolume, s: &Settlement, now: DateTime<Utc>) -> Metadata {
    to_metadata(json!({
        "reason": "binary commission processed",
        "processedAt": now.date_naive(),
        "leftVolume": row.left_volume(),
        "rightVolume": row.right_volume(),
        "commissionProcessed": s.commission,
        "commissionPercentage": s.commission_percentage,
        "directsCount": s.active_directs,
        "effectiveVolume": s.limit.effective_volume,
        "originalVolume": s.raw_volume,
        "limitApplied": s.limit.limit_applied,
        "limitDescription": s.limit.limit_description,
        "carryOver": s.carry,
        "carryOverSide": s.stronger_side,
    }))
}

/// Metadata stored on a row whose legs were equal
pub fn balanced_metadata(row: &WeeklyVolume, now: DateTime<Utc>) -> Metadata {
    to_metadata(json!({
        "reason": "legs are balanced, no weaker leg to pay",
        "processedAt": now.date_naive(),
        "leftVolume": row.left_volume(),
        "rightVolume": row.right_volume(),
        "commissionProcessed": Decimal::ZERO,
    }))
}

/// Metadata stored on a cancelled row
pub fn cancelled_metadata(
    row: &WeeklyVolume,
    ineligibility: Ineligibility,
    now: DateTime<Utc>,
) -> Metadata {
    to_metadata(json!({
        "reason": ineligibility.reason(),
        "processedAt": now.date_naive(),
        "leftVolume": row.left_volume(),
        "rightVolume": row.right_volume(),
    }))
}

/// Metadata stored on the commission transaction
pub fn transaction_metadata(row: &WeeklyVolume, s: &Settlement) -> Metadata {
    to_metadata(json!({
        "weekStartDate": row.week.start(),
        "weekEndDate": row.week.end(),
        "leftVolume": row.left_volume(),
        "rightVolume": row.right_volume(),
        "selectedSide": s.selected_side,
        "commissionPercentage": s.commission_percentage,
        "directsActive": s.active_directs,
        "effectiveVolume": s.limit.effective_volume,
        "originalLowerVolume": s.raw_volume,
        "volumeLimitApplied": s.limit.limit_applied,
        "volumeLimitDescription": s.limit.limit_description,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{UserProfile, Week};
    use chrono::NaiveDate;
    use rstest::*;
    use speculoos::prelude::*;
    use uuid::Uuid;

    fn row(left: Decimal, right: Decimal) -> WeeklyVolume {
        let profile = UserProfile::new(Uuid::new_v4(), "user@example.com", None);
        let week = Week::containing(NaiveDate::from_ymd_opt(2024, 6, 12).unwrap());
        let mut row = WeeklyVolume::new(&profile, week, Metadata::new(), Utc::now());
        row.add(Side::Left, left).unwrap();
        row.add(Side::Right, right).unwrap();
        row
    }

    #[test]
    fn test_settle_pays_weaker_leg_and_carries_difference() {
        let res = settle(&row(dec!(800), dec!(500)), 0, dec!(10));

        assert_that!(res).is_some().matches(|s| {
            s.selected_side == Side::Right
                && s.stronger_side == Side::Left
                && s.commission == dec!(50)
                && s.carry == dec!(300)
        });
    }

    #[test]
    fn test_settle_applies_volume_cap() {
        let res = settle(&row(dec!(400000), dec!(300000)), 5, dec!(12)).unwrap();

        assert_that!(res.limit.effective_volume).is_equal_to(dec!(250000));
        assert_that!(res.limit.limit_applied).is_true();
        assert_that!(res.commission).is_equal_to(dec!(30000));
        // The cap only limits what is paid, the carry still uses raw volumes
        assert_that!(res.carry).is_equal_to(dec!(100000));
    }

    #[test]
    fn test_settle_balanced_legs() {
        assert_that!(settle(&row(dec!(70), dec!(70)), 3, dec!(10))).is_none();
    }

    #[rstest]
    #[case(dec!(333.33), dec!(7.5), dec!(25.00))]
    #[case(dec!(1), dec!(0.5), dec!(0.01))]
    #[case(dec!(0), dec!(10), dec!(0))]
    fn test_commission_amount_rounding(
        #[case] effective: Decimal,
        #[case] percentage: Decimal,
        #[case] expected: Decimal,
    ) {
        assert_that!(commission_amount(effective, percentage)).is_equal_to(expected);
    }

    #[rstest]
    #[case(true, true, None)]
    #[case(false, false, Some(Ineligibility::NoActiveLegs))]
    #[case(false, true, Some(Ineligibility::NoActiveLeftLeg))]
    #[case(true, false, Some(Ineligibility::NoActiveRightLeg))]
    fn test_ineligibility_from_legs(
        #[case] left: bool,
        #[case] right: bool,
        #[case] expected: Option<Ineligibility>,
    ) {
        assert_that!(Ineligibility::from_legs(left, right)).is_equal_to(expected);
    }

    #[test]
    fn test_metadata_records_limit() {
        let row = row(dec!(20000), dec!(15000));
        let settlement = settle(&row, 2, dec!(10)).unwrap();
        let metadata = processed_metadata(&row, &settlement, Utc::now());

        assert_that!(metadata.get("limitApplied")).is_equal_to(Some(&json!(true)));
        assert_that!(metadata.get("directsCount")).is_equal_to(Some(&json!(2)));
    }
}
