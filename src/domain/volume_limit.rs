use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

/// A volume cap unlocked by a minimum number of active direct referrals
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeTier {
    pub min_directs: u32,
    pub max_volume: Decimal,
    pub description: &'static str,
}

/// Tiers ordered by `min_directs`, highest first
pub const VOLUME_TIERS: [VolumeTier; 4] = [
    VolumeTier {
        min_directs: 5,
        max_volume: dec!(250000),
        description: "5 or more active directs - limit 250,000",
    },
    VolumeTier {
        min_directs: 4,
        max_volume: dec!(150000),
        description: "4 active directs - limit 150,000",
    },
    VolumeTier {
        min_directs: 3,
        max_volume: dec!(50000),
        description: "3 active directs - limit 50,000",
    },
    VolumeTier {
        min_directs: 2,
        max_volume: dec!(12500),
        description: "2 active directs - limit 12,500",
    },
];

pub const NO_LIMIT_DESCRIPTION: &str = "no volume limit applied";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeLimit {
    pub effective_volume: Decimal,
    pub limit_applied: bool,
    pub limit_description: &'static str,
}

/// The tier that applies to `active_directs`, if any
pub fn tier_for(active_directs: u32) -> Option<&'static VolumeTier> {
    VOLUME_TIERS
        .iter()
        .filter(|tier| active_directs >= tier.min_directs)
        .max_by_key(|tier| tier.min_directs)
}

/// Cap `raw_volume` according to the number of active direct referrals
///
/// Below two active directs there is no cap at all.
pub fn effective_volume(raw_volume: Decimal, active_directs: u32) -> VolumeLimit {
    let tier = tier_for(active_directs);
    let effective_volume = match tier {
        Some(tier) => raw_volume.min(tier.max_volume),
        None => raw_volume,
    };

    VolumeLimit {
        effective_volume,
        limit_applied: effective_volume < raw_volume,
        limit_description: tier.map_or(NO_LIMIT_DESCRIPTION, |tier| tier.description),
    }
}
