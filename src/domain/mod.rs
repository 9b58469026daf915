use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod commission;
pub mod ledger;
pub mod points;
pub mod volume;
pub mod volume_limit;

pub use points::{
    PointsPool, PointsTransaction, PointsTransactionPayment, TransactionStatus, TransactionType,
    UserPoints,
};
pub use volume::{VolumeStatus, Week, WeeklyVolume, WeeklyVolumeHistory};

/// Free-form JSON attached to ledger and volume rows
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Fields of a JSON object; anything else yields empty metadata
pub fn to_metadata(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

/// One leg of a user's binary referral subtree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

/// Display fields copied onto ledger and volume rows for quick reference
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    /// Lower-cased, trimmed email
    pub email: String,
    pub name: Option<String>,
}

impl UserProfile {
    pub fn new(user_id: Uuid, email: &str, name: Option<&str>) -> Self {
        Self {
            user_id,
            email: email.trim().to_lowercase(),
            name: name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        }
    }
}

/// An amount would break one of the numeric invariants of an entity
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount: {0}")]
pub struct InvalidAmount(pub Cow<'static, str>);

impl InvalidAmount {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self(reason.into())
    }
}
