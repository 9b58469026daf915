use rust_decimal::Decimal;
use uuid::Uuid;

pub type PlanId = u64;

#[mockall::automock]
#[async_trait::async_trait]
pub trait MembershipPort: Send + Sync {
    async fn get_user_membership_info(&self, user_id: Uuid) -> Result<MembershipInfo, Error>;

    async fn get_membership_plan(
        &self,
        plan_id: PlanId,
        user_id: Uuid,
    ) -> Result<MembershipPlan, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    Pending,
    Active,
    Expired,
    Inactive,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanSummary {
    pub id: PlanId,
    pub name: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipInfo {
    pub has_membership: bool,
    pub status: Option<MembershipStatus>,
    pub plan: Option<PlanSummary>,
}

impl MembershipInfo {
    pub fn is_active(&self) -> bool {
        self.has_membership && self.status == Some(MembershipStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MembershipPlan {
    pub id: PlanId,
    pub name: String,
    /// Share of the weaker leg paid as binary commission, in percent
    pub commission_percentage: Decimal,
    pub direct_commission_amount: Option<Decimal>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("membership plan {0} does not exist")]
    PlanDoesNotExist(PlanId),

    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}
