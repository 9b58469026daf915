use uuid::Uuid;

use crate::domain::{Side, UserProfile};

/// User directory owning the binary tree
#[mockall::automock]
#[async_trait::async_trait]
pub trait DirectoryPort: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> Result<User, Error>;

    async fn get_direct_referrals(&self, user_id: Uuid) -> Result<Vec<DirectReferral>, Error>;

    async fn get_user_with_children(
        &self,
        user_id: Uuid,
    ) -> Result<Option<UserWithChildren>, Error>;

    /// Every user below `root_id`, the root included
    async fn get_descendants_in_leg(&self, root_id: Uuid, side: Side) -> Result<Vec<Uuid>, Error>;

    /// Whether any of `descendant_ids` holds an active membership under `referral_code`
    async fn check_active_memberships_in_leg(
        &self,
        descendant_ids: Vec<Uuid>,
        referral_code: String,
    ) -> Result<bool, Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        let name = [user.first_name.as_deref(), user.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        UserProfile::new(user.user_id, &user.email, Some(&name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectReferral {
    pub user_id: Uuid,
    /// Holds an active paid membership
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserWithChildren {
    pub user_id: Uuid,
    pub referral_code: Option<String>,
    pub left_child_id: Option<Uuid>,
    pub right_child_id: Option<Uuid>,
}

impl UserWithChildren {
    pub fn child(&self, side: Side) -> Option<Uuid> {
        match side {
            Side::Left => self.left_child_id,
            Side::Right => self.right_child_id,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Domain-level error when a user does not exist
    #[error("user {0} does not exist")]
    UserDoesNotExist(Uuid),

    /// Concrete adapter errors
    ///
    /// This could represent any errors from a concrete adapter that is not part of the domain
    /// model, such as connectivity, configuration, or permission errors.
    #[error("adapter error: {0:?}")]
    Adapter(Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use speculoos::prelude::*;

    #[test]
    fn test_profile_from_user() {
        let user_id = Uuid::new_v4();
        let profile = UserProfile::from(User {
            user_id,
            email: "Ana@Example.com".to_string(),
            first_name: Some("Ana".to_string()),
            last_name: None,
        });

        assert_that!(profile.name.as_deref()).is_equal_to(Some("Ana"));
        assert_that!(profile.email.as_str()).is_equal_to("ana@example.com");
    }
}
