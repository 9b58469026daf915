use std::{borrow::Cow, future::Future, sync::Arc, time::Duration};

use backon::Retryable;
use rust_decimal::Decimal;
use tracing::warn;
use uuid::Uuid;

use crate::{
    adapters::clock::SystemClock,
    config::{ConfigError, Settings},
    domain::{
        ledger::{LedgerError, UserLedger},
        volume::NotPending,
        InvalidAmount, UserProfile,
    },
    ports::{clock::ClockPort, database::DatabasePort, directory::DirectoryPort},
};

pub mod add_volume;
pub mod approve_withdrawal;
pub mod close_weekly_volumes;
pub mod credit_points;
pub mod get_points_transactions;
pub mod get_user_points;
pub mod reject_withdrawal;
pub mod reserve_withdrawal;
pub mod rollback_reserved_points;
pub mod weekly_volume_queries;

/// Entry point for every operation of the service
///
/// Each operation is a [`tower::Service`] implementation for its own request type.
pub struct DomainLogic<D, U, M> {
    database: Arc<D>,
    directory: Arc<U>,
    membership: Arc<M>,
    clock: Arc<dyn ClockPort>,
    settings: Arc<Settings>,
}

impl<D, U, M> DomainLogic<D, U, M> {
    pub fn new(
        database: Arc<D>,
        directory: Arc<U>,
        membership: Arc<M>,
        clock: Arc<dyn ClockPort>,
        settings: Settings,
    ) -> Self {
        Self {
            database,
            directory,
            membership,
            clock,
            settings: Arc::new(settings),
        }
    }

    /// Build on the wall clock, cutting weeks at the configured UTC offset
    pub fn from_settings(
        database: Arc<D>,
        directory: Arc<U>,
        membership: Arc<M>,
        settings: Settings,
    ) -> Result<Self, ConfigError> {
        let minutes = settings.volume.utc_offset_minutes;
        let clock = SystemClock::from_offset_minutes(minutes).ok_or_else(|| {
            ConfigError::InvalidValue("volume.utc_offset_minutes".to_string(), minutes.to_string())
        })?;
        Ok(Self::new(
            database,
            directory,
            membership,
            Arc::new(clock),
            settings,
        ))
    }

    fn upstream_timeout(&self) -> Duration {
        self.settings.upstream.timeout()
    }

    /// Run a ledger operation, starting over on a fresh snapshot whenever its commit loses a race
    async fn with_ledger_retry<T, F, Fut>(&self, user_id: Uuid, operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        operation
            .retry(self.settings.ledger.retry.backoff())
            .when(Error::is_conflict)
            .notify(|err: &Error, delay: Duration| {
                warn!(user_id = %user_id, error = %err, delay = ?delay, "ledger commit conflicted, retrying");
            })
            .await
    }
}

impl<D, U, M> DomainLogic<D, U, M>
where
    D: DatabasePort,
    U: DirectoryPort,
{
    async fn profile(&self, user_id: Uuid) -> Result<UserProfile, Error> {
        let user = upstream(
            self.upstream_timeout(),
            "directory",
            self.directory.get_user(user_id),
        )
        .await?;
        Ok(user.into())
    }

    /// Stored ledger of a user, or an empty one built from the directory
    async fn ledger_or_empty(&self, user_id: Uuid) -> Result<UserLedger, Error> {
        match self.database.load_ledger(user_id).await? {
            Some(ledger) => Ok(ledger),
            None => {
                let profile = self.profile(user_id).await?;
                Ok(UserLedger::empty(&profile, self.clock.now()))
            }
        }
    }

    /// Stored ledger of a user that must already have a points row
    async fn existing_ledger(&self, user_id: Uuid) -> Result<UserLedger, Error> {
        self.database
            .load_ledger(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("points of user {user_id}").into()))
    }
}

impl<D, U, M> Clone for DomainLogic<D, U, M> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            directory: self.directory.clone(),
            membership: self.membership.clone(),
            clock: self.clock.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// Await a call to the directory or membership service, giving up after `timeout`
async fn upstream<T, E>(
    timeout: Duration,
    service: &'static str,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, Error>
where
    Error: From<E>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(res) => res.map_err(Error::from),
        Err(_) => Err(Error::UpstreamUnavailable(service)),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database port error: {0:?}")]
    Database(#[from] crate::ports::database::Error),
    #[error("directory port error: {0:?}")]
    Directory(crate::ports::directory::Error),
    #[error("membership port error: {0:?}")]
    Membership(#[from] crate::ports::membership::Error),

    #[error("{0} not found")]
    NotFound(Cow<'static, str>),

    #[error("insufficient balance: {available} available, {requested} requested")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },

    #[error("insufficient reservable funds: {reservable} reservable, {available_points} available points, {requested} requested")]
    InsufficientReservableFunds {
        available_points: Decimal,
        reservable: Decimal,
        requested: Decimal,
    },

    #[error(transparent)]
    InvalidAmount(#[from] InvalidAmount),

    #[error("{0} service unavailable")]
    UpstreamUnavailable(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),
}

impl Error {
    /// Whether the operation lost an optimistic concurrency race and can run again
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Database(err) if err.is_conflict())
    }
}

impl From<crate::ports::directory::Error> for Error {
    fn from(err: crate::ports::directory::Error) -> Self {
        match err {
            crate::ports::directory::Error::UserDoesNotExist(user_id) => {
                Error::NotFound(format!("user {user_id}").into())
            }
            err => Error::Directory(err),
        }
    }
}

impl From<NotPending> for Error {
    fn from(NotPending(id): NotPending) -> Self {
        Error::Database(crate::ports::database::Error::VolumeNotPending(id))
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientBalance {
                available,
                requested,
            } => Error::InsufficientBalance {
                available,
                requested,
            },
            LedgerError::InsufficientReservableFunds {
                available_points,
                reservable,
                requested,
            } => Error::InsufficientReservableFunds {
                available_points,
                reservable,
                requested,
            },
            LedgerError::UnknownTransaction(id) => {
                Error::NotFound(format!("points transaction {id}").into())
            }
            LedgerError::InvalidAmount(err) => Error::InvalidAmount(err),
        }
    }
}

/// Shared fixtures for command tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        adapters::{clock::FixedClock, database::memory::MemoryDatabase},
        ports::{
            directory::{MockDirectoryPort, User},
            membership::MockMembershipPort,
        },
    };
    use chrono::{DateTime, TimeZone, Utc};

    /// Wednesday 2024-06-12, 10:00 UTC
    pub fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 12, 10, 0, 0).unwrap()
    }

    pub fn user(user_id: Uuid) -> User {
        User {
            user_id,
            email: "member@example.com".to_string(),
            first_name: Some("Ana".to_string()),
            last_name: Some("Lopez".to_string()),
        }
    }

    pub fn fast_settings() -> Settings {
        let mut settings = Settings::default();
        settings.ledger.retry.min_delay_ms = 1;
        settings.ledger.retry.max_delay_ms = 2;
        settings.upstream.timeout_ms = 200;
        settings
    }

    pub fn domain(
        database: MemoryDatabase,
        directory: MockDirectoryPort,
        membership: MockMembershipPort,
    ) -> DomainLogic<MemoryDatabase, MockDirectoryPort, MockMembershipPort> {
        DomainLogic::new(
            Arc::new(database),
            Arc::new(directory),
            Arc::new(membership),
            Arc::new(FixedClock::at_utc(now())),
            fast_settings(),
        )
    }
}
