use async_trait::async_trait;

use crate::{
    error::BackendError,
    types::{AccountStatus, Session},
};

/// Backend operations consumed by the liveness and session components.
///
/// Implementations report failures as structured [`BackendError`] kinds.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Cheapest possible read proving the backend answers.
    async fn check_alive(&self) -> Result<(), BackendError>;

    /// Fetch the entitlement flags of the session account.
    async fn fetch_account_status(&self, session: &Session) -> Result<AccountStatus, BackendError>;

    /// Exchange the session's refresh token for a new session.
    async fn refresh_session(&self, session: &Session) -> Result<Session, BackendError>;

    /// Revoke the session server-side.
    async fn sign_out(&self, session: &Session) -> Result<(), BackendError>;

    /// Record that the account was seen now.
    async fn touch_last_seen(&self, session: &Session) -> Result<(), BackendError>;
}
