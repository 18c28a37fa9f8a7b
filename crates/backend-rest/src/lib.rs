//! [`BackendClient`] over a hosted backend-as-a-service REST surface.
//!
//! Liveness reads one row from a health table, entitlement reads the account
//! row, and token refresh and sign-out go through the auth endpoints.

use std::time::Duration;

use async_trait::async_trait;
use liveness_core::{
    AccountStatus, BackendClient, BackendError, BackendErrorKind, Session, classify_http_status,
    types::now_ms,
};
use reqwest::{
    RequestBuilder, Response,
    header::{AUTHORIZATION, HeaderMap, RETRY_AFTER},
};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_ACCOUNTS_TABLE: &str = "profiles";
const DEFAULT_HEALTH_TABLE: &str = "profiles";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const API_KEY_HEADER: &str = "apikey";

#[derive(Debug, Clone)]
pub struct RestBackendConfig {
    pub base_url: Url,
    pub api_key: String,
    pub accounts_table: String,
    pub health_table: String,
    pub request_timeout: Duration,
}

impl RestBackendConfig {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, BackendError> {
        let mut base_url = Url::parse(base_url).map_err(|err| {
            BackendError::new(
                BackendErrorKind::Config,
                "invalid_base_url",
                format!("invalid backend url '{base_url}': {err}"),
            )
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            api_key: api_key.into(),
            accounts_table: DEFAULT_ACCOUNTS_TABLE.to_owned(),
            health_table: DEFAULT_HEALTH_TABLE.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_accounts_table(mut self, table: impl Into<String>) -> Self {
        self.accounts_table = table.into();
        self
    }

    pub fn with_health_table(mut self, table: impl Into<String>) -> Self {
        self.health_table = table.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct AccountRow {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    validated: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    /// Seconds since the epoch.
    #[serde(default)]
    expires_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RestBackendClient {
    http: reqwest::Client,
    config: RestBackendConfig,
}

impl RestBackendClient {
    pub fn new(config: RestBackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(map_client_build_error)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &RestBackendConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.config.base_url.join(path).map_err(|err| {
            BackendError::new(
                BackendErrorKind::Config,
                "invalid_endpoint",
                format!("cannot build endpoint '{path}': {err}"),
            )
        })
    }

    fn table_endpoint(&self, table: &str) -> Result<Url, BackendError> {
        self.endpoint(&format!("rest/v1/{table}"))
    }

    fn with_api_key(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(API_KEY_HEADER, &self.config.api_key)
    }

    fn with_bearer(&self, request: RequestBuilder, session: &Session) -> RequestBuilder {
        self.with_api_key(request)
            .header(AUTHORIZATION, format!("Bearer {}", session.token))
    }
}

#[async_trait]
impl BackendClient for RestBackendClient {
    async fn check_alive(&self) -> Result<(), BackendError> {
        let url = self.table_endpoint(&self.config.health_table)?;
        let request = self
            .with_api_key(self.http.get(url))
            .query(&[("select", "id"), ("limit", "1")]);
        send(request, "check_alive").await.map(|_| ())
    }

    async fn fetch_account_status(&self, session: &Session) -> Result<AccountStatus, BackendError> {
        let url = self.table_endpoint(&self.config.accounts_table)?;
        let id_filter = format!("eq.{}", session.user_id);
        let request = self
            .with_bearer(self.http.get(url), session)
            .query(&[("id", id_filter.as_str()), ("select", "active,validated")]);
        let response = send(request, "fetch_account_status").await?;

        let rows: Vec<AccountRow> = response
            .json()
            .await
            .map_err(|err| map_decode_error("fetch_account_status", err))?;
        let Some(row) = rows.into_iter().next() else {
            return Err(BackendError::new(
                BackendErrorKind::AccountNotFound,
                "account_not_found",
                format!("no account row for user '{}'", session.user_id),
            ));
        };

        Ok(AccountStatus {
            active: row.active,
            validated: row.validated,
        })
    }

    async fn refresh_session(&self, session: &Session) -> Result<Session, BackendError> {
        let Some(refresh_token) = session.refresh_token.as_deref() else {
            return Err(BackendError::new(
                BackendErrorKind::Unauthorized,
                "refresh_token_missing",
                "session has no refresh token",
            ));
        };

        let url = self.endpoint("auth/v1/token")?;
        let request = self
            .with_api_key(self.http.post(url))
            .query(&[("grant_type", "refresh_token")])
            .json(&serde_json::json!({ "refresh_token": refresh_token }));
        let response = send(request, "refresh_session").await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| map_decode_error("refresh_session", err))?;

        let expires_at_ms = match (token.expires_at, token.expires_in) {
            (Some(at), _) => Some(at.saturating_mul(1_000)),
            (None, Some(within)) => Some(now_ms().saturating_add(within.saturating_mul(1_000))),
            (None, None) => None,
        };

        debug!(user_id = %session.user_id, "session token refreshed");
        Ok(Session {
            token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| session.refresh_token.clone()),
            expires_at_ms,
            ..session.clone()
        })
    }

    async fn sign_out(&self, session: &Session) -> Result<(), BackendError> {
        let url = self.endpoint("auth/v1/logout")?;
        let request = self.with_bearer(self.http.post(url), session);
        send(request, "sign_out").await.map(|_| ())
    }

    async fn touch_last_seen(&self, session: &Session) -> Result<(), BackendError> {
        let url = self.table_endpoint(&self.config.accounts_table)?;
        let id_filter = format!("eq.{}", session.user_id);
        let request = self
            .with_bearer(self.http.patch(url), session)
            .query(&[("id", id_filter.as_str())])
            .json(&serde_json::json!({ "last_seen_at": chrono::Utc::now().to_rfc3339() }));
        send(request, "touch_last_seen").await.map(|_| ())
    }
}

async fn send(request: RequestBuilder, operation: &'static str) -> Result<Response, BackendError> {
    let response = request
        .send()
        .await
        .map_err(|err| map_transport_error(operation, err))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let mut mapped = BackendError::new(
        classify_http_status(status.as_u16()),
        "http_status",
        format!("{operation} failed with {status}: {body}"),
    );
    if let Some(delay) = retry_after {
        mapped = mapped.with_retry_after(delay);
    }
    warn!(operation, status = status.as_u16(), kind = ?mapped.kind, "backend request rejected");
    Err(mapped)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn map_transport_error(operation: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::new(
            BackendErrorKind::Timeout,
            "request_timeout",
            format!("{operation} timed out: {err}"),
        )
    } else if err.is_builder() {
        BackendError::new(
            BackendErrorKind::Config,
            "request_build_error",
            format!("{operation} request invalid: {err}"),
        )
    } else {
        BackendError::new(
            BackendErrorKind::Network,
            "transport_error",
            format!("{operation} transport failure: {err}"),
        )
    }
}

fn map_decode_error(operation: &str, err: reqwest::Error) -> BackendError {
    BackendError::new(
        BackendErrorKind::Serialization,
        "decode_error",
        format!("{operation} response malformed: {err}"),
    )
}

fn map_client_build_error(err: reqwest::Error) -> BackendError {
    BackendError::new(
        BackendErrorKind::Config,
        "client_build_error",
        err.to_string(),
    )
}
