//! Upstream login and session lifecycle.
//!
//! The retail site authenticates with a two-step OTP exchange: request a code
//! for a phone number, then trade phone + code for a cookie payload.
//! `SessionManager` drives that flow and owns every `AuthState` transition;
//! nothing else in the crate may move a user into `Authenticated`.

pub mod session;

use chrono::Utc;
use uuid::Uuid;

use crate::store::UserContext;
use crate::upstream::client::{ApiClient, ClientError};

pub use session::{AuthState, CredentialSet};

/// Error type for login operations
#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("phone number must be at least 10 digits")]
    InvalidPhone,

    #[error("OTP code was rejected")]
    InvalidCode,

    #[error("no login is pending; start one first")]
    NoPendingLogin,

    #[error("upstream refused the login request: {0}")]
    UpstreamRejected(String),

    #[error("user is not logged in")]
    NotAuthenticated,

    #[error("credential payload does not look like a session")]
    MalformedCredentials,

    #[error(transparent)]
    Client(ClientError),
}

/// Drives the OTP login state machine against the identity endpoints.
#[derive(Clone)]
pub struct SessionManager {
    client: ApiClient,
}

impl SessionManager {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Request an OTP for `phone` and move the user to pending-otp.
    ///
    /// Allowed from any state: starting over cancels a previous pending login
    /// and is the only way out of `Expired`.
    pub async fn start_login(
        &self,
        ctx: &mut UserContext,
        phone: &str,
    ) -> Result<(), LoginError> {
        let phone = phone.trim();
        if phone.len() < 10 || !phone.chars().all(|c| c.is_ascii_digit()) {
            return Err(LoginError::InvalidPhone);
        }

        self.client.request_otp(phone).await.map_err(|e| match e {
            ClientError::IdentityRejected(message) => LoginError::UpstreamRejected(message),
            other => LoginError::Client(other),
        })?;

        ctx.auth = AuthState::PendingOtp {
            phone: phone.to_string(),
            correlation: Uuid::new_v4().to_string(),
            requested_at: Utc::now(),
        };
        tracing::info!(user = %ctx.user_id, "OTP requested, login pending");
        Ok(())
    }

    /// Complete a pending login with the OTP code the user received.
    pub async fn complete_login(
        &self,
        ctx: &mut UserContext,
        code: &str,
    ) -> Result<(), LoginError> {
        let now = Utc::now();
        let phone = match &ctx.auth {
            AuthState::PendingOtp { phone, .. } if ctx.auth.pending_is_fresh(now) => phone.clone(),
            _ => return Err(LoginError::NoPendingLogin),
        };

        let code = code.trim();
        if !(4..=6).contains(&code.len()) || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(LoginError::InvalidCode);
        }

        match self.client.verify_otp(&phone, code).await {
            Ok(credentials) => {
                ctx.auth = AuthState::Authenticated {
                    credentials: credentials.with_defaults(&ctx.user_id),
                };
                tracing::info!(user = %ctx.user_id, "Login completed");
                Ok(())
            }
            Err(ClientError::IdentityRejected(message)) => {
                // A rejected code voids the pending request; the user starts over
                ctx.auth = AuthState::Absent;
                tracing::info!(user = %ctx.user_id, %message, "OTP rejected");
                Err(LoginError::InvalidCode)
            }
            Err(other) => Err(LoginError::Client(other)),
        }
    }

    /// Bypass for externally obtained credentials (browser cookie copy).
    pub fn set_credentials(ctx: &mut UserContext, payload: &str) -> Result<(), LoginError> {
        let credentials = CredentialSet::parse(payload);
        if credentials.is_empty() || !credentials.looks_like_session() {
            return Err(LoginError::MalformedCredentials);
        }
        ctx.auth = AuthState::Authenticated {
            credentials: credentials.with_defaults(&ctx.user_id),
        };
        tracing::info!(user = %ctx.user_id, "Credentials set manually");
        Ok(())
    }

    /// Credentials usable for upstream calls.
    pub fn current_credentials(ctx: &UserContext) -> Result<&CredentialSet, LoginError> {
        ctx.auth.credentials().ok_or(LoginError::NotAuthenticated)
    }

    /// React to an upstream auth rejection: an authenticated session becomes
    /// expired (exactly once); other states are left alone.
    pub fn mark_expired(ctx: &mut UserContext) -> bool {
        if let AuthState::Authenticated { credentials } = &ctx.auth {
            ctx.auth = AuthState::Expired {
                credentials: credentials.clone(),
            };
            tracing::warn!(user = %ctx.user_id, "Session expired, re-login required");
            return true;
        }
        false
    }
}
