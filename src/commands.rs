//! Command surface.
//!
//! The operations a chat (or any other) front end invokes on behalf of a
//! user: configure monitor URLs and pincodes, drive the login flow, trigger a
//! manual check, resend pending notifications, reset the seen ledger, read
//! status. Every operation validates synchronously and returns a typed result;
//! formatting replies for humans is the front end's job, as is deciding which
//! external identity maps to which user id.

use serde::Serialize;

use chrono::{DateTime, Utc};

use crate::auth::SessionManager;
use crate::error::CommandError;
use crate::monitor::{RunSummary, TriggerReason};
use crate::state::AppState;

/// A user's configuration and counters, as shown by status output.
#[derive(Debug, Clone, Serialize)]
pub struct UserStatus {
    pub user_id: String,
    pub monitor_urls: Vec<String>,
    pub pincodes: Vec<String>,
    pub auth_state: String,
    pub seen_count: usize,
    pub deliverable_count: usize,
    pub pending_count: usize,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
}

/// Thin command layer over the shared state.
#[derive(Clone)]
pub struct CommandService {
    state: AppState,
}

impl CommandService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn authorize(&self, user_id: &str) -> Result<(), CommandError> {
        if self
            .state
            .config
            .access
            .authorized_users
            .iter()
            .any(|u| u == user_id)
        {
            Ok(())
        } else {
            Err(CommandError::NotAuthorized)
        }
    }

    /// Add a monitor URL. Returns the total count after the addition.
    pub async fn configure_url(&self, user_id: &str, url: &str) -> Result<usize, CommandError> {
        self.authorize(user_id)?;
        let url = url.trim().to_string();
        if !url.starts_with("https://") {
            return Err(CommandError::InvalidUrl(
                "must start with https://".to_string(),
            ));
        }
        let host = url
            .trim_start_matches("https://")
            .split('/')
            .next()
            .unwrap_or("");
        if host != self.state.config.upstream_host() {
            return Err(CommandError::InvalidUrl(format!(
                "host must be {}",
                self.state.config.upstream_host()
            )));
        }

        self.state
            .store
            .update(user_id, move |ctx| {
                if ctx.monitor_urls.contains(&url) {
                    return Err(CommandError::DuplicateUrl);
                }
                ctx.monitor_urls.push(url);
                Ok(ctx.monitor_urls.len())
            })
            .await?
    }

    pub async fn remove_url(&self, user_id: &str, url: &str) -> Result<(), CommandError> {
        self.authorize(user_id)?;
        let url = url.trim().to_string();
        self.state
            .store
            .update(user_id, move |ctx| {
                let before = ctx.monitor_urls.len();
                ctx.monitor_urls.retain(|u| *u != url);
                if ctx.monitor_urls.len() == before {
                    Err(CommandError::UnknownUrl)
                } else {
                    Ok(())
                }
            })
            .await?
    }

    /// Add a pincode. Returns false when it was already configured.
    pub async fn add_pincode(&self, user_id: &str, code: &str) -> Result<bool, CommandError> {
        self.authorize(user_id)?;
        let code = validate_pincode(code)?;
        self.state
            .store
            .update(user_id, move |ctx| ctx.pincodes.insert(code))
            .await
            .map_err(Into::into)
    }

    pub async fn remove_pincode(&self, user_id: &str, code: &str) -> Result<(), CommandError> {
        self.authorize(user_id)?;
        let code = code.trim().to_string();
        self.state
            .store
            .update(user_id, move |ctx| {
                if ctx.pincodes.remove(&code) {
                    Ok(())
                } else {
                    Err(CommandError::UnknownPincode)
                }
            })
            .await?
    }

    /// Start the OTP login flow for a phone number.
    pub async fn start_login(&self, user_id: &str, phone: &str) -> Result<(), CommandError> {
        self.authorize(user_id)?;
        let mut ctx = self.state.store.load(user_id).await?;
        self.state.sessions.start_login(&mut ctx, phone).await?;
        let auth = ctx.auth;
        self.state
            .store
            .update(user_id, move |doc| doc.auth = auth)
            .await?;
        Ok(())
    }

    /// Complete a pending login with the received OTP code.
    pub async fn complete_login(&self, user_id: &str, code: &str) -> Result<(), CommandError> {
        self.authorize(user_id)?;
        let mut ctx = self.state.store.load(user_id).await?;
        // A rejected code also changes state (back to absent), so the
        // document is written on both outcomes
        let result = self.state.sessions.complete_login(&mut ctx, code).await;
        let auth = ctx.auth;
        self.state
            .store
            .update(user_id, move |doc| doc.auth = auth)
            .await?;
        result.map_err(Into::into)
    }

    /// Store externally obtained session cookies.
    pub async fn set_credentials(&self, user_id: &str, payload: &str) -> Result<(), CommandError> {
        self.authorize(user_id)?;
        let payload = payload.to_string();
        self.state
            .store
            .update(user_id, move |ctx| {
                SessionManager::set_credentials(ctx, &payload)
            })
            .await?
            .map_err(Into::into)
    }

    /// Run a fleet-wide check now, subject to the same mutual exclusion as
    /// scheduled runs.
    pub async fn trigger_manual_check(&self) -> Result<RunSummary, CommandError> {
        self.state
            .scheduler
            .trigger(TriggerReason::Manual)
            .await
            .map_err(Into::into)
    }

    /// Re-deliver notifications whose dispatch failed. Returns how many were
    /// sent; successfully sent records are dropped from the pending queue.
    pub async fn resend_pending(&self, user_id: &str) -> Result<usize, CommandError> {
        self.authorize(user_id)?;
        let ctx = self.state.store.load(user_id).await?;

        let mut delivered: Vec<(String, String)> = Vec::new();
        for record in ctx
            .pending_notifications
            .iter()
            .filter(|r| r.delivered_at.is_none())
        {
            match self.state.dispatcher.deliver(record).await {
                Ok(()) => delivered.push((record.product_url.clone(), record.pincode.clone())),
                Err(error) => {
                    tracing::warn!(user = %user_id, %error, "Resend stopped early");
                    break;
                }
            }
        }

        let sent = delivered.len();
        if sent > 0 {
            self.state
                .store
                .update(user_id, move |doc| {
                    doc.pending_notifications.retain(|r| {
                        !delivered
                            .iter()
                            .any(|(url, pin)| r.product_url == *url && r.pincode == *pin)
                    });
                })
                .await?;
        }
        Ok(sent)
    }

    /// Forget every seen product, making the next check treat the whole
    /// listing as new. Returns how many entries were dropped.
    pub async fn clear_seen(&self, user_id: &str) -> Result<usize, CommandError> {
        self.authorize(user_id)?;
        self.state
            .store
            .update(user_id, |ctx| {
                let count = ctx.seen.len();
                ctx.seen.clear();
                count
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_status(&self, user_id: &str) -> Result<UserStatus, CommandError> {
        self.authorize(user_id)?;
        let ctx = self.state.store.load(user_id).await?;
        Ok(UserStatus {
            user_id: ctx.user_id.clone(),
            monitor_urls: ctx.monitor_urls.clone(),
            pincodes: ctx.pincodes.iter().cloned().collect(),
            auth_state: ctx.auth.label().to_string(),
            seen_count: ctx.seen.len(),
            deliverable_count: ctx.deliverable_count(),
            pending_count: ctx.pending_count(),
            last_check: ctx.last_check,
            next_check: self.state.scheduler.next_run(),
        })
    }
}

/// Pincodes are 5 or 6 digits.
fn validate_pincode(code: &str) -> Result<String, CommandError> {
    let code = code.trim();
    if (5..=6).contains(&code.len()) && code.chars().all(|c| c.is_ascii_digit()) {
        Ok(code.to_string())
    } else {
        Err(CommandError::InvalidPincode(code.to_string()))
    }
}
