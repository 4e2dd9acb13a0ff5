//! Session state for retail upstream authentication.
//!
//! Provides:
//! - `CredentialSet`: the cookie payload a logged-in session presents upstream
//! - `AuthState`: tagged per-user login state (absent / pending-otp /
//!   authenticated / expired)
//!
//! `AuthState` is persisted inside the user document and only ever transitions
//! through `SessionManager`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{BASE_COOKIES, OTP_PENDING_TTL_SECS};

/// A single upstream cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Ordered cookie payload presented to the upstream on authenticated calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    pub cookies: Vec<Cookie>,
}

impl CredentialSet {
    /// Parse a raw `name=value; name=value` cookie header into a set.
    /// Malformed fragments (no `=`) are skipped.
    pub fn parse(header: &str) -> Self {
        let cookies = header
            .split(';')
            .filter_map(|part| {
                let (name, value) = part.trim().split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some(Cookie {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                })
            })
            .collect();
        Self { cookies }
    }

    /// Insert or replace a cookie by name, preserving order for existing names.
    pub fn set(&mut self, name: &str, value: &str) {
        if let Some(existing) = self.cookies.iter_mut().find(|c| c.name == name) {
            existing.value = value.to_string();
        } else {
            self.cookies.push(Cookie {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.value.as_str())
    }

    /// Render as a `Cookie:` header value.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Ensure the base cookies the upstream expects from every client are
    /// present, plus this user's stable device id.
    pub fn with_defaults(mut self, user_id: &str) -> Self {
        if self.get("deviceId").is_none() {
            let id = device_id(user_id);
            self.set("deviceId", &id);
        }
        for (name, value) in BASE_COOKIES {
            if self.get(name).is_none() {
                self.set(name, value);
            }
        }
        self
    }

    /// Rough shape check for manually supplied payloads: they must at least
    /// carry a device id or a session token cookie.
    pub fn looks_like_session(&self) -> bool {
        self.get("deviceId").is_some() || self.get("A").is_some() || self.get("V").is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Stable synthetic device identifier for a user. The upstream keys some
/// responses on the device cookie, so it must not change between cycles.
pub fn device_id(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    digest
        .iter()
        .take(11)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Per-user login state.
///
/// Transitions: Absent -> PendingOtp -> Authenticated -> Expired, with
/// Expired -> PendingOtp only via an explicit re-login. Modeled as a tagged
/// enum so an illegal transition (completing a login that was never started)
/// is an exhaustively-matched case, not a forgotten flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Absent,
    PendingOtp {
        phone: String,
        /// Correlates the OTP request with its completion
        correlation: String,
        requested_at: DateTime<Utc>,
    },
    Authenticated {
        credentials: CredentialSet,
    },
    Expired {
        credentials: CredentialSet,
    },
}

impl AuthState {
    /// Short label for status output and logs.
    pub fn label(&self) -> &'static str {
        match self {
            AuthState::Absent => "absent",
            AuthState::PendingOtp { .. } => "pending-otp",
            AuthState::Authenticated { .. } => "authenticated",
            AuthState::Expired { .. } => "expired",
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. })
    }

    /// Credentials usable for upstream calls (only while authenticated).
    pub fn credentials(&self) -> Option<&CredentialSet> {
        match self {
            AuthState::Authenticated { credentials } => Some(credentials),
            _ => None,
        }
    }

    /// Whether a pending OTP login is still completable at `now`.
    pub fn pending_is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self {
            AuthState::PendingOtp { requested_at, .. } => {
                now.signed_duration_since(*requested_at).num_seconds() < OTP_PENDING_TTL_SECS
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_parse_cookie_header() {
        let set = CredentialSet::parse("A=token; R=refresh; LS=LOGGED_IN");
        assert_eq!(set.get("A"), Some("token"));
        assert_eq!(set.get("R"), Some("refresh"));
        assert_eq!(set.cookie_header(), "A=token; R=refresh; LS=LOGGED_IN");
    }

    #[test]
    fn test_parse_skips_malformed_fragments() {
        let set = CredentialSet::parse("A=token; garbage; =novalue; B=2");
        assert_eq!(set.cookies.len(), 2);
        assert_eq!(set.get("B"), Some("2"));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut set = CredentialSet::parse("A=old; B=2");
        set.set("A", "new");
        assert_eq!(set.cookie_header(), "A=new; B=2");
    }

    #[test]
    fn test_with_defaults_adds_device_id_and_base_cookies() {
        let set = CredentialSet::parse("A=token").with_defaults("user-1");
        assert_eq!(set.get("deviceId"), Some(device_id("user-1").as_str()));
        assert_eq!(set.get("LS"), Some("LOGGED_IN"));
        assert_eq!(set.get("customerType"), Some("Existing"));
        // Existing cookies are not clobbered
        assert_eq!(set.get("A"), Some("token"));
    }

    #[test]
    fn test_device_id_is_stable_per_user() {
        assert_eq!(device_id("42"), device_id("42"));
        assert_ne!(device_id("42"), device_id("43"));
    }

    #[test]
    fn test_pending_freshness_window() {
        let now = Utc::now();
        let state = AuthState::PendingOtp {
            phone: "9876543210".to_string(),
            correlation: "c".to_string(),
            requested_at: now - Duration::seconds(OTP_PENDING_TTL_SECS - 1),
        };
        assert!(state.pending_is_fresh(now));

        let stale = AuthState::PendingOtp {
            phone: "9876543210".to_string(),
            correlation: "c".to_string(),
            requested_at: now - Duration::seconds(OTP_PENDING_TTL_SECS + 1),
        };
        assert!(!stale.pending_is_fresh(now));
        assert!(!AuthState::Absent.pending_is_fresh(now));
    }

    #[test]
    fn test_credentials_only_while_authenticated() {
        let creds = CredentialSet::parse("A=token");
        let auth = AuthState::Authenticated {
            credentials: creds.clone(),
        };
        assert!(auth.credentials().is_some());
        let expired = AuthState::Expired { credentials: creds };
        assert!(expired.credentials().is_none());
        assert_eq!(expired.label(), "expired");
    }
}
