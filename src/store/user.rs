//! Per-user document types.
//!
//! `UserContext` is the whole-document unit of persistence: one JSON file per
//! user, read and written atomically. It is owned exclusively by whichever
//! path is processing that user (one in-flight check cycle, or one command
//! invocation) and never shared across users.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::session::AuthState;
use crate::upstream::ProductId;

/// Evaluation record for one discovered product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenEntry {
    pub first_seen_at: DateTime<Utc>,
    /// Pincode -> deliverable result for every pair evaluated so far
    #[serde(default)]
    pub checked: BTreeMap<String, bool>,
}

impl SeenEntry {
    pub fn new(first_seen_at: DateTime<Utc>) -> Self {
        Self {
            first_seen_at,
            checked: BTreeMap::new(),
        }
    }
}

/// One "deliverable" finding awaiting (or having completed) dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub user_id: String,
    pub pincode: String,
    pub product_url: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    pub fn new(user_id: &str, pincode: &str, product_url: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            pincode: pincode.to_string(),
            product_url: product_url.to_string(),
            created_at,
            delivered_at: None,
        }
    }
}

/// The full persisted state of one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    /// Listing URLs to poll, in the order the user added them
    #[serde(default)]
    pub monitor_urls: Vec<String>,
    /// Postal codes to test delivery against
    #[serde(default)]
    pub pincodes: BTreeSet<String>,
    #[serde(default)]
    pub auth: AuthState,
    /// Product id -> evaluation record; the dedup ledger
    #[serde(default)]
    pub seen: HashMap<ProductId, SeenEntry>,
    /// Records whose dispatch has not succeeded yet
    #[serde(default)]
    pub pending_notifications: Vec<NotificationRecord>,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
}

impl UserContext {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            monitor_urls: Vec::new(),
            pincodes: BTreeSet::new(),
            auth: AuthState::Absent,
            seen: HashMap::new(),
            pending_notifications: Vec::new(),
            last_check: None,
        }
    }

    /// Count of product×pincode pairs evaluated as deliverable.
    pub fn deliverable_count(&self) -> usize {
        self.seen
            .values()
            .flat_map(|entry| entry.checked.values())
            .filter(|deliverable| **deliverable)
            .count()
    }

    /// Records still awaiting dispatch.
    pub fn pending_count(&self) -> usize {
        self.pending_notifications
            .iter()
            .filter(|r| r.delivered_at.is_none())
            .count()
    }
}
