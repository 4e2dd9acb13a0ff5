//! Per-user check cycle.
//!
//! Runs the discovery -> filter -> resolve -> availability -> notify pipeline
//! for one user. The cycle works on a snapshot of the user's configuration
//! taken at entry, so command-surface edits made while it runs never change
//! its course mid-flight. Marking a pair as checked and attempting its
//! notification happen back to back as one step, so an interrupted run never
//! leaves a pair suppressed without its notification having been tried.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::auth::{AuthState, CredentialSet, SessionManager};
use crate::notify::NotificationDispatcher;
use crate::store::{NotificationRecord, UserContext};
use crate::upstream::client::{ApiClient, ClientError};
use crate::upstream::DiscoveredProduct;

use super::{CycleReport, DedupStore};

/// Orchestrates one user's check cycle.
#[derive(Clone)]
pub struct CheckOrchestrator {
    client: ApiClient,
    dedup: DedupStore,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl CheckOrchestrator {
    pub fn new(
        client: ApiClient,
        dedup: DedupStore,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            client,
            dedup,
            dispatcher,
        }
    }

    /// Run the full pipeline for one user.
    ///
    /// Never fails the caller: upstream faults degrade to skipped items, an
    /// auth rejection expires the session and ends the cycle with
    /// `needs_relogin` set.
    #[instrument(name = "monitor.check_user", skip_all, fields(user = %ctx.user_id, duration_ms))]
    pub async fn run_user(&self, ctx: &mut UserContext) -> CycleReport {
        let start = Instant::now();
        let now = Utc::now();
        let mut report = CycleReport::new(&ctx.user_id);

        report.purged = self.dedup.purge_expired(ctx, now);
        if report.purged > 0 {
            tracing::debug!(purged = report.purged, "Evicted stale dedup entries");
        }

        // Snapshot the configuration once; edits made during the cycle apply
        // from the next one
        let monitor_urls = ctx.monitor_urls.clone();
        let pincodes: Vec<String> = ctx.pincodes.iter().cloned().collect();
        if monitor_urls.is_empty() || pincodes.is_empty() {
            tracing::debug!("No monitor URLs or pincodes configured, skipping");
            return report;
        }

        if matches!(ctx.auth, AuthState::Expired { .. }) {
            report.needs_relogin = true;
            tracing::info!("Session expired, skipping checks until re-login");
            return report;
        }
        let authenticated = ctx.auth.is_authenticated();
        let creds = ctx
            .auth
            .credentials()
            .cloned()
            .unwrap_or_else(|| CredentialSet::default().with_defaults(&ctx.user_id));

        'urls: for monitor_url in &monitor_urls {
            let products = match self.client.discover_products(monitor_url, &creds).await {
                Ok(products) => products,
                Err(ClientError::AuthRejected) if authenticated => {
                    self.expire(ctx, &mut report);
                    break 'urls;
                }
                Err(error) => {
                    report.skipped_urls += 1;
                    tracing::warn!(url = %monitor_url, %error, "Discovery failed, skipping URL");
                    continue;
                }
            };
            report.discovered += products.len();

            for product in &products {
                if self.dedup.fully_checked(ctx, &product.id, &pincodes) {
                    continue;
                }
                report.new_products += 1;
                tracing::debug!(product = %product.id, "New product");

                self.client.pace().await;
                let variant = match self.client.resolve_variant(&product.id, &creds).await {
                    Ok(variant) => variant,
                    Err(ClientError::AuthRejected) if authenticated => {
                        self.expire(ctx, &mut report);
                        break 'urls;
                    }
                    Err(error) => {
                        tracing::warn!(product = %product.id, %error, "Variant lookup failed, skipping product");
                        continue;
                    }
                };

                let Some(variant) = variant else {
                    // Nothing purchasable right now; settle every pair so the
                    // product stays quiet until eviction re-opens it
                    for pincode in &pincodes {
                        if !self.dedup.already_checked(ctx, &product.id, pincode) {
                            self.dedup.mark_checked(ctx, &product.id, pincode, false, now);
                        }
                    }
                    continue;
                };

                for pincode in &pincodes {
                    if self.dedup.already_checked(ctx, &product.id, pincode) {
                        continue;
                    }
                    self.client.pace().await;
                    match self
                        .client
                        .check_availability(&variant, pincode, &creds)
                        .await
                    {
                        Ok(deliverable) => {
                            self.settle_pair(ctx, &mut report, product, pincode, deliverable, now)
                                .await;
                        }
                        Err(ClientError::AuthRejected) if authenticated => {
                            self.expire(ctx, &mut report);
                            break 'urls;
                        }
                        Err(error) => {
                            // Pair left unmarked: it gets another try next cycle
                            tracing::warn!(
                                product = %product.id,
                                %pincode,
                                %error,
                                "Availability check failed, pair deferred"
                            );
                        }
                    }
                }
            }
        }

        if !report.needs_relogin {
            ctx.last_check = Some(now);
        }
        tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        tracing::info!(
            discovered = report.discovered,
            new = report.new_products,
            deliverable = report.deliverable,
            skipped_urls = report.skipped_urls,
            "Check cycle finished"
        );
        report
    }

    fn expire(&self, ctx: &mut UserContext, report: &mut CycleReport) {
        SessionManager::mark_expired(ctx);
        report.needs_relogin = true;
    }

    /// Record the evaluation and, when deliverable, attempt the notification
    /// immediately. A failed dispatch keeps the record pending for resend; it
    /// never re-opens the pair for another availability check.
    async fn settle_pair(
        &self,
        ctx: &mut UserContext,
        report: &mut CycleReport,
        product: &DiscoveredProduct,
        pincode: &str,
        deliverable: bool,
        now: DateTime<Utc>,
    ) {
        self.dedup
            .mark_checked(ctx, &product.id, pincode, deliverable, now);
        if !deliverable {
            tracing::debug!(product = %product.id, %pincode, "Not deliverable");
            return;
        }

        report.deliverable += 1;
        let mut record = NotificationRecord::new(&ctx.user_id, pincode, &product.url, now);
        match self.dispatcher.deliver(&record).await {
            Ok(()) => {
                record.delivered_at = Some(Utc::now());
                tracing::info!(product = %product.id, %pincode, "Deliverable, notification dispatched");
            }
            Err(error) => {
                tracing::warn!(product = %product.id, %pincode, %error, "Dispatch failed, notification kept pending");
                ctx.pending_notifications.push(record);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::auth::SessionManager;
    use crate::config::UpstreamConfig;
    use crate::notify::DispatchError;
    use crate::upstream::client::testing::{ok, status, ScriptedTransport};
    use crate::upstream::client::{ApiResponse, TransportError};

    /// Collects delivered records; optionally refuses every delivery.
    struct RecordingDispatcher {
        delivered: Mutex<Vec<NotificationRecord>>,
        fail: bool,
    }

    impl RecordingDispatcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn count(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn deliver(&self, record: &NotificationRecord) -> Result<(), DispatchError> {
            if self.fail {
                return Err(DispatchError::QueueFull);
            }
            self.delivered.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    const LISTING_ONE: &str = r#"{"products": [{"code": "101", "name": "Tee"}]}"#;
    const DETAIL_IN_STOCK: &str = r#"{"variants": [{"code": "101_M", "inStock": true}]}"#;
    const CART_OK: &str = r#"{"entryId": "e-1"}"#;

    fn orchestrator(
        responses: Vec<Result<ApiResponse, TransportError>>,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> (CheckOrchestrator, Arc<ScriptedTransport>) {
        let config: UpstreamConfig = toml::from_str(
            r#"
                base_url = "https://shop.example.in"
                wait_min_ms = 0
                wait_max_ms = 0
            "#,
        )
        .unwrap();
        let transport = ScriptedTransport::new(responses);
        let client = ApiClient::new(&config, transport.clone()).with_zero_backoff();
        (
            CheckOrchestrator::new(client, DedupStore::new(7, 500), dispatcher),
            transport,
        )
    }

    fn user() -> UserContext {
        let mut ctx = UserContext::new("u1");
        ctx.monitor_urls
            .push("https://shop.example.in/c/verse-1".to_string());
        ctx.pincodes.insert("110001".to_string());
        SessionManager::set_credentials(&mut ctx, "deviceId=abc; A=token").unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_deliverable_product_notifies_exactly_once() {
        let dispatcher = RecordingDispatcher::new(false);
        let (orchestrator, transport) = orchestrator(
            vec![
                ok(LISTING_ONE),
                ok(DETAIL_IN_STOCK),
                ok(CART_OK),
                ok(r#"{"serviceable": true}"#),
                ok("{}"),
            ],
            dispatcher.clone(),
        );
        let mut ctx = user();

        let report = orchestrator.run_user(&mut ctx).await;
        assert_eq!(report.deliverable, 1);
        assert_eq!(dispatcher.count(), 1);
        assert!(ctx.pending_notifications.is_empty());
        assert!(ctx.last_check.is_some());
        let calls_after_first = transport.call_count();

        // Second pass over unchanged upstream state: discovery comes from the
        // cache, the pair is already settled, so zero upstream calls and zero
        // new records
        let report = orchestrator.run_user(&mut ctx).await;
        assert_eq!(report.deliverable, 0);
        assert_eq!(report.new_products, 0);
        assert_eq!(dispatcher.count(), 1);
        assert_eq!(transport.call_count(), calls_after_first);
    }

    #[tokio::test]
    async fn test_not_deliverable_settles_pair_without_notification() {
        let dispatcher = RecordingDispatcher::new(false);
        let (orchestrator, transport) = orchestrator(
            vec![
                ok(LISTING_ONE),
                ok(DETAIL_IN_STOCK),
                ok(CART_OK),
                ok(r#"{"serviceable": false}"#),
                ok("{}"),
            ],
            dispatcher.clone(),
        );
        let mut ctx = user();

        let report = orchestrator.run_user(&mut ctx).await;
        assert_eq!(report.deliverable, 0);
        assert_eq!(dispatcher.count(), 0);
        assert_eq!(ctx.seen.get("101").unwrap().checked.get("110001"), Some(&false));

        // Re-run: no new upstream call for the settled pair
        let calls = transport.call_count();
        orchestrator.run_user(&mut ctx).await;
        assert_eq!(transport.call_count(), calls);
    }

    #[tokio::test]
    async fn test_no_variant_settles_all_pincodes() {
        let dispatcher = RecordingDispatcher::new(false);
        let (orchestrator, transport) = orchestrator(
            vec![
                ok(LISTING_ONE),
                ok(r#"{"variants": [{"code": "101_S", "inStock": false}]}"#),
            ],
            dispatcher.clone(),
        );
        let mut ctx = user();
        ctx.pincodes.insert("400001".to_string());

        let report = orchestrator.run_user(&mut ctx).await;
        assert_eq!(report.deliverable, 0);
        let entry = ctx.seen.get("101").unwrap();
        assert_eq!(entry.checked.len(), 2);
        assert!(entry.checked.values().all(|deliverable| !deliverable));
        // Listing + detail only, no cart traffic
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_auth_rejection_expires_session_and_aborts() {
        let dispatcher = RecordingDispatcher::new(false);
        let (orchestrator, transport) =
            orchestrator(vec![status(401, "{}"), status(401, "{}"), status(401, "{}")],
                dispatcher.clone());
        let mut ctx = user();

        let report = orchestrator.run_user(&mut ctx).await;
        assert!(report.needs_relogin);
        assert_eq!(ctx.auth.label(), "expired");
        assert!(ctx.last_check.is_none());
        let calls = transport.call_count();

        // While expired, checks are skipped entirely
        let report = orchestrator.run_user(&mut ctx).await;
        assert!(report.needs_relogin);
        assert_eq!(transport.call_count(), calls);
    }

    #[tokio::test]
    async fn test_failed_dispatch_keeps_record_pending_without_recheck() {
        let dispatcher = RecordingDispatcher::new(true);
        let (orchestrator, transport) = orchestrator(
            vec![
                ok(LISTING_ONE),
                ok(DETAIL_IN_STOCK),
                ok(CART_OK),
                ok(r#"{"serviceable": true}"#),
                ok("{}"),
            ],
            dispatcher.clone(),
        );
        let mut ctx = user();

        let report = orchestrator.run_user(&mut ctx).await;
        assert_eq!(report.deliverable, 1);
        assert_eq!(dispatcher.count(), 0);
        assert_eq!(ctx.pending_notifications.len(), 1);
        assert!(ctx.pending_notifications[0].delivered_at.is_none());

        // The pair stays settled: no fresh availability check, no duplicate
        // pending record
        let calls = transport.call_count();
        orchestrator.run_user(&mut ctx).await;
        assert_eq!(transport.call_count(), calls);
        assert_eq!(ctx.pending_notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_discovery_failure_skips_url_and_continues() {
        let dispatcher = RecordingDispatcher::new(false);
        let (orchestrator, _transport) = orchestrator(
            vec![
                Err(TransportError::Timeout),
                Err(TransportError::Timeout),
                Err(TransportError::Timeout),
                ok(LISTING_ONE),
                ok(DETAIL_IN_STOCK),
                ok(CART_OK),
                ok(r#"{"serviceable": true}"#),
                ok("{}"),
            ],
            dispatcher.clone(),
        );
        let mut ctx = user();
        ctx.monitor_urls
            .insert(0, "https://shop.example.in/c/broken".to_string());

        let report = orchestrator.run_user(&mut ctx).await;
        assert_eq!(report.skipped_urls, 1);
        // The healthy URL still produced its notification
        assert_eq!(report.deliverable, 1);
        assert_eq!(dispatcher.count(), 1);
    }

    #[tokio::test]
    async fn test_no_pincodes_means_no_upstream_traffic() {
        let dispatcher = RecordingDispatcher::new(false);
        let (orchestrator, transport) = orchestrator(vec![], dispatcher);
        let mut ctx = user();
        ctx.pincodes.clear();

        let report = orchestrator.run_user(&mut ctx).await;
        assert_eq!(report.discovered, 0);
        assert_eq!(transport.call_count(), 0);
    }
}
