//! Retail API client.
//!
//! Wraps the upstream's logical operations (discover products, resolve a
//! variant, check deliverability via cart simulation, OTP login) behind a
//! retry/rotation policy. Each attempt egresses through a fresh proxy pool
//! endpoint; authentication rejections short-circuit the retry budget so the
//! session layer can react immediately. A short-TTL cache keeps a manual
//! trigger right after a scheduled run from re-hitting the listing endpoint.
//!
//! The `Transport` trait isolates "perform one attempt" from the policy that
//! decides attempt count and delay, so unit tests drive the client with
//! scripted responses instead of a network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use rand::Rng;
use reqwest::Method;
use serde::Deserialize;

use crate::auth::session::CredentialSet;
use crate::config::{
    UpstreamConfig, API_CART_ADD, API_CART_REMOVE, API_CATEGORY, API_DELIVERY_CHECK,
    API_GENERATE_OTP, API_LOGIN, API_PRODUCT, DISCOVERY_PAGE_SIZE, RETRY_BASE_DELAY_MS,
    RETRY_MAX_DELAY_MS, UPSTREAM_USER_AGENT,
};

use super::proxy::{Egress, ProxyPool};
use super::{category_code, monitor_query, product_url, DiscoveredProduct, ProductId, VariantId};

/// Marker the upstream's edge returns instead of JSON when it dislikes a
/// client. Treated as a transient, rotate-and-retry condition.
const BLOCKED_MARKER: &str = "Access Denied";

/// Which egress a call should use. Cart and delivery calls are answered from
/// the buyer's region, so they prefer the pinned checkout endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Identity,
    Discovery,
    Checkout,
}

/// One upstream request, transport-agnostic.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the upstream base URL
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Rendered `Cookie:` header value, when the call carries a session
    pub cookies: Option<String>,
    pub referer: Option<String>,
    pub body: Option<serde_json::Value>,
    pub kind: CallKind,
}

/// Raw upstream response as the transport saw it.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
    /// Raw `Set-Cookie` header values
    pub set_cookies: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("no proxy endpoint available")]
    NoProxy,
}

/// Performs one attempt of one request. Implementations own egress selection
/// and outcome reporting; the client owns retries, rotation and parsing.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Production transport: reqwest through the proxy pool.
///
/// A client is built per attempt because the proxy is fixed at client build
/// time; rotation requires a fresh client.
pub struct HttpTransport {
    base_url: String,
    tenant: Option<String>,
    timeout: Duration,
    pool: Arc<ProxyPool>,
}

impl HttpTransport {
    pub fn new(config: &UpstreamConfig, pool: Arc<ProxyPool>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tenant: config.tenant.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            pool,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let egress = match request.kind {
            CallKind::Checkout => self.pool.acquire_checkout(),
            CallKind::Identity | CallKind::Discovery => self.pool.acquire(),
        }
        .map_err(|_| TransportError::NoProxy)?;

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(UPSTREAM_USER_AGENT);
        if let Egress::Proxy { url, .. } = &egress {
            let proxy =
                reqwest::Proxy::all(url).map_err(|e| TransportError::Network(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let url = format!("{}/{}", self.base_url, request.path);
        let mut req = client
            .request(request.method.clone(), &url)
            .header(reqwest::header::ACCEPT, "application/json");
        if !request.query.is_empty() {
            req = req.query(&request.query);
        }
        if let Some(tenant) = &self.tenant {
            req = req.header("x-tenant-id", tenant);
        }
        if let Some(referer) = &request.referer {
            req = req.header(reqwest::header::REFERER, referer);
        }
        if let Some(cookies) = &request.cookies {
            req = req.header(reqwest::header::COOKIE, cookies);
        }
        if let Some(body) = &request.body {
            req = req
                .header(reqwest::header::ORIGIN, self.base_url.clone())
                .json(body);
        }

        match req.send().await {
            Ok(response) => {
                self.pool.report(&egress, true);
                let status = response.status().as_u16();
                let set_cookies = response
                    .headers()
                    .get_all(reqwest::header::SET_COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .map(str::to_string)
                    .collect();
                let body = response
                    .text()
                    .await
                    .map_err(|e| TransportError::Network(e.to_string()))?;
                Ok(ApiResponse {
                    status,
                    body,
                    set_cookies,
                })
            }
            Err(error) => {
                self.pool.report(&egress, false);
                if error.is_timeout() {
                    Err(TransportError::Timeout)
                } else {
                    Err(TransportError::Network(error.to_string()))
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The upstream rejected the caller's session; the session layer must
    /// mark it expired before anything else is tried for this user.
    #[error("authentication rejected by upstream")]
    AuthRejected,
    #[error("product discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("variant lookup failed: {0}")]
    ResolveFailed(String),
    #[error("availability check failed: {0}")]
    AvailabilityCheckFailed(String),
    #[error("identity endpoint rejected the request: {0}")]
    IdentityRejected(String),
}

/// Outcome of the shared retry loop, before an operation maps it onto its own
/// error variant.
enum RequestError {
    AuthRejected,
    Exhausted { message: String },
}

/// Jittered exponential backoff between retry attempts.
#[derive(Debug, Clone)]
struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    fn delay(&self, completed_attempts: u32) -> Duration {
        let exp = (self.base.as_millis() as u64)
            .saturating_mul(1u64 << (completed_attempts.saturating_sub(1)).min(16));
        let capped = exp.min(self.cap.as_millis() as u64);
        let jitter = {
            let mut rng = rand::rng();
            rng.random_range(0..=capped / 2)
        };
        Duration::from_millis(capped / 2 + jitter)
    }
}

// =============================================================================
// Upstream wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    products: Vec<ListingProduct>,
    #[serde(default)]
    pagination: Option<ListingPagination>,
}

#[derive(Debug, Deserialize)]
struct ListingProduct {
    #[serde(default)]
    code: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    price: Option<ListingPrice>,
}

#[derive(Debug, Deserialize)]
struct ListingPrice {
    #[serde(default)]
    value: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingPagination {
    #[serde(default)]
    total_number_of_results: u64,
    #[serde(default)]
    current_page: u32,
    #[serde(default)]
    number_of_pages: u32,
}

#[derive(Debug, Deserialize)]
struct DetailResponse {
    #[serde(default)]
    variants: Vec<VariantEntry>,
}

#[derive(Debug, Deserialize)]
struct VariantEntry {
    #[serde(default)]
    code: String,
    #[serde(default, rename = "inStock")]
    in_stock: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CartAddResponse {
    #[serde(default)]
    entry_id: Option<String>,
    #[serde(default)]
    out_of_stock: bool,
}

#[derive(Debug, Deserialize)]
struct DeliveryResponse {
    // The upstream has shipped both spellings; accept either
    #[serde(default)]
    serviceable: Option<bool>,
    #[serde(default)]
    servicability: Option<bool>,
}

impl DeliveryResponse {
    fn verdict(&self) -> Option<bool> {
        self.serviceable.or(self.servicability)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Retail API client: retry/rotation policy over a `Transport`, plus the
/// operation-level request building and response parsing.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    retry_attempts: u32,
    retry: RetryPolicy,
    wait_min_ms: u64,
    wait_max_ms: u64,
    max_products: usize,
    discovery_cache: Cache<String, Vec<DiscoveredProduct>>,
}

impl ApiClient {
    pub fn new(config: &UpstreamConfig, transport: Arc<dyn Transport>) -> Self {
        let discovery_cache = Cache::builder()
            .max_capacity(64)
            .time_to_live(Duration::from_secs(config.discovery_cache_ttl_seconds))
            .build();
        Self {
            transport,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry_attempts: config.retry_attempts,
            retry: RetryPolicy {
                base: Duration::from_millis(RETRY_BASE_DELAY_MS),
                cap: Duration::from_millis(RETRY_MAX_DELAY_MS),
            },
            wait_min_ms: config.wait_min_ms,
            wait_max_ms: config.wait_max_ms,
            max_products: config.max_products,
            discovery_cache,
        }
    }

    /// Randomized politeness delay between successive product-level
    /// operations. Bounds come from configuration; zero disables it.
    pub async fn pace(&self) {
        if self.wait_max_ms == 0 {
            return;
        }
        let millis = {
            let mut rng = rand::rng();
            rng.random_range(self.wait_min_ms..=self.wait_max_ms)
        };
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Fetch the product listing behind a monitor URL.
    pub async fn discover_products(
        &self,
        monitor_url: &str,
        creds: &CredentialSet,
    ) -> Result<Vec<DiscoveredProduct>, ClientError> {
        if let Some(cached) = self.discovery_cache.get(monitor_url).await {
            tracing::debug!(url = %monitor_url, products = cached.len(), "Discovery cache hit");
            return Ok(cached);
        }

        let code = category_code(monitor_url).ok_or_else(|| {
            ClientError::DiscoveryFailed("no category code in monitor URL".to_string())
        })?;

        let mut query: Vec<(String, String)> = vec![
            ("fields".to_string(), "SITE".to_string()),
            ("currentPage".to_string(), "0".to_string()),
            ("pageSize".to_string(), DISCOVERY_PAGE_SIZE.to_string()),
            ("format".to_string(), "json".to_string()),
            ("platform".to_string(), "Desktop".to_string()),
            ("customerType".to_string(), "Existing".to_string()),
        ];
        if let Some((_, facets)) = monitor_query(monitor_url)
            .into_iter()
            .find(|(name, _)| name == "facets")
        {
            query.push(("query".to_string(), format!(":relevance:{facets}")));
            query.push(("facets".to_string(), facets));
        }

        let request = ApiRequest {
            method: Method::GET,
            path: format!("{API_CATEGORY}/{code}"),
            query,
            cookies: Some(creds.cookie_header()),
            referer: Some(monitor_url.to_string()),
            body: None,
            kind: CallKind::Discovery,
        };

        let response = self.send_with_retry(&request).await.map_err(|e| match e {
            RequestError::AuthRejected => ClientError::AuthRejected,
            RequestError::Exhausted { message } => ClientError::DiscoveryFailed(message),
        })?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::DiscoveryFailed(format!(
                "upstream status {}",
                response.status
            )));
        }

        let listing: ListingResponse = serde_json::from_str(&response.body)
            .map_err(|e| ClientError::DiscoveryFailed(format!("unparseable listing: {e}")))?;
        if let Some(pagination) = &listing.pagination {
            tracing::debug!(
                url = %monitor_url,
                total = pagination.total_number_of_results,
                page = pagination.current_page + 1,
                pages = pagination.number_of_pages,
                "Listing fetched"
            );
        }

        let products: Vec<DiscoveredProduct> = listing
            .products
            .into_iter()
            .filter(|p| !p.code.is_empty())
            .take(self.max_products)
            .map(|p| DiscoveredProduct {
                url: product_url(&self.base_url, &p.code),
                id: p.code,
                name: p.name,
                price: p.price.map(|price| price.value),
            })
            .collect();

        self.discovery_cache
            .insert(monitor_url.to_string(), products.clone())
            .await;
        Ok(products)
    }

    /// Find the first in-stock variant of a product. `None` means the product
    /// is currently unavailable, which is a valid outcome, not an error.
    pub async fn resolve_variant(
        &self,
        product_id: &ProductId,
        creds: &CredentialSet,
    ) -> Result<Option<VariantId>, ClientError> {
        let request = ApiRequest {
            method: Method::GET,
            path: format!("{API_PRODUCT}/{product_id}"),
            query: Vec::new(),
            cookies: Some(creds.cookie_header()),
            referer: Some(product_url(&self.base_url, product_id)),
            body: None,
            kind: CallKind::Discovery,
        };

        let response = self.send_with_retry(&request).await.map_err(|e| match e {
            RequestError::AuthRejected => ClientError::AuthRejected,
            RequestError::Exhausted { message } => ClientError::ResolveFailed(message),
        })?;
        // A withdrawn product is "unavailable", not a fault
        if response.status == 404 {
            return Ok(None);
        }
        if !(200..300).contains(&response.status) {
            return Err(ClientError::ResolveFailed(format!(
                "upstream status {}",
                response.status
            )));
        }

        let detail: DetailResponse = serde_json::from_str(&response.body)
            .map_err(|e| ClientError::ResolveFailed(format!("unparseable detail: {e}")))?;
        Ok(detail
            .variants
            .into_iter()
            .find(|v| v.in_stock && !v.code.is_empty())
            .map(|v| v.code))
    }

    /// Can this variant be delivered to this pincode? Simulated through the
    /// cart: add the variant, read the delivery estimate, roll the cart back.
    pub async fn check_availability(
        &self,
        variant_id: &VariantId,
        pincode: &str,
        creds: &CredentialSet,
    ) -> Result<bool, ClientError> {
        let add_request = ApiRequest {
            method: Method::POST,
            path: API_CART_ADD.to_string(),
            query: Vec::new(),
            cookies: Some(creds.cookie_header()),
            referer: Some(product_url(&self.base_url, variant_id)),
            body: Some(serde_json::json!({
                "productCode": variant_id,
                "quantity": 1,
            })),
            kind: CallKind::Checkout,
        };

        let response = self
            .send_with_retry(&add_request)
            .await
            .map_err(|e| match e {
                RequestError::AuthRejected => ClientError::AuthRejected,
                RequestError::Exhausted { message } => {
                    ClientError::AvailabilityCheckFailed(message)
                }
            })?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::AvailabilityCheckFailed(format!(
                "cart add status {}",
                response.status
            )));
        }
        let cart: CartAddResponse = serde_json::from_str(&response.body)
            .map_err(|e| ClientError::AvailabilityCheckFailed(format!("unparseable cart: {e}")))?;
        if cart.out_of_stock {
            return Ok(false);
        }

        let verdict = self.delivery_estimate(variant_id, pincode, creds).await;

        // Roll the cart back regardless of the estimate outcome; a failed
        // rollback leaves a stray cart entry, which the upstream tolerates
        if let Some(entry_id) = cart.entry_id {
            self.rollback_cart(&entry_id, creds).await;
        }

        verdict
    }

    async fn delivery_estimate(
        &self,
        variant_id: &VariantId,
        pincode: &str,
        creds: &CredentialSet,
    ) -> Result<bool, ClientError> {
        let request = ApiRequest {
            method: Method::GET,
            path: API_DELIVERY_CHECK.to_string(),
            query: vec![
                ("productCode".to_string(), variant_id.clone()),
                ("postalCode".to_string(), pincode.to_string()),
                ("quantity".to_string(), "1".to_string()),
            ],
            cookies: Some(creds.cookie_header()),
            referer: Some(product_url(&self.base_url, variant_id)),
            body: None,
            kind: CallKind::Checkout,
        };

        let response = self.send_with_retry(&request).await.map_err(|e| match e {
            RequestError::AuthRejected => ClientError::AuthRejected,
            RequestError::Exhausted { message } => ClientError::AvailabilityCheckFailed(message),
        })?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::AvailabilityCheckFailed(format!(
                "delivery check status {}",
                response.status
            )));
        }
        let delivery: DeliveryResponse = serde_json::from_str(&response.body).map_err(|e| {
            ClientError::AvailabilityCheckFailed(format!("unparseable estimate: {e}"))
        })?;
        delivery.verdict().ok_or_else(|| {
            ClientError::AvailabilityCheckFailed("no serviceability field in estimate".to_string())
        })
    }

    async fn rollback_cart(&self, entry_id: &str, creds: &CredentialSet) {
        let request = ApiRequest {
            method: Method::POST,
            path: API_CART_REMOVE.to_string(),
            query: Vec::new(),
            cookies: Some(creds.cookie_header()),
            referer: None,
            body: Some(serde_json::json!({ "entryId": entry_id })),
            kind: CallKind::Checkout,
        };
        if let Err(RequestError::Exhausted { message }) = self.send_with_retry(&request).await {
            tracing::warn!(entry = %entry_id, %message, "Cart rollback failed");
        }
    }

    /// Ask the identity endpoint to send an OTP to a phone number.
    pub async fn request_otp(&self, phone: &str) -> Result<(), ClientError> {
        let request = ApiRequest {
            method: Method::POST,
            path: API_GENERATE_OTP.to_string(),
            query: Vec::new(),
            cookies: None,
            referer: Some(format!("{}/login", self.base_url)),
            body: Some(serde_json::json!({ "mobileNumber": phone })),
            kind: CallKind::Identity,
        };

        let response = self.send_with_retry(&request).await.map_err(|e| match e {
            RequestError::AuthRejected => {
                ClientError::IdentityRejected("request refused".to_string())
            }
            RequestError::Exhausted { message } => ClientError::IdentityRejected(message),
        })?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::IdentityRejected(error_message(&response)));
        }
        Ok(())
    }

    /// Exchange phone + OTP for the session cookie payload.
    pub async fn verify_otp(
        &self,
        phone: &str,
        code: &str,
    ) -> Result<CredentialSet, ClientError> {
        let request = ApiRequest {
            method: Method::POST,
            path: API_LOGIN.to_string(),
            query: Vec::new(),
            cookies: None,
            referer: Some(format!("{}/login/otp", self.base_url)),
            body: Some(serde_json::json!({ "username": phone, "otp": code })),
            kind: CallKind::Identity,
        };

        let response = self.send_with_retry(&request).await.map_err(|e| match e {
            RequestError::AuthRejected => {
                ClientError::IdentityRejected("login refused".to_string())
            }
            RequestError::Exhausted { message } => ClientError::IdentityRejected(message),
        })?;

        let login: LoginResponse = serde_json::from_str(&response.body)
            .map_err(|e| ClientError::IdentityRejected(format!("unparseable login: {e}")))?;
        let rejected = !(200..300).contains(&response.status)
            || login.error.is_some()
            || login.status_code.is_some_and(|c| c >= 400);
        if rejected {
            return Err(ClientError::IdentityRejected(error_message(&response)));
        }

        let mut creds = CredentialSet::default();
        for raw in &response.set_cookies {
            if let Some(pair) = raw.split(';').next() {
                if let Some((name, value)) = pair.split_once('=') {
                    creds.set(name.trim(), value.trim());
                }
            }
        }
        if let Some(token) = login.access_token {
            creds.set("A", &token);
        }
        if let Some(token) = login.refresh_token {
            creds.set("R", &token);
        }
        Ok(creds)
    }

    /// Shared retry loop: rotate egress per attempt, back off with jitter,
    /// short-circuit on authentication rejection.
    async fn send_with_retry(&self, request: &ApiRequest) -> Result<ApiResponse, RequestError> {
        let mut last = String::new();
        for attempt in 1..=self.retry_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.retry.delay(attempt - 1)).await;
            }
            match self.transport.send(request).await {
                Ok(response) => {
                    if response.body.contains(BLOCKED_MARKER) {
                        last = "request blocked by upstream".to_string();
                        tracing::debug!(path = %request.path, attempt, "Upstream blocked request, rotating");
                        continue;
                    }
                    if response.status == 401 || response.status == 403 {
                        return Err(RequestError::AuthRejected);
                    }
                    if response.status == 429 || response.status >= 500 {
                        last = format!("upstream status {}", response.status);
                        tracing::debug!(path = %request.path, attempt, status = response.status, "Retryable upstream status");
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    last = error.to_string();
                    tracing::debug!(path = %request.path, attempt, %error, "Attempt failed");
                }
            }
        }
        Err(RequestError::Exhausted { message: last })
    }

    #[cfg(test)]
    pub(crate) fn with_zero_backoff(mut self) -> Self {
        self.retry = RetryPolicy {
            base: Duration::ZERO,
            cap: Duration::ZERO,
        };
        self
    }
}

/// Best-effort human-readable error out of an upstream response body.
fn error_message(response: &ApiResponse) -> String {
    serde_json::from_str::<LoginResponse>(&response.body)
        .ok()
        .and_then(|login| login.message.or(login.error))
        .unwrap_or_else(|| format!("upstream status {}", response.status))
}


#[cfg(test)]
mod tests {
    use super::testing::{ok, status, ScriptedTransport};
    use super::*;

    fn upstream_config() -> UpstreamConfig {
        toml::from_str(
            r#"
                base_url = "https://shop.example.in"
                wait_min_ms = 0
                wait_max_ms = 0
                max_products = 3
            "#,
        )
        .unwrap()
    }

    fn client(transport: Arc<ScriptedTransport>) -> ApiClient {
        ApiClient::new(&upstream_config(), transport).with_zero_backoff()
    }

    fn creds() -> CredentialSet {
        CredentialSet::parse("A=token").with_defaults("u1")
    }

    const LISTING: &str = r#"{
        "products": [
            {"code": "101", "name": "Tee", "price": {"value": 499.0}},
            {"code": "102", "name": "Jeans"},
            {"code": "", "name": "corrupt"},
            {"code": "103", "name": "Jacket"},
            {"code": "104", "name": "Over the cap"}
        ],
        "pagination": {"totalNumberOfResults": 5, "currentPage": 0, "numberOfPages": 1}
    }"#;

    #[tokio::test]
    async fn test_discovery_parses_and_caps_products() {
        let transport = ScriptedTransport::new(vec![ok(LISTING)]);
        let client = client(transport.clone());
        let products = client
            .discover_products("https://shop.example.in/c/verse-1", &creds())
            .await
            .unwrap();
        // Empty codes skipped, capped at max_products
        assert_eq!(products.len(), 3);
        assert_eq!(products[0].id, "101");
        assert_eq!(products[0].price, Some(499.0));
        assert_eq!(products[0].url, "https://shop.example.in/p/101");
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_discovery_cache_suppresses_second_fetch() {
        let transport = ScriptedTransport::new(vec![ok(LISTING)]);
        let client = client(transport.clone());
        let url = "https://shop.example.in/c/verse-1";
        client.discover_products(url, &creds()).await.unwrap();
        client.discover_products(url, &creds()).await.unwrap();
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_discovery_retries_then_fails() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Network("reset".to_string())),
            Err(TransportError::Timeout),
        ]);
        let client = client(transport.clone());
        let err = client
            .discover_products("https://shop.example.in/c/verse-1", &creds())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DiscoveryFailed(_)));
        // One attempt per configured retry, no more
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_auth_rejection_short_circuits_retries() {
        let transport =
            ScriptedTransport::new(vec![status(401, "{}"), ok(LISTING), ok(LISTING)]);
        let client = client(transport.clone());
        let err = client
            .discover_products("https://shop.example.in/c/verse-1", &creds())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::AuthRejected));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_blocked_body_rotates_and_retries() {
        let transport = ScriptedTransport::new(vec![
            status(403, "<html>Access Denied</html>"),
            ok(LISTING),
        ]);
        let client = client(transport.clone());
        let products = client
            .discover_products("https://shop.example.in/c/verse-1", &creds())
            .await
            .unwrap();
        assert_eq!(products.len(), 3);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_resolve_picks_first_in_stock_variant() {
        let body = r#"{"variants": [
            {"code": "101_S", "inStock": false},
            {"code": "101_M", "inStock": true},
            {"code": "101_L", "inStock": true}
        ]}"#;
        let transport = ScriptedTransport::new(vec![ok(body)]);
        let client = client(transport);
        let variant = client
            .resolve_variant(&"101".to_string(), &creds())
            .await
            .unwrap();
        assert_eq!(variant, Some("101_M".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_none_when_nothing_in_stock_or_gone() {
        let body = r#"{"variants": [{"code": "101_S", "inStock": false}]}"#;
        let transport = ScriptedTransport::new(vec![ok(body), status(404, "")]);
        let client = client(transport);
        let id = "101".to_string();
        assert_eq!(client.resolve_variant(&id, &creds()).await.unwrap(), None);
        assert_eq!(client.resolve_variant(&id, &creds()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_availability_out_of_stock_skips_delivery_call() {
        let transport =
            ScriptedTransport::new(vec![ok(r#"{"outOfStock": true}"#)]);
        let client = client(transport.clone());
        let deliverable = client
            .check_availability(&"101_M".to_string(), "110001", &creds())
            .await
            .unwrap();
        assert!(!deliverable);
        assert_eq!(transport.call_paths(), vec![API_CART_ADD.to_string()]);
    }

    #[tokio::test]
    async fn test_availability_simulates_cart_and_rolls_back() {
        let transport = ScriptedTransport::new(vec![
            ok(r#"{"entryId": "e-9"}"#),
            ok(r#"{"serviceable": true}"#),
            ok("{}"),
        ]);
        let client = client(transport.clone());
        let deliverable = client
            .check_availability(&"101_M".to_string(), "110001", &creds())
            .await
            .unwrap();
        assert!(deliverable);
        assert_eq!(
            transport.call_paths(),
            vec![
                API_CART_ADD.to_string(),
                API_DELIVERY_CHECK.to_string(),
                API_CART_REMOVE.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_availability_accepts_legacy_serviceability_spelling() {
        let transport = ScriptedTransport::new(vec![
            ok(r#"{"entryId": "e-9"}"#),
            ok(r#"{"servicability": false}"#),
            ok("{}"),
        ]);
        let client = client(transport);
        let deliverable = client
            .check_availability(&"101_M".to_string(), "110001", &creds())
            .await
            .unwrap();
        assert!(!deliverable);
    }

    #[tokio::test]
    async fn test_verify_otp_assembles_credentials() {
        let transport = ScriptedTransport::new(vec![Ok(ApiResponse {
            status: 200,
            body: r#"{"accessToken": "acc", "refreshToken": "ref"}"#.to_string(),
            set_cookies: vec!["SID=abc; Path=/; HttpOnly".to_string()],
        })]);
        let client = client(transport);
        let creds = client.verify_otp("9876543210", "123456").await.unwrap();
        assert_eq!(creds.get("SID"), Some("abc"));
        assert_eq!(creds.get("A"), Some("acc"));
        assert_eq!(creds.get("R"), Some("ref"));
    }

    #[tokio::test]
    async fn test_verify_otp_surfaces_upstream_message() {
        let transport = ScriptedTransport::new(vec![status(
            400,
            r#"{"statusCode": 400, "message": "Invalid OTP"}"#,
        )]);
        let client = client(transport);
        let err = client.verify_otp("9876543210", "000000").await.unwrap_err();
        match err {
            ClientError::IdentityRejected(message) => assert_eq!(message, "Invalid OTP"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
