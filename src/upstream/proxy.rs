//! Outbound proxy pool.
//!
//! Every outbound call egresses through one endpoint of a static pool, chosen
//! round-robin. Endpoints that keep failing are put on an exponentially
//! growing cooldown and skipped until it expires. Cart and delivery calls can
//! be pinned to a dedicated region-local endpoint, since the upstream answers
//! those from the buyer's region. The pool can be disabled entirely, in which
//! case every call uses a direct connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::{
    ProxyConfig, PROXY_COOLDOWN_BASE_SECS, PROXY_COOLDOWN_CAP_SECS, PROXY_FAILURE_THRESHOLD,
};

/// All endpoints are cooling down (or none are configured) and direct
/// fallback is not allowed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no proxy endpoint available")]
pub struct NoProxyAvailable;

/// Which pool slot an egress came from, for outcome reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxySlot {
    Rotating(usize),
    Checkout,
}

/// The egress chosen for one outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Egress {
    /// No proxy: connect directly
    Direct,
    /// Proxy endpoint with its full connection URL
    Proxy { slot: ProxySlot, url: String },
}

#[derive(Debug)]
struct EndpointState {
    addr: String,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

impl EndpointState {
    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }

    fn eligible(&self, now: Instant) -> bool {
        match self.cooldown_until {
            Some(until) => until <= now,
            None => true,
        }
    }
}

/// Round-robin pool of outbound proxy endpoints with failure avoidance.
pub struct ProxyPool {
    enabled: bool,
    allow_direct: bool,
    rotating: Mutex<Vec<EndpointState>>,
    checkout: Option<Mutex<EndpointState>>,
    cursor: AtomicUsize,
    credentials: Option<(String, String)>,
}

impl ProxyPool {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let rotating = config
            .endpoints
            .iter()
            .map(|addr| EndpointState::new(addr))
            .collect();
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };
        Self {
            enabled: config.enabled,
            allow_direct: config.allow_direct,
            rotating: Mutex::new(rotating),
            checkout: config
                .checkout
                .as_deref()
                .map(|addr| Mutex::new(EndpointState::new(addr))),
            cursor: AtomicUsize::new(0),
            credentials,
        }
    }

    /// Pick an egress for a general (discovery/identity) call.
    pub fn acquire(&self) -> Result<Egress, NoProxyAvailable> {
        self.acquire_at(Instant::now())
    }

    /// Pick an egress for a cart/delivery call, preferring the region-pinned
    /// checkout endpoint when one is configured and not cooling down.
    pub fn acquire_checkout(&self) -> Result<Egress, NoProxyAvailable> {
        self.acquire_checkout_at(Instant::now())
    }

    /// Feed back the transport outcome of a call made through `egress`.
    pub fn report(&self, egress: &Egress, success: bool) {
        self.report_at(egress, success, Instant::now());
    }

    fn acquire_at(&self, now: Instant) -> Result<Egress, NoProxyAvailable> {
        if !self.enabled {
            return Ok(Egress::Direct);
        }
        let endpoints = lock(&self.rotating);
        if !endpoints.is_empty() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed);
            for offset in 0..endpoints.len() {
                let index = (start + offset) % endpoints.len();
                if endpoints[index].eligible(now) {
                    return Ok(Egress::Proxy {
                        slot: ProxySlot::Rotating(index),
                        url: self.url_for(&endpoints[index].addr),
                    });
                }
            }
        }
        if self.allow_direct {
            tracing::debug!("All proxy endpoints cooling down, falling back to direct connection");
            Ok(Egress::Direct)
        } else {
            Err(NoProxyAvailable)
        }
    }

    fn acquire_checkout_at(&self, now: Instant) -> Result<Egress, NoProxyAvailable> {
        if !self.enabled {
            return Ok(Egress::Direct);
        }
        if let Some(checkout) = &self.checkout {
            let state = lock(checkout);
            if state.eligible(now) {
                return Ok(Egress::Proxy {
                    slot: ProxySlot::Checkout,
                    url: self.url_for(&state.addr),
                });
            }
        }
        self.acquire_at(now)
    }

    fn report_at(&self, egress: &Egress, success: bool, now: Instant) {
        let Egress::Proxy { slot, .. } = egress else {
            return;
        };
        match slot {
            ProxySlot::Rotating(index) => {
                let mut endpoints = lock(&self.rotating);
                if let Some(state) = endpoints.get_mut(*index) {
                    Self::apply_outcome(state, success, now);
                }
            }
            ProxySlot::Checkout => {
                if let Some(checkout) = &self.checkout {
                    Self::apply_outcome(&mut lock(checkout), success, now);
                }
            }
        }
    }

    fn apply_outcome(state: &mut EndpointState, success: bool, now: Instant) {
        if success {
            state.consecutive_failures = 0;
            state.cooldown_until = None;
            return;
        }
        state.consecutive_failures += 1;
        if state.consecutive_failures >= PROXY_FAILURE_THRESHOLD {
            let over = state.consecutive_failures - PROXY_FAILURE_THRESHOLD;
            let secs = PROXY_COOLDOWN_BASE_SECS
                .saturating_mul(1u64 << over.min(63))
                .min(PROXY_COOLDOWN_CAP_SECS);
            state.cooldown_until = Some(now + Duration::from_secs(secs));
            tracing::warn!(
                endpoint = %state.addr,
                failures = state.consecutive_failures,
                cooldown_secs = secs,
                "Proxy endpoint entering cooldown"
            );
        }
    }

    fn url_for(&self, addr: &str) -> String {
        match &self.credentials {
            Some((user, pass)) => format!(
                "http://{}:{}@{}",
                urlencoding::encode(user),
                urlencoding::encode(pass),
                addr
            ),
            None => format!("http://{addr}"),
        }
    }
}

/// Poison-tolerant lock: the guarded state stays usable even if a panic
/// unwound while it was held.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
