//! Retail upstream access.
//!
//! Everything that talks to the retail site lives here: the proxy pool that
//! chooses an egress per outbound call, and the API client that wraps the
//! site's discovery, variant and cart endpoints behind retry/rotation policy.
//! Shared identifier types and monitor-URL parsing helpers are defined at the
//! module root.

pub mod client;
pub mod proxy;

/// Opaque product identifier as the upstream reports it
pub type ProductId = String;

/// Opaque variant (size/option) identifier
pub type VariantId = String;

/// One product taken from a category listing
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredProduct {
    pub id: ProductId,
    pub name: String,
    pub price: Option<f64>,
    /// Canonical product page URL, used in notifications
    pub url: String,
}

/// Extract the base product id from a product URL like `…/p/443336453_pink`.
pub fn extract_product_id(product_url: &str) -> Option<ProductId> {
    let after = product_url.split("/p/").nth(1)?;
    let id: String = after.chars().take_while(char::is_ascii_digit).collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Build the canonical product page URL for an id.
pub fn product_url(base_url: &str, id: &str) -> String {
    format!("{}/p/{}", base_url.trim_end_matches('/'), id)
}

/// Extract the category code from a monitor URL path.
///
/// Listing URLs look like `https://host/c/<code>?facets=…`; some older links
/// put the code in the last path segment without the `/c/` prefix.
pub fn category_code(monitor_url: &str) -> Option<String> {
    let without_scheme = monitor_url.split("://").nth(1).unwrap_or(monitor_url);
    let path = without_scheme
        .split_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or("");
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if let Some(pos) = segments.iter().position(|s| *s == "c") {
        return segments.get(pos + 1).map(|s| (*s).to_string());
    }
    segments.last().map(|s| (*s).to_string())
}

/// Pull the (decoded) query parameters off a monitor URL.
pub fn monitor_query(monitor_url: &str) -> Vec<(String, String)> {
    let Some((_, query)) = monitor_url.split_once('?') else {
        return Vec::new();
    };
    query
        .split('&')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let value = urlencoding::decode(value).ok()?;
            Some((name.to_string(), value.into_owned()))
        })
        .collect()
}
