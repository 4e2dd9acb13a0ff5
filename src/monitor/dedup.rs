//! Product×pincode evaluation ledger.
//!
//! Records which (product, pincode) pairs have been evaluated for a user so a
//! pair is checked at most once while its entry is live. Eviction is lazy:
//! each check cycle purges entries older than the retention window before it
//! starts, which also re-opens those products for evaluation. A size bound
//! keeps a user's ledger from growing without limit on busy listings; oldest
//! entries go first.

use chrono::{DateTime, Duration, Utc};

use crate::store::user::SeenEntry;
use crate::store::UserContext;

/// Policy over the `seen` map inside a user document. Stateless: the data
/// lives in the document, this carries only the retention knobs.
#[derive(Debug, Clone, Copy)]
pub struct DedupStore {
    retention: Duration,
    max_entries: usize,
}

impl DedupStore {
    pub fn new(retention_days: i64, max_entries: usize) -> Self {
        Self {
            retention: Duration::days(retention_days),
            max_entries,
        }
    }

    /// Has this pair been evaluated while its entry is live?
    pub fn already_checked(&self, ctx: &UserContext, product_id: &str, pincode: &str) -> bool {
        ctx.seen
            .get(product_id)
            .is_some_and(|entry| entry.checked.contains_key(pincode))
    }

    /// Has this product been evaluated against every pincode in `pincodes`?
    pub fn fully_checked<'a, I>(&self, ctx: &UserContext, product_id: &str, pincodes: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Some(entry) = ctx.seen.get(product_id) else {
            return false;
        };
        pincodes
            .into_iter()
            .all(|pincode| entry.checked.contains_key(pincode))
    }

    /// Record the evaluation result for a pair. Creates the product entry on
    /// first sight.
    pub fn mark_checked(
        &self,
        ctx: &mut UserContext,
        product_id: &str,
        pincode: &str,
        deliverable: bool,
        now: DateTime<Utc>,
    ) {
        ctx.seen
            .entry(product_id.to_string())
            .or_insert_with(|| SeenEntry::new(now))
            .checked
            .insert(pincode.to_string(), deliverable);
    }

    /// Drop entries older than the retention window, then enforce the size
    /// bound (oldest first). Returns how many entries were removed.
    pub fn purge_expired(&self, ctx: &mut UserContext, now: DateTime<Utc>) -> usize {
        let before = ctx.seen.len();
        let cutoff = now - self.retention;
        ctx.seen.retain(|_, entry| entry.first_seen_at > cutoff);

        if ctx.seen.len() > self.max_entries {
            let mut by_age: Vec<(String, DateTime<Utc>)> = ctx
                .seen
                .iter()
                .map(|(id, entry)| (id.clone(), entry.first_seen_at))
                .collect();
            by_age.sort_by_key(|(_, first_seen_at)| *first_seen_at);
            let excess = ctx.seen.len() - self.max_entries;
            for (id, _) in by_age.into_iter().take(excess) {
                ctx.seen.remove(&id);
            }
        }

        before - ctx.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup() -> DedupStore {
        DedupStore::new(7, 500)
    }

    #[test]
    fn test_mark_then_already_checked() {
        let dedup = dedup();
        let mut ctx = UserContext::new("u1");
        let now = Utc::now();

        assert!(!dedup.already_checked(&ctx, "101", "110001"));
        dedup.mark_checked(&mut ctx, "101", "110001", true, now);
        assert!(dedup.already_checked(&ctx, "101", "110001"));
        // Other pincodes of the same product stay unchecked
        assert!(!dedup.already_checked(&ctx, "101", "400001"));
    }

    #[test]
    fn test_fully_checked_requires_every_pincode() {
        let dedup = dedup();
        let mut ctx = UserContext::new("u1");
        let now = Utc::now();
        let pincodes = vec!["110001".to_string(), "400001".to_string()];

        dedup.mark_checked(&mut ctx, "101", "110001", false, now);
        assert!(!dedup.fully_checked(&ctx, "101", &pincodes));
        dedup.mark_checked(&mut ctx, "101", "400001", false, now);
        assert!(dedup.fully_checked(&ctx, "101", &pincodes));
        assert!(!dedup.fully_checked(&ctx, "102", &pincodes));
    }

    #[test]
    fn test_purge_evicts_at_retention_boundary() {
        let dedup = dedup();
        let mut ctx = UserContext::new("u1");
        let now = Utc::now();

        dedup.mark_checked(&mut ctx, "old", "110001", false, now - Duration::days(7));
        dedup.mark_checked(
            &mut ctx,
            "fresh",
            "110001",
            false,
            now - Duration::days(7) + Duration::seconds(1),
        );

        let purged = dedup.purge_expired(&mut ctx, now);
        assert_eq!(purged, 1);
        assert!(!ctx.seen.contains_key("old"));
        assert!(ctx.seen.contains_key("fresh"));
        // The purged product is eligible again
        assert!(!dedup.already_checked(&ctx, "old", "110001"));
    }

    #[test]
    fn test_purge_enforces_size_bound_oldest_first() {
        let dedup = DedupStore::new(7, 2);
        let mut ctx = UserContext::new("u1");
        let now = Utc::now();

        dedup.mark_checked(&mut ctx, "oldest", "110001", false, now - Duration::hours(3));
        dedup.mark_checked(&mut ctx, "middle", "110001", false, now - Duration::hours(2));
        dedup.mark_checked(&mut ctx, "newest", "110001", false, now - Duration::hours(1));

        let purged = dedup.purge_expired(&mut ctx, now);
        assert_eq!(purged, 1);
        assert!(!ctx.seen.contains_key("oldest"));
        assert!(ctx.seen.contains_key("middle"));
        assert!(ctx.seen.contains_key("newest"));
    }

    #[test]
    fn test_purge_noop_when_everything_is_fresh() {
        let dedup = dedup();
        let mut ctx = UserContext::new("u1");
        let now = Utc::now();
        dedup.mark_checked(&mut ctx, "101", "110001", true, now);
        assert_eq!(dedup.purge_expired(&mut ctx, now), 0);
        assert!(dedup.already_checked(&ctx, "101", "110001"));
    }
}
