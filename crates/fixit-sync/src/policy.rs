//! Freshness and eviction policy.

use std::collections::HashMap;
use std::time::Duration;

use crate::key::{
    QueryKey, TAG_CATEGORIES, TAG_CHATS, TAG_MESSAGES, TAG_PROFILE, TAG_PROJECT, TAG_PROJECTS,
    TAG_PROVIDERS,
};

/// Per-entry cache behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPolicy {
    /// How long a fetched value counts as fresh. Stale values are still
    /// served, but trigger a background revalidation.
    pub stale_after: Duration,
    /// How long an entry with no subscribers is kept before eviction.
    pub collect_after: Duration,
    /// Revalidate stale entries when the view regains attention.
    pub refetch_on_focus: bool,
    /// Forced periodic refetch while subscribed.
    pub refetch_interval: Option<Duration>,
    /// Automatic retries of a failed fetch before surfacing the error.
    pub retry_count: u32,
}

impl QueryPolicy {
    /// Baseline for server data without special freshness needs.
    pub fn default_profile() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            collect_after: Duration::from_secs(5 * 60),
            refetch_on_focus: false,
            refetch_interval: None,
            retry_count: 1,
        }
    }

    /// Rarely-changing reference data (categories).
    pub fn static_data() -> Self {
        Self {
            stale_after: Duration::from_secs(24 * 60 * 60),
            collect_after: Duration::from_secs(7 * 24 * 60 * 60),
            refetch_on_focus: false,
            refetch_interval: None,
            retry_count: 1,
        }
    }

    /// Per-user data that should track the server closely.
    pub fn user_data() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            collect_after: Duration::from_secs(5 * 60),
            refetch_on_focus: true,
            refetch_interval: None,
            retry_count: 2,
        }
    }

    /// Chat data: always revalidate, poll as a realtime fallback.
    pub fn realtime_data() -> Self {
        Self {
            stale_after: Duration::ZERO,
            collect_after: Duration::from_secs(60),
            refetch_on_focus: true,
            refetch_interval: Some(Duration::from_secs(10)),
            retry_count: 3,
        }
    }
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self::default_profile()
    }
}

/// Maps key tags to policy profiles, with a fallback for unknown tags.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    by_tag: HashMap<&'static str, QueryPolicy>,
    fallback: QueryPolicy,
}

impl PolicyTable {
    pub fn new(fallback: QueryPolicy) -> Self {
        Self {
            by_tag: HashMap::new(),
            fallback,
        }
    }

    pub fn set(&mut self, tag: &'static str, policy: QueryPolicy) {
        self.by_tag.insert(tag, policy);
    }

    pub fn resolve(&self, key: &QueryKey) -> QueryPolicy {
        key.tag()
            .and_then(|tag| self.by_tag.get(tag).copied())
            .unwrap_or(self.fallback)
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut table = Self::new(QueryPolicy::default_profile());
        table.set(TAG_CATEGORIES, QueryPolicy::static_data());
        table.set(TAG_PROJECTS, QueryPolicy::default_profile());
        table.set(TAG_PROJECT, QueryPolicy::default_profile());
        table.set(TAG_PROVIDERS, QueryPolicy::default_profile());
        table.set(TAG_PROFILE, QueryPolicy::user_data());
        table.set(TAG_CHATS, QueryPolicy::realtime_data());
        table.set(TAG_MESSAGES, QueryPolicy::realtime_data());
        table
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::key::keys;

    #[test]
    fn resolves_by_leading_tag() {
        let table = PolicyTable::default();
        assert_eq!(
            table.resolve(keys::categories().key()),
            QueryPolicy::static_data()
        );
        assert_eq!(
            table.resolve(keys::messages(Uuid::from_u128(1)).key()),
            QueryPolicy::realtime_data()
        );
    }

    #[test]
    fn unknown_tag_falls_back() {
        let table = PolicyTable::default();
        let key = QueryKey::new(vec![crate::key::KeyPart::Tag("weather")]);
        assert_eq!(table.resolve(&key), QueryPolicy::default_profile());
    }

    #[test]
    fn override_replaces_profile() {
        let mut table = PolicyTable::default();
        let custom = QueryPolicy {
            retry_count: 5,
            ..QueryPolicy::default_profile()
        };
        table.set(TAG_CATEGORIES, custom);
        assert_eq!(table.resolve(keys::categories().key()).retry_count, 5);
    }
}
