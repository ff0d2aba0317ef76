//! Subscription filters and their normalized signatures.
//!
//! Two logically identical filter sets must map to the same signature
//! so the multiplexer can collapse them onto one relay-level
//! subscription. Normalization sorts and deduplicates every list
//! field; the signature is a SHA-256 over the canonical JSON form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A structured query describing which events a subscription wants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries, keyed as `#<letter>` on the wire.
    #[serde(flatten, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key should be the tag letter (e.g., "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by `#e` (event reference) tags.
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by `#p` (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Canonical form: every list field sorted and deduplicated.
    pub fn normalized(&self) -> Filter {
        fn canon<T: Ord>(v: &Option<Vec<T>>) -> Option<Vec<T>>
        where
            T: Clone,
        {
            v.as_ref().map(|items| {
                let mut items = items.clone();
                items.sort();
                items.dedup();
                items
            })
        }

        let mut tags = BTreeMap::new();
        for (key, values) in &self.tags {
            let mut values = values.clone();
            values.sort();
            values.dedup();
            tags.insert(key.clone(), values);
        }

        Filter {
            ids: canon(&self.ids),
            authors: canon(&self.authors),
            kinds: canon(&self.kinds),
            since: self.since,
            until: self.until,
            limit: self.limit,
            tags,
        }
    }
}

/// Normalized hash identifying a set of filters.
///
/// Used as the multiplexer's deduplication key: equal signatures mean
/// one relay-level subscription serves every caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterSignature(String);

impl FilterSignature {
    /// Compute the signature for a set of filters.
    ///
    /// Filter order within the set does not matter.
    pub fn of(filters: &[Filter]) -> Self {
        let mut canonical: Vec<String> = filters
            .iter()
            .map(|f| {
                serde_json::to_string(&f.normalized())
                    .unwrap_or_else(|_| String::from("{}"))
            })
            .collect();
        canonical.sort();
        canonical.dedup();

        let mut hasher = Sha256::new();
        for entry in &canonical {
            hasher.update(entry.as_bytes());
            hasher.update(b"\n");
        }
        FilterSignature(hex::encode(hasher.finalize()))
    }

    /// Hex digest backing this signature.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FilterSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short prefix is enough to disambiguate in logs.
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}
