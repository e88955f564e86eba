//! The cache record shared by every tier.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;

/// How servable an entry is at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `now < created_at + ttl`
    Fresh,
    /// Past its TTL but inside the stale window; may be served while revalidating.
    Stale,
    /// Must not be served.
    Expired,
}

impl Freshness {
    pub fn is_servable(self) -> bool {
        !matches!(self, Freshness::Expired)
    }
}

/// A cached value with its tags and lifetime.
///
/// Only [`CacheStore`](super::CacheStore) creates or mutates entries; tiers store
/// and return them verbatim so that a promoted copy keeps its original age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub tags: BTreeSet<String>,
    pub created_at: OffsetDateTime,
    pub ttl_secs: u64,
    pub stale_window_secs: u64,
    /// Write generation assigned by the tag index; lets background writers and
    /// bulk deletes detect that a newer write has superseded them.
    pub generation: u64,
}

impl CacheEntry {
    pub fn freshness(&self, now: OffsetDateTime) -> Freshness {
        if now < deadline(self.created_at, self.ttl_secs) {
            Freshness::Fresh
        } else if now < deadline(self.created_at, self.ttl_secs.saturating_add(self.stale_window_secs))
        {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// Time left before the entry stops being fresh.
    pub fn remaining_ttl(&self, now: OffsetDateTime) -> Duration {
        let left = deadline(self.created_at, self.ttl_secs) - now;
        left.try_into().unwrap_or(Duration::ZERO)
    }

    /// Time left before the entry must no longer be served at all.
    pub fn remaining_lifetime(&self, now: OffsetDateTime) -> Duration {
        let total = self.ttl_secs.saturating_add(self.stale_window_secs);
        let left = deadline(self.created_at, total) - now;
        left.try_into().unwrap_or(Duration::ZERO)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

fn deadline(created_at: OffsetDateTime, secs: u64) -> OffsetDateTime {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    created_at
        .checked_add(time::Duration::seconds(secs))
        .unwrap_or(OffsetDateTime::new_utc(time::Date::MAX, time::Time::MIDNIGHT))
}
