//! Invalidation plans.
//!
//! Resolves intents into the concrete tags, patterns and keys to purge, and
//! merges queued plans into a single deduplicated batch.

use std::collections::BTreeSet;
use std::fmt;

use time::OffsetDateTime;

use super::error::{CacheError, CacheResult};
use super::intents::{
    InvalidationIntent, area_tag, authority_tags, hourly_tag, postcode_tag, user_tag,
};
use super::keys::KeyPattern;
use super::rules::EntityRules;

/// Purge actions for the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub tags: BTreeSet<String>,
    pub patterns: BTreeSet<String>,
    pub keys: BTreeSet<String>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ tags: {}, patterns: {}, keys: {} }}",
            self.tags.len(),
            self.patterns.len(),
            self.keys.len(),
        )
    }
}

impl InvalidationPlan {
    /// Pure resolution of one intent; `now` picks the bucket for time intents
    /// without an explicit instant.
    pub fn resolve(
        intent: &InvalidationIntent,
        rules: &EntityRules,
        now: OffsetDateTime,
    ) -> CacheResult<Self> {
        let mut plan = Self::default();

        match intent {
            InvalidationIntent::InvalidateByTag { tag } => {
                plan.tags.insert(non_blank(tag, "tag")?);
            }
            InvalidationIntent::InvalidateByTags { tags } => {
                if tags.is_empty() {
                    return Err(CacheError::validation("at least one tag is required"));
                }
                for tag in tags {
                    plan.tags.insert(non_blank(tag, "tag")?);
                }
            }
            InvalidationIntent::InvalidateByPattern { pattern } => {
                let pattern = non_blank(pattern, "pattern")?;
                KeyPattern::parse(&pattern)
                    .map_err(|err| CacheError::validation(err.to_string()))?;
                plan.patterns.insert(pattern);
            }
            InvalidationIntent::InvalidateByKeys { keys } => {
                if keys.is_empty() {
                    return Err(CacheError::validation("at least one key is required"));
                }
                for key in keys {
                    plan.keys.insert(non_blank(key, "key")?);
                }
            }
            InvalidationIntent::InvalidateForEntityMutation {
                entity_type,
                id,
                fields,
            } => {
                plan.tags = rules.resolve(entity_type, id, fields)?;
            }
            InvalidationIntent::InvalidateByGeography { area, postcode } => {
                if area.is_none() && postcode.is_none() {
                    return Err(CacheError::validation(
                        "geography invalidation needs an area name or a postcode",
                    ));
                }
                if let Some(area) = area {
                    plan.tags.insert(area_tag(area)?);
                }
                if let Some(postcode) = postcode {
                    plan.tags.insert(postcode_tag(postcode)?);
                }
            }
            InvalidationIntent::InvalidateByAuthority { council } => {
                plan.tags.extend(authority_tags(council)?);
            }
            InvalidationIntent::InvalidateTimeBucket { at } => {
                plan.tags.insert(hourly_tag(at.unwrap_or(now))?);
            }
            InvalidationIntent::InvalidateByUser { user_id } => {
                plan.tags.insert(user_tag(user_id)?);
            }
        }

        Ok(plan)
    }

    /// Merge several plans, deduplicating every action.
    pub fn from_plans<I>(plans: I) -> Self
    where
        I: IntoIterator<Item = InvalidationPlan>,
    {
        plans.into_iter().fold(Self::default(), |mut merged, plan| {
            merged.merge(plan);
            merged
        })
    }

    pub fn merge(&mut self, other: InvalidationPlan) {
        self.tags.extend(other.tags);
        self.patterns.extend(other.patterns);
        self.keys.extend(other.keys);
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.patterns.is_empty() && self.keys.is_empty()
    }
}

fn non_blank(value: &str, what: &str) -> CacheResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CacheError::validation(format!("{what} must not be empty")));
    }
    Ok(value.to_string())
}
