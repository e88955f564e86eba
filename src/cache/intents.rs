//! Invalidation intents.
//!
//! The closed set of requests callers may make of the dispatcher, plus the tag
//! naming helpers those requests resolve through. Callers never build tag names
//! themselves.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use super::error::{CacheError, CacheResult};

const HOURLY_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]");

/// One invalidation request.
///
/// The JSON form is tagged by `"intent"`:
/// `{"intent": "invalidate-by-geography", "area": "NW3"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "kebab-case")]
pub enum InvalidationIntent {
    InvalidateByTag {
        tag: String,
    },
    InvalidateByTags {
        tags: Vec<String>,
    },
    InvalidateByPattern {
        pattern: String,
    },
    InvalidateByKeys {
        keys: Vec<String>,
    },
    /// Resolved through the entity rule table.
    InvalidateForEntityMutation {
        entity_type: String,
        #[serde(deserialize_with = "string_or_number")]
        id: String,
        /// Changed fields; template placeholders other than `id` read from here.
        #[serde(default)]
        fields: BTreeMap<String, serde_json::Value>,
    },
    /// At least one of `area` and `postcode` is required.
    InvalidateByGeography {
        #[serde(default)]
        area: Option<String>,
        #[serde(default)]
        postcode: Option<String>,
    },
    InvalidateByAuthority {
        council: String,
    },
    /// The hourly bucket containing `at`, or the current hour.
    InvalidateTimeBucket {
        #[serde(default, with = "time::serde::rfc3339::option")]
        at: Option<OffsetDateTime>,
    },
    InvalidateByUser {
        #[serde(deserialize_with = "string_or_number")]
        user_id: String,
    },
}

impl InvalidationIntent {
    /// Parse the JSON wire form; unknown intents and malformed bodies are
    /// validation errors.
    pub fn from_json(raw: &str) -> CacheResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| CacheError::validation(format!("invalid intent: {err}")))
    }

    pub fn from_value(value: serde_json::Value) -> CacheResult<Self> {
        serde_json::from_value(value)
            .map_err(|err| CacheError::validation(format!("invalid intent: {err}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidateByTag { .. } => "invalidate-by-tag",
            Self::InvalidateByTags { .. } => "invalidate-by-tags",
            Self::InvalidateByPattern { .. } => "invalidate-by-pattern",
            Self::InvalidateByKeys { .. } => "invalidate-by-keys",
            Self::InvalidateForEntityMutation { .. } => "invalidate-for-entity-mutation",
            Self::InvalidateByGeography { .. } => "invalidate-by-geography",
            Self::InvalidateByAuthority { .. } => "invalidate-by-authority",
            Self::InvalidateTimeBucket { .. } => "invalidate-time-bucket",
            Self::InvalidateByUser { .. } => "invalidate-by-user",
        }
    }

    pub fn geography_area(area: impl Into<String>) -> Self {
        Self::InvalidateByGeography {
            area: Some(area.into()),
            postcode: None,
        }
    }

    pub fn entity_mutation(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::InvalidateForEntityMutation {
            entity_type: entity_type.into(),
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a changed field to an entity mutation; other intents are unchanged.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let Self::InvalidateForEntityMutation { fields, .. } = &mut self {
            fields.insert(name.into(), value.into());
        }
        self
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

fn required<'a>(value: &'a str, what: &str) -> CacheResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CacheError::validation(format!("{what} is required")));
    }
    Ok(value)
}

/// `area:{name}`.
pub fn area_tag(name: &str) -> CacheResult<String> {
    Ok(format!("area:{}", required(name, "area name")?))
}

/// `postcode:{CODE}`, uppercased with spaces removed so `nw3 6ab` and `NW36AB` agree.
pub fn postcode_tag(postcode: &str) -> CacheResult<String> {
    let normalized: String = required(postcode, "postcode")?
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    Ok(format!("postcode:{normalized}"))
}

/// Planning and council tags for a local authority.
pub fn authority_tags(council: &str) -> CacheResult<[String; 2]> {
    let slug = slugify(required(council, "council name")?);
    if slug.is_empty() {
        return Err(CacheError::validation(format!(
            "council name `{council}` has no usable characters"
        )));
    }
    Ok([format!("planning:{slug}"), format!("council:{slug}")])
}

/// `hourly:{YYYY-MM-DDTHH}` for the UTC hour containing `at`.
pub fn hourly_tag(at: OffsetDateTime) -> CacheResult<String> {
    let bucket = at
        .to_offset(UtcOffset::UTC)
        .format(HOURLY_FORMAT)
        .map_err(|err| CacheError::validation(format!("unformattable time bucket: {err}")))?;
    Ok(format!("hourly:{bucket}"))
}

pub fn user_tag(user_id: &str) -> CacheResult<String> {
    Ok(format!("user:{}", required(user_id, "user id")?))
}

pub(crate) fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
