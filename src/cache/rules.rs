//! Entity invalidation rules.
//!
//! A declarative table from entity type to the tag templates a mutation of that
//! entity always invalidates. Supporting a new entity type means adding a row,
//! either here or under `[cache.entity_rules]`.
//!
//! A placeholder may carry the `slug` filter (`{council|slug}`), which
//! normalizes the value the way the authority tag helpers do.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::error::{CacheError, CacheResult};
use super::intents::slugify;

const BUILTIN_RULES: &[(&str, &[&str])] = &[
    ("property", &["property:{id}", "area:{area_id}", "search"]),
    ("area", &["area:{id}", "search"]),
    (
        "planning_application",
        &["planning-application:{id}", "planning:{council|slug}"],
    ),
    ("agent", &["agent:{id}", "search"]),
    ("user", &["user:{id}"]),
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { name: String, slug: bool },
}

/// A tag with `{field}` placeholders, e.g. `area:{area_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl TagTemplate {
    pub fn parse(raw: &str) -> CacheResult<Self> {
        let invalid = |reason: &str| CacheError::validation(format!("tag template `{raw}`: {reason}"));

        let mut segments = Vec::new();
        let mut rest = raw.trim();
        if rest.is_empty() {
            return Err(invalid("must not be empty"));
        }

        while let Some(open) = rest.find('{') {
            if rest[..open].contains('}') {
                return Err(invalid("unmatched `}`"));
            }
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| invalid("unclosed `{`"))?;
            let (field, filter) = match after[..close].split_once('|') {
                Some((field, filter)) => (field.trim(), Some(filter.trim())),
                None => (after[..close].trim(), None),
            };
            if field.is_empty() || field.contains('{') {
                return Err(invalid("placeholder needs a field name"));
            }
            let slug = match filter {
                None => false,
                Some("slug") => true,
                Some(other) => return Err(invalid(&format!("unknown filter `{other}`"))),
            };
            segments.push(Segment::Field {
                name: field.to_string(),
                slug,
            });
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(invalid("unmatched `}`"));
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Fill placeholders; a placeholder with no value is a validation error.
    pub fn render<F>(&self, mut lookup: F) -> CacheResult<String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut tag = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => tag.push_str(text),
                Segment::Field { name, slug } => {
                    let value = lookup(name)
                        .map(|value| if *slug { slugify(&value) } else { value.trim().to_string() })
                        .filter(|value| !value.is_empty())
                        .ok_or_else(|| {
                            CacheError::validation(format!(
                                "field `{name}` is required by tag template `{}`",
                                self.raw
                            ))
                        })?;
                    tag.push_str(&value);
                }
            }
        }
        Ok(tag)
    }
}

/// Entity type -> tag templates.
#[derive(Debug, Clone)]
pub struct EntityRules {
    rows: BTreeMap<String, Vec<TagTemplate>>,
}

impl EntityRules {
    pub fn builtin() -> Self {
        let rows = BUILTIN_RULES
            .iter()
            .map(|(entity, templates)| {
                let templates = templates
                    .iter()
                    .filter_map(|raw| TagTemplate::parse(raw).ok())
                    .collect();
                (entity.to_string(), templates)
            })
            .collect();
        Self { rows }
    }

    /// Built-in table with configured rows replacing rows of the same entity type.
    pub fn with_overrides(overrides: &BTreeMap<String, Vec<String>>) -> CacheResult<Self> {
        let mut rules = Self::builtin();
        for (entity, templates) in overrides {
            let templates = templates
                .iter()
                .map(|raw| TagTemplate::parse(raw))
                .collect::<CacheResult<Vec<_>>>()?;
            if templates.is_empty() {
                return Err(CacheError::validation(format!(
                    "entity rule `{entity}` has no tag templates"
                )));
            }
            rules.rows.insert(normalize_entity(entity), templates);
        }
        Ok(rules)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    pub fn templates(&self, entity_type: &str) -> Option<&[TagTemplate]> {
        self.rows.get(&normalize_entity(entity_type)).map(Vec::as_slice)
    }

    /// Tags invalidated by a mutation of `entity_type` `id`.
    ///
    /// `{id}` resolves to the entity id; every other placeholder reads the
    /// changed field of the same name.
    pub fn resolve(
        &self,
        entity_type: &str,
        id: &str,
        fields: &BTreeMap<String, Value>,
    ) -> CacheResult<BTreeSet<String>> {
        let templates = self.templates(entity_type).ok_or_else(|| {
            CacheError::validation(format!("no invalidation rule for entity type `{entity_type}`"))
        })?;
        if id.trim().is_empty() {
            return Err(CacheError::validation("entity id is required"));
        }

        templates
            .iter()
            .map(|template| {
                template.render(|name| match name {
                    "id" => Some(id.to_string()),
                    other => fields.get(other).and_then(scalar_text),
                })
            })
            .collect()
    }
}

impl Default for EntityRules {
    fn default() -> Self {
        Self::builtin()
    }
}

fn normalize_entity(entity_type: &str) -> String {
    entity_type.trim().to_ascii_lowercase().replace('-', "_")
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
