//! Warming from a TOML manifest.
//!
//! ```toml
//! [[entries]]
//! key = "area:NW3"
//! value = '{"name": "Hampstead"}'
//! tags = ["area", "area:NW3"]
//! ```
//!
//! The file is re-read on every run so edits take effect on the next cycle.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use super::error::{CacheError, CacheResult};
use super::warmer::{WarmItem, WarmSource};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Manifest {
    #[serde(default)]
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestEntry {
    key: String,
    value: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ManifestSource {
    path: PathBuf,
}

impl ManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse manifest text into warm items.
    pub fn parse(raw: &str) -> CacheResult<Vec<WarmItem>> {
        let manifest: Manifest =
            toml::from_str(raw).map_err(|err| CacheError::Manifest(err.to_string()))?;

        manifest
            .entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                if entry.key.trim().is_empty() {
                    return Err(CacheError::Manifest(format!(
                        "entry {index} has an empty key"
                    )));
                }
                Ok(WarmItem::new(entry.key, Bytes::from(entry.value), entry.tags))
            })
            .collect()
    }
}

#[async_trait]
impl WarmSource for ManifestSource {
    async fn produce(&self) -> CacheResult<Vec<WarmItem>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            CacheError::Manifest(format!("failed to read `{}`: {err}", self.path.display()))
        })?;
        let items = Self::parse(&raw)?;
        debug!(path = %self.path.display(), entries = items.len(), "Manifest loaded");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_entries_with_optional_tags() {
        let items = ManifestSource::parse(
            r#"
            [[entries]]
            key = "area:NW3"
            value = "hampstead"
            tags = ["area", "area:NW3"]

            [[entries]]
            key = "search:featured"
            value = "[]"
            "#,
        )
        .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].tags, vec!["area", "area:NW3"]);
        assert_eq!(items[1].value, Bytes::from_static(b"[]"));
        assert!(items[1].tags.is_empty());
    }

    #[test]
    fn rejects_blank_keys_and_unknown_fields() {
        let blank = ManifestSource::parse("[[entries]]\nkey = \" \"\nvalue = \"x\"\n");
        assert!(matches!(blank, Err(CacheError::Manifest(_))));

        let unknown = ManifestSource::parse("[[entries]]\nkey = \"k\"\nvalue = \"x\"\nttl = 5\n");
        assert!(matches!(unknown, Err(CacheError::Manifest(_))));
    }

    #[tokio::test]
    async fn produces_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[entries]]\nkey = \"agent:1\"\nvalue = \"a\"\ntags = [\"agent:1\"]").unwrap();

        let source = ManifestSource::new(file.path());
        let items = source.produce().await.unwrap();
        assert_eq!(items[0].key, "agent:1");

        let missing = ManifestSource::new(file.path().with_extension("missing"));
        assert!(matches!(missing.produce().await, Err(CacheError::Manifest(_))));
    }
}
