//! Tag index.
//!
//! Tracks tag -> keys and key -> tags so that bulk invalidation can find every
//! entry sharing a tag, and so that deleting a key leaves no dangling tag
//! references behind.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::registry";

/// Index record for one live key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyRecord {
    tags: BTreeSet<String>,
    generation: u64,
}

#[derive(Debug, Default)]
struct IndexState {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_record: HashMap<String, KeyRecord>,
}

impl IndexState {
    fn detach(&mut self, key: &str, tags: &BTreeSet<String>) {
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(tag);
                }
            }
        }
    }
}

/// Bidirectional tag <-> key index.
///
/// The index also doubles as the store's key universe: every live key has a
/// record here, tagged or not. Each association is stamped with a monotonically
/// increasing generation.
pub struct TagIndex {
    state: RwLock<IndexState>,
    next_generation: AtomicU64,
}

impl TagIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Replace the key's tag membership with `tags`.
    ///
    /// Returns the generation stamped on the new association.
    pub fn associate<I, S>(&self, key: &str, tags: I) -> u64
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let mut state = rw_write(&self.state, SOURCE, "associate");
        if let Some(previous) = state.key_to_record.remove(key) {
            let dropped: BTreeSet<String> = previous.tags.difference(&tags).cloned().collect();
            state.detach(key, &dropped);
        }
        for tag in &tags {
            state
                .tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        state
            .key_to_record
            .insert(key.to_string(), KeyRecord { tags, generation });

        generation
    }

    /// Get all keys currently carrying `tag`.
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        rw_read(&self.state, SOURCE, "keys_for_tag")
            .tag_to_keys
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    /// Consistent view of a tag's keys with their generations at this instant.
    pub fn snapshot_tag(&self, tag: &str) -> Vec<(String, u64)> {
        let state = rw_read(&self.state, SOURCE, "snapshot_tag");
        let Some(keys) = state.tag_to_keys.get(tag) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| {
                state
                    .key_to_record
                    .get(key)
                    .map(|record| (key.clone(), record.generation))
            })
            .collect()
    }

    /// Get the tags tracked for `key`.
    pub fn tags_for_key(&self, key: &str) -> BTreeSet<String> {
        rw_read(&self.state, SOURCE, "tags_for_key")
            .key_to_record
            .get(key)
            .map(|record| record.tags.clone())
            .unwrap_or_default()
    }

    pub fn generation(&self, key: &str) -> Option<u64> {
        rw_read(&self.state, SOURCE, "generation")
            .key_to_record
            .get(key)
            .map(|record| record.generation)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        rw_read(&self.state, SOURCE, "contains_key")
            .key_to_record
            .contains_key(key)
    }

    /// Remove a key from every tag that references it.
    pub fn remove_key(&self, key: &str) -> bool {
        let mut state = rw_write(&self.state, SOURCE, "remove_key");
        match state.key_to_record.remove(key) {
            Some(record) => {
                state.detach(key, &record.tags);
                true
            }
            None => false,
        }
    }

    /// Remove a key only if no newer association replaced `generation`.
    pub fn remove_key_if(&self, key: &str, generation: u64) -> bool {
        let mut state = rw_write(&self.state, SOURCE, "remove_key_if");
        let current = state.key_to_record.get(key).map(|record| record.generation);
        if current != Some(generation) {
            return false;
        }
        if let Some(record) = state.key_to_record.remove(key) {
            state.detach(key, &record.tags);
        }
        true
    }

    /// Every key in the index with its current generation.
    pub fn snapshot_keys(&self) -> Vec<(String, u64)> {
        rw_read(&self.state, SOURCE, "snapshot_keys")
            .key_to_record
            .iter()
            .map(|(key, record)| (key.clone(), record.generation))
            .collect()
    }

    /// Every key in the index.
    pub fn all_keys(&self) -> Vec<String> {
        rw_read(&self.state, SOURCE, "all_keys")
            .key_to_record
            .keys()
            .cloned()
            .collect()
    }

    /// Clear all mappings.
    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.tag_to_keys.clear();
        state.key_to_record.clear();
    }

    /// Get the number of tracked tags.
    pub fn tag_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "tag_count").tag_to_keys.len()
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "key_count")
            .key_to_record
            .len()
    }
}

impl Default for TagIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn associate_and_lookup() {
        let index = TagIndex::new();

        index.associate("property:42", ["property:42", "area:NW3", "search"]);

        assert!(index.keys_for_tag("area:NW3").contains("property:42"));
        assert!(index.keys_for_tag("search").contains("property:42"));
        assert_eq!(index.tags_for_key("property:42").len(), 3);
    }

    #[test]
    fn reassociate_drops_previous_tags() {
        let index = TagIndex::new();

        index.associate("property:42", ["area:NW3", "search"]);
        index.associate("property:42", ["area:NW6", "search"]);

        assert!(index.keys_for_tag("area:NW3").is_empty());
        assert!(index.keys_for_tag("area:NW6").contains("property:42"));
        assert!(index.keys_for_tag("search").contains("property:42"));
        // the emptied tag is gone entirely
        assert_eq!(index.tag_count(), 2);
    }

    #[test]
    fn remove_key_cleans_up_mappings() {
        let index = TagIndex::new();

        index.associate("a", ["t1", "t2"]);
        index.associate("b", ["t2"]);
        assert_eq!(index.key_count(), 2);

        assert!(index.remove_key("a"));
        assert!(!index.remove_key("a"));

        assert!(index.keys_for_tag("t1").is_empty());
        assert_eq!(
            index.keys_for_tag("t2"),
            HashSet::from(["b".to_string()])
        );
        assert_eq!(index.tag_count(), 1);
    }

    #[test]
    fn untagged_keys_are_still_tracked() {
        let index = TagIndex::new();
        index.associate("plain", Vec::<String>::new());

        assert!(index.contains_key("plain"));
        assert_eq!(index.all_keys(), vec!["plain".to_string()]);
        assert_eq!(index.tag_count(), 0);
    }

    #[test]
    fn generations_increase_and_guard_removal() {
        let index = TagIndex::new();

        let first = index.associate("k", ["t"]);
        let second = index.associate("k", ["t"]);
        assert!(second > first);

        assert!(!index.remove_key_if("k", first));
        assert!(index.contains_key("k"));
        assert!(index.remove_key_if("k", second));
        assert!(!index.contains_key("k"));
    }

    #[test]
    fn snapshot_is_not_affected_by_later_writes() {
        let index = TagIndex::new();
        index.associate("a", ["search"]);

        let snapshot = index.snapshot_tag("search");
        index.associate("b", ["search"]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "a");
        assert_eq!(index.keys_for_tag("search").len(), 2);
    }

    #[test]
    fn clear_removes_all_mappings() {
        let index = TagIndex::new();
        index.associate("a", ["t"]);

        index.clear();
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.tag_count(), 0);
    }

    #[test]
    fn index_recovers_from_poisoned_lock() {
        let index = TagIndex::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = index.state.write().expect("state lock should be acquired");
            panic!("poison index lock");
        }));

        index.associate("a", ["t"]);
        assert!(index.keys_for_tag("t").contains("a"));
    }
}
