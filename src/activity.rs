//! Last-activity index used to pick eviction victims.
//!
//! Entries are ordered by timestamp; entries without a known timestamp sort
//! before every timestamped one.  Entries sharing a timestamp leave in
//! insertion order.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct ActivityCache {
    initialized: bool,
    entries: BTreeMap<Option<i64>, VecDeque<PathBuf>>,
}

impl ActivityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the cache ready for use, dropping anything left from before.
    pub fn initialize(&mut self) {
        self.entries.clear();
        self.initialized = true;
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Forget everything and return to the uninitialized state.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.initialized = false;
    }

    pub fn add_existing_user(&mut self, path: PathBuf, timestamp: i64) {
        self.insert(path, Some(timestamp));
    }

    /// Add a user whose last activity is unknown; treated as the oldest.
    pub fn add_existing_user_notime(&mut self, path: PathBuf) {
        self.insert(path, None);
    }

    /// Move `path` to `timestamp`, inserting it if absent.
    pub fn update_existing_user(&mut self, path: PathBuf, timestamp: i64) {
        self.remove_user(&path);
        self.insert(path, Some(timestamp));
    }

    /// Remove and return the entry with the smallest timestamp.
    pub fn remove_oldest_user(&mut self) -> Option<PathBuf> {
        self.assert_initialized();
        let mut first = self.entries.first_entry()?;
        let path = first.get_mut().pop_front();
        if first.get().is_empty() {
            first.remove();
        }
        path
    }

    /// Remove `path` wherever it sits. Returns whether it was present.
    pub fn remove_user(&mut self, path: &Path) -> bool {
        self.assert_initialized();
        let mut found = None;
        for (timestamp, paths) in self.entries.iter_mut() {
            if let Some(pos) = paths.iter().position(|p| p == path) {
                paths.remove(pos);
                found = Some(*timestamp);
                break;
            }
        }
        match found {
            Some(timestamp) => {
                if self.entries.get(&timestamp).is_some_and(VecDeque::is_empty) {
                    self.entries.remove(&timestamp);
                }
                true
            }
            None => false,
        }
    }

    /// Smallest timestamp currently present, ignoring entries without one.
    pub fn oldest_known_timestamp(&self) -> Option<i64> {
        self.entries.keys().find_map(|k| *k)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(VecDeque::len).sum()
    }

    fn insert(&mut self, path: PathBuf, timestamp: Option<i64>) {
        self.assert_initialized();
        self.entries.entry(timestamp).or_default().push_back(path);
    }

    fn assert_initialized(&self) {
        assert!(self.initialized, "ActivityCache used before initialize()");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ActivityCache {
        let mut c = ActivityCache::new();
        c.initialize();
        c
    }

    #[test]
    fn notime_entries_leave_first() {
        let mut c = cache();
        c.add_existing_user(PathBuf::from("/c"), 300);
        c.add_existing_user_notime(PathBuf::from("/a"));
        c.add_existing_user(PathBuf::from("/b"), 200);

        assert_eq!(c.oldest_known_timestamp(), Some(200));
        assert_eq!(c.remove_oldest_user(), Some(PathBuf::from("/a")));
        assert_eq!(c.remove_oldest_user(), Some(PathBuf::from("/b")));
        assert_eq!(c.oldest_known_timestamp(), Some(300));
        assert_eq!(c.remove_oldest_user(), Some(PathBuf::from("/c")));
        assert_eq!(c.remove_oldest_user(), None);
        assert_eq!(c.oldest_known_timestamp(), None);
    }

    #[test]
    fn only_notime_entries_have_no_known_oldest() {
        let mut c = cache();
        c.add_existing_user_notime(PathBuf::from("/a"));
        assert!(!c.is_empty());
        assert_eq!(c.oldest_known_timestamp(), None);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut c = cache();
        c.add_existing_user(PathBuf::from("/x"), 5);
        c.add_existing_user(PathBuf::from("/y"), 5);
        assert_eq!(c.remove_oldest_user(), Some(PathBuf::from("/x")));
        assert_eq!(c.remove_oldest_user(), Some(PathBuf::from("/y")));
    }

    #[test]
    fn updating_the_minimum_recomputes_oldest() {
        let mut c = cache();
        c.add_existing_user(PathBuf::from("/a"), 10);
        c.add_existing_user(PathBuf::from("/b"), 20);
        c.update_existing_user(PathBuf::from("/a"), 30);

        assert_eq!(c.len(), 2);
        assert_eq!(c.oldest_known_timestamp(), Some(20));
        assert_eq!(c.remove_oldest_user(), Some(PathBuf::from("/b")));
    }

    #[test]
    fn remove_user_drops_empty_buckets() {
        let mut c = cache();
        c.add_existing_user(PathBuf::from("/a"), 10);
        assert!(c.remove_user(Path::new("/a")));
        assert!(!c.remove_user(Path::new("/a")));
        assert!(c.is_empty());
    }

    #[test]
    #[should_panic(expected = "before initialize")]
    fn mutation_before_initialize_panics() {
        ActivityCache::new().add_existing_user(PathBuf::from("/a"), 1);
    }
}
