//! Process and thread name directories

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use crate::protocol::constants::UNKNOWN_NAME;

/// Concurrent map from an id to a display name
#[derive(Debug)]
pub struct NameDirectory<K> {
    names: RwLock<HashMap<K, Arc<str>>>,
}

impl<K: Eq + Hash + Copy> NameDirectory<K> {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(HashMap::new()),
        }
    }

    /// Record a name, replacing any previous one
    ///
    /// Returns true if a name was already present.
    pub fn set(&self, key: K, name: impl Into<Arc<str>>) -> bool {
        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        names.insert(key, name.into()).is_some()
    }

    pub fn get(&self, key: K) -> Option<Arc<str>> {
        let names = self.names.read().unwrap_or_else(|e| e.into_inner());
        names.get(&key).cloned()
    }

    /// Name for display, "Unknown" if never set
    pub fn name_or_unknown(&self, key: K) -> Arc<str> {
        self.get(key).unwrap_or_else(|| Arc::from(UNKNOWN_NAME))
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Copy> Default for NameDirectory<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process names keyed by unique process id
pub type ProcessDirectory = NameDirectory<u32>;

/// Thread names keyed by (unique process id, unique thread id)
pub type ThreadDirectory = NameDirectory<(u32, u32)>;

/// Both directories, shared by all workers
#[derive(Debug, Default)]
pub struct Directories {
    pub processes: ProcessDirectory,
    pub threads: ThreadDirectory,
}

impl Directories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_name(&self, unique_process_id: u32) -> Arc<str> {
        self.processes.name_or_unknown(unique_process_id)
    }

    pub fn thread_name(&self, unique_process_id: u32, unique_thread_id: u32) -> Arc<str> {
        self.threads
            .name_or_unknown((unique_process_id, unique_thread_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_default() {
        let dirs = Directories::new();
        assert_eq!(&*dirs.process_name(3), "Unknown");
        assert_eq!(&*dirs.thread_name(3, 1), "Unknown");
    }

    #[test]
    fn test_set_replaces() {
        let dirs = Directories::new();
        assert!(!dirs.processes.set(7, "Test"));
        assert!(dirs.processes.set(7, "Renamed"));
        assert_eq!(&*dirs.process_name(7), "Renamed");
        assert_eq!(dirs.processes.len(), 1);
    }

    #[test]
    fn test_threads_are_scoped_by_process() {
        let dirs = Directories::new();
        dirs.threads.set((1, 5), "worker");
        assert_eq!(&*dirs.thread_name(1, 5), "worker");
        assert_eq!(&*dirs.thread_name(2, 5), "Unknown");
    }
}
