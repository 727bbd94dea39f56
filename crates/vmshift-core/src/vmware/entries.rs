//! Ordered, case-insensitive key/value table backing the VMware codec.

use std::collections::HashMap;

/// One `key = "value"` line of a `.vmx` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Key with its original spelling.
    pub key: String,
    pub value: String,
    /// Whether the key survives the filtered (privacy-safe) export.
    pub filtered: bool,
}

/// Entries in file order, looked up case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Entries {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Entries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index
            .get(&key.to_ascii_lowercase())
            .map(|&i| self.entries[i].value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(&key.to_ascii_lowercase())
    }

    /// Whether `key` is set to a VMware boolean true (`TRUE`, `yes`, `1`).
    pub fn is_true(&self, key: &str) -> bool {
        self.get(key).is_some_and(is_true_value)
    }

    /// Insert or replace a value. A replaced entry keeps its position and
    /// original key spelling; `filtered` is OR-ed into the existing flag.
    pub fn set(&mut self, key: &str, value: impl Into<String>, filtered: bool) {
        let lower = key.to_ascii_lowercase();
        match self.index.get(&lower) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                entry.value = value.into();
                entry.filtered |= filtered;
            }
            None => {
                self.index.insert(lower, self.entries.len());
                self.entries.push(Entry {
                    key: key.to_string(),
                    value: value.into(),
                    filtered,
                });
            }
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let lower = key.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|e| e.key.to_ascii_lowercase() != lower);
        if self.entries.len() == before {
            return false;
        }
        self.reindex();
        true
    }

    /// Remove every entry whose key matches the predicate.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !predicate(&e.key));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    /// Keys matching the predicate, in file order.
    pub fn keys_where(&self, mut predicate: impl FnMut(&str) -> bool) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| predicate(&e.key))
            .map(|e| e.key.clone())
            .collect()
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.to_ascii_lowercase(), i))
            .collect();
    }
}

pub fn is_true_value(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut entries = Entries::new();
        entries.set("displayName", "Test", false);
        assert_eq!(entries.get("DISPLAYNAME"), Some("Test"));
        assert!(entries.contains("displayname"));
    }

    #[test]
    fn test_replace_keeps_position_and_spelling() {
        let mut entries = Entries::new();
        entries.set("memsize", "1024", false);
        entries.set("numvcpus", "1", false);
        entries.set("MemSize", "2048", true);

        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["memsize", "numvcpus"]);
        assert_eq!(entries.get("memsize"), Some("2048"));
        assert!(entries.iter().next().unwrap().filtered);
    }

    #[test]
    fn test_remove_reindexes() {
        let mut entries = Entries::new();
        entries.set("a", "1", false);
        entries.set("b", "2", false);
        entries.set("c", "3", false);
        assert!(entries.remove("B"));
        assert!(!entries.remove("b"));
        assert_eq!(entries.get("c"), Some("3"));
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_remove_where() {
        let mut entries = Entries::new();
        entries.set("scsi0:0.fileName", "disk.vmdk", false);
        entries.set("scsi0:0.present", "TRUE", false);
        entries.set("floppy0.fileName", "boot.img", false);
        let removed = entries.remove_where(|k| k.to_ascii_lowercase().ends_with(".filename"));
        assert_eq!(removed, 2);
        assert!(entries.is_true("scsi0:0.present"));
    }
}
