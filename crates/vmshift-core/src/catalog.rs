//! Operating system catalogs.
//!
//! Two collaborator data sets are consumed here: the canonical OS catalog,
//! whose records map each virtualizer's native OS identifier to one canonical
//! entry, and the OS fingerprint database (libosinfo style), used by the
//! libvirt codec when a domain only carries a fingerprint identifier.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A canonical operating system record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingSystem {
    pub id: u32,
    pub name: String,
    /// CPU architecture, e.g. `x86_64` or `i686`.
    pub architecture: String,
    /// Native OS identifier per virtualizer id (`vmware` -> `ubuntu-64`).
    #[serde(default)]
    pub virtualizer_os_ids: HashMap<String, String>,
    #[serde(default)]
    pub max_mem_mb: Option<u32>,
    #[serde(default)]
    pub max_cores: Option<u32>,
}

impl OperatingSystem {
    /// Native identifier of this OS for the given virtualizer.
    pub fn native_id(&self, virtualizer_id: &str) -> Option<&str> {
        self.virtualizer_os_ids.get(virtualizer_id).map(String::as_str)
    }

    pub fn is_64bit(&self) -> bool {
        is_64bit_arch(&self.architecture)
    }
}

/// Whether an architecture string names a 64-bit CPU.
pub fn is_64bit_arch(arch: &str) -> bool {
    matches!(
        arch.to_ascii_lowercase().as_str(),
        "x86_64" | "amd64" | "x64" | "aarch64" | "arm64" | "ppc64" | "ppc64le" | "s390x" | "riscv64"
    )
}

/// The canonical operating system catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OsCatalog {
    systems: Vec<OperatingSystem>,
}

impl OsCatalog {
    pub fn new(systems: Vec<OperatingSystem>) -> Self {
        Self { systems }
    }

    /// Parse a catalog from a JSON array of records.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::catalog(format!("invalid OS catalog: {}", e)))
    }

    /// Load a catalog from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        Self::from_json(&content)
    }

    pub fn systems(&self) -> &[OperatingSystem] {
        &self.systems
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Find the entry whose native id for `virtualizer_id` equals `native_id`
    /// (case-insensitive).
    pub fn find_by_native_id(&self, virtualizer_id: &str, native_id: &str) -> Option<&OperatingSystem> {
        self.systems.iter().find(|os| {
            os.native_id(virtualizer_id)
                .is_some_and(|id| id.eq_ignore_ascii_case(native_id))
        })
    }

    /// The entry with the smallest edit distance to `name` among entries of
    /// matching bitness.
    pub fn closest_by_name(&self, name: &str, is_64bit: bool) -> Option<&OperatingSystem> {
        let wanted = name.to_lowercase();
        self.systems
            .iter()
            .filter(|os| os.is_64bit() == is_64bit)
            .min_by_key(|os| levenshtein(&wanted, &os.name.to_lowercase()))
    }
}

/// A record of the OS fingerprint database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    /// Fingerprint identifier, e.g. `http://ubuntu.com/ubuntu/20.04`.
    pub id: String,
    /// Display name, e.g. `Ubuntu 20.04 LTS`.
    pub name: String,
}

/// OS fingerprint database keyed by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OsInfoDatabase {
    entries: Vec<OsInfo>,
}

impl OsInfoDatabase {
    pub fn new(entries: Vec<OsInfo>) -> Self {
        Self { entries }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::catalog(format!("invalid OS info database: {}", e)))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
        Self::from_json(&content)
    }

    pub fn lookup(&self, id: &str) -> Option<&OsInfo> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// Collaborator data handed to every codec at parse time.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    pub catalog: OsCatalog,
    pub osinfo: OsInfoDatabase,
}

impl ParseContext {
    pub fn new(catalog: OsCatalog, osinfo: OsInfoDatabase) -> Self {
        Self { catalog, osinfo }
    }
}

/// Levenshtein edit distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = if ca == *cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(id: u32, name: &str, arch: &str, vmware: &str) -> OperatingSystem {
        OperatingSystem {
            id,
            name: name.to_string(),
            architecture: arch.to_string(),
            virtualizer_os_ids: HashMap::from([("vmware".to_string(), vmware.to_string())]),
            max_mem_mb: None,
            max_cores: None,
        }
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("ubuntu", "ubuntu"), 0);
    }

    #[test]
    fn test_find_by_native_id_is_case_insensitive() {
        let catalog = OsCatalog::new(vec![os(1, "Ubuntu (64 Bit)", "x86_64", "ubuntu-64")]);
        assert_eq!(catalog.find_by_native_id("vmware", "UBUNTU-64").map(|o| o.id), Some(1));
        assert!(catalog.find_by_native_id("virtualbox", "ubuntu-64").is_none());
    }

    #[test]
    fn test_closest_by_name_respects_bitness() {
        let catalog = OsCatalog::new(vec![
            os(1, "Ubuntu 20.04", "i686", "ubuntu"),
            os(2, "Ubuntu 20.04 (64 Bit)", "x86_64", "ubuntu-64"),
            os(3, "Windows 10 (64 Bit)", "x86_64", "windows9-64"),
        ]);
        assert_eq!(catalog.closest_by_name("Ubuntu 20.04 LTS", true).map(|o| o.id), Some(2));
        assert_eq!(catalog.closest_by_name("Ubuntu 20.04 LTS", false).map(|o| o.id), Some(1));
    }

    #[test]
    fn test_catalog_from_json() {
        let json = r#"[
            {"id": 7, "name": "Debian 12", "architecture": "x86_64",
             "virtualizer_os_ids": {"virtualbox": "Debian_64"}}
        ]"#;
        let catalog = OsCatalog::from_json(json).unwrap();
        assert_eq!(catalog.systems().len(), 1);
        assert_eq!(catalog.systems()[0].native_id("virtualbox"), Some("Debian_64"));
        assert!(catalog.systems()[0].is_64bit());
    }

    #[test]
    fn test_catalog_from_bad_json() {
        assert!(matches!(OsCatalog::from_json("{"), Err(Error::Catalog { .. })));
    }
}
