//! Machine type strings such as `pc-q35-6.2`.
//!
//! QEMU encodes its version inside the machine type. [`split`] and [`join`]
//! are the only places that know the layout.

use crate::model::Version;
use once_cell::sync::Lazy;
use regex::Regex;

static MACHINE_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+)-(\d+)\.(\d+)$").expect("Invalid regex: MACHINE_TYPE"));

/// Split `pc-i440fx-2.11` into `("pc-i440fx", 2.11)`.
pub fn split(machine: &str) -> Option<(&str, Version)> {
    let caps = MACHINE_TYPE.captures(machine.trim())?;
    let name = caps.get(1)?.as_str();
    let major = caps[2].parse().ok()?;
    let minor = caps[3].parse().ok()?;
    Some((name, Version::new(major, minor)))
}

pub fn join(name: &str, version: Version) -> String {
    format!("{}-{}.{}", name, version.major, version.minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split() {
        assert_eq!(split("pc-q35-6.2"), Some(("pc-q35", Version::new(6, 2))));
        assert_eq!(split("pc-i440fx-2.11"), Some(("pc-i440fx", Version::new(2, 11))));
        assert_eq!(split("q35"), None);
        assert_eq!(split("pc-q35-rhel8.6"), None);
    }

    #[test]
    fn test_join_inverts_split() {
        let (name, version) = split("pc-q35-8.2").unwrap();
        assert_eq!(join(name, version), "pc-q35-8.2");
    }
}
