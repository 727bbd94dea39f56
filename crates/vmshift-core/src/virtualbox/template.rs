//! Placeholder tokens used by VirtualBox templates.
//!
//! Disk tokens carry the position of the disk in the media registry, so a
//! template with several disks keeps one location and one UUID per disk:
//! `%VM_DISK_PATH_0%`, `%VM_DISK_UUID_1%`, ...

use crate::xml::{Element, Node};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use uuid::Uuid;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"%VM_(MACHINE_UUID|MEMORY|CPU_CORES|NIC_MAC|DISK_PATH_(\d+)|DISK_UUID_(\d+))%")
        .expect("Invalid regex: TOKEN")
});

/// Host- or instance-specific values replaced by a token in a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placeholder {
    MachineUuid,
    /// Location of the n-th registered hard disk.
    DiskPath(usize),
    /// UUID of the n-th registered hard disk.
    DiskUuid(usize),
    Memory,
    CpuCores,
    NicMac,
}

impl Placeholder {
    /// Placeholders that occur once per template.
    pub const MACHINE_WIDE: [Placeholder; 4] = [
        Placeholder::MachineUuid,
        Placeholder::Memory,
        Placeholder::CpuCores,
        Placeholder::NicMac,
    ];

    pub fn token(&self) -> String {
        match self {
            Placeholder::MachineUuid => "%VM_MACHINE_UUID%".to_string(),
            Placeholder::DiskPath(index) => format!("%VM_DISK_PATH_{}%", index),
            Placeholder::DiskUuid(index) => format!("%VM_DISK_UUID_{}%", index),
            Placeholder::Memory => "%VM_MEMORY%".to_string(),
            Placeholder::CpuCores => "%VM_CPU_CORES%".to_string(),
            Placeholder::NicMac => "%VM_NIC_MAC%".to_string(),
        }
    }

    /// Every placeholder mentioned in `text`, in order of appearance.
    pub fn scan(text: &str) -> impl Iterator<Item = Placeholder> + '_ {
        TOKEN.captures_iter(text).filter_map(|caps| {
            let index = |group: usize| -> Option<usize> { caps.get(group)?.as_str().parse().ok() };
            match caps.get(1)?.as_str() {
                "MACHINE_UUID" => Some(Placeholder::MachineUuid),
                "MEMORY" => Some(Placeholder::Memory),
                "CPU_CORES" => Some(Placeholder::CpuCores),
                "NIC_MAC" => Some(Placeholder::NicMac),
                name if name.starts_with("DISK_PATH_") => index(2).map(Placeholder::DiskPath),
                _ => index(3).map(Placeholder::DiskUuid),
            }
        })
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Location and UUID for one hard disk of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskValues {
    pub path: String,
    pub uuid: Uuid,
}

impl DiskValues {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uuid: Uuid::new_v4(),
        }
    }
}

/// Values for instantiating a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceValues {
    pub machine_uuid: Uuid,
    /// One entry per registered disk, in registry order.
    pub disks: Vec<DiskValues>,
    pub memory_mb: u32,
    pub cpu_cores: u32,
    /// Twelve hex digits, no separators.
    pub nic_mac: String,
}

impl InstanceValues {
    /// Fresh UUIDs for the machine and every disk, and a random MAC in the
    /// VirtualBox OUI (`08:00:27`).
    pub fn generate<I, S>(disk_paths: I, memory_mb: u32, cpu_cores: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let random = Uuid::new_v4();
        let tail = &random.as_bytes()[..3];
        Self {
            machine_uuid: Uuid::new_v4(),
            disks: disk_paths.into_iter().map(DiskValues::new).collect(),
            memory_mb,
            cpu_cores,
            nic_mac: format!("080027{:02X}{:02X}{:02X}", tail[0], tail[1], tail[2]),
        }
    }

    /// Value written in place of `placeholder`, `None` for a disk this
    /// instance has no values for.
    pub fn value_for(&self, placeholder: Placeholder) -> Option<String> {
        match placeholder {
            Placeholder::MachineUuid => Some(braced(&self.machine_uuid)),
            Placeholder::DiskPath(index) => self.disks.get(index).map(|d| d.path.clone()),
            Placeholder::DiskUuid(index) => self.disks.get(index).map(|d| braced(&d.uuid)),
            Placeholder::Memory => Some(self.memory_mb.to_string()),
            Placeholder::CpuCores => Some(self.cpu_cores.to_string()),
            Placeholder::NicMac => Some(self.nic_mac.clone()),
        }
    }
}

/// VirtualBox writes UUIDs wrapped in braces.
pub fn braced(uuid: &Uuid) -> String {
    format!("{{{}}}", uuid.hyphenated())
}

/// Tokens still present in attributes or text below `element`.
pub(crate) fn find_tokens(element: &Element, found: &mut Vec<Placeholder>) {
    for (_, value) in &element.attributes {
        note_tokens(value, found);
    }
    for child in &element.children {
        match child {
            Node::Text(t) | Node::CData(t) => note_tokens(t, found),
            Node::Element(e) => find_tokens(e, found),
            Node::Comment(_) => {}
        }
    }
}

fn note_tokens(text: &str, found: &mut Vec<Placeholder>) {
    for placeholder in Placeholder::scan(text) {
        if !found.contains(&placeholder) {
            found.push(placeholder);
        }
    }
}

/// Replace `token` with `value` everywhere below `element`. Returns the
/// number of attributes and text nodes changed.
pub(crate) fn replace_token(element: &mut Element, token: &str, value: &str) -> usize {
    let mut changed = 0;
    for (_, attr) in &mut element.attributes {
        if attr.contains(token) {
            *attr = attr.replace(token, value);
            changed += 1;
        }
    }
    for child in &mut element.children {
        match child {
            Node::Text(t) | Node::CData(t) if t.contains(token) => {
                *t = t.replace(token, value);
                changed += 1;
            }
            Node::Element(e) => changed += replace_token(e, token, value),
            _ => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_values() {
        let values = InstanceValues::generate(["/vms/a.vdi", "/vms/b.vdi"], 2048, 2);
        assert!(values.nic_mac.starts_with("080027"));
        assert_eq!(values.nic_mac.len(), 12);
        assert_eq!(values.disks.len(), 2);
        assert_ne!(values.disks[0].uuid, values.disks[1].uuid);
        assert_ne!(values.machine_uuid, values.disks[0].uuid);
        assert_eq!(
            values.value_for(Placeholder::DiskPath(1)).as_deref(),
            Some("/vms/b.vdi")
        );
        assert_eq!(values.value_for(Placeholder::DiskUuid(2)), None);
    }

    #[test]
    fn test_braced_uuid() {
        let uuid = Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap();
        assert_eq!(braced(&uuid), "{11111111-2222-3333-4444-555555555555}");
    }

    #[test]
    fn test_scan_tokens() {
        let found: Vec<_> =
            Placeholder::scan("%VM_DISK_UUID_12%/%VM_MEMORY%-%VM_DISK_PATH_0%%VM_BOGUS%").collect();
        assert_eq!(
            found,
            vec![Placeholder::DiskUuid(12), Placeholder::Memory, Placeholder::DiskPath(0)]
        );
        for placeholder in [Placeholder::DiskPath(3), Placeholder::NicMac] {
            let scanned: Vec<_> = Placeholder::scan(&placeholder.token()).collect();
            assert_eq!(scanned, vec![placeholder]);
        }
    }

    #[test]
    fn test_find_and_replace_tokens() {
        let mut root = Element::new("Machine").with_attr("uuid", Placeholder::MachineUuid.token());
        root.append(Element::new("Memory").with_attr("RAMSize", Placeholder::Memory.token()));

        let mut found = Vec::new();
        find_tokens(&root, &mut found);
        assert_eq!(found, vec![Placeholder::MachineUuid, Placeholder::Memory]);

        assert_eq!(replace_token(&mut root, &Placeholder::Memory.token(), "512"), 1);
        assert_eq!(root.child("Memory").and_then(|m| m.attr("RAMSize")), Some("512"));
    }
}
