//! Typed access to the `<devices>` section of a libvirt domain.

use crate::error::{Error, Result};
use crate::xml::{Document, Element, Node};

/// Letters available to device names (`vda` .. `vdy`).
pub const MAX_DEVICE_INDEX: usize = 25;

/// Build a device name from a prefix and a 0-based index: `("vd", 1)` is
/// `vdb`.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] for an index of 25 or more.
pub fn create_alphabetical_device_name(prefix: &str, index: usize) -> Result<String> {
    if index >= MAX_DEVICE_INDEX {
        return Err(Error::invalid_argument(format!(
            "device index {} out of range (max {})",
            index,
            MAX_DEVICE_INDEX - 1
        )));
    }
    Ok(format!("{}{}", prefix, (b'a' + index as u8) as char))
}

/// Value of a disk's `device` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskDevice {
    Disk,
    Cdrom,
    Floppy,
}

impl DiskDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskDevice::Disk => "disk",
            DiskDevice::Cdrom => "cdrom",
            DiskDevice::Floppy => "floppy",
        }
    }

    /// A missing `device` attribute means `disk`.
    pub fn of(disk: &Element) -> Option<Self> {
        match disk.attr("device").unwrap_or("disk") {
            "disk" => Some(DiskDevice::Disk),
            "cdrom" => Some(DiskDevice::Cdrom),
            "floppy" => Some(DiskDevice::Floppy),
            _ => None,
        }
    }

    /// Target name prefix and bus for new devices of this kind.
    fn target_defaults(&self) -> (&'static str, &'static str) {
        match self {
            DiskDevice::Disk => ("vd", "virtio"),
            DiskDevice::Cdrom => ("sd", "sata"),
            DiskDevice::Floppy => ("fd", "fdc"),
        }
    }
}

pub fn devices(doc: &Document) -> Option<&Element> {
    doc.root.child("devices")
}

pub fn devices_mut(doc: &mut Document) -> &mut Element {
    doc.root.child_or_insert("devices")
}

/// Disks of one kind in document order.
pub fn disks(doc: &Document, kind: DiskDevice) -> Vec<&Element> {
    devices(doc)
        .map(|d| {
            d.children_named("disk")
                .filter(|disk| DiskDevice::of(disk) == Some(kind))
                .collect()
        })
        .unwrap_or_default()
}

/// The `index`-th child of `<devices>` accepted by `matches`.
pub fn nth_device_mut<'a>(
    doc: &'a mut Document,
    index: usize,
    matches: impl Fn(&Element) -> bool,
) -> Option<&'a mut Element> {
    devices_mut(doc)
        .elements_mut()
        .filter(|e| matches(e))
        .nth(index)
}

pub fn is_disk_of(kind: DiskDevice) -> impl Fn(&Element) -> bool {
    move |e: &Element| e.name == "disk" && DiskDevice::of(e) == Some(kind)
}

pub fn is_interface(e: &Element) -> bool {
    e.name == "interface"
}

/// Path a disk reads from: `file`, `dev`, or a network `name`.
pub fn disk_source(disk: &Element) -> Option<&str> {
    let source = disk.child("source")?;
    source
        .attr("file")
        .or_else(|| source.attr("dev"))
        .or_else(|| source.attr("name"))
}

/// Point a disk at a file, or empty it with `None`.
pub fn set_disk_source(disk: &mut Element, path: Option<&str>) {
    match path {
        Some(path) => {
            disk.set_attr("type", "file");
            let source = disk.child_or_insert("source");
            source.attributes.clear();
            source.set_attr("file", path);
        }
        None => {
            disk.remove_children_where(|c| c.name == "source");
        }
    }
}

pub fn target_bus(disk: &Element) -> Option<&str> {
    disk.child("target")?.attr("bus")
}

/// Target name for a new disk: `prefix` + `index` when that name is free,
/// otherwise the first unused one.
fn target_name(doc: &Document, prefix: &str, index: usize) -> Result<String> {
    let used: Vec<&str> = devices(doc)
        .map(|d| {
            d.children_named("disk")
                .filter_map(|disk| disk.child("target")?.attr("dev"))
                .collect()
        })
        .unwrap_or_default();
    let preferred = create_alphabetical_device_name(prefix, index)?;
    if !used.contains(&preferred.as_str()) {
        return Ok(preferred);
    }
    for candidate in 0..MAX_DEVICE_INDEX {
        let name = create_alphabetical_device_name(prefix, candidate)?;
        if !used.contains(&name.as_str()) {
            return Ok(name);
        }
    }
    Err(Error::invalid_argument(format!(
        "no free device name with prefix '{}'",
        prefix
    )))
}

/// Driver `type` for an image path, guessed from its extension.
fn driver_type(path: Option<&str>) -> &'static str {
    let ext = path
        .and_then(|p| p.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("qcow2") => "qcow2",
        Some("vmdk") => "vmdk",
        Some("vdi") => "vdi",
        _ => "raw",
    }
}

/// Append a new disk of `kind` to `<devices>` as the `index`-th device of
/// that kind.
pub fn append_disk<'a>(
    doc: &'a mut Document,
    kind: DiskDevice,
    index: usize,
    path: Option<&str>,
) -> Result<&'a mut Element> {
    let (prefix, bus) = kind.target_defaults();
    let dev = target_name(doc, prefix, index)?;

    let mut disk = Element::new("disk")
        .with_attr("type", "file")
        .with_attr("device", kind.as_str());
    disk.append(
        Element::new("driver")
            .with_attr("name", "qemu")
            .with_attr("type", driver_type(path)),
    );
    if let Some(path) = path {
        disk.append(Element::new("source").with_attr("file", path));
    }
    disk.append(Element::new("target").with_attr("dev", dev).with_attr("bus", bus));
    if kind == DiskDevice::Cdrom {
        disk.append(Element::new("readonly"));
    }

    let devices = devices_mut(doc);
    // Keep disks together, ahead of the other devices.
    let pos = devices
        .children
        .iter()
        .rposition(|n| matches!(n, Node::Element(e) if e.name == "disk" || e.name == "emulator"))
        .map_or(0, |p| p + 1);
    devices.children.insert(pos, Node::Element(disk));
    match &mut devices.children[pos] {
        Node::Element(e) => Ok(e),
        _ => Err(Error::malformed("inserted disk vanished")),
    }
}

pub fn set_readonly(disk: &mut Element, read_only: bool) {
    disk.remove_children_where(|c| c.name == "readonly");
    if read_only {
        disk.append(Element::new("readonly"));
    }
}

/// `<devices>` children of element name `name`, created if missing.
pub fn device_or_insert<'a>(doc: &'a mut Document, name: &str) -> &'a mut Element {
    devices_mut(doc).child_or_insert(name)
}

/// Controllers of a given `type`.
pub fn controllers<'a>(doc: &'a Document, kind: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
    devices(doc)
        .into_iter()
        .flat_map(move |d| d.children_named("controller"))
        .filter(move |c| c.attr("type") == Some(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_names() {
        assert_eq!(create_alphabetical_device_name("vd", 0).unwrap(), "vda");
        assert_eq!(create_alphabetical_device_name("vd", 1).unwrap(), "vdb");
        assert_eq!(create_alphabetical_device_name("sd", 24).unwrap(), "sdy");
        assert!(matches!(
            create_alphabetical_device_name("vd", 25),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_append_disk_uses_index_name() {
        let mut doc = Document::parse(br#"<domain type="kvm"><devices/></domain>"#).unwrap();
        let disk = append_disk(&mut doc, DiskDevice::Cdrom, 2, None).unwrap();
        assert_eq!(disk.child("target").and_then(|t| t.attr("dev")), Some("sdc"));
        assert!(disk.child("readonly").is_some());
        assert!(disk.child("source").is_none());
        assert!(append_disk(&mut doc, DiskDevice::Floppy, 25, None).is_err());
    }

    #[test]
    fn test_append_disk_picks_free_name() {
        let mut doc = Document::parse(
            br#"<domain type="kvm"><devices><emulator>/usr/bin/qemu</emulator>
                <disk type="file" device="disk"><target dev="vda" bus="virtio"/></disk>
                <interface type="network"/></devices></domain>"#,
        )
        .unwrap();
        let disk = append_disk(&mut doc, DiskDevice::Disk, 0, Some("/img/b.qcow2")).unwrap();
        assert_eq!(disk.child("target").and_then(|t| t.attr("dev")), Some("vdb"));
        assert_eq!(disk.child("driver").and_then(|d| d.attr("type")), Some("qcow2"));

        let names: Vec<_> = devices(&doc).unwrap().elements().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["emulator", "disk", "disk", "interface"]);
    }

    #[test]
    fn test_disk_source_variants() {
        let mut disk = Element::new("disk");
        assert_eq!(disk_source(&disk), None);
        set_disk_source(&mut disk, Some("/a.img"));
        assert_eq!(disk_source(&disk), Some("/a.img"));
        set_disk_source(&mut disk, None);
        assert_eq!(disk_source(&disk), None);
        assert_eq!(DiskDevice::of(&disk), Some(DiskDevice::Disk));
    }
}
