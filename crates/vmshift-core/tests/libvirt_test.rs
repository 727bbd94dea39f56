//! Integration tests for the libvirt domain codec.

use std::collections::HashMap;
use std::path::Path;
use vmshift_core::libvirt::create_alphabetical_device_name;
use vmshift_core::{
    Acceleration3d, BusType, EtherType, OperatingSystem, OsCatalog, OsInfo, OsInfoDatabase,
    ParseContext, QemuConfig, SoundCardType, UsbSpeed, Version, VirtualizationConfiguration,
};

fn fixture_path() -> &'static Path {
    Path::new(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/teaching-domain.xml"
    ))
}

fn overlay_path() -> &'static Path {
    Path::new(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/teaching-overlay.xml"
    ))
}

fn parse_fixture() -> QemuConfig {
    QemuConfig::parse_file(fixture_path(), &ParseContext::default())
        .expect("Failed to parse domain XML")
}

fn os(id: u32, name: &str, arch: &str) -> OperatingSystem {
    OperatingSystem {
        id,
        name: name.to_string(),
        architecture: arch.to_string(),
        virtualizer_os_ids: HashMap::new(),
        max_mem_mb: None,
        max_cores: None,
    }
}

#[test]
fn test_parse_fixture() {
    let config = parse_fixture();
    assert_eq!(config.display_name(), "teaching-vm");
    assert_eq!(config.virtualizer_version(), Some(Version::new(8, 1)));
    assert_eq!(config.sound_card(), SoundCardType::Default);
    assert_eq!(config.acceleration_3d(), Acceleration3d::On);
    assert_eq!(config.usb_speed(), UsbSpeed::Usb3);
    assert!(!config.is_machine_snapshot());

    let hdds = config.hdds();
    assert_eq!(hdds.len(), 1);
    assert_eq!(hdds[0].bus, BusType::Scsi);
    assert_eq!(hdds[0].disk_image, "/var/lib/libvirt/images/teaching-vm.qcow2");
}

#[test]
fn test_os_fingerprint_prefers_matching_bitness() {
    let catalog = OsCatalog::new(vec![
        os(1, "Fedora 39 (32-bit)", "i686"),
        os(2, "Fedora 39 (64-bit)", "x86_64"),
        os(3, "Debian 12 (64-bit)", "x86_64"),
    ]);
    let osinfo = OsInfoDatabase::new(vec![OsInfo {
        id: "http://fedoraproject.org/fedora/39".to_string(),
        name: "Fedora 39".to_string(),
    }]);
    let ctx = ParseContext::new(catalog, osinfo);

    let config = QemuConfig::parse_file(fixture_path(), &ctx).unwrap();
    assert_eq!(config.os().map(|o| o.id), Some(2));
}

#[test]
fn test_unknown_fingerprint_leaves_os_unset() {
    let ctx = ParseContext::new(
        OsCatalog::new(vec![os(2, "Fedora 39 (64-bit)", "x86_64")]),
        OsInfoDatabase::default(),
    );
    let config = QemuConfig::parse_file(fixture_path(), &ctx).unwrap();
    assert!(config.os().is_none());
}

#[test]
fn test_backing_store_marks_snapshot() {
    let xml = std::fs::read_to_string(fixture_path()).unwrap().replace(
        "<target dev=\"vda\" bus=\"virtio\"/>",
        "<target dev=\"vda\" bus=\"virtio\"/>\n      <backingStore type=\"file\"><source file=\"/base.qcow2\"/></backingStore>",
    );
    let config = QemuConfig::parse(xml.as_bytes(), &ParseContext::default()).unwrap();
    assert!(config.is_machine_snapshot());
}

#[test]
fn test_filtered_export_drops_host_details() {
    let config = parse_fixture();
    let out = String::from_utf8(config.filtered_definition_bytes().unwrap()).unwrap();
    assert!(!out.contains("<uuid>"));
    assert!(!out.contains("<source file="));
    assert!(!out.contains("52:54:00"));
    assert!(!out.contains("<emulator>"));
    assert!(out.contains("<name>teaching-vm</name>"));
    assert!(out.contains("<memory unit=\"KiB\">4194304</memory>"));
}

#[test]
fn test_mutations() {
    let mut config = parse_fixture();
    assert!(config.add_ram(1024));
    assert!(config.add_cpu_core_count(2));
    assert!(config.add_hdd("/srv/images/student.qcow2"));
    assert!(config.add_ethernet(1, EtherType::Bridged));
    assert!(config.set_virtualizer_version(Version::new(7, 2)));

    let out = String::from_utf8(config.definition_bytes().unwrap()).unwrap();
    assert!(out.contains("<memory unit=\"KiB\">1048576</memory>"));
    assert!(out.contains("<currentMemory unit=\"KiB\">1048576</currentMemory>"));
    assert!(out.contains("<vcpu placement=\"static\">2</vcpu>"));
    assert!(out.contains("<source bridge=\"br0\"/>"));
    assert!(out.contains("machine=\"pc-q35-7.2\""));
    assert_eq!(config.hdds()[0].disk_image, "/srv/images/student.qcow2");
}

#[test]
fn test_transforms() {
    let mut config = parse_fixture();
    config.transform_editable();
    config.transform_non_persistent();
    config.transform_privacy();

    let out = String::from_utf8(config.definition_bytes().unwrap()).unwrap();
    assert!(!out.contains("<boot"));
    assert!(out.contains("<suspend-to-mem enabled=\"no\"/>"));
    assert!(out.contains("<suspend-to-disk enabled=\"no\"/>"));
    assert!(!out.contains("teaching-vm.qcow2"));
    assert!(!out.contains("Fedora-Workstation-39.iso"));
}

#[test]
fn test_device_names() {
    assert_eq!(create_alphabetical_device_name("hd", 3).unwrap(), "hdd");
    assert!(create_alphabetical_device_name("hd", 25).is_err());
}

#[test]
fn test_overlay_fixture_is_snapshot() {
    let config = QemuConfig::parse_file(overlay_path(), &ParseContext::default()).unwrap();
    assert!(config.is_machine_snapshot());
    let hdds = config.hdds();
    assert_eq!(hdds.len(), 2);
    assert_eq!(hdds[0].disk_image, "/home/student/overlays/lab1.qcow2");
    assert_eq!(hdds[1].disk_image, "/home/student/overlays/scratch.img");
}

#[test]
fn test_filtered_export_drops_backing_chain_paths() {
    let config = QemuConfig::parse_file(overlay_path(), &ParseContext::default()).unwrap();
    let out = String::from_utf8(config.filtered_definition_bytes().unwrap()).unwrap();
    assert!(!out.contains("/home/student"));
    assert!(!out.contains("52:54:00:11:22:33"));
    assert!(out.contains("<format type=\"qcow2\"/>"));
    assert!(out.contains("<target dev=\"vdb\" bus=\"virtio\"/>"));
}

#[test]
fn test_privacy_transform_drops_backing_chain_paths() {
    let mut config = QemuConfig::parse_file(overlay_path(), &ParseContext::default()).unwrap();
    config.transform_privacy();
    let once = config.definition_bytes().unwrap();
    config.transform_privacy();
    assert_eq!(config.definition_bytes().unwrap(), once);

    let out = String::from_utf8(once).unwrap();
    assert!(!out.contains("/home/student"));
    assert!(config.hdds().iter().all(|h| h.disk_image.is_empty()));
    // The chain structure survives; only the paths go.
    assert!(config.is_machine_snapshot());
}
