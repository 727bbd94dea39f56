//! Integration tests for the VirtualBox codec, templates and disk provisioning.

use std::fs;
use std::path::Path;
use tempfile::TempDir;
use vmshift_core::disk::vdi::{IMAGE_UUID_OFFSET, SIGNATURE_OFFSET, VDI_SIGNATURE};
use vmshift_core::{
    BusType, Error, InstanceValues, ParseContext, Placeholder, SoundCardType, UsbSpeed, Version,
    VirtualBoxConfig, VirtualizationConfiguration,
};

fn fixture_path() -> &'static Path {
    Path::new(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/teaching.vbox"
    ))
}

fn lab_fixture_path() -> &'static Path {
    Path::new(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/teaching-lab.vbox"
    ))
}

fn parse_fixture() -> VirtualBoxConfig {
    VirtualBoxConfig::parse_file(fixture_path(), &ParseContext::default())
        .expect("Failed to parse .vbox")
}

/// A 512-byte VDI header with a signature and nothing else.
fn write_blank_vdi(path: &Path) {
    let mut header = vec![0u8; 512];
    let sig = SIGNATURE_OFFSET as usize;
    header[sig..sig + 4].copy_from_slice(&VDI_SIGNATURE.to_be_bytes());
    fs::write(path, header).unwrap();
}

#[test]
fn test_parse_fixture() {
    let config = parse_fixture();
    assert_eq!(config.display_name(), "Teaching VM");
    assert_eq!(config.virtualizer_version(), Some(Version::new(1, 16)));
    assert_eq!(config.sound_card(), SoundCardType::Ac97);
    assert_eq!(config.usb_speed(), UsbSpeed::Usb3);

    let hdds = config.hdds();
    assert_eq!(hdds.len(), 1);
    assert_eq!(hdds[0].bus, BusType::Sata);
    assert_eq!(
        hdds[0].disk_image,
        "/home/student/VirtualBox VMs/Teaching VM/disk.vdi"
    );
}

#[test]
fn test_unsupported_version_is_rejected() {
    let xml = fs::read_to_string(fixture_path())
        .unwrap()
        .replace("version=\"1.16-linux\"", "version=\"1.12-linux\"");
    let err = VirtualBoxConfig::parse(xml.as_bytes(), &ParseContext::default()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedSchemaVersion { .. }));
}

#[test]
fn test_invalid_document_is_rejected() {
    let xml = fs::read_to_string(fixture_path())
        .unwrap()
        .replace("RAMSize=\"2048\"", "RAMSize=\"two gigs\"");
    let err = VirtualBoxConfig::parse(xml.as_bytes(), &ParseContext::default()).unwrap_err();
    assert!(matches!(err, Error::SchemaValidation { .. }));
}

#[test]
fn test_filtered_export_prunes_host_details() {
    let config = parse_fixture();
    let out = String::from_utf8(config.filtered_definition_bytes().unwrap()).unwrap();
    assert!(!out.contains("SharedFolder"));
    assert!(!out.contains("GuestProperty"));
    assert!(!out.contains("ExtraData"));
    assert!(!out.contains("BridgedInterface"));
    assert!(!out.contains("/home/student"));
    assert!(out.contains("RAMSize=\"2048\""));
}

#[test]
fn test_template_then_instantiate() {
    let config = parse_fixture();
    let template = config.create_template().unwrap();

    let pending = template.unresolved_placeholders();
    let expected = Placeholder::MACHINE_WIDE
        .into_iter()
        .chain([Placeholder::DiskPath(0), Placeholder::DiskUuid(0)]);
    for placeholder in expected {
        assert!(pending.contains(&placeholder), "missing {}", placeholder);
    }
    assert_eq!(pending.len(), 6);

    // A template survives a round trip through its own serialization.
    let bytes = template.definition_bytes().unwrap();
    let reparsed = VirtualBoxConfig::parse(&bytes, &ParseContext::default()).unwrap();
    assert!(!reparsed.unresolved_placeholders().is_empty());

    let values = InstanceValues::generate(["/srv/vms/student-07.vdi"], 4096, 4);
    let instance = reparsed
        .instantiate(&values, &ParseContext::default())
        .unwrap();
    assert!(instance.unresolved_placeholders().is_empty());
    assert_eq!(instance.hdds()[0].disk_image, "/srv/vms/student-07.vdi");
    instance.validate().unwrap();

    let out = String::from_utf8(instance.definition_bytes().unwrap()).unwrap();
    assert!(out.contains("RAMSize=\"4096\""));
    assert!(out.contains("count=\"4\""));
}

#[test]
fn test_substitute_resolves_one_placeholder() {
    let template = parse_fixture().create_template().unwrap();
    let mut partial = template.clone();
    assert!(partial.substitute(Placeholder::Memory, "1024") > 0);
    assert!(!partial.unresolved_placeholders().contains(&Placeholder::Memory));

    let bytes = partial.definition_bytes().unwrap();
    let reparsed = VirtualBoxConfig::parse(&bytes, &ParseContext::default()).unwrap();
    assert!(reparsed
        .unresolved_placeholders()
        .contains(&Placeholder::DiskUuid(0)));
}

#[test]
fn test_assign_hdd_patches_vdi_header() {
    let dir = TempDir::new().unwrap();
    let vdi = dir.path().join("student.vdi");
    write_blank_vdi(&vdi);

    let mut config = parse_fixture();
    let uuid = config.assign_hdd(&vdi).unwrap();

    let header = fs::read(&vdi).unwrap();
    let at = IMAGE_UUID_OFFSET as usize;
    assert_eq!(&header[at..at + 16], &uuid.to_bytes_le());

    assert_eq!(config.hdds().len(), 1);
    assert_eq!(config.hdds()[0].disk_image, vdi.to_string_lossy());
    let out = String::from_utf8(config.definition_bytes().unwrap()).unwrap();
    assert!(out.contains(&uuid.to_string()));
    assert!(!out.contains("7e1f0c2d-3b4a-4c5d-8e6f-7a8b9c0d1e2f"));
    config.validate().unwrap();
}

#[test]
fn test_assign_hdd_refuses_non_vdi() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("not-a-disk.vdi");
    fs::write(&path, vec![0u8; 512]).unwrap();

    let mut config = parse_fixture();
    let before = config.definition_bytes().unwrap();
    assert!(config.assign_hdd(&path).is_err());
    assert_eq!(config.definition_bytes().unwrap(), before);
    assert_eq!(fs::read(&path).unwrap(), vec![0u8; 512]);
}

#[test]
fn test_version_change_moves_storage_controllers() {
    let mut config = parse_fixture();
    assert!(config.set_virtualizer_version(Version::new(1, 18)));
    config.validate().unwrap();

    let out = String::from_utf8(config.definition_bytes().unwrap()).unwrap();
    assert!(out.contains("version=\"1.18-linux\""));
    assert_eq!(config.hdds().len(), 1);

    assert!(!config.set_virtualizer_version(Version::new(1, 3)));
}

#[test]
fn test_two_disk_template_gets_one_token_pair_per_disk() {
    let config = VirtualBoxConfig::parse_file(lab_fixture_path(), &ParseContext::default()).unwrap();
    assert_eq!(config.hdds().len(), 2);

    let template = config.create_template().unwrap();
    let pending = template.unresolved_placeholders();
    for index in 0..2 {
        assert!(pending.contains(&Placeholder::DiskPath(index)));
        assert!(pending.contains(&Placeholder::DiskUuid(index)));
    }
    let out = String::from_utf8(template.definition_bytes().unwrap()).unwrap();
    assert!(!out.contains("c4a1e9d2"));
    assert!(!out.contains("e8f3b6a0"));

    let values = InstanceValues::generate(["/srv/lab/system.vdi", "/srv/lab/data.vdi"], 2048, 2);
    let instance = template.instantiate(&values, &ParseContext::default()).unwrap();
    instance.validate().unwrap();
    let images: Vec<_> = instance.hdds().iter().map(|h| h.disk_image.as_str()).collect();
    assert_eq!(images, vec!["/srv/lab/system.vdi", "/srv/lab/data.vdi"]);

    let out = String::from_utf8(instance.definition_bytes().unwrap()).unwrap();
    for disk in &values.disks {
        let uuid = vmshift_core::virtualbox::braced(&disk.uuid);
        // Once in the registry, once on the attachment.
        assert_eq!(out.matches(uuid.as_str()).count(), 2);
    }
}

#[test]
fn test_two_disk_template_needs_values_for_every_disk() {
    let template = VirtualBoxConfig::parse_file(lab_fixture_path(), &ParseContext::default())
        .unwrap()
        .create_template()
        .unwrap();
    let values = InstanceValues::generate(["/srv/lab/system.vdi"], 2048, 2);
    assert!(template.instantiate(&values, &ParseContext::default()).is_err());
}
