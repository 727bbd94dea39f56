//! Integration tests for disk image probing on synthetic images.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use vmshift_core::disk::qcow2::{L2_COMPRESSED_MASK, QCOW2_MAGIC};
use vmshift_core::disk::vdi::{SIGNATURE_OFFSET, VDI_SIGNATURE};
use vmshift_core::disk::vmdk::VMDK_MAGIC;
use vmshift_core::{probe, DiskFormat, Error};

const CLUSTER_BITS: u32 = 9;
const CLUSTER: usize = 1 << CLUSTER_BITS;

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

fn write(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, data).unwrap();
    path
}

/// QCOW2 v2 image: header in cluster 0, L1 table in cluster 1, one L2
/// table in cluster 2 whose first entry is `l2_entry`.
fn qcow2_image(l1_size: u32, l2_entry: u64, snapshot_field: u32, backing: u64) -> Vec<u8> {
    let mut image = vec![0u8; CLUSTER * 3];
    put_u32(&mut image, 0, QCOW2_MAGIC);
    put_u32(&mut image, 4, 2);
    put_u64(&mut image, 8, backing);
    put_u32(&mut image, 20, CLUSTER_BITS);
    put_u32(&mut image, 36, l1_size);
    put_u64(&mut image, 40, CLUSTER as u64);
    put_u32(&mut image, 56, snapshot_field);

    put_u64(&mut image, CLUSTER, (2 * CLUSTER) as u64);
    put_u64(&mut image, 2 * CLUSTER, l2_entry);
    image
}

/// QCOW2 v3 image with the extended-L2 feature bit set and `entry` stored at
/// byte `at` of the single L2 table.
fn qcow2_extended_l2_image(at: usize, entry: u64) -> Vec<u8> {
    let mut image = qcow2_image(1, 0, 0, 0);
    put_u32(&mut image, 4, 3);
    put_u64(&mut image, 72, 1 << 4);
    put_u64(&mut image, 2 * CLUSTER + at, entry);
    image
}

fn vdi_image(parent: [u8; 16], description: &str) -> Vec<u8> {
    let mut image = vec![0u8; 512];
    image[..24].copy_from_slice(b"<<< Oracle VM VirtualBox");
    put_u32(&mut image, SIGNATURE_OFFSET as usize, VDI_SIGNATURE);
    image[0x54..0x54 + description.len()].copy_from_slice(description.as_bytes());
    image[0x1b8..0x1b8 + 16].copy_from_slice(&parent);
    image
}

fn probe_path(path: &Path) -> vmshift_core::DiskImage {
    probe(path).expect("Failed to probe image")
}

#[test]
fn test_qcow2_compressed_cluster() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "c.qcow2", &qcow2_image(1, L2_COMPRESSED_MASK | 0x1000, 0, 0));
    let image = probe_path(&path);
    assert_eq!(image.format, DiskFormat::Qcow2);
    assert_eq!(image.hw_version, 2);
    assert!(image.is_compressed);
    assert!(image.is_standalone);
}

#[test]
fn test_qcow2_plain_cluster() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "p.qcow2", &qcow2_image(1, 0x8000_0000_0000_1000, 0, 0));
    assert!(!probe_path(&path).is_compressed);
}

#[test]
fn test_qcow2_empty_l1_skips_scan() {
    let dir = TempDir::new().unwrap();
    // The L1 offset points past the end; a scan would fail.
    let mut data = qcow2_image(0, L2_COMPRESSED_MASK, 0, 0);
    put_u64(&mut data, 40, 1 << 40);
    let path = write(&dir, "e.qcow2", &data);
    assert!(!probe_path(&path).is_compressed);
}

#[test]
fn test_qcow2_snapshot_and_backing_flags() {
    let dir = TempDir::new().unwrap();
    let zero = write(&dir, "z.qcow2", &qcow2_image(0, 0, 0, 0));
    assert!(probe_path(&zero).is_snapshot);

    let nonzero = write(&dir, "n.qcow2", &qcow2_image(0, 0, 3, 0));
    assert!(!probe_path(&nonzero).is_snapshot);

    let backed = write(&dir, "b.qcow2", &qcow2_image(0, 0, 0, 0x200));
    assert!(!probe_path(&backed).is_standalone);
}

#[test]
fn test_qcow2_extended_l2_stride() {
    let dir = TempDir::new().unwrap();
    // Second extended entry: compressed flag honoured.
    let hit = write(&dir, "x16.qcow2", &qcow2_extended_l2_image(16, L2_COMPRESSED_MASK));
    let image = probe_path(&hit);
    assert_eq!(image.hw_version, 3);
    assert!(image.is_compressed);

    // Byte 8 is the subcluster bitmap of the first entry, not an entry.
    let miss = write(&dir, "x8.qcow2", &qcow2_extended_l2_image(8, L2_COMPRESSED_MASK));
    assert!(!probe_path(&miss).is_compressed);
}

#[test]
fn test_qcow2_v3_without_extended_l2_uses_plain_stride() {
    let dir = TempDir::new().unwrap();
    let mut data = qcow2_image(1, 0, 0, 0);
    put_u32(&mut data, 4, 3);
    put_u64(&mut data, 2 * CLUSTER + 8, L2_COMPRESSED_MASK);
    let path = write(&dir, "v3.qcow2", &data);
    assert!(probe_path(&path).is_compressed);
}

#[test]
fn test_qcow2_unsupported_version() {
    let dir = TempDir::new().unwrap();
    for version in [1, 4] {
        let mut data = qcow2_image(0, 0, 0, 0);
        put_u32(&mut data, 4, version);
        let path = write(&dir, &format!("v{}.qcow2", version), &data);
        assert!(
            matches!(probe(&path), Err(Error::UnknownFormat { .. })),
            "version {}",
            version
        );
    }
}

#[test]
fn test_qcow2_header_bounds() {
    let dir = TempDir::new().unwrap();
    for cluster_bits in [8, 22] {
        let mut data = qcow2_image(1, 0, 0, 0);
        put_u32(&mut data, 20, cluster_bits);
        let path = write(&dir, &format!("cb{}.qcow2", cluster_bits), &data);
        assert!(matches!(probe(&path), Err(Error::UnknownFormat { .. })));
    }

    let huge_l1 = write(&dir, "l1.qcow2", &qcow2_image(4 * 1024 * 1024 + 1, 0, 0, 0));
    assert!(matches!(probe(&huge_l1), Err(Error::UnknownFormat { .. })));

    // Within bounds but pointing past the end of the file.
    let mut data = qcow2_image(1, 0, 0, 0);
    put_u64(&mut data, 40, 1 << 20);
    let truncated = write(&dir, "t.qcow2", &data);
    assert!(matches!(probe(&truncated), Err(Error::UnknownFormat { .. })));
}

#[test]
fn test_vdi_parent_uuid() {
    let dir = TempDir::new().unwrap();
    let base = write(&dir, "base.vdi", &vdi_image([0; 16], "Course base image"));
    let image = probe_path(&base);
    assert_eq!(image.format, DiskFormat::Vdi);
    assert!(!image.is_snapshot);
    assert_eq!(image.description.as_deref(), Some("Course base image"));

    let mut parent = [0u8; 16];
    parent[15] = 1;
    let child = write(&dir, "child.vdi", &vdi_image(parent, ""));
    let image = probe_path(&child);
    assert!(image.is_snapshot);
    assert_eq!(image.description, None);
}

#[test]
fn test_vmdk_text_descriptor() {
    let dir = TempDir::new().unwrap();
    let descriptor = "# Disk DescriptorFile\nversion=1\nCID=fffffffe\nparentCID=ffffffff\n\
                      createType=\"monolithicSparse\"\n\
                      RW 41943040 SPARSE \"disk.vmdk\"\n\
                      ddb.virtualHWVersion = \"19\"\n";
    let path = write(&dir, "disk.vmdk", descriptor.as_bytes());
    let image = probe_path(&path);
    assert_eq!(image.format, DiskFormat::Vmdk);
    assert_eq!(image.sub_format.as_deref(), Some("monolithicSparse"));
    assert_eq!(image.hw_version, 19);
    assert!(image.is_standalone);
    assert!(!image.is_compressed);
    assert!(!image.is_snapshot);
}

#[test]
fn test_vmdk_delta_is_snapshot() {
    let dir = TempDir::new().unwrap();
    let descriptor = "version=1\nCID=12345678\nparentCID=87654321\ncreateType=\"monolithicSparse\"\n";
    let path = write(&dir, "disk-000001.vmdk", descriptor.as_bytes());
    let image = probe_path(&path);
    assert!(image.is_snapshot);
    assert!(!image.is_standalone);
}

#[test]
fn test_vmdk_embedded_descriptor() {
    let dir = TempDir::new().unwrap();
    let mut data = vec![0u8; 8192];
    put_u32(&mut data, 0, VMDK_MAGIC);
    let descriptor = b"createType=\"streamOptimized\"\nparentCID=ffffffff\n";
    data[512..512 + descriptor.len()].copy_from_slice(descriptor);
    let path = write(&dir, "stream.vmdk", &data);

    let image = probe_path(&path);
    assert_eq!(image.sub_format.as_deref(), Some("streamOptimized"));
    assert!(image.is_compressed);
    assert!(image.is_standalone);
    assert_eq!(image.hw_version, 10);
}

#[test]
fn test_unknown_image() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "random.img", &vec![0xAB; 8192]);
    assert!(matches!(probe(&path), Err(Error::UnknownFormat { .. })));
}

#[test]
fn test_missing_file_is_io_error() {
    let err = probe(Path::new("/nonexistent/disk.qcow2")).unwrap_err();
    assert!(err.is_io());
}
