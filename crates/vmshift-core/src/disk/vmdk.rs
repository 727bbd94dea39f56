//! VMDK header and embedded descriptor probing.
//!
//! Sparse VMDKs start with the `KDMV` magic and carry their text descriptor at
//! sector 1. Descriptor-only VMDKs (the small text file next to a flat extent)
//! have no magic and are text from byte 0.

use super::{read_up_to, DiskImage};
use crate::error::Result;
use crate::model::DiskFormat;
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

/// `KDMV` read as a big-endian integer.
pub const VMDK_MAGIC: u32 = 0x4B44_4D56;

/// Files smaller than this without magic are treated as descriptor-only VMDKs.
pub const SMALL_FILE_THRESHOLD: u64 = 4096;

/// Offset of the embedded descriptor in a sparse VMDK.
pub const DESCRIPTOR_OFFSET: u64 = 512;

/// Maximum number of descriptor bytes examined.
pub const DESCRIPTOR_MAX_LEN: usize = 2048;

/// Hardware version assumed when the descriptor does not declare one.
pub const DEFAULT_HW_VERSION: u32 = 10;

/// Parent CID value meaning "no parent".
const NO_PARENT_CID: &str = "ffffffff";

/// Key/value pairs of a VMDK text descriptor, keyed by lowercased key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmdkDescriptor {
    entries: HashMap<String, String>,
}

impl VmdkDescriptor {
    /// Look up a key case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn create_type(&self) -> Option<&str> {
        self.get("createType")
    }

    pub fn parent_cid(&self) -> Option<&str> {
        self.get("parentCID")
    }

    /// Whether the descriptor declares a parent disk.
    pub fn has_parent(&self) -> bool {
        self.parent_cid()
            .is_some_and(|cid| !cid.eq_ignore_ascii_case(NO_PARENT_CID))
    }

    pub fn hw_version(&self) -> u32 {
        self.get("ddb.virtualHWVersion")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_HW_VERSION)
    }

    /// Whether this looks like a VMDK descriptor at all.
    pub fn is_vmdk(&self) -> bool {
        self.create_type().is_some() || self.parent_cid().is_some()
    }
}

/// Parse a VMDK descriptor from its text content.
///
/// Lines that are not `key = value` or `key = "value"` (extent lines,
/// comments) are skipped.
pub fn parse_descriptor(content: &str) -> VmdkDescriptor {
    let mut entries = HashMap::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = parse_key_value(line) {
            entries.insert(key.to_ascii_lowercase(), value);
        }
    }

    VmdkDescriptor { entries }
}

/// Parse a key=value or key = value line.
///
/// Returns None if the line doesn't contain an equals sign.
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let mut value = line[eq_pos + 1..].trim();

    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = &value[1..value.len() - 1];
    }

    Some((key.to_string(), value.to_string()))
}

/// Probe for a VMDK. `Ok(None)` means "not a VMDK, try the next format".
pub(crate) fn probe<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Option<DiskImage>> {
    reader.seek(SeekFrom::Start(0))?;
    let magic = if file_len >= 4 {
        reader.read_u32::<BigEndian>()?
    } else {
        0
    };

    let offset = if magic == VMDK_MAGIC {
        DESCRIPTOR_OFFSET
    } else if file_len < SMALL_FILE_THRESHOLD {
        0
    } else {
        return Ok(None);
    };

    reader.seek(SeekFrom::Start(offset))?;
    let raw = read_up_to(reader, DESCRIPTOR_MAX_LEN)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = String::from_utf8_lossy(&raw[..end]);

    let descriptor = parse_descriptor(&text);
    if !descriptor.is_vmdk() {
        if magic == VMDK_MAGIC {
            tracing::debug!("VMDK magic present but descriptor has no createType/parentCID");
        }
        return Ok(None);
    }

    let create_type = descriptor.create_type().map(str::to_string);
    let is_stream_optimized = create_type
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("streamOptimized"));
    let is_monolithic_sparse = create_type
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("monolithicSparse"));
    let has_parent = descriptor.has_parent();

    tracing::debug!(
        create_type = create_type.as_deref().unwrap_or("-"),
        has_parent,
        "probed VMDK descriptor"
    );

    Ok(Some(DiskImage {
        format: DiskFormat::Vmdk,
        is_standalone: (is_stream_optimized || is_monolithic_sparse) && !has_parent,
        is_compressed: is_stream_optimized,
        is_snapshot: has_parent,
        sub_format: create_type,
        hw_version: descriptor.hw_version(),
        description: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const FLAT_DESCRIPTOR: &str = "# Disk DescriptorFile\n\
        version=1\n\
        CID=fffffffe\n\
        parentCID=ffffffff\n\
        createType=\"monolithicFlat\"\n\
        RW 838860800 FLAT \"TestVM-flat.vmdk\" 0\n\
        ddb.virtualHWVersion = \"21\"\n";

    #[test]
    fn test_parse_key_value_no_spaces() {
        let (key, value) = parse_key_value("version=1").unwrap();
        assert_eq!(key, "version");
        assert_eq!(value, "1");
    }

    #[test]
    fn test_parse_key_value_quoted() {
        let (key, value) = parse_key_value("createType=\"monolithicFlat\"").unwrap();
        assert_eq!(key, "createType");
        assert_eq!(value, "monolithicFlat");
    }

    #[test]
    fn test_parse_key_value_rejects_extent_line() {
        assert!(parse_key_value("RW 12345 SPARSE \"disk.vmdk\" 128").is_none());
    }

    #[test]
    fn test_descriptor_keys_are_case_insensitive() {
        let descriptor = parse_descriptor("CREATETYPE = \"streamOptimized\"\nParentCid=ffffffff\n");
        assert_eq!(descriptor.create_type(), Some("streamOptimized"));
        assert!(!descriptor.has_parent());
        assert_eq!(descriptor.hw_version(), DEFAULT_HW_VERSION);
    }

    #[test]
    fn test_probe_descriptor_only_file() {
        let mut cursor = Cursor::new(FLAT_DESCRIPTOR.as_bytes().to_vec());
        let len = FLAT_DESCRIPTOR.len() as u64;
        let image = probe(&mut cursor, len).unwrap().unwrap();
        assert_eq!(image.format, DiskFormat::Vmdk);
        assert_eq!(image.sub_format.as_deref(), Some("monolithicFlat"));
        assert_eq!(image.hw_version, 21);
        assert!(!image.is_standalone);
        assert!(!image.is_compressed);
        assert!(!image.is_snapshot);
    }

    #[test]
    fn test_probe_large_file_without_magic_is_skipped() {
        let mut data = vec![0u8; 8192];
        data[..FLAT_DESCRIPTOR.len()].copy_from_slice(FLAT_DESCRIPTOR.as_bytes());
        let mut cursor = Cursor::new(data);
        assert!(probe(&mut cursor, 8192).unwrap().is_none());
    }
}
