//! VirtualBox VDI header probing and in-place UUID patching.
//!
//! ```text
//! 0x000  opening text tag (64 bytes)
//! 0x040  signature 0x7f10dabe (read big-endian)
//! 0x044  version, header size, image type, image flags
//! 0x054  description (256 bytes)
//! 0x154  geometry, offsets and block metadata (13 x u32)
//! 0x188  image UUID (16 bytes)
//! 0x198  last snapshot UUID, link UUID
//! 0x1b8  parent UUID
//! ```

use super::{eof_as_unknown, DiskImage};
use crate::error::{Error, Result};
use crate::model::DiskFormat;
use byteorder::{BigEndian, ReadBytesExt};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use uuid::Uuid;

/// VDI signature as read big-endian from offset 64.
pub const VDI_SIGNATURE: u32 = 0x7f10_dabe;

/// Offset of the signature, right after the opening text tag.
pub const SIGNATURE_OFFSET: u64 = 64;

/// Length of the free text description.
pub const DESCRIPTION_LEN: usize = 256;

/// Absolute offset of the image UUID.
pub const IMAGE_UUID_OFFSET: u64 = 392;

/// Byte order of the first eight UUID bytes as stored on disk.
const MIXED_ENDIAN_ORDER: [usize; 8] = [3, 2, 1, 0, 5, 4, 7, 6];

/// Probe for a VDI. `Ok(None)` means "not a VDI, try the next format".
pub(crate) fn probe<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Option<DiskImage>> {
    if file_len < SIGNATURE_OFFSET + 4 {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(SIGNATURE_OFFSET))?;
    if reader.read_u32::<BigEndian>()? != VDI_SIGNATURE {
        return Ok(None);
    }

    read_header(reader).map(Some).map_err(eof_as_unknown("truncated VDI header"))
}

fn read_header<R: Read + Seek>(reader: &mut R) -> Result<DiskImage> {
    // version, header size, image type, image flags
    reader.seek(SeekFrom::Current(4 * 4))?;

    let mut description = [0u8; DESCRIPTION_LEN];
    reader.read_exact(&mut description)?;
    let end = description.iter().position(|&b| b == 0).unwrap_or(DESCRIPTION_LEN);
    let description = String::from_utf8_lossy(&description[..end]).trim().to_string();

    // block offsets, data offset, geometry, sector size, unused, disk size,
    // block size, block extra, blocks in image, blocks allocated
    reader.seek(SeekFrom::Current(13 * 4))?;

    let mut image_uuid = [0u8; 16];
    reader.read_exact(&mut image_uuid)?;

    // last snapshot UUID and link UUID
    reader.seek(SeekFrom::Current(32))?;

    let mut parent_uuid = [0u8; 16];
    reader.read_exact(&mut parent_uuid)?;

    let is_snapshot = parent_uuid.iter().any(|&b| b != 0);
    tracing::debug!(
        image_uuid = %decode_uuid(&image_uuid),
        is_snapshot,
        "probed VDI header"
    );

    Ok(DiskImage {
        format: DiskFormat::Vdi,
        is_standalone: true,
        is_compressed: false,
        is_snapshot,
        sub_format: None,
        hw_version: 0,
        description: if description.is_empty() {
            None
        } else {
            Some(description)
        },
    })
}

/// Encode a UUID the way VDI headers store it: the first eight big-endian
/// bytes reordered, the last eight unchanged.
pub fn encode_uuid(uuid: &Uuid) -> [u8; 16] {
    let be = uuid.as_bytes();
    let mut out = *be;
    for (i, &src) in MIXED_ENDIAN_ORDER.iter().enumerate() {
        out[i] = be[src];
    }
    out
}

/// Inverse of [`encode_uuid`].
pub fn decode_uuid(raw: &[u8; 16]) -> Uuid {
    let mut be = *raw;
    for (i, &dst) in MIXED_ENDIAN_ORDER.iter().enumerate() {
        be[dst] = raw[i];
    }
    Uuid::from_bytes(be)
}

/// Overwrite the image UUID of the VDI at `path`.
///
/// The signature is checked first, then the 16 encoded bytes are written with
/// a single seek and a single contiguous write, so the file ends up either
/// untouched or fully patched.
pub fn write_image_uuid(path: &Path, uuid: &Uuid) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::io(e, path))?;

    file.seek(SeekFrom::Start(SIGNATURE_OFFSET))
        .map_err(|e| Error::io(e, path))?;
    let signature = file.read_u32::<BigEndian>().map_err(|e| Error::io(e, path))?;
    if signature != VDI_SIGNATURE {
        tracing::error!(path = %path.display(), "refusing to patch UUID: not a VDI image");
        return Err(Error::unknown_format(format!(
            "{} has no VDI signature",
            path.display()
        )));
    }

    let encoded = encode_uuid(uuid);
    let result = file
        .seek(SeekFrom::Start(IMAGE_UUID_OFFSET))
        .and_then(|_| file.write_all(&encoded))
        .and_then(|_| file.sync_data());

    if let Err(e) = result {
        tracing::error!(path = %path.display(), error = %e, "failed to patch VDI image UUID");
        return Err(Error::io(e, path));
    }

    tracing::debug!(path = %path.display(), %uuid, "patched VDI image UUID");
    Ok(())
}
