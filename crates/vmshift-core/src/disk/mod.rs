//! Disk image probing.
//!
//! [`probe`] identifies VMDK, VDI and QCOW2 images by their headers and reports
//! the properties the exchange pipeline cares about: whether an image is
//! standalone, compressed, or a snapshot delta. Detection is content based and
//! tried in a fixed order (VMDK, VDI, QCOW2); the first match wins.

pub mod qcow2;
pub mod vdi;
pub mod vmdk;

use crate::error::{Error, Result};
use crate::model::DiskFormat;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

pub use vdi::write_image_uuid as write_vdi_image_uuid;
pub use vmdk::{parse_descriptor, VmdkDescriptor};

/// Result of probing a disk image. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub format: DiskFormat,
    /// The image does not depend on a backing or parent file.
    pub is_standalone: bool,
    pub is_compressed: bool,
    /// The image is a delta against a parent.
    pub is_snapshot: bool,
    /// VMDK `createType`.
    pub sub_format: Option<String>,
    /// VMDK virtual hardware version or QCOW2 header version.
    pub hw_version: u32,
    /// VDI free text description.
    pub description: Option<String>,
}

/// Probe the disk image at `path`.
///
/// # Errors
///
/// Returns [`Error::UnknownFormat`] if no known header is found, or an I/O
/// error if the file cannot be read.
pub fn probe(path: &Path) -> Result<DiskImage> {
    let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
    let len = file.metadata().map_err(|e| Error::io(e, path))?.len();

    probe_reader(&mut file, len).map_err(|e| match e {
        Error::Io { source, path: None } => Error::io(source, path),
        other => other,
    })
}

/// Probe an already opened image of `len` bytes.
pub fn probe_reader<R: Read + Seek>(reader: &mut R, len: u64) -> Result<DiskImage> {
    if let Some(image) = vmdk::probe(reader, len)? {
        return Ok(image);
    }
    if let Some(image) = vdi::probe(reader, len)? {
        return Ok(image);
    }
    if let Some(image) = qcow2::probe(reader, len)? {
        return Ok(image);
    }
    Err(Error::unknown_format("no VMDK, VDI or QCOW2 header found"))
}

/// Probe an in-memory image.
pub fn probe_bytes(data: &[u8]) -> Result<DiskImage> {
    let mut cursor = std::io::Cursor::new(data);
    probe_reader(&mut cursor, data.len() as u64)
}

/// Read at most `limit` bytes from the current position.
pub(crate) fn read_up_to<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit);
    reader.take(limit as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Map a premature end of file inside a recognized header to `UnknownFormat`.
pub(crate) fn eof_as_unknown(message: &'static str) -> impl Fn(Error) -> Error {
    move |e| match e {
        Error::Io { ref source, .. } if source.kind() == std::io::ErrorKind::UnexpectedEof => {
            Error::unknown_format(message)
        }
        other => other,
    }
}

