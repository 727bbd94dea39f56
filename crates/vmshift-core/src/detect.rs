//! Content-based codec dispatch.
//!
//! Codecs are tried in a fixed order: VMware, VirtualBox, QEMU/libvirt,
//! Docker. A codec that rejects the input hands over to the next one; an I/O
//! failure aborts the whole detection. File extensions are never consulted.

use crate::catalog::ParseContext;
use crate::config::VirtualizationConfiguration;
use crate::docker::{DockerConfig, GZIP_MAGIC};
use crate::error::{Error, Result};
use crate::libvirt::QemuConfig;
use crate::virtualbox::VirtualBoxConfig;
use crate::vmware::VmwareConfig;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Largest file considered as a machine descriptor. Anything bigger can only
/// be a container archive.
pub const MAX_DESCRIPTOR_SIZE: u64 = 16 * 1024 * 1024;

/// A configuration together with the codec that accepted it.
#[derive(Debug, Clone)]
pub enum DetectedConfiguration {
    Vmware(VmwareConfig),
    VirtualBox(VirtualBoxConfig),
    Qemu(QemuConfig),
    Docker(DockerConfig),
}

impl DetectedConfiguration {
    pub fn config(&self) -> &dyn VirtualizationConfiguration {
        match self {
            DetectedConfiguration::Vmware(c) => c,
            DetectedConfiguration::VirtualBox(c) => c,
            DetectedConfiguration::Qemu(c) => c,
            DetectedConfiguration::Docker(c) => c,
        }
    }

    pub fn config_mut(&mut self) -> &mut dyn VirtualizationConfiguration {
        match self {
            DetectedConfiguration::Vmware(c) => c,
            DetectedConfiguration::VirtualBox(c) => c,
            DetectedConfiguration::Qemu(c) => c,
            DetectedConfiguration::Docker(c) => c,
        }
    }

    pub fn into_boxed(self) -> Box<dyn VirtualizationConfiguration> {
        match self {
            DetectedConfiguration::Vmware(c) => Box::new(c),
            DetectedConfiguration::VirtualBox(c) => Box::new(c),
            DetectedConfiguration::Qemu(c) => Box::new(c),
            DetectedConfiguration::Docker(c) => Box::new(c),
        }
    }
}

/// Read `path` and detect its configuration format.
///
/// At most [`MAX_DESCRIPTOR_SIZE`] bytes are read up front. A larger file is
/// read in full only when it carries the gzip magic of a container archive.
pub fn detect_file(path: &Path, ctx: &ParseContext) -> Result<DetectedConfiguration> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let (data, oversized) =
        read_limited(file, MAX_DESCRIPTOR_SIZE).map_err(|e| Error::io(e, path))?;
    if oversized {
        if !data.starts_with(&GZIP_MAGIC) {
            tracing::debug!(path = %path.display(), "file too large for a machine descriptor");
            return Err(Error::UnrecognizedFormat);
        }
        return DockerConfig::parse_file(path).map(DetectedConfiguration::Docker);
    }
    match detect(&data, ctx)? {
        DetectedConfiguration::Docker(docker) => {
            Ok(DetectedConfiguration::Docker(docker.named_after(path)))
        }
        other => Ok(other),
    }
}

/// Read up to `limit` bytes. The flag is set when the input goes on past
/// `limit`; the returned buffer then holds `limit + 1` bytes.
fn read_limited<R: Read>(reader: R, limit: u64) -> std::io::Result<(Vec<u8>, bool)> {
    let mut data = Vec::new();
    reader.take(limit + 1).read_to_end(&mut data)?;
    let oversized = data.len() as u64 > limit;
    Ok((data, oversized))
}

/// Detect the configuration format of `data`.
///
/// # Errors
///
/// Returns [`Error::UnrecognizedFormat`] when every codec rejects the input.
pub fn detect(data: &[u8], ctx: &ParseContext) -> Result<DetectedConfiguration> {
    type Attempt = fn(&[u8], &ParseContext) -> Result<DetectedConfiguration>;
    let attempts: [(&str, Attempt); 4] = [
        ("vmware", |d, ctx| VmwareConfig::parse(d, ctx).map(DetectedConfiguration::Vmware)),
        ("virtualbox", |d, ctx| {
            VirtualBoxConfig::parse(d, ctx).map(DetectedConfiguration::VirtualBox)
        }),
        ("qemukvm", |d, ctx| QemuConfig::parse(d, ctx).map(DetectedConfiguration::Qemu)),
        ("docker", |d, _| DockerConfig::parse(d).map(DetectedConfiguration::Docker)),
    ];

    for (codec, attempt) in attempts {
        let result = attempt(data, ctx).and_then(|detected| {
            detected.config().validate()?;
            Ok(detected)
        });
        match result {
            Ok(detected) => {
                tracing::debug!(codec, "configuration format detected");
                return Ok(detected);
            }
            Err(e) if e.is_io() => return Err(e),
            Err(e) => tracing::debug!(codec, error = %e, "codec rejected input"),
        }
    }
    Err(Error::UnrecognizedFormat)
}
