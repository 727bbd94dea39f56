//! Container image descriptors.
//!
//! A Docker descriptor is an opaque gzip-compressed tar archive. It is
//! recognized by its magic bytes only and carries no editable hardware, so
//! every mutation reports `false` and every transform leaves it untouched.

use crate::catalog::OperatingSystem;
use crate::config::VirtualizationConfiguration;
use crate::error::{Error, Result};
use crate::model::{
    Acceleration3d, ConfigurableOptionGroup, EtherType, EthernetModel, HardDisk, SoundCardType,
    UsbSpeed, Version, Virtualizer, DOCKER,
};
use std::fs;
use std::path::Path;

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const DEFAULT_NAME: &str = "container";

#[derive(Debug, Clone)]
pub struct DockerConfig {
    data: Vec<u8>,
    display_name: String,
}

impl DockerConfig {
    /// Accept `path` and name the machine after its file stem.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::io(e, path))?;
        Ok(Self::parse(&data)?.named_after(path))
    }

    pub(crate) fn named_after(mut self, path: &Path) -> Self {
        let stem = path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.split('.').next().unwrap_or(name))
            .unwrap_or_default();
        if !stem.is_empty() {
            self.display_name = stem.to_string();
        }
        self
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if !data.starts_with(&GZIP_MAGIC) {
            return Err(Error::unknown_format("missing gzip magic"));
        }
        tracing::debug!(len = data.len(), "accepted container descriptor");
        Ok(Self {
            data: data.to_vec(),
            display_name: DEFAULT_NAME.to_string(),
        })
    }
}

impl VirtualizationConfiguration for DockerConfig {
    fn virtualizer(&self) -> &'static Virtualizer {
        &DOCKER
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn os(&self) -> Option<&OperatingSystem> {
        None
    }

    fn hdds(&self) -> &[HardDisk] {
        &[]
    }

    fn is_machine_snapshot(&self) -> bool {
        false
    }

    fn option_groups(&self) -> &[ConfigurableOptionGroup] {
        &[]
    }

    fn set_display_name(&mut self, _name: &str) -> bool {
        false
    }

    fn set_os(&mut self, _os: &OperatingSystem) -> bool {
        false
    }

    fn add_hdd(&mut self, _path: &str) -> bool {
        false
    }

    fn add_cdrom(&mut self, _index: usize, _path: Option<&str>) -> bool {
        false
    }

    fn add_floppy(&mut self, _index: usize, _path: Option<&str>, _read_only: bool) -> bool {
        false
    }

    fn add_cpu_core_count(&mut self, _cores: u32) -> bool {
        false
    }

    fn add_ram(&mut self, _mb: u32) -> bool {
        false
    }

    fn add_ethernet(&mut self, _index: usize, _kind: EtherType) -> bool {
        false
    }

    fn sound_card(&self) -> SoundCardType {
        SoundCardType::None
    }

    fn set_sound_card(&mut self, _card: SoundCardType) -> bool {
        false
    }

    fn acceleration_3d(&self) -> Acceleration3d {
        Acceleration3d::Off
    }

    fn set_acceleration_3d(&mut self, _acceleration: Acceleration3d) -> bool {
        false
    }

    fn virtualizer_version(&self) -> Option<Version> {
        None
    }

    fn set_virtualizer_version(&mut self, _version: Version) -> bool {
        false
    }

    fn ethernet_model(&self, _index: usize) -> Option<EthernetModel> {
        None
    }

    fn set_ethernet_model(&mut self, _index: usize, _model: EthernetModel) -> bool {
        false
    }

    fn usb_speed(&self) -> UsbSpeed {
        UsbSpeed::None
    }

    fn set_usb_speed(&mut self, _speed: UsbSpeed) -> bool {
        false
    }

    fn transform_privacy(&mut self) {}

    fn transform_editable(&mut self) {}

    fn transform_non_persistent(&mut self) {}

    fn validate(&self) -> Result<()> {
        if self.data.starts_with(&GZIP_MAGIC) {
            Ok(())
        } else {
            Err(Error::malformed("missing gzip magic"))
        }
    }

    fn definition_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }

    fn filtered_definition_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }
}
