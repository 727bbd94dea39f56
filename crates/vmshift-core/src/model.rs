//! Normalized configuration model shared by every codec.
//!
//! Codecs translate their native vocabulary into the types defined here: hard
//! disks, virtualizer identity, and the hardware option groups a user may pick
//! from when editing a machine.

use std::fmt;

/// A `major.minor` version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parse `major[.minor]`, ignoring anything after the minor component.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(minor) => {
                let digits: String = minor.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()?
            }
            None => 0,
        };
        Some(Self { major, minor })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Disk image container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskFormat {
    Vmdk,
    Qcow2,
    Vdi,
    Docker,
}

impl DiskFormat {
    /// Conventional file extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Vmdk => "vmdk",
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Vdi => "vdi",
            DiskFormat::Docker => "dockerfile",
        }
    }

    /// Whether the given virtualizer can attach images of this format.
    pub fn is_supported_by(&self, virtualizer: &Virtualizer) -> bool {
        virtualizer.disk_formats.contains(self)
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiskFormat::Vmdk => "VMDK",
            DiskFormat::Qcow2 => "QCOW2",
            DiskFormat::Vdi => "VDI",
            DiskFormat::Docker => "DOCKER",
        };
        f.write_str(name)
    }
}

/// Identity of the hypervisor a configuration originates from.
#[derive(Debug, PartialEq, Eq)]
pub struct Virtualizer {
    /// Stable identifier, also the key into per-virtualizer OS id mappings.
    pub id: &'static str,
    /// Human readable name.
    pub name: &'static str,
    /// Hypervisor versions this codec can produce descriptors for.
    pub supported_versions: &'static [Version],
    /// Disk formats this hypervisor can attach.
    pub disk_formats: &'static [DiskFormat],
}

pub static VMWARE: Virtualizer = Virtualizer {
    id: "vmware",
    name: "VMware",
    supported_versions: &[
        Version::new(3, 0),
        Version::new(4, 0),
        Version::new(6, 0),
        Version::new(7, 0),
        Version::new(8, 0),
        Version::new(9, 0),
        Version::new(10, 0),
        Version::new(11, 0),
        Version::new(12, 0),
        Version::new(13, 0),
        Version::new(14, 0),
        Version::new(15, 0),
        Version::new(16, 0),
        Version::new(17, 0),
        Version::new(18, 0),
        Version::new(19, 0),
        Version::new(20, 0),
        Version::new(21, 0),
    ],
    disk_formats: &[DiskFormat::Vmdk],
};

pub static VIRTUALBOX: Virtualizer = Virtualizer {
    id: "virtualbox",
    name: "VirtualBox",
    supported_versions: &[
        Version::new(1, 15),
        Version::new(1, 16),
        Version::new(1, 17),
        Version::new(1, 18),
        Version::new(1, 19),
    ],
    disk_formats: &[DiskFormat::Vdi],
};

pub static QEMU: Virtualizer = Virtualizer {
    id: "qemukvm",
    name: "QEMU-KVM",
    supported_versions: &[
        Version::new(2, 11),
        Version::new(2, 12),
        Version::new(3, 0),
        Version::new(3, 1),
        Version::new(4, 0),
        Version::new(4, 1),
        Version::new(4, 2),
        Version::new(5, 0),
        Version::new(5, 1),
        Version::new(5, 2),
        Version::new(6, 0),
        Version::new(6, 1),
        Version::new(6, 2),
        Version::new(7, 0),
        Version::new(7, 1),
        Version::new(7, 2),
        Version::new(8, 0),
        Version::new(8, 1),
        Version::new(8, 2),
    ],
    disk_formats: &[DiskFormat::Qcow2, DiskFormat::Vmdk, DiskFormat::Vdi],
};

pub static DOCKER: Virtualizer = Virtualizer {
    id: "docker",
    name: "Docker",
    supported_versions: &[],
    disk_formats: &[DiskFormat::Docker],
};

/// Storage bus a hard disk hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusType {
    Scsi,
    Ide,
    Sata,
    Nvme,
}

impl BusType {
    /// Match a bus name case-insensitively (`scsi`, `IDE`, `NVMe`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "scsi" => Some(BusType::Scsi),
            "ide" => Some(BusType::Ide),
            "sata" => Some(BusType::Sata),
            "nvme" => Some(BusType::Nvme),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BusType::Scsi => "scsi",
            BusType::Ide => "ide",
            BusType::Sata => "sata",
            BusType::Nvme => "nvme",
        }
    }
}

/// A hard disk attached to a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardDisk {
    /// Controller chipset driver (e.g. `lsilogic`, `AHCI`), if known.
    pub chipset_driver: Option<String>,
    pub bus: BusType,
    /// Path of the disk image; may be a placeholder token in templates.
    pub disk_image: String,
}

impl HardDisk {
    pub fn new(chipset_driver: Option<String>, bus: BusType, disk_image: impl Into<String>) -> Self {
        Self {
            chipset_driver,
            bus,
            disk_image: disk_image.into(),
        }
    }
}

/// Kind of network attachment for a new NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EtherType {
    Nat,
    Bridged,
    HostOnly,
}

/// Normalized sound card models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundCardType {
    None,
    Default,
    SoundBlaster,
    Es1371,
    HdAudio,
    Ac97,
}

impl SoundCardType {
    pub const ALL: [SoundCardType; 6] = [
        SoundCardType::None,
        SoundCardType::Default,
        SoundCardType::SoundBlaster,
        SoundCardType::Es1371,
        SoundCardType::HdAudio,
        SoundCardType::Ac97,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            SoundCardType::None => "none",
            SoundCardType::Default => "default",
            SoundCardType::SoundBlaster => "sb16",
            SoundCardType::Es1371 => "es1371",
            SoundCardType::HdAudio => "hdaudio",
            SoundCardType::Ac97 => "ac97",
        }
    }
}

/// 3D acceleration switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acceleration3d {
    Off,
    On,
}

impl Acceleration3d {
    pub fn id(&self) -> &'static str {
        match self {
            Acceleration3d::Off => "off",
            Acceleration3d::On => "on",
        }
    }
}

/// Normalized NIC models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EthernetModel {
    Auto,
    PcNet32,
    E1000,
    E1000e,
    Vmxnet,
    Vmxnet3,
    Virtio,
    Rtl8139,
}

impl EthernetModel {
    pub const ALL: [EthernetModel; 8] = [
        EthernetModel::Auto,
        EthernetModel::PcNet32,
        EthernetModel::E1000,
        EthernetModel::E1000e,
        EthernetModel::Vmxnet,
        EthernetModel::Vmxnet3,
        EthernetModel::Virtio,
        EthernetModel::Rtl8139,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            EthernetModel::Auto => "auto",
            EthernetModel::PcNet32 => "pcnet32",
            EthernetModel::E1000 => "e1000",
            EthernetModel::E1000e => "e1000e",
            EthernetModel::Vmxnet => "vmxnet",
            EthernetModel::Vmxnet3 => "vmxnet3",
            EthernetModel::Virtio => "virtio",
            EthernetModel::Rtl8139 => "rtl8139",
        }
    }
}

/// Maximum USB speed offered to the guest. Ordered by speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UsbSpeed {
    None,
    Usb1,
    Usb2,
    Usb3,
}

impl UsbSpeed {
    pub const ALL: [UsbSpeed; 4] = [UsbSpeed::None, UsbSpeed::Usb1, UsbSpeed::Usb2, UsbSpeed::Usb3];

    pub fn id(&self) -> &'static str {
        match self {
            UsbSpeed::None => "none",
            UsbSpeed::Usb1 => "usb1",
            UsbSpeed::Usb2 => "usb2",
            UsbSpeed::Usb3 => "usb3",
        }
    }
}

/// Semantic axes a user can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionGroupId {
    HwVersion,
    SoundCard,
    Acceleration3d,
    EthernetModel,
    UsbSpeed,
}

/// One concrete value of an option group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurableOption {
    pub id: String,
    pub active: bool,
}

/// The values one hypervisor supports along one semantic axis.
///
/// At most one option is active at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurableOptionGroup {
    pub group: OptionGroupId,
    pub options: Vec<ConfigurableOption>,
}

impl ConfigurableOptionGroup {
    pub fn new<I, S>(group: OptionGroupId, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            group,
            options: ids
                .into_iter()
                .map(|id| ConfigurableOption {
                    id: id.into(),
                    active: false,
                })
                .collect(),
        }
    }

    /// Activate `id`, deactivating whatever was active before.
    ///
    /// Returns false (and leaves the group untouched) if `id` is not offered.
    pub fn select(&mut self, id: &str) -> bool {
        if !self.options.iter().any(|o| o.id == id) {
            return false;
        }
        for option in &mut self.options {
            option.active = option.id == id;
        }
        true
    }

    /// The currently active option, if any.
    pub fn active(&self) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.active)
            .map(|o| o.id.as_str())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.options.iter().any(|o| o.id == id)
    }
}

/// Select `id` inside the group `group` of `groups`, if both exist.
pub(crate) fn select_option(groups: &mut [ConfigurableOptionGroup], group: OptionGroupId, id: &str) -> bool {
    groups
        .iter_mut()
        .find(|g| g.group == group)
        .map(|g| g.select(id))
        .unwrap_or(false)
}
