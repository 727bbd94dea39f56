//! The contract every configuration codec implements.
//!
//! A codec owns one parsed descriptor exclusively. Mutations return `true` when
//! the descriptor was changed and `false` when the hypervisor has no way to
//! express the request; they never leave a half-applied change behind.

use crate::catalog::OperatingSystem;
use crate::error::Result;
use crate::model::{
    Acceleration3d, ConfigurableOptionGroup, EtherType, EthernetModel, HardDisk, SoundCardType,
    UsbSpeed, Version, Virtualizer,
};

pub trait VirtualizationConfiguration: std::fmt::Debug {
    /// The hypervisor this descriptor belongs to.
    fn virtualizer(&self) -> &'static Virtualizer;

    /// Display name of the machine. Never empty.
    fn display_name(&self) -> &str;

    /// Canonical OS, if the native OS identifier resolved against the catalog.
    fn os(&self) -> Option<&OperatingSystem>;

    fn hdds(&self) -> &[HardDisk];

    /// Whether the machine is paused or carries snapshots.
    fn is_machine_snapshot(&self) -> bool;

    /// Option groups this hypervisor supports, with the active values marked.
    fn option_groups(&self) -> &[ConfigurableOptionGroup];

    fn set_display_name(&mut self, name: &str) -> bool;

    fn set_os(&mut self, os: &OperatingSystem) -> bool;

    /// Point the primary hard disk at `path`, creating one if needed.
    fn add_hdd(&mut self, path: &str) -> bool;

    /// Attach or update the CD-ROM drive at `index`; `None` leaves it empty.
    fn add_cdrom(&mut self, index: usize, path: Option<&str>) -> bool;

    /// Attach or update the floppy drive at `index`.
    fn add_floppy(&mut self, index: usize, path: Option<&str>, read_only: bool) -> bool;

    fn add_cpu_core_count(&mut self, cores: u32) -> bool;

    fn add_ram(&mut self, mb: u32) -> bool;

    /// Enable the NIC at `index` with the given attachment.
    fn add_ethernet(&mut self, index: usize, kind: EtherType) -> bool;

    fn sound_card(&self) -> SoundCardType;

    fn set_sound_card(&mut self, card: SoundCardType) -> bool;

    fn acceleration_3d(&self) -> Acceleration3d;

    fn set_acceleration_3d(&mut self, acceleration: Acceleration3d) -> bool;

    fn virtualizer_version(&self) -> Option<Version>;

    fn set_virtualizer_version(&mut self, version: Version) -> bool;

    fn ethernet_model(&self, index: usize) -> Option<EthernetModel>;

    fn set_ethernet_model(&mut self, index: usize, model: EthernetModel) -> bool;

    fn usb_speed(&self) -> UsbSpeed;

    fn set_usb_speed(&mut self, speed: UsbSpeed) -> bool;

    /// Remove every storage file path (disks, floppies, CD-ROMs). Idempotent.
    fn transform_privacy(&mut self);

    /// Adjust settings for a copy a person is going to edit interactively.
    fn transform_editable(&mut self);

    /// Adjust settings for stateless (non-persistent) execution.
    fn transform_non_persistent(&mut self);

    /// Re-run the codec's structural validation on the current state.
    fn validate(&self) -> Result<()>;

    /// Full serialization in the native format.
    fn definition_bytes(&self) -> Result<Vec<u8>>;

    /// Serialization reduced to what is safe to persist or share.
    fn filtered_definition_bytes(&self) -> Result<Vec<u8>>;
}
