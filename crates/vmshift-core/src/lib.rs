//! vmshift Core Library
//!
//! This crate normalizes virtual machine descriptors from several hypervisors
//! into one model and introspects the disk images they reference.
//!
//! # Overview
//!
//! A descriptor is handed to [`detect`], which tries each codec in turn and
//! returns the first one that accepts the content. Every codec implements
//! [`VirtualizationConfiguration`], so callers can read, mutate, transform and
//! re-serialize a machine without knowing which hypervisor it came from. Disk
//! images are identified separately with [`probe`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`model`] - Normalized types shared by every codec
//! - [`catalog`] - Operating system catalog and fingerprint database
//! - [`config`] - The codec contract
//! - [`disk`] - VMDK, VDI and QCOW2 header probing
//! - [`vmware`] - VMware `.vmx` codec
//! - [`virtualbox`] - VirtualBox `.vbox` codec, templating and provisioning
//! - [`libvirt`] - QEMU/KVM libvirt domain codec
//! - [`docker`] - Opaque container descriptors
//! - [`detect`] - Content-based codec dispatch
//! - [`xml`] - Element tree and path queries used by the XML codecs
//!
//! # Quick Start
//!
//! ```no_run
//! use vmshift_core::{detect_file, ParseContext};
//! use std::path::Path;
//!
//! let ctx = ParseContext::default();
//! let mut detected = detect_file(Path::new("/path/to/vm.vmx"), &ctx).unwrap();
//! let config = detected.config_mut();
//! config.transform_privacy();
//! let bytes = config.filtered_definition_bytes().unwrap();
//! # let _ = bytes;
//! ```

pub mod catalog;
pub mod config;
pub mod detect;
pub mod disk;
pub mod docker;
pub mod error;
pub mod libvirt;
pub mod model;
pub mod virtualbox;
pub mod vmware;
pub mod xml;

pub use error::{Error, Result};

// Re-export the entry points for convenience
pub use catalog::{OperatingSystem, OsCatalog, OsInfo, OsInfoDatabase, ParseContext};
pub use config::VirtualizationConfiguration;
pub use detect::{detect, detect_file, DetectedConfiguration};
pub use disk::{probe, DiskImage};
pub use docker::DockerConfig;
pub use libvirt::QemuConfig;
pub use model::{
    Acceleration3d, BusType, ConfigurableOption, ConfigurableOptionGroup, DiskFormat, EtherType,
    EthernetModel, HardDisk, OptionGroupId, SoundCardType, UsbSpeed, Version, Virtualizer,
    DOCKER, QEMU, VIRTUALBOX, VMWARE,
};
pub use virtualbox::{DiskValues, InstanceValues, Placeholder, VirtualBoxConfig};
pub use vmware::VmwareConfig;
