//! VirtualBox `.vbox` configuration codec.
//!
//! The settings file is XML with a root `version` attribute (`1.16-linux`).
//! Only versions listed in [`SCHEMAS`] are accepted. Documents carrying
//! template placeholders may fail the structural rules (a token is not a
//! UUID); that failure is tolerated and logged.

mod schema;
mod template;

pub use schema::{lookup as lookup_schema, Schema, SCHEMAS};
pub use template::{braced, DiskValues, InstanceValues, Placeholder};

use crate::catalog::{OperatingSystem, ParseContext};
use crate::config::VirtualizationConfiguration;
use crate::disk::write_vdi_image_uuid;
use crate::error::{Error, Result};
use crate::model::{
    select_option, Acceleration3d, BusType, ConfigurableOptionGroup, EtherType, EthernetModel,
    HardDisk, OptionGroupId, SoundCardType, UsbSpeed, Version, Virtualizer, VIRTUALBOX,
};
use crate::xml::{Document, Element, Node, Query};
use once_cell::sync::Lazy;
use schema::query;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Network adapter slots VirtualBox offers.
const MAX_ADAPTERS: usize = 8;

static MACHINE: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine"));
static HARDWARE: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine/Hardware"));
static REGISTERED_DISKS: Lazy<Query> = Lazy::new(|| query("//MediaRegistry/HardDisks//HardDisk"));
static MEDIA_LOCATIONS: Lazy<Query> = Lazy::new(|| query("//MediaRegistry//*[@location]"));
static DISK_IMAGE_REFS: Lazy<Query> =
    Lazy::new(|| query("//AttachedDevice[@type='HardDisk']/Image"));
static UUID_CARRIERS: Lazy<Query> = Lazy::new(|| query("//*[@uuid]"));
static SNAPSHOTS: Lazy<Query> = Lazy::new(|| query("//Snapshot"));
static ADAPTERS: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine/Hardware/Network/Adapter"));
static LEGACY_STORAGE: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine/StorageControllers"));
static HARDWARE_STORAGE: Lazy<Query> =
    Lazy::new(|| query("/VirtualBox/Machine/Hardware/StorageControllers"));

/// Locations pruned before a document becomes a template or a filtered export.
static BLACKLIST: Lazy<Vec<Query>> = Lazy::new(|| {
    [
        "/VirtualBox/Machine/Hardware/SharedFolders",
        "/VirtualBox/Machine/Hardware/GuestProperties",
        "/VirtualBox/Machine/Hardware/Network/Adapter[@slot!='0']",
        "//StorageController/AttachedDevice[@type!='HardDisk']",
        "/VirtualBox/Machine/MediaRegistry/DVDImages",
        "/VirtualBox/Machine/MediaRegistry/FloppyImages",
        "/VirtualBox/Machine/ExtraData",
    ]
    .into_iter()
    .map(query)
    .collect()
});

static SOUND_CONTROLLERS: &[(SoundCardType, &str)] = &[
    (SoundCardType::SoundBlaster, "SB16"),
    (SoundCardType::HdAudio, "HDA"),
    (SoundCardType::Ac97, "AC97"),
];

/// Adapter `type` written for each model. Reading also accepts the aliases.
static ADAPTER_TYPES: &[(EthernetModel, &str, &[&str])] = &[
    (EthernetModel::PcNet32, "Am79C973", &["Am79C970A"]),
    (EthernetModel::E1000, "82540EM", &["82543GC", "82545EM"]),
    (EthernetModel::Virtio, "virtio", &[]),
];

static USB_CONTROLLERS: &[(UsbSpeed, &str)] = &[
    (UsbSpeed::Usb1, "OHCI"),
    (UsbSpeed::Usb2, "EHCI"),
    (UsbSpeed::Usb3, "XHCI"),
];

/// Attachment child elements of an `Adapter`.
const ATTACHMENT_KINDS: [&str; 6] = [
    "NAT",
    "BridgedInterface",
    "HostOnlyInterface",
    "InternalNetwork",
    "GenericInterface",
    "NATNetwork",
];

/// Parsed VirtualBox configuration.
#[derive(Debug, Clone)]
pub struct VirtualBoxConfig {
    doc: Document,
    schema: &'static Schema,
    display_name: String,
    os: Option<OperatingSystem>,
    is_snapshot: bool,
    hdds: Vec<HardDisk>,
    option_groups: Vec<ConfigurableOptionGroup>,
}

impl VirtualBoxConfig {
    pub fn parse_file(path: &Path, ctx: &ParseContext) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::io(e, path))?;
        Self::parse(&data, ctx)
    }

    pub fn parse(data: &[u8], ctx: &ParseContext) -> Result<Self> {
        Self::parse_with(data, ctx, false)
    }

    /// In strict mode neither validation failures nor leftover placeholders
    /// are tolerated.
    fn parse_with(data: &[u8], ctx: &ParseContext, strict: bool) -> Result<Self> {
        let mut doc = Document::parse(data)?;
        if doc.root.name != "VirtualBox" {
            return Err(Error::unknown_format(format!(
                "root element <{}> is not <VirtualBox>",
                doc.root.name
            )));
        }
        let version = doc
            .root
            .attr("version")
            .ok_or_else(|| Error::malformed("<VirtualBox> has no version attribute"))?
            .to_string();
        let schema = schema::lookup(&version)?;

        let mut placeholders = Vec::new();
        template::find_tokens(&doc.root, &mut placeholders);
        if let Err(e) = schema.validate(&doc) {
            if strict || placeholders.is_empty() {
                return Err(e);
            }
            tracing::warn!(
                version = %schema.version,
                error = %e,
                "settings file has placeholders and fails validation; continuing"
            );
        }
        if strict && !placeholders.is_empty() {
            let tokens: Vec<_> = placeholders.iter().map(Placeholder::token).collect();
            return Err(Error::malformed(format!(
                "unresolved placeholders: {}",
                tokens.join(", ")
            )));
        }

        ensure_hardware_uuid(&mut doc)?;

        let machine = doc
            .find(&MACHINE)
            .ok_or_else(|| Error::malformed("no <Machine> element"))?;
        let display_name = machine
            .attr("name")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::malformed("<Machine> has no name"))?
            .to_string();
        let os = machine
            .attr("OSType")
            .and_then(|id| ctx.catalog.find_by_native_id(VIRTUALBOX.id, id))
            .cloned();
        let is_snapshot = doc.find(&SNAPSHOTS).is_some();

        let mut config = Self {
            doc,
            schema,
            display_name,
            os,
            is_snapshot,
            hdds: Vec::new(),
            option_groups: Vec::new(),
        };
        config.hdds = config.read_hdds();
        config.option_groups = config.build_option_groups();

        tracing::debug!(
            display_name = %config.display_name,
            version = %schema.version,
            disks = config.hdds.len(),
            "parsed VirtualBox settings"
        );
        Ok(config)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    /// Media registry entries of attached hard disks, keyed by UUID.
    fn registry(&self) -> HashMap<String, String> {
        self.doc
            .find_all(&REGISTERED_DISKS)
            .into_iter()
            .filter_map(|disk| {
                Some((
                    disk.attr("uuid")?.to_ascii_lowercase(),
                    disk.attr("location").unwrap_or_default().to_string(),
                ))
            })
            .collect()
    }

    /// Attached hard disks in controller order, paired with their UUID.
    fn attached_disks(&self) -> Vec<(String, HardDisk)> {
        let registry = self.registry();
        let mut disks = Vec::new();
        for controller in self.doc.find_all(self.schema.storage_controllers()) {
            let Some(bus) = controller_bus(controller) else {
                continue;
            };
            let driver = controller.attr("type").map(str::to_string);
            for device in controller.children_named("AttachedDevice") {
                if device.attr("type") != Some("HardDisk") {
                    continue;
                }
                let Some(uuid) = device.child("Image").and_then(|image| image.attr("uuid")) else {
                    continue;
                };
                match registry.get(&uuid.to_ascii_lowercase()) {
                    Some(location) => disks.push((
                        uuid.to_string(),
                        HardDisk::new(driver.clone(), bus, location.clone()),
                    )),
                    None => tracing::debug!(uuid, "attached disk is not in the media registry"),
                }
            }
        }
        disks
    }

    fn read_hdds(&self) -> Vec<HardDisk> {
        self.attached_disks().into_iter().map(|(_, hdd)| hdd).collect()
    }

    fn build_option_groups(&self) -> Vec<ConfigurableOptionGroup> {
        let mut groups = vec![
            ConfigurableOptionGroup::new(
                OptionGroupId::HwVersion,
                VIRTUALBOX.supported_versions.iter().map(Version::to_string),
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::SoundCard,
                [SoundCardType::None, SoundCardType::Default]
                    .iter()
                    .chain(SOUND_CONTROLLERS.iter().map(|(card, _)| card))
                    .map(|card| card.id()),
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::Acceleration3d,
                [Acceleration3d::Off.id(), Acceleration3d::On.id()],
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::EthernetModel,
                std::iter::once(EthernetModel::Auto)
                    .chain(ADAPTER_TYPES.iter().map(|(model, _, _)| *model))
                    .map(|model| model.id()),
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::UsbSpeed,
                UsbSpeed::ALL.iter().map(|speed| speed.id()),
            ),
        ];

        select_option(&mut groups, OptionGroupId::HwVersion, &self.schema.version.to_string());
        select_option(&mut groups, OptionGroupId::SoundCard, self.sound_card().id());
        select_option(&mut groups, OptionGroupId::Acceleration3d, self.acceleration_3d().id());
        if let Some(model) = self.ethernet_model(0) {
            select_option(&mut groups, OptionGroupId::EthernetModel, model.id());
        }
        select_option(&mut groups, OptionGroupId::UsbSpeed, self.usb_speed().id());
        groups
    }

    fn machine_mut(&mut self) -> Option<&mut Element> {
        self.doc.find_mut(&MACHINE)
    }

    fn hardware(&self) -> Option<&Element> {
        self.doc.find(&HARDWARE)
    }

    fn hardware_mut(&mut self) -> Option<&mut Element> {
        self.doc.find_mut(&HARDWARE)
    }

    /// `MediaRegistry/<list>` under the machine, created on demand.
    fn registry_list_mut(&mut self, list: &str) -> Option<&mut Element> {
        Some(
            self.machine_mut()?
                .child_or_insert("MediaRegistry")
                .child_or_insert(list),
        )
    }

    fn controllers_container_mut(&mut self) -> Option<&mut Element> {
        let parent = if self.schema.storage_under_hardware {
            self.hardware_mut()?
        } else {
            self.machine_mut()?
        };
        Some(parent.child_or_insert("StorageControllers"))
    }

    fn find_controller(&self, matches: &dyn Fn(&Element) -> bool) -> Option<Vec<usize>> {
        self.doc
            .select(self.schema.storage_controllers())
            .into_iter()
            .find(|path| self.doc.root.element_at(path).is_some_and(matches))
    }

    /// Path of the first controller accepted by `matches`; `template` is
    /// added when there is none.
    fn ensure_controller(
        &mut self,
        matches: &dyn Fn(&Element) -> bool,
        template: Element,
    ) -> Option<Vec<usize>> {
        if let Some(path) = self.find_controller(matches) {
            return Some(path);
        }
        self.controllers_container_mut()?.append(template);
        self.find_controller(matches)
    }

    /// Put `attached` at `port`/`device` of the controller, replacing what
    /// was there.
    fn attach_device(&mut self, controller: &[usize], port: u32, device: u32, attached: Element) -> bool {
        let Some(ctrl) = self.doc.root.element_at_mut(controller) else {
            return false;
        };
        let (port, device) = (port.to_string(), device.to_string());
        ctrl.remove_children_where(|e| {
            e.name == "AttachedDevice"
                && e.attr("port") == Some(port.as_str())
                && e.attr("device") == Some(device.as_str())
        });
        ctrl.append(attached.with_attr("port", port).with_attr("device", device));
        true
    }

    /// Register `location` as a new hard disk and attach it to the first
    /// disk-capable controller (a SATA controller is created if needed).
    fn attach_new_disk(&mut self, uuid: &str, location: &str) -> bool {
        let Some(disks) = self.registry_list_mut("HardDisks") else {
            return false;
        };
        disks.append(
            Element::new("HardDisk")
                .with_attr("uuid", uuid)
                .with_attr("location", location)
                .with_attr("format", "VDI")
                .with_attr("type", "Normal"),
        );

        let is_disk_controller = |c: &Element| {
            matches!(controller_bus(c), Some(BusType::Sata | BusType::Scsi | BusType::Nvme))
        };
        let template = Element::new("StorageController")
            .with_attr("name", "SATA")
            .with_attr("type", "AHCI")
            .with_attr("PortCount", "1")
            .with_attr("useHostIOCache", "false")
            .with_attr("Bootable", "true");
        let Some(controller) = self.ensure_controller(&is_disk_controller, template) else {
            return false;
        };

        let Some(ctrl) = self.doc.root.element_at_mut(&controller) else {
            return false;
        };
        let port = ctrl
            .children_named("AttachedDevice")
            .filter_map(|d| d.attr("port")?.parse::<u32>().ok())
            .max()
            .map_or(0, |p| p + 1);
        let port_count = ctrl
            .attr("PortCount")
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(0);
        if port_count <= port {
            ctrl.set_attr("PortCount", (port + 1).to_string());
        }

        let mut attached = Element::new("AttachedDevice")
            .with_attr("type", "HardDisk")
            .with_attr("hotpluggable", "false");
        attached.append(Element::new("Image").with_attr("uuid", uuid));
        self.attach_device(&controller, port, 0, attached)
    }

    /// Register an optical or floppy image and return its UUID.
    fn register_image(&mut self, list: &str, location: &str) -> Option<String> {
        let uuid = braced(&Uuid::new_v4());
        self.registry_list_mut(list)?.append(
            Element::new("Image")
                .with_attr("uuid", uuid.as_str())
                .with_attr("location", location),
        );
        Some(uuid)
    }

    fn adapter(&self, index: usize) -> Option<&Element> {
        let slot = index.to_string();
        self.doc
            .find_all(&ADAPTERS)
            .into_iter()
            .find(|a| a.attr("slot") == Some(slot.as_str()))
    }

    fn adapter_mut(&mut self, index: usize) -> Option<&mut Element> {
        let slot = index.to_string();
        self.hardware_mut()?
            .child_mut("Network")?
            .elements_mut()
            .find(|e| e.name == "Adapter" && e.attr("slot") == Some(slot.as_str()))
    }

    /// The adapter in slot `index`, created if missing.
    fn adapter_or_insert(&mut self, index: usize) -> Option<&mut Element> {
        let slot = index.to_string();
        let network = self.hardware_mut()?.child_or_insert("Network");
        let pos = network.children.iter().position(|node| {
            matches!(node, Node::Element(e) if e.name == "Adapter" && e.attr("slot") == Some(slot.as_str()))
        });
        match pos {
            Some(i) => match &mut network.children[i] {
                Node::Element(e) => Some(e),
                _ => None,
            },
            None => Some(network.append(Element::new("Adapter").with_attr("slot", slot))),
        }
    }

    fn set_extra_data(&mut self, name: &str, value: &str) -> bool {
        let Some(machine) = self.machine_mut() else {
            return false;
        };
        let extra = machine.child_or_insert("ExtraData");
        let existing = extra
            .elements_mut()
            .find(|item| item.name == "ExtraDataItem" && item.attr("name") == Some(name));
        match existing {
            Some(item) => item.set_attr("value", value),
            None => {
                extra.append(
                    Element::new("ExtraDataItem")
                        .with_attr("name", name)
                        .with_attr("value", value),
                );
            }
        }
        true
    }

    fn prune_blacklist(doc: &mut Document) -> usize {
        BLACKLIST.iter().map(|q| doc.remove_all(q)).sum()
    }

    /// Placeholders still present anywhere in the document.
    pub fn unresolved_placeholders(&self) -> Vec<Placeholder> {
        let mut found = Vec::new();
        template::find_tokens(&self.doc.root, &mut found);
        found
    }

    /// Derive a reusable template: prune blacklisted locations and replace
    /// host- and instance-specific values with placeholder tokens.
    pub fn create_template(&self) -> Result<Self> {
        let mut template = self.clone();
        let pruned = Self::prune_blacklist(&mut template.doc);

        let machine_token = Placeholder::MachineUuid.token();
        if let Some(machine) = template.machine_mut() {
            machine.set_attr("uuid", machine_token.clone());
        }
        let hardware = template
            .hardware_mut()
            .ok_or_else(|| Error::malformed("no <Hardware> element"))?;
        hardware.set_attr("uuid", machine_token);
        hardware
            .child_or_insert("Memory")
            .set_attr("RAMSize", Placeholder::Memory.token());
        hardware
            .child_or_insert("CPU")
            .set_attr("count", Placeholder::CpuCores.token());

        // Registry position -> token index; attachments follow their medium.
        let mut indexes = HashMap::new();
        template.doc.for_each_mut(&REGISTERED_DISKS, |disk| {
            let index = indexes.len();
            if let Some(uuid) = disk.attr("uuid") {
                indexes.insert(uuid.to_ascii_lowercase(), index);
            }
            disk.set_attr("uuid", Placeholder::DiskUuid(index).token());
            disk.set_attr("location", Placeholder::DiskPath(index).token());
        });
        template.doc.for_each_mut(&DISK_IMAGE_REFS, |image| {
            let index = image
                .attr("uuid")
                .and_then(|uuid| indexes.get(&uuid.to_ascii_lowercase()).copied());
            match index {
                Some(index) => image.set_attr("uuid", Placeholder::DiskUuid(index).token()),
                None => tracing::debug!(uuid = ?image.attr("uuid"), "attachment outside the media registry"),
            }
        });
        if let Some(adapter) = template.adapter_mut(0) {
            adapter.set_attr("MACAddress", Placeholder::NicMac.token());
        }

        template.hdds = template.read_hdds();
        template.option_groups = template.build_option_groups();
        tracing::debug!(pruned, "created VirtualBox template");
        Ok(template)
    }

    /// Replace one placeholder everywhere. Returns how many values changed.
    pub fn substitute(&mut self, placeholder: Placeholder, value: &str) -> usize {
        let changed = template::replace_token(&mut self.doc.root, &placeholder.token(), value);
        if changed > 0 {
            if let Some(name) = self.doc.find(&MACHINE).and_then(|m| m.attr("name")) {
                self.display_name = name.to_string();
            }
            self.hdds = self.read_hdds();
        }
        changed
    }

    /// Fill every placeholder and re-parse the result strictly. A disk token
    /// without a matching entry in `values.disks` is left in place and fails
    /// the strict parse.
    pub fn instantiate(&self, values: &InstanceValues, ctx: &ParseContext) -> Result<Self> {
        let mut doc = self.doc.clone();
        for placeholder in self.unresolved_placeholders() {
            if let Some(value) = values.value_for(placeholder) {
                template::replace_token(&mut doc.root, &placeholder.token(), &value);
            }
        }
        Self::parse_with(&doc.to_bytes()?, ctx, true)
    }

    /// Give the machine a fresh identity and the VDI at `vdi_path` as its
    /// primary disk. The new disk UUID is written into the image header
    /// first; on failure the configuration is left untouched.
    pub fn assign_hdd(&mut self, vdi_path: &Path) -> Result<Uuid> {
        let disk_uuid = Uuid::new_v4();
        let machine_uuid = braced(&Uuid::new_v4());
        write_vdi_image_uuid(vdi_path, &disk_uuid)?;

        let new_disk = braced(&disk_uuid);
        let location = vdi_path.to_string_lossy().into_owned();
        match self.attached_disks().into_iter().next() {
            Some((old, _)) => {
                self.doc.for_each_mut(&UUID_CARRIERS, |e| {
                    if e.attr("uuid").is_some_and(|u| u.eq_ignore_ascii_case(&old)) {
                        e.set_attr("uuid", new_disk.as_str());
                        if e.name == "HardDisk" {
                            e.set_attr("location", location.as_str());
                        }
                    }
                });
            }
            None => {
                if !self.attach_new_disk(&new_disk, &location) {
                    return Err(Error::malformed("cannot attach a disk to this machine"));
                }
            }
        }

        if let Some(machine) = self.machine_mut() {
            machine.set_attr("uuid", machine_uuid.as_str());
        }
        if let Some(hardware) = self.hardware_mut() {
            hardware.set_attr("uuid", machine_uuid.as_str());
        }
        self.hdds = self.read_hdds();
        tracing::info!(path = %vdi_path.display(), uuid = %disk_uuid, "assigned hard disk");
        Ok(disk_uuid)
    }

    /// Move `StorageControllers` between the pre- and post-1.17 layout.
    fn relocate_storage(&mut self, to: &'static Schema) {
        if self.schema.storage_under_hardware == to.storage_under_hardware {
            return;
        }
        let from = if self.schema.storage_under_hardware {
            &HARDWARE_STORAGE
        } else {
            &LEGACY_STORAGE
        };
        let Some(storage) = self.doc.find(from).cloned() else {
            return;
        };
        self.doc.remove_all(from);
        let parent = if to.storage_under_hardware {
            self.hardware_mut()
        } else {
            self.machine_mut()
        };
        if let Some(parent) = parent {
            parent.append(storage);
        }
    }
}

/// Make sure the single `Hardware` node carries a UUID, copying the machine
/// UUID when it is missing.
fn ensure_hardware_uuid(doc: &mut Document) -> Result<()> {
    let count = doc.select(&HARDWARE).len();
    if count != 1 {
        return Err(Error::malformed(format!(
            "expected exactly one <Hardware> element, found {}",
            count
        )));
    }
    let machine_uuid = doc
        .find(&MACHINE)
        .and_then(|m| m.attr("uuid"))
        .ok_or_else(|| Error::malformed("<Machine> has no uuid"))?
        .to_string();
    if let Some(hardware) = doc.find_mut(&HARDWARE) {
        if !hardware.has_attr("uuid") {
            hardware.set_attr("uuid", machine_uuid);
        }
    }
    Ok(())
}

/// Bus of a storage controller: its name first, then its chipset type.
fn controller_bus(controller: &Element) -> Option<BusType> {
    let by_name = controller
        .attr("name")
        .and_then(|name| name.split_whitespace().next())
        .and_then(BusType::from_name);
    by_name.or_else(|| match controller.attr("type")? {
        "PIIX3" | "PIIX4" | "ICH6" => Some(BusType::Ide),
        "AHCI" => Some(BusType::Sata),
        "LsiLogic" | "BusLogic" | "LsiLogicSas" => Some(BusType::Scsi),
        "NVMe" => Some(BusType::Nvme),
        _ => None,
    })
}

fn bool_attr(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

impl VirtualizationConfiguration for VirtualBoxConfig {
    fn virtualizer(&self) -> &'static Virtualizer {
        &VIRTUALBOX
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn os(&self) -> Option<&OperatingSystem> {
        self.os.as_ref()
    }

    fn hdds(&self) -> &[HardDisk] {
        &self.hdds
    }

    fn is_machine_snapshot(&self) -> bool {
        self.is_snapshot
    }

    fn option_groups(&self) -> &[ConfigurableOptionGroup] {
        &self.option_groups
    }

    fn set_display_name(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let Some(machine) = self.machine_mut() else {
            return false;
        };
        machine.set_attr("name", name);
        self.display_name = name.to_string();
        true
    }

    fn set_os(&mut self, os: &OperatingSystem) -> bool {
        let Some(native) = os.native_id(VIRTUALBOX.id) else {
            return false;
        };
        let native = native.to_string();
        let Some(machine) = self.machine_mut() else {
            return false;
        };
        machine.set_attr("OSType", native);
        self.os = Some(os.clone());
        true
    }

    fn add_hdd(&mut self, path: &str) -> bool {
        let changed = match self.attached_disks().into_iter().next() {
            Some((uuid, _)) => {
                let mut updated = 0;
                self.doc.for_each_mut(&REGISTERED_DISKS, |disk| {
                    if disk.attr("uuid").is_some_and(|u| u.eq_ignore_ascii_case(&uuid)) {
                        disk.set_attr("location", path);
                        updated += 1;
                    }
                });
                updated > 0
            }
            None => self.attach_new_disk(&braced(&Uuid::new_v4()), path),
        };
        self.hdds = self.read_hdds();
        changed
    }

    /// # Panics
    ///
    /// Panics if `index` is 4 or larger (two IDE channels, two units each).
    fn add_cdrom(&mut self, index: usize, path: Option<&str>) -> bool {
        assert!(index < 4, "CD-ROM index {} out of range", index);
        let image = match path {
            Some(path) => match self.register_image("DVDImages", path) {
                Some(uuid) => Some(uuid),
                None => return false,
            },
            None => None,
        };

        let is_ide = |c: &Element| controller_bus(c) == Some(BusType::Ide);
        let template = Element::new("StorageController")
            .with_attr("name", "IDE")
            .with_attr("type", "PIIX4")
            .with_attr("PortCount", "2")
            .with_attr("useHostIOCache", "true")
            .with_attr("Bootable", "true");
        let Some(controller) = self.ensure_controller(&is_ide, template) else {
            return false;
        };

        let mut attached = Element::new("AttachedDevice")
            .with_attr("passthrough", "false")
            .with_attr("type", "DVD");
        if let Some(uuid) = image {
            attached.append(Element::new("Image").with_attr("uuid", uuid));
        }
        self.attach_device(&controller, (index / 2) as u32, (index % 2) as u32, attached)
    }

    /// VirtualBox has no per-drive write protection; `read_only` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `index` is 2 or larger.
    fn add_floppy(&mut self, index: usize, path: Option<&str>, read_only: bool) -> bool {
        assert!(index < 2, "floppy index {} out of range", index);
        if read_only {
            tracing::debug!(index, "VirtualBox floppies cannot be read-only; attaching writable");
        }
        let image = match path {
            Some(path) => match self.register_image("FloppyImages", path) {
                Some(uuid) => Some(uuid),
                None => return false,
            },
            None => None,
        };

        let is_floppy = |c: &Element| c.attr("type") == Some("I82078");
        let template = Element::new("StorageController")
            .with_attr("name", "Floppy")
            .with_attr("type", "I82078")
            .with_attr("PortCount", "1")
            .with_attr("useHostIOCache", "true")
            .with_attr("Bootable", "true");
        let Some(controller) = self.ensure_controller(&is_floppy, template) else {
            return false;
        };

        let mut attached = Element::new("AttachedDevice").with_attr("type", "Floppy");
        if let Some(uuid) = image {
            attached.append(Element::new("Image").with_attr("uuid", uuid));
        }
        self.attach_device(&controller, 0, index as u32, attached)
    }

    fn add_cpu_core_count(&mut self, cores: u32) -> bool {
        if cores == 0 {
            return false;
        }
        let Some(hardware) = self.hardware_mut() else {
            return false;
        };
        hardware.child_or_insert("CPU").set_attr("count", cores.to_string());
        true
    }

    fn add_ram(&mut self, mb: u32) -> bool {
        if mb == 0 {
            return false;
        }
        let Some(hardware) = self.hardware_mut() else {
            return false;
        };
        hardware.child_or_insert("Memory").set_attr("RAMSize", mb.to_string());
        true
    }

    /// # Panics
    ///
    /// Panics if `index` is 8 or larger.
    fn add_ethernet(&mut self, index: usize, kind: EtherType) -> bool {
        assert!(index < MAX_ADAPTERS, "ethernet index {} out of range", index);
        let Some(adapter) = self.adapter_or_insert(index) else {
            return false;
        };
        adapter.set_attr("enabled", "true");
        adapter.set_attr("cable", "true");
        if !adapter.has_attr("type") {
            adapter.set_attr("type", "82540EM");
        }
        adapter.remove_children_where(|child| ATTACHMENT_KINDS.contains(&child.name.as_str()));
        let attachment = match kind {
            EtherType::Nat => "NAT",
            EtherType::Bridged => "BridgedInterface",
            EtherType::HostOnly => "HostOnlyInterface",
        };
        adapter.append(Element::new(attachment));
        true
    }

    fn sound_card(&self) -> SoundCardType {
        let Some(audio) = self.hardware().and_then(|h| h.child("AudioAdapter")) else {
            return SoundCardType::None;
        };
        if audio.attr("enabled") != Some("true") {
            return SoundCardType::None;
        }
        match audio.attr("controller") {
            None => SoundCardType::Default,
            Some(controller) => SOUND_CONTROLLERS
                .iter()
                .find(|(_, name)| name.eq_ignore_ascii_case(controller))
                .map(|(card, _)| *card)
                .unwrap_or(SoundCardType::Default),
        }
    }

    fn set_sound_card(&mut self, card: SoundCardType) -> bool {
        let controller = match card {
            SoundCardType::None | SoundCardType::Default => None,
            other => match SOUND_CONTROLLERS.iter().find(|(c, _)| *c == other) {
                Some((_, name)) => Some(*name),
                None => return false,
            },
        };
        let Some(hardware) = self.hardware_mut() else {
            return false;
        };
        let audio = hardware.child_or_insert("AudioAdapter");
        audio.set_attr("enabled", bool_attr(card != SoundCardType::None));
        match controller {
            Some(name) => audio.set_attr("controller", name),
            None if card == SoundCardType::Default => {
                audio.remove_attr("controller");
            }
            None => {}
        }
        select_option(&mut self.option_groups, OptionGroupId::SoundCard, card.id());
        true
    }

    fn acceleration_3d(&self) -> Acceleration3d {
        let enabled = self
            .hardware()
            .and_then(|h| h.child("Display"))
            .and_then(|d| d.attr("accelerate3D"))
            == Some("true");
        if enabled {
            Acceleration3d::On
        } else {
            Acceleration3d::Off
        }
    }

    fn set_acceleration_3d(&mut self, acceleration: Acceleration3d) -> bool {
        let Some(hardware) = self.hardware_mut() else {
            return false;
        };
        hardware
            .child_or_insert("Display")
            .set_attr("accelerate3D", bool_attr(acceleration == Acceleration3d::On));
        select_option(&mut self.option_groups, OptionGroupId::Acceleration3d, acceleration.id());
        true
    }

    /// The settings-file format version.
    fn virtualizer_version(&self) -> Option<Version> {
        Some(self.schema.version)
    }

    fn set_virtualizer_version(&mut self, version: Version) -> bool {
        let Some(target) = SCHEMAS.iter().find(|s| s.version == version) else {
            return false;
        };
        let suffix = self
            .doc
            .root
            .attr("version")
            .and_then(|v| v.split_once('-'))
            .map(|(_, suffix)| format!("-{}", suffix))
            .unwrap_or_default();
        self.relocate_storage(target);
        self.doc
            .root
            .set_attr("version", format!("{}{}", target.version, suffix));
        self.schema = target;
        select_option(&mut self.option_groups, OptionGroupId::HwVersion, &version.to_string());
        true
    }

    fn ethernet_model(&self, index: usize) -> Option<EthernetModel> {
        let adapter = self.adapter(index)?;
        if adapter.attr("enabled") != Some("true") {
            return None;
        }
        match adapter.attr("type") {
            None => Some(EthernetModel::Auto),
            Some(kind) => ADAPTER_TYPES
                .iter()
                .find(|(_, name, aliases)| *name == kind || aliases.contains(&kind))
                .map(|(model, _, _)| *model),
        }
    }

    /// # Panics
    ///
    /// Panics if `index` is 8 or larger.
    fn set_ethernet_model(&mut self, index: usize, model: EthernetModel) -> bool {
        assert!(index < MAX_ADAPTERS, "ethernet index {} out of range", index);
        let kind = match model {
            EthernetModel::Auto => None,
            other => match ADAPTER_TYPES.iter().find(|(m, _, _)| *m == other) {
                Some((_, name, _)) => Some(*name),
                None => return false,
            },
        };
        let Some(adapter) = self.adapter_or_insert(index) else {
            return false;
        };
        match kind {
            Some(name) => adapter.set_attr("type", name),
            None => {
                adapter.remove_attr("type");
            }
        }
        if index == 0 {
            select_option(&mut self.option_groups, OptionGroupId::EthernetModel, model.id());
        }
        true
    }

    fn usb_speed(&self) -> UsbSpeed {
        let Some(controllers) = self
            .hardware()
            .and_then(|h| h.child("USB"))
            .and_then(|usb| usb.child("Controllers"))
        else {
            return UsbSpeed::None;
        };
        controllers
            .children_named("Controller")
            .filter_map(|c| {
                let kind = c.attr("type")?;
                USB_CONTROLLERS
                    .iter()
                    .find(|(_, name)| name.eq_ignore_ascii_case(kind))
                    .map(|(speed, _)| *speed)
            })
            .max()
            .unwrap_or(UsbSpeed::None)
    }

    fn set_usb_speed(&mut self, speed: UsbSpeed) -> bool {
        let wanted: &[&str] = match speed {
            UsbSpeed::None => &[],
            UsbSpeed::Usb1 => &["OHCI"],
            UsbSpeed::Usb2 => &["OHCI", "EHCI"],
            UsbSpeed::Usb3 => &["XHCI"],
        };
        let Some(hardware) = self.hardware_mut() else {
            return false;
        };
        let controllers = hardware.child_or_insert("USB").child_or_insert("Controllers");
        controllers.remove_children_where(|c| c.name == "Controller");
        for kind in wanted {
            controllers.append(
                Element::new("Controller")
                    .with_attr("name", *kind)
                    .with_attr("type", *kind),
            );
        }
        select_option(&mut self.option_groups, OptionGroupId::UsbSpeed, speed.id());
        true
    }

    fn transform_privacy(&mut self) {
        let cleared = self
            .doc
            .for_each_mut(&MEDIA_LOCATIONS, |medium| medium.set_attr("location", ""));
        self.hdds = self.read_hdds();
        tracing::debug!(cleared, "cleared media locations");
    }

    fn transform_editable(&mut self) {
        self.set_extra_data("GUI/AutoresizeGuest", "false");
        let slots: Vec<usize> = self
            .doc
            .find_all(&ADAPTERS)
            .iter()
            .filter_map(|a| a.attr("slot")?.parse::<usize>().ok())
            .filter(|slot| *slot != 0)
            .collect();
        for slot in slots {
            if let Some(adapter) = self.adapter_mut(slot) {
                adapter.set_attr("enabled", "false");
            }
        }
        if let Some(hardware) = self.hardware_mut() {
            hardware.remove_children_where(|child| child.name == "Boot");
        }
    }

    fn transform_non_persistent(&mut self) {
        self.set_extra_data("GUI/RestrictedCloseActions", "SaveState,PowerOffRestoringSnapshot,Detach");
        self.set_extra_data("GUI/RestrictedRuntimeMachineMenuActions", "SaveState,Pause");
        self.set_extra_data("GUI/PreventSnapshotOperations", "true");
    }

    fn validate(&self) -> Result<()> {
        if let Err(e) = self.schema.validate(&self.doc) {
            if self.unresolved_placeholders().is_empty() {
                return Err(e);
            }
        }
        let count = self.doc.select(&HARDWARE).len();
        if count != 1 {
            return Err(Error::malformed(format!(
                "expected exactly one <Hardware> element, found {}",
                count
            )));
        }
        Ok(())
    }

    fn definition_bytes(&self) -> Result<Vec<u8>> {
        self.doc.to_bytes()
    }

    fn filtered_definition_bytes(&self) -> Result<Vec<u8>> {
        let mut doc = self.doc.clone();
        Self::prune_blacklist(&mut doc);
        doc.for_each_mut(&MEDIA_LOCATIONS, |medium| medium.set_attr("location", ""));
        doc.to_bytes()
    }
}
