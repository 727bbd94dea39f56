//! QEMU/KVM codec for libvirt domain XML.
//!
//! Devices are addressed by ordinal position within their kind: the second
//! CD-ROM is the second `<disk device="cdrom">` under `<devices>`. Setting a
//! device that does not exist yet appends one with default attributes.

pub mod domain;
pub mod machine;

use crate::catalog::{is_64bit_arch, OperatingSystem, ParseContext};
use crate::config::VirtualizationConfiguration;
use crate::error::{Error, Result};
use crate::model::{
    select_option, Acceleration3d, BusType, ConfigurableOptionGroup, EtherType, EthernetModel,
    HardDisk, OptionGroupId, SoundCardType, UsbSpeed, Version, Virtualizer, QEMU,
};
use crate::xml::{Document, Element, Query};
use domain::DiskDevice;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub use domain::create_alphabetical_device_name;

const LIBOSINFO_NS: &str = "http://libosinfo.org/xmlns/libvirt/domain/1.0";

static SOUND_MODELS: Lazy<HashMap<SoundCardType, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (SoundCardType::Default, "ich9"),
        (SoundCardType::SoundBlaster, "sb16"),
        (SoundCardType::Es1371, "es1370"),
        (SoundCardType::HdAudio, "ich6"),
        (SoundCardType::Ac97, "ac97"),
    ])
});

static NIC_MODELS: Lazy<HashMap<EthernetModel, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (EthernetModel::PcNet32, "pcnet"),
        (EthernetModel::E1000, "e1000"),
        (EthernetModel::E1000e, "e1000e"),
        (EthernetModel::Vmxnet3, "vmxnet3"),
        (EthernetModel::Virtio, "virtio"),
        (EthernetModel::Rtl8139, "rtl8139"),
    ])
});

/// USB controller model and its speed rank per normalized speed.
static USB_MODELS: Lazy<HashMap<UsbSpeed, (&'static str, u8)>> = Lazy::new(|| {
    HashMap::from([
        (UsbSpeed::None, ("none", 0)),
        (UsbSpeed::Usb1, ("piix3-uhci", 1)),
        (UsbSpeed::Usb2, ("ich9-ehci1", 2)),
        (UsbSpeed::Usb3, ("qemu-xhci", 3)),
    ])
});

/// Models recognized when reading, beyond the ones written.
static USB_MODEL_RANKS: Lazy<HashMap<&'static str, u8>> = Lazy::new(|| {
    let mut ranks: HashMap<&'static str, u8> = USB_MODELS.values().copied().collect();
    ranks.extend([
        ("piix4-uhci", 1),
        ("ich9-uhci1", 1),
        ("pci-ohci", 1),
        ("ehci", 2),
        ("nec-xhci", 3),
    ]);
    ranks
});

static DOMAIN_UUID: Lazy<Query> = Lazy::new(|| query("/domain/uuid"));
/// Disk sources, including those nested in backing chains.
static DISK_SOURCES: Lazy<Query> = Lazy::new(|| query("/domain/devices/disk//source"));
static INTERFACE_MACS: Lazy<Query> = Lazy::new(|| query("/domain/devices/interface/mac"));
static EMULATOR: Lazy<Query> = Lazy::new(|| query("/domain/devices/emulator"));
static BOOT_HINTS: Lazy<Query> = Lazy::new(|| query("//boot"));
static OS_TYPE: Lazy<Query> = Lazy::new(|| query("/domain/os/type"));
static VIDEO_ACCELERATION: Lazy<Query> =
    Lazy::new(|| query("/domain/devices/video/model/acceleration"));
/// An empty `<backingStore/>` terminates a chain and carries no type.
static BACKING_STORES: Lazy<Query> =
    Lazy::new(|| query("/domain/devices/disk/backingStore[@type]"));

fn query(path: &str) -> Query {
    Query::parse(path).expect("Invalid query")
}

/// Parsed libvirt domain.
#[derive(Debug, Clone)]
pub struct QemuConfig {
    doc: Document,
    display_name: String,
    os: Option<OperatingSystem>,
    hdds: Vec<HardDisk>,
    option_groups: Vec<ConfigurableOptionGroup>,
}

impl QemuConfig {
    pub fn parse_file(path: &Path, ctx: &ParseContext) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::io(e, path))?;
        Self::parse(&data, ctx)
    }

    pub fn parse(data: &[u8], ctx: &ParseContext) -> Result<Self> {
        let doc = Document::parse(data)?;
        if doc.root.name != "domain" {
            return Err(Error::unknown_format(format!(
                "root element <{}> is not <domain>",
                doc.root.name
            )));
        }
        if !doc.root.has_attr("type") {
            return Err(Error::malformed("<domain> has no type attribute"));
        }
        let display_name = doc
            .root
            .child_text("name")
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::malformed("<domain> has no name"))?;
        let os = detect_os(&doc, ctx);

        let mut config = Self {
            doc,
            display_name,
            os,
            hdds: Vec::new(),
            option_groups: Vec::new(),
        };
        config.hdds = config.read_hdds();
        config.option_groups = config.build_option_groups();

        tracing::debug!(
            display_name = %config.display_name,
            disks = config.hdds.len(),
            os = config.os.as_ref().map(|o| o.name.as_str()),
            "parsed libvirt domain"
        );
        Ok(config)
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// The libosinfo identifier from the domain metadata, if any.
    pub fn osinfo_id(&self) -> Option<&str> {
        osinfo_id(&self.doc)
    }

    fn read_hdds(&self) -> Vec<HardDisk> {
        let scsi_models: HashMap<String, String> = domain::controllers(&self.doc, "scsi")
            .filter_map(|c| {
                Some((
                    c.attr("index").unwrap_or("0").to_string(),
                    c.attr("model")?.to_string(),
                ))
            })
            .collect();

        domain::disks(&self.doc, DiskDevice::Disk)
            .into_iter()
            .filter_map(|disk| {
                let bus_name = domain::target_bus(disk).unwrap_or("virtio");
                let (bus, driver) = match bus_name {
                    "virtio" => (BusType::Scsi, Some("virtio".to_string())),
                    "scsi" => {
                        let controller = disk
                            .child("address")
                            .and_then(|a| a.attr("controller"))
                            .unwrap_or("0");
                        (BusType::Scsi, scsi_models.get(controller).cloned())
                    }
                    other => (BusType::from_name(other)?, None),
                };
                let source = domain::disk_source(disk).unwrap_or_default();
                Some(HardDisk::new(driver, bus, source))
            })
            .collect()
    }

    fn build_option_groups(&self) -> Vec<ConfigurableOptionGroup> {
        let sound_ids = SoundCardType::ALL
            .iter()
            .filter(|card| **card == SoundCardType::None || SOUND_MODELS.contains_key(*card))
            .map(|card| card.id());
        let mut groups = vec![
            ConfigurableOptionGroup::new(
                OptionGroupId::HwVersion,
                QEMU.supported_versions.iter().map(Version::to_string),
            ),
            ConfigurableOptionGroup::new(OptionGroupId::SoundCard, sound_ids),
            ConfigurableOptionGroup::new(
                OptionGroupId::Acceleration3d,
                [Acceleration3d::Off.id(), Acceleration3d::On.id()],
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::EthernetModel,
                EthernetModel::ALL
                    .iter()
                    .filter(|m| **m == EthernetModel::Auto || NIC_MODELS.contains_key(*m))
                    .map(|m| m.id()),
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::UsbSpeed,
                UsbSpeed::ALL.iter().map(|speed| speed.id()),
            ),
        ];

        if let Some(version) = self.virtualizer_version() {
            select_option(&mut groups, OptionGroupId::HwVersion, &version.to_string());
        }
        select_option(&mut groups, OptionGroupId::SoundCard, self.sound_card().id());
        select_option(&mut groups, OptionGroupId::Acceleration3d, self.acceleration_3d().id());
        if let Some(model) = self.ethernet_model(0) {
            select_option(&mut groups, OptionGroupId::EthernetModel, model.id());
        }
        select_option(&mut groups, OptionGroupId::UsbSpeed, self.usb_speed().id());
        groups
    }

    /// Update the `index`-th disk of `kind`, appending disks up to it.
    fn upsert_disk(&mut self, kind: DiskDevice, index: usize, path: Option<&str>) -> Result<&mut Element> {
        if index >= domain::MAX_DEVICE_INDEX {
            return Err(Error::invalid_argument(format!(
                "{} index {} out of range",
                kind.as_str(),
                index
            )));
        }
        let existing = domain::disks(&self.doc, kind).len();
        for position in existing..=index {
            domain::append_disk(&mut self.doc, kind, position, None)?;
        }
        let disk = domain::nth_device_mut(&mut self.doc, index, domain::is_disk_of(kind))
            .ok_or_else(|| Error::malformed(format!("no {} at index {}", kind.as_str(), index)))?;
        domain::set_disk_source(disk, path);
        Ok(disk)
    }

    fn interface_mut(&mut self, index: usize) -> Option<&mut Element> {
        domain::nth_device_mut(&mut self.doc, index, domain::is_interface)
    }

    fn interface(&self, index: usize) -> Option<&Element> {
        domain::devices(&self.doc)?
            .children_named("interface")
            .nth(index)
    }

    fn set_osinfo_id(&mut self, id: &str) {
        if !self.doc.root.has_attr("xmlns:libosinfo") {
            self.doc.root.set_attr("xmlns:libosinfo", LIBOSINFO_NS);
        }
        self.doc
            .root
            .child_or_insert("metadata")
            .child_or_insert("libosinfo:libosinfo")
            .child_or_insert("libosinfo:os")
            .set_attr("id", id);
    }
}

/// `<metadata><libosinfo:libosinfo><libosinfo:os id="..."/>`.
fn osinfo_id(doc: &Document) -> Option<&str> {
    doc.root
        .child("metadata")?
        .elements()
        .flat_map(|section| section.elements())
        .find(|e| e.name == "os" || e.name.ends_with(":os"))
        .and_then(|os| os.attr("id"))
}

/// Exact catalog match on the libosinfo id first, then a name match among
/// catalog entries with the domain's bitness.
fn detect_os(doc: &Document, ctx: &ParseContext) -> Option<OperatingSystem> {
    let id = osinfo_id(doc)?;
    if let Some(os) = ctx.catalog.find_by_native_id(QEMU.id, id) {
        return Some(os.clone());
    }
    let info = ctx.osinfo.lookup(id)?;
    let arch = doc
        .find(&OS_TYPE)
        .and_then(|t| t.attr("arch"))
        .unwrap_or("x86_64");
    let found = ctx.catalog.closest_by_name(&info.name, is_64bit_arch(arch)).cloned();
    tracing::debug!(
        osinfo = id,
        name = %info.name,
        matched = found.as_ref().map(|o| o.name.as_str()),
        "resolved OS by fingerprint"
    );
    found
}

impl VirtualizationConfiguration for QemuConfig {
    fn virtualizer(&self) -> &'static Virtualizer {
        &QEMU
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

    /// A disk with a backing store is an overlay on top of a snapshot.
    fn is_machine_snapshot(&self) -> bool {
        self.doc.find(&BACKING_STORES).is_some()
    }

    fn option_groups(&self) -> &[ConfigurableOptionGroup] {
        &self.option_groups
    }

    fn set_display_name(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        self.doc.root.child_or_insert("name").set_text(name);
        self.display_name = name.to_string();
        true
    }

    fn set_os(&mut self, os: &OperatingSystem) -> bool {
        let Some(native) = os.native_id(QEMU.id) else {
            return false;
        };
        self.set_osinfo_id(native);
        self.os = Some(os.clone());
        true
    }

    fn add_hdd(&mut self, path: &str) -> bool {
        let result = self.upsert_disk(DiskDevice::Disk, 0, Some(path)).map(|disk| {
            let driver = disk.child_or_insert("driver");
            driver.set_attr("name", "qemu");
        });
        self.hdds = self.read_hdds();
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "cannot add hard disk");
                false
            }
        }
    }

    fn add_cdrom(&mut self, index: usize, path: Option<&str>) -> bool {
        match self.upsert_disk(DiskDevice::Cdrom, index, path) {
            Ok(disk) => {
                domain::set_readonly(disk, true);
                true
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "cannot add CD-ROM");
                false
            }
        }
    }

    fn add_floppy(&mut self, index: usize, path: Option<&str>, read_only: bool) -> bool {
        match self.upsert_disk(DiskDevice::Floppy, index, path) {
            Ok(disk) => {
                domain::set_readonly(disk, read_only);
                true
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "cannot add floppy");
                false
            }
        }
    }

    fn add_cpu_core_count(&mut self, cores: u32) -> bool {
        if cores == 0 {
            return false;
        }
        let vcpu = self.doc.root.child_or_insert("vcpu");
        vcpu.set_text(cores.to_string());
        if !vcpu.has_attr("placement") {
            vcpu.set_attr("placement", "static");
        }
        true
    }

    fn add_ram(&mut self, mb: u32) -> bool {
        if mb == 0 {
            return false;
        }
        let kib = (u64::from(mb) * 1024).to_string();
        let has_current = self.doc.root.child("currentMemory").is_some();
        let names: &[&str] = if has_current {
            &["memory", "currentMemory"]
        } else {
            &["memory"]
        };
        for name in names {
            let element = self.doc.root.child_or_insert(name);
            element.set_attr("unit", "KiB");
            element.set_text(kib.as_str());
        }
        true
    }

    fn add_ethernet(&mut self, index: usize, kind: EtherType) -> bool {
        let (kind_attr, source_attr, source_value) = match kind {
            EtherType::Nat => ("network", "network", "default"),
            EtherType::Bridged => ("bridge", "bridge", "br0"),
            EtherType::HostOnly => ("network", "network", "hostonly"),
        };
        let existing = domain::devices(&self.doc)
            .map(|d| d.children_named("interface").count())
            .unwrap_or(0);
        for _ in existing..=index {
            let mut interface = Element::new("interface").with_attr("type", kind_attr);
            interface.append(Element::new("model").with_attr("type", "virtio"));
            domain::devices_mut(&mut self.doc).append(interface);
        }
        let Some(interface) = self.interface_mut(index) else {
            return false;
        };
        interface.set_attr("type", kind_attr);
        let source = interface.child_or_insert("source");
        source.attributes.clear();
        source.set_attr(source_attr, source_value);
        true
    }

    fn sound_card(&self) -> SoundCardType {
        let Some(sound) = domain::devices(&self.doc).and_then(|d| d.child("sound")) else {
            return SoundCardType::None;
        };
        let model = sound.attr("model").unwrap_or_default();
        SOUND_MODELS
            .iter()
            .find(|(_, name)| **name == model)
            .map(|(card, _)| *card)
            .unwrap_or(SoundCardType::Default)
    }

    fn set_sound_card(&mut self, card: SoundCardType) -> bool {
        if card == SoundCardType::None {
            domain::devices_mut(&mut self.doc).remove_children_where(|e| e.name == "sound");
        } else {
            let Some(model) = SOUND_MODELS.get(&card) else {
                return false;
            };
            domain::device_or_insert(&mut self.doc, "sound").set_attr("model", *model);
        }
        select_option(&mut self.option_groups, OptionGroupId::SoundCard, card.id());
        true
    }

    fn acceleration_3d(&self) -> Acceleration3d {
        match self.doc.find(&VIDEO_ACCELERATION).and_then(|a| a.attr("accel3d")) {
            Some("yes") => Acceleration3d::On,
            _ => Acceleration3d::Off,
        }
    }

    fn set_acceleration_3d(&mut self, acceleration: Acceleration3d) -> bool {
        let model = domain::device_or_insert(&mut self.doc, "video").child_or_insert("model");
        if !model.has_attr("type") {
            model.set_attr("type", "virtio");
        }
        let enabled = if acceleration == Acceleration3d::On { "yes" } else { "no" };
        model.child_or_insert("acceleration").set_attr("accel3d", enabled);
        select_option(&mut self.option_groups, OptionGroupId::Acceleration3d, acceleration.id());
        true
    }

    /// QEMU version embedded in the machine type.
    fn virtualizer_version(&self) -> Option<Version> {
        let machine_type = self.doc.find(&OS_TYPE)?.attr("machine")?;
        machine::split(machine_type).map(|(_, version)| version)
    }

    fn set_virtualizer_version(&mut self, version: Version) -> bool {
        if !QEMU.supported_versions.contains(&version) {
            return false;
        }
        let Some(os_type) = self.doc.find_mut(&OS_TYPE) else {
            return false;
        };
        let name = os_type
            .attr("machine")
            .and_then(machine::split)
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| "pc-q35".to_string());
        os_type.set_attr("machine", machine::join(&name, version));
        select_option(&mut self.option_groups, OptionGroupId::HwVersion, &version.to_string());
        true
    }

    fn ethernet_model(&self, index: usize) -> Option<EthernetModel> {
        let interface = self.interface(index)?;
        match interface.child("model").and_then(|m| m.attr("type")) {
            None => Some(EthernetModel::Auto),
            Some(kind) => NIC_MODELS
                .iter()
                .find(|(_, name)| **name == kind)
                .map(|(model, _)| *model),
        }
    }

    fn set_ethernet_model(&mut self, index: usize, model: EthernetModel) -> bool {
        let kind = match model {
            EthernetModel::Auto => None,
            other => match NIC_MODELS.get(&other) {
                Some(name) => Some(*name),
                None => return false,
            },
        };
        let Some(interface) = self.interface_mut(index) else {
            return false;
        };
        match kind {
            Some(name) => interface.child_or_insert("model").set_attr("type", name),
            None => {
                interface.remove_children_where(|c| c.name == "model");
            }
        }
        if index == 0 {
            select_option(&mut self.option_groups, OptionGroupId::EthernetModel, model.id());
        }
        true
    }

    fn usb_speed(&self) -> UsbSpeed {
        let best = domain::controllers(&self.doc, "usb")
            .map(|c| {
                let model = c.attr("model").unwrap_or("piix3-uhci");
                USB_MODEL_RANKS.get(model).copied().unwrap_or(1)
            })
            .max();
        match best {
            None => UsbSpeed::None,
            Some(rank) => USB_MODELS
                .iter()
                .find(|(_, (_, r))| *r == rank)
                .map(|(speed, _)| *speed)
                .unwrap_or(UsbSpeed::None),
        }
    }

    fn set_usb_speed(&mut self, speed: UsbSpeed) -> bool {
        let Some((model, _)) = USB_MODELS.get(&speed).copied() else {
            return false;
        };
        let devices = domain::devices_mut(&mut self.doc);
        devices.remove_children_where(|e| e.name == "controller" && e.attr("type") == Some("usb"));
        devices.append(
            Element::new("controller")
                .with_attr("type", "usb")
                .with_attr("index", "0")
                .with_attr("model", model),
        );
        select_option(&mut self.option_groups, OptionGroupId::UsbSpeed, speed.id());
        true
    }

    fn transform_privacy(&mut self) {
        let removed = self.doc.remove_all(&DISK_SOURCES);
        self.hdds = self.read_hdds();
        tracing::debug!(removed, "removed disk sources");
    }

    fn transform_editable(&mut self) {
        self.doc.remove_all(&BOOT_HINTS);
        let nics = domain::devices(&self.doc)
            .map(|d| d.children_named("interface").count())
            .unwrap_or(0);
        for index in 1..nics {
            if let Some(interface) = self.interface_mut(index) {
                interface.child_or_insert("link").set_attr("state", "down");
            }
        }
    }

    fn transform_non_persistent(&mut self) {
        let pm = self.doc.root.child_or_insert("pm");
        pm.child_or_insert("suspend-to-mem").set_attr("enabled", "no");
        pm.child_or_insert("suspend-to-disk").set_attr("enabled", "no");
    }

    fn validate(&self) -> Result<()> {
        if self.doc.root.name != "domain" {
            return Err(Error::malformed("root element is not <domain>"));
        }
        if !self.doc.root.has_attr("type") {
            return Err(Error::malformed("<domain> has no type attribute"));
        }
        let has_name = self
            .doc
            .root
            .child_text("name")
            .is_some_and(|name| !name.trim().is_empty());
        if !has_name {
            return Err(Error::malformed("<domain> has no name"));
        }
        Ok(())
    }

    fn definition_bytes(&self) -> Result<Vec<u8>> {
        self.doc.to_bytes()
    }

    /// Drops the domain UUID, disk sources, MAC addresses and the emulator
    /// path.
    fn filtered_definition_bytes(&self) -> Result<Vec<u8>> {
        let mut doc = self.doc.clone();
        for query in [&*DOMAIN_UUID, &*DISK_SOURCES, &*INTERFACE_MACS, &*EMULATOR] {
            doc.remove_all(query);
        }
        doc.to_bytes()
    }
}
