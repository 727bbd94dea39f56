//! VMware `.vmx` configuration codec.
//!
//! A `.vmx` file is a flat list of `key = "value"` lines. Values escape `"` as
//! `|22` and `|` as `|7C`. Keys are case-insensitive; their order is kept so a
//! full dump reproduces the file's layout.

mod charset;
mod entries;

pub use charset::Charset;
pub use entries::{Entries, Entry};

use crate::catalog::{OperatingSystem, ParseContext};
use crate::config::VirtualizationConfiguration;
use crate::error::{Error, Result};
use crate::model::{
    select_option, Acceleration3d, BusType, ConfigurableOptionGroup, EtherType, EthernetModel,
    HardDisk, OptionGroupId, SoundCardType, UsbSpeed, Version, Virtualizer, VMWARE,
};
use entries::is_true_value;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Only this many bytes of a `.vmx` file are read.
pub const MAX_CONFIG_SIZE: usize = 100_000;

/// Keys of which at least one appears in every `.vmx` file.
const SIGNATURE_KEYS: [&str; 2] = ["virtualHW.version", "memsize"];

/// Highest ethernet adapter index VMware accepts.
const MAX_ETHERNET: usize = 10;

static QUOTED_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*([^\s#="]+)\s*=\s*"(.*)"\s*$"#).expect("Invalid regex: QUOTED_LINE")
});

static BARE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*([^\s#="]+)\s*=\s*([^"]*?)\s*$"#).expect("Invalid regex: BARE_LINE")
});

static HDD_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(ide|scsi|sata|nvme)(\d+)(?::(\d+))?\.(.+)$").expect("Invalid regex: HDD_KEY")
});

static STORAGE_FILE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^((ide|scsi|sata|nvme)\d+:\d+|floppy\d+)\.filename$")
        .expect("Invalid regex: STORAGE_FILE_KEY")
});

static SNAPSHOT_DISK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)-\d{6}\.vmdk$").expect("Invalid regex: SNAPSHOT_DISK"));

/// Keys that are safe to keep in a filtered export.
static FILTER_ALLOW_LIST: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)^\.encoding$",
        r"(?i)^config\.version$",
        r"(?i)^virtualhw\.",
        r"(?i)^guestos$",
        r"(?i)^numvcpus$",
        r"(?i)^cpuid\.coresPerSocket$",
        r"(?i)^memsize$",
        r"(?i)^firmware$",
        r"(?i)^uefi\.",
        r"(?i)^sound[.:]",
        r"(?i)^usb[.:]",
        r"(?i)^ehci[.:]",
        r"(?i)^usb_xhci[.:]",
        r"(?i)^mks\.enable3d$",
        r"(?i)^svga\.",
        r"(?i)^pcibridge",
        r"(?i)\.pcislotnumber$",
        r"(?i)\.virtualdev$",
        r"(?i)\.devicetype$",
        r"(?i)\.present$",
        r"(?i)^tools\.synctime$",
        r"(?i)^time\.synchronize\.",
        r"(?i)^hpet\d+\.present$",
        r"(?i)^vhv\.enable$",
    ])
    .expect("Invalid regex set: FILTER_ALLOW_LIST")
});

static SOUND_MODELS: &[(SoundCardType, &str)] = &[
    (SoundCardType::SoundBlaster, "sb16"),
    (SoundCardType::Es1371, "es1371"),
    (SoundCardType::HdAudio, "hdaudio"),
];

static ETHERNET_MODELS: &[(EthernetModel, &str)] = &[
    (EthernetModel::PcNet32, "vlance"),
    (EthernetModel::E1000, "e1000"),
    (EthernetModel::E1000e, "e1000e"),
    (EthernetModel::Vmxnet, "vmxnet"),
    (EthernetModel::Vmxnet3, "vmxnet3"),
];

static USB_CONTROLLERS: &[(UsbSpeed, &str)] = &[
    (UsbSpeed::Usb1, "usb.present"),
    (UsbSpeed::Usb2, "ehci.present"),
    (UsbSpeed::Usb3, "usb_xhci.present"),
];

/// Escape a value for writing: `|` first, then `"`.
pub fn escape_value(value: &str) -> String {
    value.replace('|', "|7C").replace('"', "|22")
}

/// Inverse of [`escape_value`].
pub fn unescape_value(value: &str) -> String {
    value
        .replace("|22", "\"")
        .replace("|7C", "|")
        .replace("|7c", "|")
}

/// Split a line into key and raw value, trying the quoted form first.
fn match_line(line: &str) -> Option<(String, String)> {
    if let Some(caps) = QUOTED_LINE.captures(line) {
        return Some((caps[1].to_string(), caps[2].to_string()));
    }
    BARE_LINE
        .captures(line)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
}

/// Controller-level properties (`scsi0.present`, `scsi0.virtualDev`).
#[derive(Debug, Default)]
struct ControllerInfo {
    present: Option<bool>,
    virtual_dev: Option<String>,
}

/// Device-level properties (`scsi0:0.present`, `scsi0:0.fileName`).
#[derive(Debug, Default)]
struct DeviceInfo {
    present: bool,
    file_name: Option<String>,
    device_type: Option<String>,
}

/// A hard disk together with the key prefix (`scsi0:0`) it was read from.
#[derive(Debug, Clone)]
struct DiskSlot {
    prefix: String,
    disk: HardDisk,
}

/// Parsed VMware configuration.
#[derive(Debug, Clone)]
pub struct VmwareConfig {
    entries: Entries,
    charset: Charset,
    display_name: String,
    os: Option<OperatingSystem>,
    disks: Vec<DiskSlot>,
    hdds: Vec<HardDisk>,
    is_snapshot: bool,
    option_groups: Vec<ConfigurableOptionGroup>,
}

impl VmwareConfig {
    /// Parse a `.vmx` file.
    pub fn parse_file(path: &Path, ctx: &ParseContext) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let mut data = Vec::new();
        file.take(MAX_CONFIG_SIZE as u64)
            .read_to_end(&mut data)
            .map_err(|e| Error::io(e, path))?;
        Self::parse(&data, ctx)
    }

    /// Parse `.vmx` content. Only the first [`MAX_CONFIG_SIZE`] bytes are read.
    pub fn parse(data: &[u8], ctx: &ParseContext) -> Result<Self> {
        let data = &data[..data.len().min(MAX_CONFIG_SIZE)];
        let charset = detect_charset(data)?;
        let entries = parse_entries(&charset.decode(data));

        let display_name = entries
            .get("displayName")
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::malformed("VMX has no displayName"))?
            .to_string();

        let os = entries
            .get("guestOS")
            .and_then(|id| ctx.catalog.find_by_native_id(VMWARE.id, id))
            .cloned();

        let disks = extract_disks(&entries);
        let hdds = disks.iter().map(|slot| slot.disk.clone()).collect::<Vec<_>>();

        let is_snapshot = entries
            .get("checkpoint.vmState")
            .is_some_and(|state| !state.trim().is_empty())
            || hdds.iter().any(|hdd| SNAPSHOT_DISK.is_match(&hdd.disk_image));

        tracing::debug!(
            display_name = %display_name,
            charset = charset.label(),
            entries = entries.len(),
            disks = hdds.len(),
            "parsed VMX"
        );

        let mut config = Self {
            entries,
            charset,
            display_name,
            os,
            disks,
            hdds,
            is_snapshot,
            option_groups: Vec::new(),
        };
        config.option_groups = config.build_option_groups();
        Ok(config)
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Raw value of `key`, unescaped.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    /// Set a key and mark it as surviving the filtered export.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.set(key, value, true);
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, if value { "TRUE" } else { "FALSE" });
    }

    fn build_option_groups(&self) -> Vec<ConfigurableOptionGroup> {
        let mut groups = vec![
            ConfigurableOptionGroup::new(
                OptionGroupId::HwVersion,
                VMWARE.supported_versions.iter().map(|v| v.major.to_string()),
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::SoundCard,
                [SoundCardType::None, SoundCardType::Default]
                    .iter()
                    .chain(SOUND_MODELS.iter().map(|(card, _)| card))
                    .map(|card| card.id()),
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::Acceleration3d,
                [Acceleration3d::Off.id(), Acceleration3d::On.id()],
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::EthernetModel,
                std::iter::once(EthernetModel::Auto)
                    .chain(ETHERNET_MODELS.iter().map(|(model, _)| *model))
                    .map(|model| model.id()),
            ),
            ConfigurableOptionGroup::new(
                OptionGroupId::UsbSpeed,
                UsbSpeed::ALL.iter().map(|speed| speed.id()),
            ),
        ];

        if let Some(version) = self.virtualizer_version() {
            select_option(&mut groups, OptionGroupId::HwVersion, &version.major.to_string());
        }
        select_option(&mut groups, OptionGroupId::SoundCard, self.sound_card().id());
        select_option(&mut groups, OptionGroupId::Acceleration3d, self.acceleration_3d().id());
        if let Some(model) = self.ethernet_model(0) {
            select_option(&mut groups, OptionGroupId::EthernetModel, model.id());
        }
        select_option(&mut groups, OptionGroupId::UsbSpeed, self.usb_speed().id());
        groups
    }

    fn serialize(&self, only_filtered: bool) -> Vec<u8> {
        let mut out = String::new();
        for entry in self.entries.iter().filter(|e| !only_filtered || e.filtered) {
            out.push_str(&entry.key);
            out.push_str(" = \"");
            out.push_str(&escape_value(&entry.value));
            out.push_str("\"\n");
        }
        self.charset.encode(&out)
    }
}

/// Pass 1: scan as ISO-8859-1 for the `.encoding` key and confirm the file is
/// a VMX at all.
fn detect_charset(data: &[u8]) -> Result<Charset> {
    let text = Charset::Latin1.decode(data);
    let mut label = None;
    let mut is_vmx = false;

    for line in text.lines() {
        let Some((key, value)) = match_line(line) else {
            continue;
        };
        if key.eq_ignore_ascii_case(".encoding") || key.eq_ignore_ascii_case("encoding") {
            label = Some(value);
        } else if SIGNATURE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(&key)) {
            is_vmx = true;
        }
    }

    if !is_vmx {
        return Err(Error::unknown_format("not a VMX file: no virtualHW.version or memsize"));
    }

    Ok(match label {
        Some(label) => Charset::from_label(&label).unwrap_or_else(|| {
            tracing::warn!(encoding = %label, "unknown VMX encoding, assuming legacy charset");
            Charset::LEGACY
        }),
        None => Charset::LEGACY,
    })
}

/// Pass 2: parse decoded text into entries.
fn parse_entries(text: &str) -> Entries {
    let mut entries = Entries::new();
    for line in text.trim_start_matches('\u{feff}').lines() {
        if let Some((key, raw)) = match_line(line) {
            let filtered = FILTER_ALLOW_LIST.is_match(&key);
            entries.set(&key, unescape_value(&raw), filtered);
        }
    }
    entries
}

/// Collect controller and device records, then turn them into hard disks.
///
/// A disk is listed only if its controller and the device are both present
/// and the device type ends in "disk". IDE controllers are implicitly present.
fn extract_disks(entries: &Entries) -> Vec<DiskSlot> {
    let mut controllers: BTreeMap<(String, u32), ControllerInfo> = BTreeMap::new();
    let mut devices: BTreeMap<(String, u32, u32), DeviceInfo> = BTreeMap::new();

    for entry in entries.iter() {
        let Some(caps) = HDD_KEY.captures(&entry.key) else {
            continue;
        };
        let bus = caps[1].to_ascii_lowercase();
        let Ok(controller) = caps[2].parse::<u32>() else {
            continue;
        };
        let property = caps[4].to_ascii_lowercase();

        match caps.get(3).and_then(|m| m.as_str().parse::<u32>().ok()) {
            None => {
                let info = controllers.entry((bus, controller)).or_default();
                match property.as_str() {
                    "present" => info.present = Some(is_true_value(&entry.value)),
                    "virtualdev" => info.virtual_dev = Some(entry.value.clone()),
                    _ => {}
                }
            }
            Some(unit) => {
                let info = devices.entry((bus, controller, unit)).or_default();
                match property.as_str() {
                    "present" => info.present = is_true_value(&entry.value),
                    "filename" => info.file_name = Some(entry.value.clone()),
                    "devicetype" => info.device_type = Some(entry.value.clone()),
                    _ => {}
                }
            }
        }
    }

    let mut disks = Vec::new();
    for ((bus_name, controller, unit), device) in devices {
        let controller_info = controllers.get(&(bus_name.clone(), controller));
        let controller_present = controller_info
            .and_then(|c| c.present)
            .unwrap_or(bus_name == "ide");
        let is_disk = device
            .device_type
            .as_deref()
            .map_or(true, |t| t.to_ascii_lowercase().ends_with("disk"));

        if !controller_present || !device.present || !is_disk {
            continue;
        }
        let (Some(bus), Some(file_name)) = (BusType::from_name(&bus_name), device.file_name) else {
            continue;
        };

        disks.push(DiskSlot {
            prefix: format!("{}{}:{}", bus_name, controller, unit),
            disk: HardDisk::new(
                controller_info.and_then(|c| c.virtual_dev.clone()),
                bus,
                file_name,
            ),
        });
    }
    disks
}

impl VirtualizationConfiguration for VmwareConfig {
    fn virtualizer(&self) -> &'static Virtualizer {
        &VMWARE
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
        self.set("displayName", name);
        self.display_name = name.to_string();
        true
    }

    fn set_os(&mut self, os: &OperatingSystem) -> bool {
        let Some(native) = os.native_id(VMWARE.id) else {
            return false;
        };
        self.set("guestOS", native);
        self.os = Some(os.clone());
        true
    }

    fn add_hdd(&mut self, path: &str) -> bool {
        match self.disks.first_mut() {
            Some(slot) => {
                let key = format!("{}.fileName", slot.prefix);
                slot.disk.disk_image = path.to_string();
                self.entries.set(&key, path, true);
            }
            None => {
                self.set_bool("scsi0.present", true);
                self.set("scsi0.virtualDev", "lsilogic");
                self.set_bool("scsi0:0.present", true);
                self.set("scsi0:0.deviceType", "scsi-hardDisk");
                self.set("scsi0:0.fileName", path);
                self.disks.push(DiskSlot {
                    prefix: "scsi0:0".to_string(),
                    disk: HardDisk::new(Some("lsilogic".to_string()), BusType::Scsi, path),
                });
            }
        }
        self.hdds = self.disks.iter().map(|slot| slot.disk.clone()).collect();
        true
    }

    /// # Panics
    ///
    /// Panics if `index` is not 0 or 1 (the two units of the secondary IDE
    /// channel).
    fn add_cdrom(&mut self, index: usize, path: Option<&str>) -> bool {
        assert!(index < 2, "CD-ROM index {} out of range", index);
        let prefix = format!("ide1:{}", index);
        self.set_bool(&format!("{}.present", prefix), true);
        match path {
            Some(path) => {
                self.set(&format!("{}.deviceType", prefix), "cdrom-image");
                self.set(&format!("{}.fileName", prefix), path);
                self.entries.remove(&format!("{}.autodetect", prefix));
            }
            None => {
                self.set(&format!("{}.deviceType", prefix), "atapi-cdrom");
                self.set(&format!("{}.fileName", prefix), "auto detect");
                self.set_bool(&format!("{}.autodetect", prefix), true);
            }
        }
        true
    }

    /// # Panics
    ///
    /// Panics if `index` is greater than 1.
    fn add_floppy(&mut self, index: usize, path: Option<&str>, read_only: bool) -> bool {
        assert!(index < 2, "floppy index {} out of range", index);
        let prefix = format!("floppy{}", index);
        self.set_bool(&format!("{}.present", prefix), true);
        match path {
            Some(path) => {
                self.set(&format!("{}.fileType", prefix), "file");
                self.set(&format!("{}.fileName", prefix), path);
            }
            None => {
                self.set(&format!("{}.fileType", prefix), "device");
                self.set_bool(&format!("{}.autodetect", prefix), true);
            }
        }
        self.set_bool(&format!("{}.readonly", prefix), read_only);
        true
    }

    fn add_cpu_core_count(&mut self, cores: u32) -> bool {
        if cores == 0 {
            return false;
        }
        self.set("numvcpus", cores.to_string());
        true
    }

    fn add_ram(&mut self, mb: u32) -> bool {
        // VMware requires a multiple of 4 MB.
        let mb = mb / 4 * 4;
        if mb == 0 {
            return false;
        }
        self.set("memsize", mb.to_string());
        true
    }

    /// # Panics
    ///
    /// Panics if `index` is 10 or larger.
    fn add_ethernet(&mut self, index: usize, kind: EtherType) -> bool {
        assert!(index < MAX_ETHERNET, "ethernet index {} out of range", index);
        let prefix = format!("ethernet{}", index);
        let connection = match kind {
            EtherType::Nat => "nat",
            EtherType::Bridged => "bridged",
            EtherType::HostOnly => "hostonly",
        };
        self.set_bool(&format!("{}.present", prefix), true);
        self.set(&format!("{}.connectionType", prefix), connection);
        self.set(&format!("{}.addressType", prefix), "generated");
        true
    }

    fn sound_card(&self) -> SoundCardType {
        if !self.entries.is_true("sound.present") {
            return SoundCardType::None;
        }
        match self.entries.get("sound.virtualDev") {
            None => SoundCardType::Default,
            Some(dev) => SOUND_MODELS
                .iter()
                .find(|(_, name)| name.eq_ignore_ascii_case(dev))
                .map(|(card, _)| *card)
                .unwrap_or(SoundCardType::Default),
        }
    }

    fn set_sound_card(&mut self, card: SoundCardType) -> bool {
        match card {
            SoundCardType::None => self.set_bool("sound.present", false),
            SoundCardType::Default => {
                self.set_bool("sound.present", true);
                self.set_bool("sound.autodetect", true);
                self.entries.remove("sound.virtualDev");
            }
            other => {
                let Some((_, dev)) = SOUND_MODELS.iter().find(|(c, _)| *c == other) else {
                    return false;
                };
                self.set_bool("sound.present", true);
                self.set_bool("sound.autodetect", true);
                self.set("sound.virtualDev", *dev);
            }
        }
        select_option(&mut self.option_groups, OptionGroupId::SoundCard, card.id());
        true
    }

    fn acceleration_3d(&self) -> Acceleration3d {
        if self.entries.is_true("mks.enable3d") {
            Acceleration3d::On
        } else {
            Acceleration3d::Off
        }
    }

    fn set_acceleration_3d(&mut self, acceleration: Acceleration3d) -> bool {
        self.set_bool("mks.enable3d", acceleration == Acceleration3d::On);
        select_option(&mut self.option_groups, OptionGroupId::Acceleration3d, acceleration.id());
        true
    }

    fn virtualizer_version(&self) -> Option<Version> {
        self.entries
            .get("virtualHW.version")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .map(|major| Version::new(major, 0))
    }

    fn set_virtualizer_version(&mut self, version: Version) -> bool {
        if !VMWARE.supported_versions.iter().any(|v| v.major == version.major) {
            return false;
        }
        self.set("virtualHW.version", version.major.to_string());
        select_option(&mut self.option_groups, OptionGroupId::HwVersion, &version.major.to_string());
        true
    }

    fn ethernet_model(&self, index: usize) -> Option<EthernetModel> {
        let prefix = format!("ethernet{}", index);
        if !self.entries.is_true(&format!("{}.present", prefix)) {
            return None;
        }
        match self.entries.get(&format!("{}.virtualDev", prefix)) {
            None => Some(EthernetModel::Auto),
            Some(dev) => ETHERNET_MODELS
                .iter()
                .find(|(_, name)| name.eq_ignore_ascii_case(dev))
                .map(|(model, _)| *model),
        }
    }

    /// # Panics
    ///
    /// Panics if `index` is 10 or larger.
    fn set_ethernet_model(&mut self, index: usize, model: EthernetModel) -> bool {
        assert!(index < MAX_ETHERNET, "ethernet index {} out of range", index);
        let key = format!("ethernet{}.virtualDev", index);
        match model {
            EthernetModel::Auto => {
                self.entries.remove(&key);
            }
            other => {
                let Some((_, dev)) = ETHERNET_MODELS.iter().find(|(m, _)| *m == other) else {
                    return false;
                };
                self.set(&key, *dev);
            }
        }
        if index == 0 {
            select_option(&mut self.option_groups, OptionGroupId::EthernetModel, model.id());
        }
        true
    }

    fn usb_speed(&self) -> UsbSpeed {
        USB_CONTROLLERS
            .iter()
            .filter(|(_, key)| self.entries.is_true(key))
            .map(|(speed, _)| *speed)
            .max()
            .unwrap_or(UsbSpeed::None)
    }

    fn set_usb_speed(&mut self, speed: UsbSpeed) -> bool {
        for (controller_speed, key) in USB_CONTROLLERS {
            self.set_bool(key, *controller_speed <= speed);
        }
        select_option(&mut self.option_groups, OptionGroupId::UsbSpeed, speed.id());
        true
    }

    fn transform_privacy(&mut self) {
        let removed = self
            .entries
            .remove_where(|key| STORAGE_FILE_KEY.is_match(key));
        for slot in &mut self.disks {
            slot.disk.disk_image.clear();
        }
        for hdd in &mut self.hdds {
            hdd.disk_image.clear();
        }
        tracing::debug!(removed, "removed storage file paths from VMX");
    }

    fn transform_editable(&mut self) {
        self.set_bool("gui.applyHostDisplayScalingToGuest", false);
        let secondary_nics = self.entries.keys_where(|key| {
            let key = key.to_ascii_lowercase();
            key.starts_with("ethernet") && !key.starts_with("ethernet0.") && key.ends_with(".present")
        });
        for key in secondary_nics {
            self.set_bool(&key, false);
        }
        self.entries.remove("bios.bootOrder");
        self.entries.remove("bios.hddOrder");
    }

    fn transform_non_persistent(&mut self) {
        self.set_bool("suspend.disabled", true);
        self.set_bool("gui.restricted", true);
        self.set_bool("snapshot.disabled", true);
    }

    fn validate(&self) -> Result<()> {
        if self.display_name.trim().is_empty() {
            return Err(Error::malformed("VMX has no displayName"));
        }
        if !SIGNATURE_KEYS.iter().any(|key| self.entries.contains(key)) {
            return Err(Error::malformed("VMX has neither virtualHW.version nor memsize"));
        }
        Ok(())
    }

    fn definition_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.serialize(false))
    }

    fn filtered_definition_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.serialize(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#".encoding = "UTF-8"
config.version = "8"
virtualHW.version = "19"
displayName = "Test |22VM|22"
guestOS = "ubuntu-64"
memsize = "4096"
numvcpus = "2"
scsi0.present = "TRUE"
scsi0.virtualDev = "lsilogic"
scsi0:0.present = "TRUE"
scsi0:0.fileName = "TestVM.vmdk"
ide1:0.present = "TRUE"
ide1:0.deviceType = "cdrom-image"
ide1:0.fileName = "/isos/ubuntu.iso"
ethernet0.present = "TRUE"
ethernet0.virtualDev = "e1000"
ethernet1.present = "TRUE"
sound.present = "TRUE"
sound.virtualDev = "hdaudio"
usb.present = "TRUE"
ehci.present = "TRUE"
"#;

    fn parse(content: &str) -> VmwareConfig {
        VmwareConfig::parse(content.as_bytes(), &ParseContext::default()).unwrap()
    }

    #[test]
    fn test_escape_order() {
        assert_eq!(escape_value(r#"a|"b"#), "a|7C|22b");
        assert_eq!(unescape_value("a|7C|22b"), r#"a|"b"#);
        assert_eq!(unescape_value(&escape_value("|22")), "|22");
        assert_eq!(unescape_value(&escape_value("|7C")), "|7C");
    }

    #[test]
    fn test_match_line_forms() {
        assert_eq!(
            match_line(r#"  memsize = "2048" "#),
            Some(("memsize".to_string(), "2048".to_string()))
        );
        assert_eq!(
            match_line("memsize=2048"),
            Some(("memsize".to_string(), "2048".to_string()))
        );
        assert_eq!(match_line("# comment = \"x\""), None);
        assert_eq!(match_line("garbage"), None);
    }

    #[test]
    fn test_parse_basic_fields() {
        let config = parse(SAMPLE);
        assert_eq!(config.display_name(), r#"Test "VM""#);
        assert_eq!(config.charset(), Charset::Utf8);
        assert_eq!(config.virtualizer_version(), Some(Version::new(19, 0)));
        assert_eq!(config.sound_card(), SoundCardType::HdAudio);
        assert_eq!(config.usb_speed(), UsbSpeed::Usb2);
        assert_eq!(config.ethernet_model(0), Some(EthernetModel::E1000));
        assert_eq!(config.ethernet_model(1), Some(EthernetModel::Auto));
        assert!(!config.is_machine_snapshot());
    }

    #[test]
    fn test_parse_hdds_skips_cdrom() {
        let config = parse(SAMPLE);
        assert_eq!(config.hdds().len(), 1);
        let hdd = &config.hdds()[0];
        assert_eq!(hdd.bus, BusType::Scsi);
        assert_eq!(hdd.chipset_driver.as_deref(), Some("lsilogic"));
        assert_eq!(hdd.disk_image, "TestVM.vmdk");
    }

    #[test]
    fn test_disk_requires_controller_present() {
        let config = parse(
            "virtualHW.version = \"19\"\ndisplayName = \"x\"\n\
             sata0:1.present = \"TRUE\"\nsata0:1.fileName = \"a.vmdk\"\n",
        );
        assert!(config.hdds().is_empty());
    }

    #[test]
    fn test_ide_controller_is_implicit() {
        let config = parse(
            "virtualHW.version = \"19\"\ndisplayName = \"x\"\n\
             ide0:0.present = \"TRUE\"\nide0:0.fileName = \"a.vmdk\"\n",
        );
        assert_eq!(config.hdds().len(), 1);
        assert_eq!(config.hdds()[0].bus, BusType::Ide);
        assert_eq!(config.hdds()[0].chipset_driver, None);
    }

    #[test]
    fn test_rejects_non_vmx() {
        let err = VmwareConfig::parse(b"<domain type='kvm'/>", &ParseContext::default()).unwrap_err();
        assert!(matches!(err, Error::UnknownFormat { .. }));
    }

    #[test]
    fn test_missing_display_name_is_malformed() {
        let err = VmwareConfig::parse(b"memsize = \"1024\"\n", &ParseContext::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedStructure { .. }));
    }

    #[test]
    fn test_legacy_charset_default() {
        let mut data = b"memsize = \"1024\"\ndisplayName = \"Pr".to_vec();
        data.push(0xfc);
        data.extend_from_slice(b"fung\"\n");
        let config = VmwareConfig::parse(&data, &ParseContext::default()).unwrap();
        assert_eq!(config.charset(), Charset::Windows1252);
        assert_eq!(config.display_name(), "Prüfung");
        assert!(config.definition_bytes().unwrap().contains(&0xfc));
    }

    #[test]
    fn test_filtered_dump_contains_mutations_only_plus_allow_list() {
        let mut config = parse(SAMPLE);
        assert!(config.set_display_name("Renamed"));
        let filtered = String::from_utf8(config.filtered_definition_bytes().unwrap()).unwrap();
        assert!(filtered.contains("displayName = \"Renamed\""));
        assert!(filtered.contains("virtualHW.version = \"19\""));
        assert!(!filtered.contains("fileName"));
    }

    #[test]
    fn test_add_hdd_reuses_existing_slot() {
        let mut config = parse(SAMPLE);
        assert!(config.add_hdd("new.vmdk"));
        assert_eq!(config.get("scsi0:0.fileName"), Some("new.vmdk"));
        assert_eq!(config.hdds()[0].disk_image, "new.vmdk");
    }

    #[test]
    fn test_add_hdd_creates_controller() {
        let mut config = parse("memsize = \"1024\"\ndisplayName = \"x\"\n");
        assert!(config.add_hdd("disk.vmdk"));
        assert!(config.entries().is_true("scsi0.present"));
        assert_eq!(config.hdds().len(), 1);
    }

    #[test]
    fn test_option_groups_follow_setters() {
        let mut config = parse(SAMPLE);
        let active = |c: &VmwareConfig, g: OptionGroupId| {
            c.option_groups()
                .iter()
                .find(|grp| grp.group == g)
                .and_then(|grp| grp.active().map(str::to_string))
        };
        assert_eq!(active(&config, OptionGroupId::SoundCard).as_deref(), Some("hdaudio"));
        assert!(config.set_sound_card(SoundCardType::SoundBlaster));
        assert_eq!(active(&config, OptionGroupId::SoundCard).as_deref(), Some("sb16"));
        assert!(!config.set_sound_card(SoundCardType::Ac97));

        assert!(config.set_virtualizer_version(Version::new(14, 0)));
        assert_eq!(active(&config, OptionGroupId::HwVersion).as_deref(), Some("14"));
        assert!(!config.set_virtualizer_version(Version::new(99, 0)));
    }

    #[test]
    fn test_usb_speed_sets_lower_controllers() {
        let mut config = parse(SAMPLE);
        assert!(config.set_usb_speed(UsbSpeed::Usb3));
        assert!(config.entries().is_true("usb.present"));
        assert!(config.entries().is_true("ehci.present"));
        assert!(config.entries().is_true("usb_xhci.present"));
        assert!(config.set_usb_speed(UsbSpeed::None));
        assert_eq!(config.usb_speed(), UsbSpeed::None);
    }

    #[test]
    fn test_transform_editable_disables_secondary_nics() {
        let mut config = parse(SAMPLE);
        config.transform_editable();
        assert!(config.entries().is_true("ethernet0.present"));
        assert!(!config.entries().is_true("ethernet1.present"));
        assert_eq!(config.get("gui.applyHostDisplayScalingToGuest"), Some("FALSE"));
    }

    #[test]
    fn test_transform_non_persistent() {
        let mut config = parse(SAMPLE);
        config.transform_non_persistent();
        assert!(config.entries().is_true("suspend.disabled"));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_ethernet_index_out_of_range_panics() {
        let mut config = parse(SAMPLE);
        config.add_ethernet(10, EtherType::Nat);
    }

    #[test]
    fn test_snapshot_disk_name_marks_snapshot() {
        let config = parse(
            "virtualHW.version = \"19\"\ndisplayName = \"x\"\n\
             scsi0.present = \"TRUE\"\nscsi0:0.present = \"TRUE\"\n\
             scsi0:0.fileName = \"disk-000001.vmdk\"\n",
        );
        assert!(config.is_machine_snapshot());
    }
}
