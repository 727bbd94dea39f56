//! Settings-file versions and their structural rules.
//!
//! Each supported `major.minor` settings version maps to one rule set. A
//! version that is not in the table is rejected outright.

use crate::error::{Error, Result};
use crate::model::Version;
use crate::xml::{Document, Element, Query};
use once_cell::sync::Lazy;
use regex::Regex;

/// Rules for one settings-file version.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    pub version: Version,
    /// Name of the upstream schema this rule set mirrors.
    pub resource: &'static str,
    /// From 1.17 on, `StorageControllers` lives under `Hardware`.
    pub storage_under_hardware: bool,
}

pub static SCHEMAS: &[Schema] = &[
    Schema {
        version: Version::new(1, 15),
        resource: "VirtualBox-settings-1.15.xsd",
        storage_under_hardware: false,
    },
    Schema {
        version: Version::new(1, 16),
        resource: "VirtualBox-settings-1.16.xsd",
        storage_under_hardware: false,
    },
    Schema {
        version: Version::new(1, 17),
        resource: "VirtualBox-settings-1.17.xsd",
        storage_under_hardware: true,
    },
    Schema {
        version: Version::new(1, 18),
        resource: "VirtualBox-settings-1.18.xsd",
        storage_under_hardware: true,
    },
    Schema {
        version: Version::new(1, 19),
        resource: "VirtualBox-settings-1.19.xsd",
        storage_under_hardware: true,
    },
];

static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\}$")
        .expect("Invalid regex: UUID")
});

static MAC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{12}$").expect("Invalid regex: MAC"));

static MACHINES: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine"));
static HARDWARE: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine/Hardware"));
static MEDIA: Lazy<Query> = Lazy::new(|| query("//MediaRegistry//*[@uuid]"));
static IMAGE_REFS: Lazy<Query> = Lazy::new(|| query("//AttachedDevice/Image"));
static ADAPTERS: Lazy<Query> = Lazy::new(|| query("//Network/Adapter"));
static ATTACHED: Lazy<Query> = Lazy::new(|| query("//AttachedDevice"));
static MEMORY: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine/Hardware/Memory"));
static CPU: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine/Hardware/CPU"));
static LEGACY_STORAGE: Lazy<Query> = Lazy::new(|| query("/VirtualBox/Machine/StorageControllers"));
static HARDWARE_STORAGE: Lazy<Query> =
    Lazy::new(|| query("/VirtualBox/Machine/Hardware/StorageControllers"));

pub(super) fn query(path: &str) -> Query {
    Query::parse(path).expect("Invalid query")
}

/// Look up the rule set for a root `version` attribute such as `1.16-linux`.
pub fn lookup(version_attr: &str) -> Result<&'static Schema> {
    let version = Version::parse(version_attr)
        .ok_or_else(|| Error::malformed(format!("unparseable settings version '{}'", version_attr)))?;
    SCHEMAS
        .iter()
        .find(|schema| schema.version == version)
        .ok_or_else(|| Error::unsupported_version(version_attr))
}

impl Schema {
    /// Query for the `StorageController` elements of this version's layout.
    pub fn storage_controllers(&self) -> &'static Query {
        static LEGACY: Lazy<Query> =
            Lazy::new(|| query("/VirtualBox/Machine/StorageControllers/StorageController"));
        static NESTED: Lazy<Query> =
            Lazy::new(|| query("/VirtualBox/Machine/Hardware/StorageControllers/StorageController"));
        if self.storage_under_hardware {
            &NESTED
        } else {
            &LEGACY
        }
    }

    /// Check `doc` against this version's rules.
    pub fn validate(&self, doc: &Document) -> Result<()> {
        let fail = |message: String| Error::schema(self.version.to_string(), message);

        if doc.root.name != "VirtualBox" {
            return Err(fail(format!("root element is <{}>", doc.root.name)));
        }
        let machines = doc.find_all(&MACHINES);
        let [machine] = machines.as_slice() else {
            return Err(fail(format!("expected one Machine, found {}", machines.len())));
        };
        require_attr(machine, "name").map_err(&fail)?;
        check_uuid(machine, "uuid", true).map_err(&fail)?;
        let hardware = doc
            .find(&HARDWARE)
            .ok_or_else(|| fail("Machine has no Hardware".to_string()))?;
        check_uuid(hardware, "uuid", false).map_err(&fail)?;

        let mut seen = Vec::new();
        for medium in doc.find_all(&MEDIA) {
            check_uuid(medium, "uuid", true).map_err(&fail)?;
            let uuid = medium.attr("uuid").unwrap_or_default().to_ascii_lowercase();
            if seen.contains(&uuid) {
                return Err(fail(format!("duplicate medium uuid {}", uuid)));
            }
            seen.push(uuid);
        }
        for image in doc.find_all(&IMAGE_REFS) {
            check_uuid(image, "uuid", true).map_err(&fail)?;
        }
        for adapter in doc.find_all(&ADAPTERS) {
            check_integer(adapter, "slot", true).map_err(&fail)?;
            if let Some(mac) = adapter.attr("MACAddress") {
                if !MAC.is_match(mac) {
                    return Err(fail(format!("invalid MACAddress '{}'", mac)));
                }
            }
        }
        for device in doc.find_all(&ATTACHED) {
            require_attr(device, "type").map_err(&fail)?;
            check_integer(device, "port", false).map_err(&fail)?;
            check_integer(device, "device", false).map_err(&fail)?;
        }
        if let Some(memory) = doc.find(&MEMORY) {
            check_integer(memory, "RAMSize", true).map_err(&fail)?;
        }
        if let Some(cpu) = doc.find(&CPU) {
            check_integer(cpu, "count", false).map_err(&fail)?;
        }

        let misplaced = if self.storage_under_hardware {
            &LEGACY_STORAGE
        } else {
            &HARDWARE_STORAGE
        };
        if doc.find(misplaced).is_some() {
            return Err(fail(format!(
                "StorageControllers at the wrong level for settings {}",
                self.version
            )));
        }
        Ok(())
    }
}

fn require_attr<'a>(element: &'a Element, name: &str) -> std::result::Result<&'a str, String> {
    element
        .attr(name)
        .ok_or_else(|| format!("<{}> lacks required attribute '{}'", element.name, name))
}

fn check_uuid(element: &Element, name: &str, required: bool) -> std::result::Result<(), String> {
    match element.attr(name) {
        Some(value) if UUID.is_match(value) => Ok(()),
        Some(value) => Err(format!("<{}> {}='{}' is not a UUID", element.name, name, value)),
        None if required => Err(format!("<{}> lacks required attribute '{}'", element.name, name)),
        None => Ok(()),
    }
}

fn check_integer(element: &Element, name: &str, required: bool) -> std::result::Result<(), String> {
    match element.attr(name) {
        Some(value) if value.parse::<u64>().is_ok() => Ok(()),
        Some(value) => Err(format!("<{}> {}='{}' is not an integer", element.name, name, value)),
        None if required => Err(format!("<{}> lacks required attribute '{}'", element.name, name)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(xml: &str) -> Document {
        Document::parse(xml.as_bytes()).unwrap()
    }

    const VALID: &str = r#"<VirtualBox version="1.16-linux">
  <Machine uuid="{11111111-2222-3333-4444-555555555555}" name="vm">
    <Hardware>
      <Memory RAMSize="1024"/>
      <Network><Adapter slot="0" MACAddress="080027ABCDEF"/></Network>
    </Hardware>
    <StorageControllers/>
  </Machine>
</VirtualBox>"#;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("1.16-linux").unwrap().version, Version::new(1, 16));
        assert!(lookup("1.17").unwrap().storage_under_hardware);
        assert!(matches!(
            lookup("1.3-windows"),
            Err(Error::UnsupportedSchemaVersion { .. })
        ));
        assert!(matches!(lookup("x"), Err(Error::MalformedStructure { .. })));
    }

    #[test]
    fn test_valid_document() {
        lookup("1.16").unwrap().validate(&doc(VALID)).unwrap();
    }

    #[test]
    fn test_storage_level_depends_on_version() {
        let err = lookup("1.17").unwrap().validate(&doc(VALID)).unwrap_err();
        assert!(matches!(err, Error::SchemaValidation { .. }));
    }

    #[test]
    fn test_placeholder_uuid_fails() {
        let xml = VALID.replace("{11111111-2222-3333-4444-555555555555}", "%VM_MACHINE_UUID%");
        assert!(lookup("1.16").unwrap().validate(&doc(&xml)).is_err());
    }

    #[test]
    fn test_bad_ram_size_fails() {
        let xml = VALID.replace("RAMSize=\"1024\"", "RAMSize=\"lots\"");
        assert!(lookup("1.16").unwrap().validate(&doc(&xml)).is_err());
    }

    #[test]
    fn test_duplicate_medium_uuid_fails() {
        let disk = r#"<HardDisk uuid="{AAAAAAAA-0000-0000-0000-000000000001}" location="/a.vdi"/>"#;
        let registry = format!(
            "<MediaRegistry><HardDisks>{}{}</HardDisks></MediaRegistry><Hardware>",
            disk,
            disk.replace("AAAAAAAA", "aaaaaaaa").replace("/a.vdi", "/b.vdi")
        );
        let xml = VALID.replacen("<Hardware>", &registry, 1);
        let err = lookup("1.16").unwrap().validate(&doc(&xml)).unwrap_err();
        assert!(err.to_string().contains("duplicate medium uuid"));
    }
}
