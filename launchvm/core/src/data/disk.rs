use std::{path::PathBuf, str::FromStr};

use strum::{AsRefStr, Display, EnumString};

use super::spec::{split_escaped, DeviceSpec, Opt};
use crate::error::Error;

/// Keys consumed by the resolver rather than passed through to QEMU.
const STRUCTURAL_KEYS: [&str; 9] = ["file", "id", "driver", "if", "bus", "unit", "index", "format", "serial"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Interface {
    None,
    Virtio,
    Scsi,
    Ide,
    Pflash,
    Sd,
    Mtd,
    Floppy,
}

impl Interface {
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Sd | Self::Mtd | Self::Floppy)
    }
}

/// A validated `--disk` argument.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskSpec {
    pub spec: DeviceSpec,
    pub file: PathBuf,
    pub id: Option<String>,
    pub driver: Option<String>,
    pub interface: Option<Interface>,
    pub bus: Option<String>,
    pub unit: Option<String>,
    pub index: Option<u32>,
    pub format: Option<String>,
    pub serial: Option<String>,
    pub extra: Vec<Opt>,
}

impl DiskSpec {
    /// Parse a `--disk` argument. An unsupported interface is reported before any other problem in the spec.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if let Some(interface) = unsupported_interface(raw) {
            return Err(Error::UnsupportedDeviceType(interface));
        }
        Self::try_from(DeviceSpec::parse(raw)?)
    }

    pub fn has_option(&self, key: &str) -> bool {
        self.extra.iter().any(|opt| opt.key == key)
    }
}

fn unsupported_interface(raw: &str) -> Option<String> {
    split_escaped(raw).into_iter().find_map(|token| match token.split_once('=') {
        None if token == "floppy" => Some(format!("if={}", Interface::Floppy)),
        Some(("if", value)) => match Interface::from_str(value) {
            Ok(interface) if interface.is_supported() => None,
            _ => Some(format!("if={value}")),
        },
        _ => None,
    })
}

impl FromStr for DiskSpec {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<DeviceSpec> for DiskSpec {
    type Error = Error;

    fn try_from(spec: DeviceSpec) -> Result<Self, Self::Error> {
        let raw = spec.raw().to_string();
        let has_file_key = spec.tokens().iter().any(|opt| opt.key == "file");

        let mut file = None;
        let mut interface = None;
        let mut fields: [Option<String>; STRUCTURAL_KEYS.len()] = Default::default();
        let mut repeated = None;
        let mut extra = Vec::new();

        for (position, opt) in spec.tokens().iter().enumerate() {
            match (opt.key.as_str(), opt.value.as_deref()) {
                ("floppy", None) => interface = Some(Interface::Floppy),
                (path, None) if position == 0 && !has_file_key => file = Some(PathBuf::from(path)),
                ("if", Some(value)) => {
                    let parsed = Interface::from_str(value).map_err(|_| Error::UnsupportedDeviceType(format!("if={value}")))?;
                    if interface.is_some_and(|current: Interface| !current.is_supported()) {
                        continue;
                    }
                    interface = Some(parsed);
                }
                (key, Some(value)) => match STRUCTURAL_KEYS.iter().position(|k| *k == key) {
                    Some(slot) => {
                        if fields[slot].replace(value.to_string()).is_some() {
                            repeated.get_or_insert_with(|| key.to_string());
                        }
                    }
                    None => extra.push(opt.clone()),
                },
                _ => extra.push(opt.clone()),
            }
        }

        if let Some(unsupported) = interface.filter(|i| !i.is_supported()) {
            return Err(Error::UnsupportedDeviceType(format!("if={unsupported}")));
        }
        if let Some(key) = repeated {
            return Err(Error::malformed(raw, format!("'{key}' given more than once")));
        }

        let [file_key, id, driver, _, bus, unit, index, format, serial] = fields;
        let file = file
            .or(file_key.map(PathBuf::from))
            .filter(|file| !file.as_os_str().is_empty())
            .ok_or_else(|| Error::malformed(&raw, "no backing file given"))?;
        let index = index
            .map(|index| index.parse::<u32>().map_err(|_| Error::malformed(&raw, format!("index '{index}' is not a number"))))
            .transpose()?;

        Ok(Self {
            spec,
            file,
            id,
            driver,
            interface,
            bus,
            unit,
            index,
            format,
            serial,
            extra,
        })
    }
}
