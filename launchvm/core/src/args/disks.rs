use std::{
    borrow::Cow,
    collections::HashSet,
    ffi::OsString,
    path::{Path, PathBuf},
};

use size::Size;

use super::{Driver, ResolvedDevice};
use crate::{
    arg,
    config::{Config, PlatformDefaults},
    data::{spec::join_opts, spec::push_escaped, DiskSpec, Interface, Opt},
    error::{Error, Warning},
    image::Inspect,
    oarg,
    probe::{CapabilityCache, Introspect},
    utils::{ArgDisplay, EmulatorArgs, QemuArg},
};

const SCSI_CONTROLLER: &str = "virtio-scsi-launchvm";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDisk {
    pub device: ResolvedDevice,
    pub file: PathBuf,
    pub format: String,
    pub index: Option<u32>,
    pub bus: Option<String>,
    pub unit: Option<String>,
    pub serial: Option<String>,
    size: Option<u64>,
}

pub(crate) struct DiskResolver<'a, P, I> {
    cache: &'a mut CapabilityCache<P>,
    inspector: &'a I,
    config: &'a Config,
}

impl<'a, P: Introspect, I: Inspect> DiskResolver<'a, P, I> {
    pub(crate) fn new(cache: &'a mut CapabilityCache<P>, inspector: &'a I, config: &'a Config) -> Self {
        Self { cache, inspector, config }
    }

    pub(crate) fn disk_args(&mut self, specs: &[DiskSpec]) -> Result<(DiskArgs, Vec<Warning>), Error> {
        let mut warnings = Vec::new();
        let mut ids = HashSet::new();
        let disks = specs
            .iter()
            .enumerate()
            .map(|(ordinal, spec)| {
                let (disk, warning) = self.resolve(ordinal as u32, spec)?;
                if !ids.insert(disk.device.id.clone()) {
                    return Err(Error::malformed(spec.spec.raw(), format!("duplicate device id '{}'", disk.device.id)));
                }
                warnings.extend(warning);
                Ok(disk)
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let scsi_controller = disks.iter().any(|disk| disk.bus.as_deref().is_some_and(|bus| bus.starts_with(SCSI_CONTROLLER)));
        Ok((DiskArgs { disks, scsi_controller }, warnings))
    }

    pub(crate) fn resolve(&mut self, ordinal: u32, spec: &DiskSpec) -> Result<(ResolvedDisk, Option<Warning>), Error> {
        let id = spec.id.clone().unwrap_or_else(|| format!("disk{ordinal:02}"));

        if (spec.bus.is_some() || spec.unit.is_some()) && spec.index.is_some() {
            return Err(Error::ConflictingAddressing(id));
        }

        let mut warning = None;
        let driver = match (spec.interface, &spec.driver) {
            (Some(Interface::Pflash), driver) => {
                // The driver is dropped even when given explicitly.
                if let Some(driver) = driver {
                    warning = Some(Warning::PflashDriverCleared(id.clone(), driver.clone()));
                }
                Driver::Pflash
            }
            (_, Some(driver)) => Driver::Model(driver.clone()),
            (Some(interface), None) => Driver::Model(self.interface_driver(interface)?.to_string()),
            (None, None) => Driver::Model(self.config.disk_driver().to_string()),
        };
        log::debug!("Disk {id}: {} -> {driver}", spec.file.display());

        let index = match (&spec.bus, &spec.unit, spec.index) {
            (None, None, None) => Some(ordinal),
            (_, _, index) => index,
        };

        let (format, size) = match &spec.format {
            Some(format) => (format.clone(), None),
            None => {
                let info = self.inspector.inspect(&spec.file)?;
                log::debug!("Detected format {} for {}", info.format, spec.file.display());
                (info.format, Some(info.virtual_size))
            }
        };

        let partition = self.cache.partition(driver.model(), &spec.extra)?;

        let serial = match (&spec.serial, driver.model()) {
            (Some(serial), _) => Some(serial.clone()),
            (None, Some(model)) if !spec.has_option("wwn") && self.cache.supports(model, "serial")? => default_serial(&spec.file),
            _ => None,
        };

        let bus = match (&spec.bus, driver.model()) {
            (None, Some("scsi-hd")) => Some(format!("{SCSI_CONTROLLER}.0")),
            (bus, _) => bus.clone(),
        };

        let disk = ResolvedDisk {
            device: ResolvedDevice {
                id,
                driver,
                backend: partition.backend,
                frontend: partition.frontend,
            },
            file: spec.file.clone(),
            format,
            index,
            bus,
            unit: spec.unit.clone(),
            serial,
            size,
        };
        Ok((disk, warning))
    }

    fn interface_driver(&self, interface: Interface) -> Result<&'a str, Error> {
        match interface {
            Interface::None => Ok(self.config.disk_driver()),
            Interface::Virtio => Ok(PlatformDefaults::host().disk_driver),
            Interface::Scsi => Ok("scsi-hd"),
            Interface::Ide => Ok("ide-hd"),
            Interface::Pflash | Interface::Sd | Interface::Mtd | Interface::Floppy => Err(Error::UnsupportedDeviceType(format!("if={interface}"))),
        }
    }
}

fn default_serial(file: &Path) -> Option<String> {
    file.file_name().map(|name| name.to_string_lossy().into_owned()).filter(|name| !name.is_empty())
}

pub struct DiskArgs {
    disks: Vec<ResolvedDisk>,
    scsi_controller: bool,
}

impl DiskArgs {
    pub fn disks(&self) -> &[ResolvedDisk] {
        &self.disks
    }
}

impl ResolvedDisk {
    fn drive_arg(&self) -> OsString {
        let mut drive = OsString::from("file=");
        push_escaped(&mut drive, self.file.as_os_str());
        drive.push(format!(",id={}", self.device.id));
        drive.push(match self.device.driver {
            Driver::Pflash => ",if=pflash",
            Driver::Model(_) => ",if=none",
        });
        drive.push(format!(",format={}", self.format));

        let mut structural = Vec::new();
        if let Some(index) = self.index {
            structural.push(Opt::new("index", index.to_string()));
        }
        if let Driver::Pflash = self.device.driver {
            structural.extend(self.bus.iter().map(|bus| Opt::new("bus", bus)));
            structural.extend(self.unit.iter().map(|unit| Opt::new("unit", unit)));
            structural.extend(self.serial.iter().map(|serial| Opt::new("serial", serial)));
        }
        join_opts(drive, structural.iter().chain(&self.device.backend))
    }

    fn device_arg(&self) -> Option<OsString> {
        let model = self.device.driver.model()?;
        let structural: Vec<Opt> = [
            Some(Opt::new("drive", &self.device.id)),
            self.bus.as_ref().map(|bus| Opt::new("bus", bus)),
            self.unit.as_ref().map(|unit| Opt::new("unit", unit)),
            self.serial.as_ref().map(|serial| Opt::new("serial", serial)),
        ]
        .into_iter()
        .flatten()
        .collect();
        Some(join_opts(OsString::from(format!("driver={model}")), structural.iter().chain(&self.device.frontend)))
    }

    fn arg_display(&self) -> ArgDisplay {
        let size = self.size.map(|size| format!(", {}", Size::from_bytes(size))).unwrap_or_default();
        ArgDisplay {
            name: Cow::Owned(format!("Disk ({})", self.device.id)),
            value: Cow::Owned(format!("{} ({}{size}) via {}", self.file.display(), self.format, self.device.driver)),
        }
    }
}

impl EmulatorArgs for DiskArgs {
    fn display(&self) -> impl IntoIterator<Item = ArgDisplay> {
        self.disks.iter().map(ResolvedDisk::arg_display)
    }
    fn qemu_args(&self) -> impl IntoIterator<Item = QemuArg> {
        let mut args = Vec::new();
        if self.scsi_controller {
            args.extend([arg!("-device"), oarg!(format!("virtio-scsi-pci,id={SCSI_CONTROLLER}"))]);
        }
        for disk in &self.disks {
            args.extend([arg!("-drive"), oarg!(disk.drive_arg())]);
            if let Some(device) = disk.device_arg() {
                args.extend([arg!("-device"), oarg!(device)]);
            }
        }
        args
    }
}
