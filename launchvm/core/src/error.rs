use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed device specification '{spec}': {reason}")]
    MalformedSpec { spec: String, reason: String },
    #[error("Unsupported device type '{0}'")]
    UnsupportedDeviceType(String),
    #[error("Device {0}: 'bus' and 'unit' cannot be combined with 'index'")]
    ConflictingAddressing(String),
    #[error("Could not probe device model '{model}': {reason}")]
    ProbeFailure { model: String, reason: String },
    #[error("Could not attach tap device {tap} to {bridge}: {reason}")]
    ProvisioningFailure { tap: String, bridge: String, reason: String },
    #[error("Required binary '{binary}' was not found (provided by package '{package}')")]
    MissingPrerequisite { binary: String, package: String },
    #[error("Failed to run {0}: {1}")]
    Command(String, String),
    #[error("Could not inspect disk image {0}: {1}")]
    DiskImage(PathBuf, String),
    #[error("Firmware: {0}")]
    Firmware(String),
    #[error("Unexpected tap-control output: {0}")]
    Protocol(String),
    #[error("Interrupted by {0} before the hypervisor started")]
    Interrupted(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub(crate) fn malformed(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum Warning {
    #[error("Could not tear down tap device {0}: {1}")]
    Teardown(String, String),
    #[error("Disk {0}: if=pflash discards driver={1}; the image is attached as a flash drive without a device")]
    PflashDriverCleared(String, String),
}
