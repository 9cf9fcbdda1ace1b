use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_DIR: &str = "launch-vm";
const CONFIG_FILE: &str = "config.toml";

const DEFAULT_PACKAGES: [(&str, &str); 6] = [
    ("kvm", "qemu-kvm"),
    ("qemu-img", "qemu-utils"),
    ("ip", "iproute2"),
    ("ovs-vsctl", "openvswitch-switch"),
    ("sudo", "sudo"),
    ("qemu-system-x86_64", "qemu-system-x86"),
];

/// User defaults, read from `$XDG_CONFIG_HOME/launch-vm/config.toml` or `--config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub kvm: Option<PathBuf>,
    pub qemu_img: PathBuf,
    pub disk_driver: Option<String>,
    pub nic_model: Option<String>,
    pub netdevs: Vec<String>,
    pub tap_prefix: Option<String>,
    pub install_command: Vec<String>,
    pub packages: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kvm: None,
            qemu_img: PathBuf::from("qemu-img"),
            disk_driver: None,
            nic_model: None,
            netdevs: vec!["user".to_string()],
            tap_prefix: None,
            install_command: ["apt-get", "install", "--assume-yes"].map(String::from).to_vec(),
            packages: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn parse(file: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(file)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Read `explicit` if given, else the per-user file when it exists, else the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(file) = explicit {
            return Self::parse(file);
        }
        match Self::default_path().filter(|path| path.is_file()) {
            Some(path) => {
                log::debug!("Using configuration file {}", path.display());
                Self::parse(&path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn disk_driver(&self) -> &str {
        self.disk_driver.as_deref().unwrap_or(PlatformDefaults::host().disk_driver)
    }

    pub fn nic_model(&self) -> &str {
        self.nic_model.as_deref().unwrap_or(PlatformDefaults::host().nic_model)
    }

    pub fn package_for(&self, binary: &str) -> String {
        self.packages
            .get(binary)
            .cloned()
            .or_else(|| DEFAULT_PACKAGES.iter().find(|(bin, _)| *bin == binary).map(|(_, package)| package.to_string()))
            .unwrap_or_else(|| binary.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformDefaults {
    pub disk_driver: &'static str,
    pub nic_model: &'static str,
}

impl PlatformDefaults {
    pub fn host() -> Self {
        Self::for_arch(std::env::consts::ARCH)
    }

    pub fn for_arch(arch: &str) -> Self {
        match arch {
            "s390x" => Self {
                disk_driver: "virtio-blk-ccw",
                nic_model: "virtio-net-ccw",
            },
            _ => Self {
                disk_driver: "virtio-blk",
                nic_model: "virtio-net-pci",
            },
        }
    }
}
