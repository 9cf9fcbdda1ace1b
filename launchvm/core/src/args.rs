use derive_more::Display;

use crate::data::Opt;

pub(crate) mod disks;
pub(crate) mod firmware;
pub(crate) mod network;

pub use disks::{DiskArgs, ResolvedDisk};
pub use network::{NetArgs, ResolvedNic};

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Driver {
    #[display("{_0}")]
    Model(String),
    /// `if=pflash` drives are attached without a `-device`.
    #[display("pflash")]
    Pflash,
}

impl Driver {
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Model(model) => Some(model),
            Self::Pflash => None,
        }
    }
}

/// One guest device: its host side (`-drive`/`-netdev`) and guest side (`-device`) options.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDevice {
    pub id: String,
    pub driver: Driver,
    pub backend: Vec<Opt>,
    pub frontend: Vec<Opt>,
}
