mod args;
pub mod config;
pub mod data;
pub mod error;
pub mod image;
pub mod launch;
pub mod prereq;
pub mod probe;
pub mod tap;
mod utils;

pub use args::{DiskArgs, Driver, NetArgs, ResolvedDevice, ResolvedDisk, ResolvedNic};
pub use utils::{shell_quote, ArgDisplay, QemuArg};
