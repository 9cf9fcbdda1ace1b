pub mod disk;
pub mod firmware;
pub mod network;
pub mod spec;

pub use disk::*;
pub use firmware::*;
pub use network::*;
pub use spec::{DeviceSpec, Opt};
