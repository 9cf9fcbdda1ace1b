use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Firmware {
    /// Whatever the hypervisor boots with when no firmware options are given.
    #[default]
    Default,
    Bios(PathBuf),
    Uefi {
        /// Persistent variable store. A throwaway copy of the distribution's template is used when unset.
        nvram: Option<PathBuf>,
    },
}
