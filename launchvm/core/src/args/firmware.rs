use std::{
    borrow::Cow,
    ffi::OsString,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::{
    arg,
    data::{spec::push_escaped, Firmware},
    error::Error,
    oarg,
    utils::{ArgDisplay, EmulatorArgs, QemuArg},
};

const X86_64_OVMF: &[(&str, &str)] = &[
    ("OVMF/OVMF_CODE_4M.fd", "OVMF/OVMF_VARS_4M.fd"),
    ("OVMF/OVMF_CODE.fd", "OVMF/OVMF_VARS.fd"),
    ("edk2/ovmf/OVMF_CODE.fd", "edk2/ovmf/OVMF_VARS.fd"),
    ("OVMF/x64/OVMF_CODE.fd", "OVMF/x64/OVMF_VARS.fd"),
    ("edk2-ovmf/OVMF_CODE.fd", "edk2-ovmf/OVMF_VARS.fd"),
    ("qemu/ovmf-x86_64-4m-code.bin", "qemu/ovmf-x86_64-4m-vars.bin"),
    ("edk2-ovmf/x64/OVMF_CODE.fd", "edk2-ovmf/x64/OVMF_VARS.fd"),
    ("edk2/x64/OVMF_CODE.4m.fd", "edk2/x64/OVMF_VARS.4m.fd"),
];
const AARCH64_AAVMF: &[(&str, &str)] = &[
    ("AAVMF/AAVMF_CODE.fd", "AAVMF/AAVMF_VARS.fd"),
    ("qemu-efi-aarch64/QEMU_EFI.fd", "qemu-efi-aarch64/QEMU_VARS.fd"),
    ("edk2/aarch64/QEMU_EFI.fd", "edk2/aarch64/QEMU_VARS.fd"),
];

impl Firmware {
    /// Locate the firmware. A dry run plans the variable store path without writing it.
    pub(crate) fn firmware_args(&self, dry_run: bool) -> Result<FirmwareArgs, Error> {
        self.firmware_args_in(Path::new("/usr/share"), std::env::consts::ARCH, dry_run)
    }

    fn firmware_args_in(&self, share_dir: &Path, arch: &str, dry_run: bool) -> Result<FirmwareArgs, Error> {
        match self {
            Self::Default => Ok(FirmwareArgs::Default),
            Self::Bios(bios) if bios.is_file() => Ok(FirmwareArgs::Bios(bios.clone())),
            Self::Bios(bios) => Err(Error::Firmware(format!("BIOS file {} does not exist", bios.display()))),
            Self::Uefi { nvram } => {
                let candidates = match arch {
                    "x86_64" => X86_64_OVMF,
                    "aarch64" => AARCH64_AAVMF,
                    _ => return Err(Error::Firmware(format!("UEFI boot is not supported on {arch}"))),
                };
                let (code, template) = find_firmware(share_dir, candidates)?;
                let vars = NvramStore::prepare(nvram.as_deref(), &template, dry_run)?;
                Ok(FirmwareArgs::Uefi(Efi { code, vars }))
            }
        }
    }
}

fn find_firmware(share_dir: &Path, candidates: &[(&str, &str)]) -> Result<(PathBuf, PathBuf), Error> {
    candidates
        .iter()
        .map(|(code, vars)| (share_dir.join(code), share_dir.join(vars)))
        .find(|(code, vars)| code.is_file() && vars.is_file())
        .ok_or_else(|| Error::Firmware(format!("no UEFI firmware found under {}", share_dir.display())))
}

/// Writable UEFI variable store. Without a user supplied path, a temporary copy lives as long as the launch.
pub(crate) enum NvramStore {
    Persistent(PathBuf),
    Scratch(NamedTempFile),
    /// Not created yet: the launch is a dry run.
    Planned(PathBuf),
}

impl NvramStore {
    fn prepare(nvram: Option<&Path>, template: &Path, dry_run: bool) -> Result<Self, Error> {
        match nvram {
            Some(path) if path.exists() => Ok(Self::Persistent(path.to_path_buf())),
            Some(path) if dry_run => Ok(Self::Planned(path.to_path_buf())),
            None if dry_run => Ok(Self::Planned(std::env::temp_dir().join("launch-vm-nvram.fd"))),
            Some(path) => {
                log::info!("Creating UEFI variable store {} from {}", path.display(), template.display());
                std::fs::copy(template, path).map_err(|e| Error::Firmware(format!("could not copy {} to {}: {e}", template.display(), path.display())))?;
                Ok(Self::Persistent(path.to_path_buf()))
            }
            None => {
                let scratch = tempfile::Builder::new().prefix("launch-vm-nvram-").tempfile().map_err(|e| Error::Firmware(e.to_string()))?;
                std::fs::copy(template, scratch.path()).map_err(|e| Error::Firmware(format!("could not copy {}: {e}", template.display())))?;
                Ok(Self::Scratch(scratch))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Persistent(path) | Self::Planned(path) => path,
            Self::Scratch(file) => file.path(),
        }
    }
}

pub(crate) struct Efi {
    code: PathBuf,
    vars: NvramStore,
}

pub(crate) enum FirmwareArgs {
    Default,
    Bios(PathBuf),
    Uefi(Efi),
}

impl EmulatorArgs for FirmwareArgs {
    fn display(&self) -> impl IntoIterator<Item = ArgDisplay> {
        let value = match self {
            Self::Default => return None,
            Self::Bios(bios) => format!("BIOS: {}", bios.display()),
            Self::Uefi(Efi { code, vars }) => {
                let kind = match vars {
                    NvramStore::Persistent(_) => "",
                    NvramStore::Scratch(_) => " (discarded on exit)",
                    NvramStore::Planned(_) => " (copied from the template at launch)",
                };
                format!("UEFI: {}, NVRAM: {}{kind}", code.display(), vars.path().display())
            }
        };
        Some(ArgDisplay {
            name: Cow::Borrowed("Boot"),
            value: Cow::Owned(value),
        })
    }
    fn qemu_args(&self) -> impl IntoIterator<Item = QemuArg> {
        match self {
            Self::Default => vec![],
            Self::Bios(bios) => vec![arg!("-bios"), oarg!(bios)],
            Self::Uefi(Efi { code, vars }) => {
                let mut code_drive = OsString::from("if=pflash,format=raw,unit=0,file=");
                push_escaped(&mut code_drive, code.as_os_str());
                code_drive.push(",readonly=on");
                let mut vars_drive = OsString::from("if=pflash,format=raw,unit=1,file=");
                push_escaped(&mut vars_drive, vars.path().as_os_str());
                vec![arg!("-drive"), oarg!(code_drive), arg!("-drive"), oarg!(vars_drive)]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("OVMF")).unwrap();
        std::fs::write(dir.path().join("OVMF/OVMF_CODE.fd"), b"code").unwrap();
        std::fs::write(dir.path().join("OVMF/OVMF_VARS.fd"), b"vars").unwrap();
        dir
    }

    fn rendered(args: &FirmwareArgs) -> Vec<String> {
        args.qemu_args().into_iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn nvram_is_copied_once() {
        let share = share_dir();
        let nvram = share.path().join("my-vars.fd");
        let firmware = Firmware::Uefi { nvram: Some(nvram.clone()) };

        let args = firmware.firmware_args_in(share.path(), "x86_64", false).unwrap();
        assert_eq!(std::fs::read(&nvram).unwrap(), b"vars");
        let rendered = rendered(&args);
        assert_eq!(rendered[1], format!("if=pflash,format=raw,unit=0,file={},readonly=on", share.path().join("OVMF/OVMF_CODE.fd").display()));
        assert_eq!(rendered[3], format!("if=pflash,format=raw,unit=1,file={}", nvram.display()));

        std::fs::write(&nvram, b"modified").unwrap();
        firmware.firmware_args_in(share.path(), "x86_64", false).unwrap();
        assert_eq!(std::fs::read(&nvram).unwrap(), b"modified");
    }

    #[test]
    fn scratch_nvram_is_removed() {
        let share = share_dir();
        let args = Firmware::Uefi { nvram: None }.firmware_args_in(share.path(), "x86_64", false).unwrap();
        let scratch = match &args {
            FirmwareArgs::Uefi(efi) => efi.vars.path().to_path_buf(),
            _ => panic!("expected UEFI"),
        };
        assert_eq!(std::fs::read(&scratch).unwrap(), b"vars");
        drop(args);
        assert!(!scratch.exists());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let share = share_dir();
        let nvram = share.path().join("new-vars.fd");
        let args = Firmware::Uefi { nvram: Some(nvram.clone()) }.firmware_args_in(share.path(), "x86_64", true).unwrap();
        assert!(!nvram.exists());
        assert_eq!(rendered(&args)[3], format!("if=pflash,format=raw,unit=1,file={}", nvram.display()));

        let args = Firmware::Uefi { nvram: None }.firmware_args_in(share.path(), "x86_64", true).unwrap();
        assert!(matches!(&args, FirmwareArgs::Uefi(Efi { vars: NvramStore::Planned(_), .. })));
        assert!(rendered(&args)[3].ends_with("launch-vm-nvram.fd"));
    }

    #[test]
    fn missing_firmware() {
        let empty = tempfile::tempdir().unwrap();
        let firmware = Firmware::Uefi { nvram: None };
        assert!(matches!(firmware.firmware_args_in(empty.path(), "x86_64", false), Err(Error::Firmware(_))));
        assert!(matches!(firmware.firmware_args_in(empty.path(), "riscv64", false), Err(Error::Firmware(_))));
        assert!(matches!(Firmware::Bios(empty.path().join("bios.bin")).firmware_args(false), Err(Error::Firmware(_))));
    }

    #[test]
    fn default_adds_nothing() {
        let args = Firmware::Default.firmware_args(false).unwrap();
        assert!(rendered(&args).is_empty());
        assert!(args.display().into_iter().next().is_none());
    }
}
