use std::{
    path::{Path, PathBuf},
    process::Command,
};

use which::which;

use crate::{config::Config, error::Error};

fn missing(binary: &str, config: &Config) -> Error {
    Error::MissingPrerequisite {
        binary: binary.to_string(),
        package: config.package_for(binary),
    }
}

/// Resolve `program` (a bare name searched in `PATH`, or a path) to an executable.
pub fn locate(program: &Path, config: &Config) -> Result<PathBuf, Error> {
    which(program).map_err(|_| {
        let binary = program.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_else(|| program.display().to_string());
        missing(&binary, config)
    })
}

/// The hypervisor: an explicit path, else the configured one, else `kvm`, else `qemu-system-<arch>`.
pub fn hypervisor(explicit: Option<&Path>, config: &Config) -> Result<PathBuf, Error> {
    if let Some(program) = explicit.or(config.kvm.as_deref()) {
        return which(program).map_err(|_| Error::MissingPrerequisite {
            binary: program.display().to_string(),
            package: config.package_for("kvm"),
        });
    }
    which("kvm")
        .or_else(|_| which(format!("qemu-system-{}", std::env::consts::ARCH)))
        .map_err(|_| missing("kvm", config))
}

/// Install `package` with the configured install command, through `sudo` unless already root.
pub fn install_package(config: &Config, package: &str) -> Result<(), Error> {
    let (program, args) = config
        .install_command
        .split_first()
        .ok_or_else(|| Error::Command("install_command".into(), "no install command configured".into()))?;

    let mut command = if nix::unistd::geteuid().is_root() {
        Command::new(program)
    } else {
        let mut command = Command::new(locate(Path::new("sudo"), config)?);
        command.arg(program);
        command
    };
    command.args(args).arg(package);

    log::info!("Installing {package}");
    let status = command.status().map_err(|e| Error::Command(program.clone(), e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Command(program.clone(), format!("installing {package} exited with {status}")))
    }
}
