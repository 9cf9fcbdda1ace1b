use std::{
    ffi::OsString,
    io::IsTerminal,
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use launchvm_core::{
    config::Config,
    data::{DiskSpec, Firmware, NetSpec},
    error::Error,
    launch::{Launch, LaunchOptions},
    prereq,
};

use crate::tap_control::TapControlCommand;

#[derive(Debug, Parser)]
#[command(name = "launch-vm", version, about = "Launch a KVM guest with the given disks and network devices", args_conflicts_with_subcommands = true)]
#[clap(group = ArgGroup::new("firmware").multiple(false))]
pub(crate) struct Args {
    #[command(subcommand)]
    command: Option<Command>,
    #[arg(short, long = "netdev", value_name = "SPEC", help = "Network device: 'user' or a bridge name, followed by ,key=value options")]
    netdevs: Vec<String>,
    #[arg(short, long = "disk", value_name = "SPEC", help = "Disk: an image path, followed by ,key=value options")]
    disks: Vec<String>,
    #[arg(long, value_name = "FILE", group = "firmware", help = "Boot with this BIOS image")]
    bios: Option<PathBuf>,
    #[arg(long, group = "firmware", help = "Boot with UEFI firmware and a throwaway variable store")]
    uefi: bool,
    #[arg(long, value_name = "FILE", group = "firmware", help = "Boot with UEFI firmware, keeping variables in FILE")]
    uefi_nvram: Option<PathBuf>,
    #[arg(long, help = "Print the command instead of running it")]
    dry_run: bool,
    #[arg(long, help = "Run the hypervisor in the foreground even when tap devices were created")]
    attached: bool,
    #[arg(long, value_name = "PATH", help = "Hypervisor binary to run")]
    kvm: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "Configuration file")]
    config: Option<PathBuf>,
    #[command(flatten)]
    pub(crate) verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::WarnLevel>,
    #[arg(last = true, value_name = "ARGS", help = "Extra arguments passed to the hypervisor")]
    extra_args: Vec<OsString>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Privileged tap device operations, run through sudo by the launcher.
    #[command(subcommand, hide = true)]
    TapControl(TapControlCommand),
}

impl Args {
    pub(crate) fn run(mut self) -> Result<ExitCode> {
        if let Some(Command::TapControl(command)) = self.command.take() {
            return command.run();
        }

        let config = Config::load(self.config.as_deref()).context("Couldn't load configuration")?;
        let options = self.launch_options(&config)?;
        let dry_run = options.dry_run;
        let launch = prepare(options, &config)?;

        launch.warnings().iter().for_each(|warning| log::warn!("{warning}"));
        if dry_run {
            println!("{}", launch.command_line());
            return Ok(ExitCode::SUCCESS);
        }

        println!("Launching {}:", launch.binary().display());
        launch.display().iter().for_each(|display| println!("{display}"));
        let code = launch.run()?;
        Ok(ExitCode::from(code.clamp(0, u8::MAX as i32) as u8))
    }

    fn launch_options(self, config: &Config) -> Result<LaunchOptions> {
        let disks = self.disks.iter().map(|disk| disk.parse()).collect::<Result<Vec<DiskSpec>, _>>()?;
        let netdevs = match self.netdevs.is_empty() {
            true => &config.netdevs,
            false => &self.netdevs,
        };
        let netdevs = netdevs.iter().map(|netdev| netdev.parse()).collect::<Result<Vec<NetSpec>, _>>()?;

        let firmware = match (self.bios, self.uefi, self.uefi_nvram) {
            (Some(bios), ..) => Firmware::Bios(bios),
            (_, _, Some(nvram)) => Firmware::Uefi { nvram: Some(nvram) },
            (_, true, None) => Firmware::Uefi { nvram: None },
            _ => Firmware::Default,
        };

        Ok(LaunchOptions {
            kvm: self.kvm,
            disks,
            netdevs,
            firmware,
            extra_args: self.extra_args,
            dry_run: self.dry_run,
            attached: self.attached,
        })
    }
}

/// Prepare the launch, offering to install each missing prerequisite once.
fn prepare(options: LaunchOptions, config: &Config) -> Result<Launch> {
    let mut installed: Vec<String> = Vec::new();
    loop {
        match options.clone().prepare(config) {
            Err(Error::MissingPrerequisite { binary, package }) if !installed.contains(&package) && offer_install(&binary, &package)? => {
                prereq::install_package(config, &package)?;
                installed.push(package);
            }
            result => return result.context("Couldn't prepare the virtual machine"),
        }
    }
}

fn offer_install(binary: &str, package: &str) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        return Ok(false);
    }
    inquire::Confirm::new(&format!("'{binary}' was not found. Install the '{package}' package?"))
        .with_default(true)
        .prompt()
        .context("Couldn't read the answer")
}
