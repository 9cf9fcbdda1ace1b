use std::process::ExitCode;

use anyhow::{ensure, Result};
use clap::Subcommand;
use launchvm_core::{
    data::Connection,
    error::Warning,
    tap::{
        protocol::{self, OvsPort},
        HostTapControl, MakeNics, TapControl,
    },
};

#[derive(Debug, Subcommand)]
pub(crate) enum TapControlCommand {
    /// Create one tap per bridged connection and print a `<tap>:<kind>` or `skip` line for each.
    MakeNics {
        #[arg(long)]
        prefix: String,
        #[arg(long)]
        owner: String,
        #[arg(required = true, value_name = "CONNECTION")]
        connections: Vec<String>,
    },
    /// Remove `BRIDGE:TAP` ports from Open vSwitch. Exits with the number of failures.
    OvsCleanup {
        #[arg(required = true, value_name = "BRIDGE:TAP")]
        ports: Vec<String>,
    },
    /// Delete tap devices. Exits with the number of failures.
    DelTaps {
        #[arg(required = true, value_name = "TAP")]
        taps: Vec<String>,
    },
}

impl TapControlCommand {
    pub(crate) fn run(self) -> Result<ExitCode> {
        let mut control: HostTapControl = HostTapControl::default();
        match self {
            Self::MakeNics { prefix, owner, connections } => {
                ensure!(prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'), "Invalid tap prefix '{prefix}'");
                let connections = connections.iter().map(|c| c.parse()).collect::<Result<Vec<Connection>, _>>()?;

                let MakeNics { reports, error } = HostTapControl::new(prefix, owner).make_nics(&connections);
                protocol::write_reports(&mut std::io::stdout().lock(), &reports)?;
                match error {
                    Some(error) => {
                        eprintln!("{error}");
                        Ok(ExitCode::FAILURE)
                    }
                    None => Ok(ExitCode::SUCCESS),
                }
            }
            Self::OvsCleanup { ports } => {
                let mut failures = 0;
                let mut valid = Vec::with_capacity(ports.len());
                for port in ports {
                    match port.parse::<OvsPort>() {
                        Ok(port) => valid.push(port),
                        Err(e) => {
                            eprintln!("{e}");
                            failures += 1;
                        }
                    }
                }
                Ok(report_failures(failures, control.ovs_cleanup(&valid)))
            }
            Self::DelTaps { taps } => Ok(report_failures(0, control.delete_taps(&taps))),
        }
    }
}

fn report_failures(earlier: usize, warnings: Vec<Warning>) -> ExitCode {
    warnings.iter().for_each(|warning| eprintln!("{warning}"));
    ExitCode::from(protocol::failure_status(earlier + warnings.len()))
}
