use std::{
    path::PathBuf,
    process::{Command, Output},
};

use super::{
    protocol::{self, OvsPort},
    tap_name, MakeNics, TapControl, TapKind, TapRecord,
};
use crate::{
    data::Connection,
    error::{Error, Warning},
};

/// Runs the `tap-control` helper of this executable through `sudo`.
pub struct SudoTapControl {
    sudo: PathBuf,
    helper: PathBuf,
    prefix: String,
    owner: String,
}

impl SudoTapControl {
    pub fn new(sudo: PathBuf, helper: PathBuf, prefix: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            sudo,
            helper,
            prefix: prefix.into(),
            owner: owner.into(),
        }
    }

    fn run_helper(&self, args: &[String]) -> Result<Output, Error> {
        log::debug!("Running {} {} {}", self.sudo.display(), self.helper.display(), args.join(" "));
        Command::new(&self.sudo)
            .arg("--")
            .arg(&self.helper)
            .args(args)
            .output()
            .map_err(|e| Error::Command(self.sudo.display().to_string(), e.to_string()))
    }

    /// Runs a cleanup request, whose exit status is its failure count.
    fn cleanup(&self, args: &[String], subject: String) -> Option<Warning> {
        match self.run_helper(args) {
            Ok(output) if output.status.success() => None,
            Ok(output) => {
                let failures = output.status.code().map_or_else(|| output.status.to_string(), |code| format!("{code} failure(s)"));
                Some(Warning::Teardown(subject, format!("{failures}: {}", last_line(&output.stderr))))
            }
            Err(e) => Some(Warning::Teardown(subject, e.to_string())),
        }
    }
}

impl TapControl for SudoTapControl {
    fn make_nics(&mut self, connections: &[Connection]) -> MakeNics {
        let output = match self.run_helper(&protocol::make_nics_args(&self.prefix, &self.owner, connections)) {
            Ok(output) => output,
            Err(error) => return MakeNics { reports: Vec::new(), error: Some(error) },
        };

        let (reports, parse_error) = protocol::parse_reports(&String::from_utf8_lossy(&output.stdout));
        if output.status.success() {
            return MakeNics { reports, error: parse_error };
        }

        let position = reports.len();
        let error = Error::ProvisioningFailure {
            tap: tap_name(&self.prefix, position),
            bridge: connections.get(position).map(Connection::to_string).unwrap_or_default(),
            reason: match last_line(&output.stderr) {
                "" => format!("helper exited with {}", output.status),
                reason => reason.to_string(),
            },
        };
        MakeNics { reports, error: Some(error) }
    }

    fn remove(&mut self, records: &[TapRecord]) -> Vec<Warning> {
        let ports: Vec<OvsPort> = records.iter().filter(|record| record.kind == TapKind::Ovs).map(OvsPort::from).collect();
        let names: Vec<String> = records.iter().map(|record| record.name.clone()).collect();

        let mut warnings = Vec::new();
        if !ports.is_empty() {
            let subject = ports.iter().map(|port| port.tap.as_str()).collect::<Vec<_>>().join(", ");
            warnings.extend(self.cleanup(&protocol::ovs_cleanup_args(&ports), subject));
        }
        if !names.is_empty() {
            warnings.extend(self.cleanup(&protocol::del_taps_args(&names), names.join(", ")));
        }
        warnings
    }
}

fn last_line(stderr: &[u8]) -> &str {
    std::str::from_utf8(stderr).unwrap_or_default().lines().map(str::trim).filter(|line| !line.is_empty()).last().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_stderr_line() {
        assert_eq!(last_line(b"creating tap\nError: no such bridge br9\n\n"), "Error: no such bridge br9");
        assert_eq!(last_line(b""), "");
        assert_eq!(last_line(&[0xff, 0xfe]), "");
    }

    #[test]
    fn missing_sudo_is_a_command_error() {
        let mut control = SudoTapControl::new("/nonexistent/sudo".into(), "/nonexistent/launch-vm".into(), "tap1", "alice");
        let MakeNics { reports, error } = control.make_nics(&[Connection::Bridge("br0".into())]);
        assert!(reports.is_empty());
        assert!(matches!(error, Some(Error::Command(..))));

        let warnings = control.remove(&[TapRecord {
            name: "tap1n0".into(),
            kind: TapKind::Ovs,
            bridge: "br0".into(),
        }]);
        assert_eq!(warnings.len(), 2);
    }
}
