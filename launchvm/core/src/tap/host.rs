use std::process::Command;

use super::{protocol::OvsPort, tap_name, MakeNics, NicReport, TapControl, TapKind, TapRecord, MAX_IFNAME_LEN};
use crate::{
    data::Connection,
    error::{Error, Warning},
};

pub trait CommandRunner {
    /// Run `program` with `args`, returning stdout on success and a description of the failure otherwise.
    fn run(&mut self, program: &str, args: &[&str]) -> Result<String, String>;
}

#[derive(Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, program: &str, args: &[&str]) -> Result<String, String> {
        log::debug!("Running {program} {}", args.join(" "));
        let output = Command::new(program).args(args).output().map_err(|e| format!("{program}: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{program} {} failed ({}): {}", args.join(" "), output.status, stderr.trim()))
        }
    }
}

/// Creates taps directly with `ip` and `ovs-vsctl`. Needs `CAP_NET_ADMIN`.
#[derive(Default)]
pub struct HostTapControl<R = SystemRunner> {
    prefix: String,
    owner: String,
    runner: R,
}

impl HostTapControl {
    pub fn new(prefix: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::with_runner(prefix, owner, SystemRunner)
    }
}

impl<R: CommandRunner> HostTapControl<R> {
    pub fn with_runner(prefix: impl Into<String>, owner: impl Into<String>, runner: R) -> Self {
        Self {
            prefix: prefix.into(),
            owner: owner.into(),
            runner,
        }
    }

    fn provision_one(&mut self, name: &str, bridge: &str) -> Result<TapKind, Error> {
        let failure = |reason: String| Error::ProvisioningFailure {
            tap: name.to_string(),
            bridge: bridge.to_string(),
            reason,
        };
        if name.len() > MAX_IFNAME_LEN {
            return Err(failure(format!("interface name is longer than {MAX_IFNAME_LEN} characters")));
        }

        self.runner.run("ip", &["tuntap", "add", "mode", "tap", "user", self.owner.as_str(), name]).map_err(failure)?;

        let kind = detect_kind(&mut self.runner, bridge);
        if let Err(reason) = self.attach(name, bridge, kind) {
            log::warn!("Attaching {name} to {bridge} failed, removing it");
            if let Err(e) = self.runner.run("ip", &["tuntap", "del", "mode", "tap", name]) {
                log::warn!("{}", Warning::Teardown(name.to_string(), e));
            }
            return Err(failure(reason));
        }
        Ok(kind)
    }

    fn attach(&mut self, name: &str, bridge: &str, kind: TapKind) -> Result<(), String> {
        match kind {
            TapKind::Bridge => self.runner.run("ip", &["link", "set", name, "master", bridge])?,
            TapKind::Ovs => self.runner.run("ovs-vsctl", &["add-port", bridge, name])?,
        };
        if let Err(e) = self.runner.run("ip", &["link", "set", name, "up"]) {
            if kind == TapKind::Ovs {
                self.runner.run("ovs-vsctl", &["del-port", bridge, name]).ok();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove each port from its Open vSwitch bridge, returning the failures.
    pub fn ovs_cleanup(&mut self, ports: &[OvsPort]) -> Vec<Warning> {
        ports
            .iter()
            .filter_map(|port| self.runner.run("ovs-vsctl", &["del-port", port.bridge.as_str(), port.tap.as_str()]).err().map(|e| Warning::Teardown(port.tap.clone(), e)))
            .collect()
    }

    pub fn delete_taps(&mut self, names: &[String]) -> Vec<Warning> {
        names
            .iter()
            .filter_map(|name| self.runner.run("ip", &["tuntap", "del", "mode", "tap", name.as_str()]).err().map(|e| Warning::Teardown(name.clone(), e)))
            .collect()
    }
}

impl<R: CommandRunner> TapControl for HostTapControl<R> {
    fn make_nics(&mut self, connections: &[Connection]) -> MakeNics {
        let mut reports = Vec::with_capacity(connections.len());
        for (position, connection) in connections.iter().enumerate() {
            let Some(bridge) = connection.bridge() else {
                reports.push(NicReport::Skip);
                continue;
            };
            let name = tap_name(&self.prefix, position);
            match self.provision_one(&name, bridge) {
                Ok(kind) => reports.push(NicReport::Tap { name, kind }),
                Err(error) => return MakeNics { reports, error: Some(error) },
            }
        }
        MakeNics { reports, error: None }
    }

    fn remove(&mut self, records: &[TapRecord]) -> Vec<Warning> {
        let ports: Vec<OvsPort> = records.iter().filter(|record| record.kind == TapKind::Ovs).map(OvsPort::from).collect();
        let names: Vec<String> = records.iter().map(|record| record.name.clone()).collect();

        let mut warnings = self.ovs_cleanup(&ports);
        warnings.extend(self.delete_taps(&names));
        warnings
    }
}

/// Plans tap names without touching the host, for `--dry-run`.
pub struct DryRunTapControl<R = SystemRunner> {
    prefix: String,
    runner: R,
}

impl DryRunTapControl {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            runner: SystemRunner,
        }
    }
}

impl<R: CommandRunner> TapControl for DryRunTapControl<R> {
    fn make_nics(&mut self, connections: &[Connection]) -> MakeNics {
        let reports = connections
            .iter()
            .enumerate()
            .map(|(position, connection)| match connection.bridge() {
                None => NicReport::Skip,
                Some(bridge) => NicReport::Tap {
                    name: tap_name(&self.prefix, position),
                    kind: detect_kind(&mut self.runner, bridge),
                },
            })
            .collect();
        MakeNics { reports, error: None }
    }

    fn remove(&mut self, _records: &[TapRecord]) -> Vec<Warning> {
        Vec::new()
    }
}

fn detect_kind<R: CommandRunner>(runner: &mut R, bridge: &str) -> TapKind {
    match runner.run("ovs-vsctl", &["br-exists", bridge]) {
        Ok(_) => TapKind::Ovs,
        Err(_) => TapKind::Bridge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every command and fails those whose rendering starts with one of `failing`.
    #[derive(Default)]
    struct ScriptedRunner {
        commands: Vec<String>,
        failing: Vec<&'static str>,
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&mut self, program: &str, args: &[&str]) -> Result<String, String> {
            let command = format!("{program} {}", args.join(" "));
            self.commands.push(command.clone());
            if self.failing.iter().any(|prefix| command.starts_with(prefix)) {
                Err(format!("{command}: failed"))
            } else {
                Ok(String::new())
            }
        }
    }

    fn control(failing: &[&'static str]) -> HostTapControl<ScriptedRunner> {
        HostTapControl::with_runner(
            "tap7",
            "alice",
            ScriptedRunner {
                failing: failing.to_vec(),
                ..Default::default()
            },
        )
    }

    fn connections(names: &[&str]) -> Vec<Connection> {
        names.iter().map(|name| name.parse().unwrap()).collect()
    }

    #[test]
    fn kernel_bridge() {
        let mut control = control(&["ovs-vsctl br-exists"]);
        let MakeNics { reports, error } = control.make_nics(&connections(&["user", "br0"]));
        assert!(error.is_none());
        assert_eq!(
            reports,
            vec![
                NicReport::Skip,
                NicReport::Tap {
                    name: "tap7n1".into(),
                    kind: TapKind::Bridge
                }
            ]
        );
        assert_eq!(
            control.runner.commands,
            vec![
                "ip tuntap add mode tap user alice tap7n1",
                "ovs-vsctl br-exists br0",
                "ip link set tap7n1 master br0",
                "ip link set tap7n1 up",
            ]
        );
    }

    #[test]
    fn ovs_bridge_and_teardown() {
        let mut control = control(&[]);
        let MakeNics { reports, .. } = control.make_nics(&connections(&["ovsbr"]));
        assert_eq!(
            reports,
            vec![NicReport::Tap {
                name: "tap7n0".into(),
                kind: TapKind::Ovs
            }]
        );
        control.runner.commands.clear();

        let warnings = control.remove(&[TapRecord {
            name: "tap7n0".into(),
            kind: TapKind::Ovs,
            bridge: "ovsbr".into(),
        }]);
        assert!(warnings.is_empty());
        assert_eq!(control.runner.commands, vec!["ovs-vsctl del-port ovsbr tap7n0", "ip tuntap del mode tap tap7n0"]);
    }

    #[test]
    fn attach_failure_rolls_back() {
        let mut control = control(&["ovs-vsctl br-exists", "ip link set tap7n1 master"]);
        let MakeNics { reports, error } = control.make_nics(&connections(&["br0", "nosuchbr", "br0"]));
        assert_eq!(reports.len(), 1);
        assert!(matches!(error, Some(Error::ProvisioningFailure { ref tap, .. }) if tap == "tap7n1"));
        assert_eq!(control.runner.commands.last().unwrap(), "ip tuntap del mode tap tap7n1");
        assert!(!control.runner.commands.iter().any(|c| c.contains("tap7n2")));
    }

    #[test]
    fn teardown_continues_past_failures() {
        let mut control = control(&["ovs-vsctl del-port", "ip tuntap del mode tap a"]);
        let records = [("a", TapKind::Ovs), ("b", TapKind::Bridge)].map(|(name, kind)| TapRecord {
            name: name.into(),
            kind,
            bridge: "br0".into(),
        });
        let warnings = control.remove(&records);
        assert_eq!(warnings.len(), 2);
        assert!(control.runner.commands.contains(&"ip tuntap del mode tap b".to_string()));
    }

    #[test]
    fn long_names_are_refused() {
        let mut control = HostTapControl::with_runner("averyverylongprefix", "alice", ScriptedRunner::default());
        let MakeNics { error, .. } = control.make_nics(&connections(&["br0"]));
        assert!(matches!(error, Some(Error::ProvisioningFailure { .. })));
        assert!(control.runner.commands.is_empty());
    }

    #[test]
    fn dry_run_creates_nothing() {
        let mut control = DryRunTapControl {
            prefix: "tap9".into(),
            runner: ScriptedRunner {
                failing: vec!["ovs-vsctl"],
                ..Default::default()
            },
        };
        let MakeNics { reports, error } = control.make_nics(&connections(&["br0", "user"]));
        assert!(error.is_none());
        assert_eq!(reports[0].to_string(), "tap9n0:bridge");
        assert_eq!(control.runner.commands, vec!["ovs-vsctl br-exists br0"]);
    }
}
