//! Tap devices for bridged guest networking.
//!
//! Creating and deleting taps needs `CAP_NET_ADMIN`. All privileged work goes through [`TapControl`]:
//! [`HostTapControl`] performs it in-process (when already root, or inside the `tap-control` helper),
//! [`SudoTapControl`] asks the helper to do it through `sudo`, and [`DryRunTapControl`] only plans names.
//! A [`TapSession`] remembers every tap that was created and removes each exactly once.

use std::{fmt, str::FromStr};

use strum::{AsRefStr, Display, EnumString};

use crate::{
    data::Connection,
    error::{Error, Warning},
};

mod host;
mod privileged;
pub mod protocol;

pub use host::{CommandRunner, DryRunTapControl, HostTapControl, SystemRunner};
pub use privileged::SudoTapControl;

/// Linux interface names are limited to 15 bytes.
pub const MAX_IFNAME_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum TapKind {
    Bridge,
    Ovs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapRecord {
    pub name: String,
    pub kind: TapKind,
    pub bridge: String,
}

/// Outcome of provisioning one requested connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NicReport {
    /// User mode networking, no tap needed.
    Skip,
    Tap { name: String, kind: TapKind },
}

impl fmt::Display for NicReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => f.write_str("skip"),
            Self::Tap { name, kind } => write!(f, "{name}:{kind}"),
        }
    }
}

impl FromStr for NicReport {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "skip" {
            return Ok(Self::Skip);
        }
        let (name, kind) = s.split_once(':').ok_or_else(|| Error::Protocol(s.to_string()))?;
        let kind = TapKind::from_str(kind).map_err(|_| Error::Protocol(s.to_string()))?;
        if name.is_empty() || name.len() > MAX_IFNAME_LEN {
            return Err(Error::Protocol(s.to_string()));
        }
        Ok(Self::Tap { name: name.to_string(), kind })
    }
}

/// Result of a `make_nics` request. Reports cover the connections handled before any failure.
#[derive(Debug)]
pub struct MakeNics {
    pub reports: Vec<NicReport>,
    pub error: Option<Error>,
}

pub trait TapControl {
    /// Create and attach one tap per bridged connection, in order, stopping at the first failure.
    /// A tap whose attachment fails is deleted again before returning.
    fn make_nics(&mut self, connections: &[Connection]) -> MakeNics;

    /// Detach and delete taps. Failures are reported, not raised.
    fn remove(&mut self, records: &[TapRecord]) -> Vec<Warning>;
}

/// Tap name for the connection at `position`, e.g. `tap4242n0`.
pub fn tap_name(prefix: &str, position: usize) -> String {
    format!("{prefix}n{position}")
}

/// Default tap prefix for this process. Leaves room for the `n<position>` suffix.
pub fn default_prefix() -> String {
    let prefix = format!("tap{}", std::process::id());
    prefix[..prefix.len().min(MAX_IFNAME_LEN - 4)].to_string()
}

pub struct TapSession {
    control: Box<dyn TapControl>,
    records: Vec<TapRecord>,
}

impl TapSession {
    pub fn new(control: Box<dyn TapControl>) -> Self {
        Self { control, records: Vec::new() }
    }

    pub fn provision(&mut self, connections: &[Connection]) -> Result<Vec<NicReport>, Error> {
        if connections.iter().all(|connection| connection.bridge().is_none()) {
            return Ok(vec![NicReport::Skip; connections.len()]);
        }

        let MakeNics { reports, error } = self.control.make_nics(connections);
        for (connection, report) in connections.iter().zip(&reports) {
            if let NicReport::Tap { name, kind } = report {
                log::info!("Provisioned {kind} tap {name} on {connection}");
                self.records.push(TapRecord {
                    name: name.clone(),
                    kind: *kind,
                    bridge: connection.to_string(),
                });
            }
        }

        if let Some(error) = error {
            return Err(error);
        }
        if reports.len() != connections.len() {
            return Err(Error::Protocol(format!("expected {} results, got {}", connections.len(), reports.len())));
        }
        Ok(reports)
    }

    pub fn records(&self) -> &[TapRecord] {
        &self.records
    }

    /// Remove every provisioned tap. Calling this again does nothing.
    pub fn teardown(&mut self) {
        let records = std::mem::take(&mut self.records);
        if records.is_empty() {
            return;
        }
        log::debug!("Tearing down {} tap device{}", records.len(), crate::utils::plural_if(records.len() != 1));
        for warning in self.control.remove(&records) {
            log::warn!("{warning}");
        }
    }
}

impl Drop for TapSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Default)]
    pub(crate) struct Journal {
        pub(crate) created: Vec<String>,
        pub(crate) removed: Vec<String>,
    }

    /// Pretends to create taps, optionally failing the attachment on one bridge.
    pub(crate) struct FakeControl {
        pub(crate) journal: Rc<RefCell<Journal>>,
        pub(crate) fail_on: Option<String>,
    }

    impl TapControl for FakeControl {
        fn make_nics(&mut self, connections: &[Connection]) -> MakeNics {
            let mut reports = Vec::new();
            for (position, connection) in connections.iter().enumerate() {
                let Some(bridge) = connection.bridge() else {
                    reports.push(NicReport::Skip);
                    continue;
                };
                let name = tap_name("tapt", position);
                if self.fail_on.as_deref() == Some(bridge) {
                    return MakeNics {
                        reports,
                        error: Some(Error::ProvisioningFailure {
                            tap: name,
                            bridge: bridge.to_string(),
                            reason: "no such bridge".into(),
                        }),
                    };
                }
                self.journal.borrow_mut().created.push(name.clone());
                reports.push(NicReport::Tap { name, kind: TapKind::Bridge });
            }
            MakeNics { reports, error: None }
        }

        fn remove(&mut self, records: &[TapRecord]) -> Vec<Warning> {
            self.journal.borrow_mut().removed.extend(records.iter().map(|r| r.name.clone()));
            Vec::new()
        }
    }

    fn session(fail_on: Option<&str>) -> (TapSession, Rc<RefCell<Journal>>) {
        let journal = Rc::new(RefCell::new(Journal::default()));
        let control = FakeControl {
            journal: journal.clone(),
            fail_on: fail_on.map(String::from),
        };
        (TapSession::new(Box::new(control)), journal)
    }

    fn connections(names: &[&str]) -> Vec<Connection> {
        names.iter().map(|name| name.parse().unwrap()).collect()
    }

    #[test]
    fn user_mode_needs_no_tap() {
        let (mut session, journal) = session(None);
        let reports = session.provision(&connections(&["br0", "user", "br0"])).unwrap();
        assert_eq!(journal.borrow().created, vec!["taptn0", "taptn2"]);
        assert_eq!(reports[1], NicReport::Skip);
        assert_eq!(session.records().len(), 2);

        session.teardown();
        session.teardown();
        drop(session);
        assert_eq!(journal.borrow().removed, vec!["taptn0", "taptn2"]);
    }

    #[test]
    fn drop_tears_down() {
        let (mut session, journal) = session(None);
        session.provision(&connections(&["br0"])).unwrap();
        drop(session);
        assert_eq!(journal.borrow().removed, vec!["taptn0"]);
    }

    #[test]
    fn earlier_taps_survive_a_failure_until_teardown() {
        let (mut session, journal) = session(Some("br1"));
        let result = session.provision(&connections(&["br0", "br1", "br0"]));
        assert!(matches!(result, Err(Error::ProvisioningFailure { ref bridge, .. }) if bridge == "br1"));
        assert_eq!(journal.borrow().created, vec!["taptn0"]);
        drop(session);
        assert_eq!(journal.borrow().removed, vec!["taptn0"]);
    }

    #[test]
    fn only_user_mode_skips_the_helper() {
        let (mut session, journal) = session(Some("user"));
        let reports = session.provision(&connections(&["user", "user"])).unwrap();
        assert_eq!(reports, vec![NicReport::Skip, NicReport::Skip]);
        drop(session);
        assert!(journal.borrow().created.is_empty() && journal.borrow().removed.is_empty());
    }

    #[test]
    fn report_lines() {
        assert_eq!("skip".parse::<NicReport>().unwrap(), NicReport::Skip);
        assert_eq!(
            "tap12n0:ovs".parse::<NicReport>().unwrap(),
            NicReport::Tap {
                name: "tap12n0".into(),
                kind: TapKind::Ovs
            }
        );
        assert_eq!(NicReport::Tap { name: "t0".into(), kind: TapKind::Bridge }.to_string(), "t0:bridge");
        for bad in ["", "tap0", "tap0:vde", ":ovs", "averyveryverylongname:bridge"] {
            assert!(matches!(bad.parse::<NicReport>(), Err(Error::Protocol(_))), "{bad}");
        }
    }

    #[test]
    fn prefix_fits() {
        assert!(tap_name(&default_prefix(), 999).len() <= MAX_IFNAME_LEN);
    }
}
