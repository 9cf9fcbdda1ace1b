//! The line protocol between the launcher and its privileged `tap-control` helper.
//!
//! `make-nics` answers with one line per requested connection, `<tap>:<kind>` or `skip`.
//! `ovs-cleanup` and `del-taps` answer with their exit status: the number of failures.

use std::{
    io::{self, Write},
    str::FromStr,
};

use super::{NicReport, TapRecord};
use crate::{data::Connection, error::Error};

pub const SUBCOMMAND: &str = "tap-control";
pub const MAKE_NICS: &str = "make-nics";
pub const OVS_CLEANUP: &str = "ovs-cleanup";
pub const DEL_TAPS: &str = "del-taps";

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{bridge}:{tap}")]
pub struct OvsPort {
    pub bridge: String,
    pub tap: String,
}

impl From<&TapRecord> for OvsPort {
    fn from(record: &TapRecord) -> Self {
        Self {
            bridge: record.bridge.clone(),
            tap: record.name.clone(),
        }
    }
}

impl FromStr for OvsPort {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((bridge, tap)) if !bridge.is_empty() && !tap.is_empty() => Ok(Self {
                bridge: bridge.to_string(),
                tap: tap.to_string(),
            }),
            _ => Err(Error::Protocol(format!("'{s}' is not of the form bridge:tap"))),
        }
    }
}

pub fn make_nics_args(prefix: &str, owner: &str, connections: &[Connection]) -> Vec<String> {
    [SUBCOMMAND, MAKE_NICS, "--prefix", prefix, "--owner", owner]
        .into_iter()
        .map(String::from)
        .chain(connections.iter().map(Connection::to_string))
        .collect()
}

pub fn ovs_cleanup_args(ports: &[OvsPort]) -> Vec<String> {
    [SUBCOMMAND, OVS_CLEANUP].into_iter().map(String::from).chain(ports.iter().map(OvsPort::to_string)).collect()
}

pub fn del_taps_args(names: &[String]) -> Vec<String> {
    [SUBCOMMAND, DEL_TAPS].into_iter().map(String::from).chain(names.iter().cloned()).collect()
}

pub fn write_reports(out: &mut impl Write, reports: &[NicReport]) -> io::Result<()> {
    for report in reports {
        writeln!(out, "{report}")?;
    }
    out.flush()
}

/// Parse helper output. Parsing stops at the first malformed line; the reports before it are kept.
pub fn parse_reports(output: &str) -> (Vec<NicReport>, Option<Error>) {
    let mut reports = Vec::new();
    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        match line.parse() {
            Ok(report) => reports.push(report),
            Err(e) => return (reports, Some(e)),
        }
    }
    (reports, None)
}

/// Exit status carrying a failure count.
pub fn failure_status(failures: usize) -> u8 {
    failures.min(u8::MAX as usize) as u8
}
