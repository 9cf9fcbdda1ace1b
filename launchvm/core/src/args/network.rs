use std::{borrow::Cow, collections::HashSet, ffi::OsString};

use super::{Driver, ResolvedDevice};
use crate::{
    arg,
    config::Config,
    data::{spec::join_opts, Connection, NetSpec, Opt},
    error::Error,
    oarg,
    probe::{CapabilityCache, Introspect},
    tap::NicReport,
    utils::{ArgDisplay, EmulatorArgs, QemuArg},
};

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedNic {
    pub device: ResolvedDevice,
    pub connection: Connection,
    pub tap: Option<String>,
    pub mac: Option<String>,
}

pub(crate) struct NicResolver<'a, P> {
    cache: &'a mut CapabilityCache<P>,
    config: &'a Config,
}

impl<'a, P: Introspect> NicResolver<'a, P> {
    pub(crate) fn new(cache: &'a mut CapabilityCache<P>, config: &'a Config) -> Self {
        Self { cache, config }
    }

    /// `reports` holds one provisioning result per spec, in the same order.
    pub(crate) fn nic_args(&mut self, specs: &[NetSpec], reports: &[NicReport]) -> Result<NetArgs, Error> {
        if specs.len() != reports.len() {
            return Err(Error::Protocol(format!("expected {} provisioning results, got {}", specs.len(), reports.len())));
        }

        let mut ids = HashSet::new();
        let nics = specs
            .iter()
            .zip(reports)
            .enumerate()
            .map(|(ordinal, (spec, report))| {
                let nic = self.resolve(ordinal, spec, report)?;
                if !ids.insert(nic.device.id.clone()) {
                    return Err(Error::malformed(spec.spec.raw(), format!("duplicate device id '{}'", nic.device.id)));
                }
                Ok(nic)
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(NetArgs { nics })
    }

    fn resolve(&mut self, ordinal: usize, spec: &NetSpec, report: &NicReport) -> Result<ResolvedNic, Error> {
        let id = spec.id.clone().unwrap_or_else(|| format!("net{ordinal:02}"));
        let model = spec.model.as_deref().unwrap_or(self.config.nic_model());

        let tap = match (&spec.connection, report) {
            (Connection::User, NicReport::Skip) => None,
            (Connection::Bridge(_), NicReport::Tap { name, .. }) => Some(name.clone()),
            (connection, report) => return Err(Error::Protocol(format!("'{report}' does not match connection {connection}"))),
        };

        let partition = self.cache.partition(Some(model), &spec.extra)?;
        log::debug!("Network {id}: {} via {model}", spec.connection);

        Ok(ResolvedNic {
            device: ResolvedDevice {
                id,
                driver: Driver::Model(model.to_string()),
                backend: partition.backend,
                frontend: partition.frontend,
            },
            connection: spec.connection.clone(),
            tap,
            mac: spec.mac.clone(),
        })
    }
}

pub struct NetArgs {
    nics: Vec<ResolvedNic>,
}

impl NetArgs {
    pub fn nics(&self) -> &[ResolvedNic] {
        &self.nics
    }
}

impl ResolvedNic {
    fn netdev_arg(&self) -> OsString {
        let head = match &self.tap {
            None => format!("user,id={}", self.device.id),
            Some(tap) => format!("tap,id={},ifname={tap},script=no,downscript=no", self.device.id),
        };
        join_opts(OsString::from(head), &self.device.backend)
    }

    fn device_arg(&self) -> OsString {
        let structural: Vec<Opt> = [Some(Opt::new("netdev", &self.device.id)), self.mac.as_ref().map(|mac| Opt::new("mac", mac))]
            .into_iter()
            .flatten()
            .collect();
        join_opts(OsString::from(format!("driver={}", self.device.driver)), structural.iter().chain(&self.device.frontend))
    }

    fn arg_display(&self) -> ArgDisplay {
        let value = match &self.tap {
            None => format!("user mode via {}", self.device.driver),
            Some(tap) => format!("{} (tap {tap}) via {}", self.connection, self.device.driver),
        };
        ArgDisplay {
            name: Cow::Owned(format!("Network ({})", self.device.id)),
            value: Cow::Owned(value),
        }
    }
}

impl EmulatorArgs for NetArgs {
    fn display(&self) -> impl IntoIterator<Item = ArgDisplay> {
        self.nics.iter().map(ResolvedNic::arg_display)
    }
    fn qemu_args(&self) -> impl IntoIterator<Item = QemuArg> {
        self.nics
            .iter()
            .flat_map(|nic| [arg!("-netdev"), oarg!(nic.netdev_arg()), arg!("-device"), oarg!(nic.device_arg())])
    }
}
