use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    process::Command,
};

use crate::{data::Opt, error::Error};

/// Asks a hypervisor which properties a `-device` model accepts.
pub trait Introspect {
    fn device_properties(&self, model: &str) -> Result<BTreeSet<String>, Error>;
}

pub struct QemuIntrospect {
    binary: PathBuf,
}

impl QemuIntrospect {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Introspect for QemuIntrospect {
    fn device_properties(&self, model: &str) -> Result<BTreeSet<String>, Error> {
        log::debug!("Probing properties of device model {model}");
        let output = Command::new(&self.binary)
            .arg("-device")
            .arg(format!("{model},help"))
            .output()
            .map_err(|e| Error::Command(self.binary.display().to_string(), e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || stderr.contains("not found") {
            let reason = stderr.lines().chain(stdout.lines()).find(|line| !line.trim().is_empty()).unwrap_or("unknown device model");
            return Err(Error::ProbeFailure {
                model: model.to_string(),
                reason: reason.trim().to_string(),
            });
        }
        Ok(parse_device_help(&stdout))
    }
}

/// Parse both the current `  name=<type> - description` listing and the legacy `model.name=type` one.
pub(crate) fn parse_device_help(text: &str) -> BTreeSet<String> {
    text.lines()
        .filter_map(|line| line.trim().split_once('='))
        .map(|(name, _)| name.rsplit('.').next().unwrap_or(name).trim())
        .filter(|name| !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .map(str::to_string)
        .collect()
}

/// Per-invocation memo of device model properties. Each model is probed at most once.
pub struct CapabilityCache<P> {
    probe: P,
    models: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Partition {
    pub frontend: Vec<Opt>,
    pub backend: Vec<Opt>,
}

impl<P: Introspect> CapabilityCache<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            models: HashMap::new(),
        }
    }

    pub fn supported(&mut self, model: &str) -> Result<&BTreeSet<String>, Error> {
        if !self.models.contains_key(model) {
            let properties = self.probe.device_properties(model)?;
            log::debug!("{model} accepts {} properties", properties.len());
            self.models.insert(model.to_string(), properties);
        }
        Ok(&self.models[model])
    }

    pub fn supports(&mut self, model: &str, property: &str) -> Result<bool, Error> {
        Ok(self.supported(model)?.contains(property))
    }

    /// Route every option the device model recognises to the frontend, and everything else to the backend.
    /// Without a model there is no frontend and nothing is probed.
    pub fn partition<'a>(&mut self, model: Option<&str>, opts: impl IntoIterator<Item = &'a Opt>) -> Result<Partition, Error> {
        let mut partition = Partition::default();
        let Some(model) = model else {
            partition.backend.extend(opts.into_iter().cloned());
            return Ok(partition);
        };

        let supported = self.supported(model)?;
        for opt in opts {
            if supported.contains(&opt.key) {
                partition.frontend.push(opt.clone());
            } else {
                partition.backend.push(opt.clone());
            }
        }
        Ok(partition)
    }
}
