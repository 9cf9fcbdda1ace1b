use std::str::FromStr;

use super::spec::{DeviceSpec, Opt};
use crate::error::Error;

const DEFAULT_MAC_PREFIX: [&str; 6] = ["52", "54", "00", "12", "34", "00"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum Connection {
    #[display("user")]
    User,
    #[display("{_0}")]
    Bridge(String),
}

impl Connection {
    pub fn bridge(&self) -> Option<&str> {
        match self {
            Self::User => None,
            Self::Bridge(bridge) => Some(bridge),
        }
    }
}

impl FromStr for Connection {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(Error::malformed(s, "empty connection name")),
            "user" => Ok(Self::User),
            bridge => Ok(Self::Bridge(bridge.to_string())),
        }
    }
}

/// A validated `--netdev` argument: a connection followed by device or netdev options.
#[derive(Debug, Clone, PartialEq)]
pub struct NetSpec {
    pub spec: DeviceSpec,
    pub connection: Connection,
    pub id: Option<String>,
    pub model: Option<String>,
    pub mac: Option<String>,
    pub extra: Vec<Opt>,
}

impl NetSpec {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        Self::try_from(DeviceSpec::parse(raw)?)
    }
}

impl FromStr for NetSpec {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<DeviceSpec> for NetSpec {
    type Error = Error;

    fn try_from(spec: DeviceSpec) -> Result<Self, Self::Error> {
        let (first, rest) = spec.tokens().split_first().ok_or_else(|| Error::malformed(spec.raw(), "no options given"))?;
        if first.value.is_some() {
            return Err(Error::malformed(spec.raw(), "the first field must be 'user' or a bridge name"));
        }
        let connection: Connection = first.key.parse()?;

        let (mut id, mut model, mut mac) = (None, None, None);
        let mut extra = Vec::new();
        for opt in rest {
            match (opt.key.as_str(), opt.value.as_deref()) {
                ("id", Some(value)) => id = Some(value.to_string()),
                ("model" | "driver", Some(value)) => model = Some(value.to_string()),
                ("macaddr" | "mac", Some(value)) => mac = Some(expand_mac(value).ok_or_else(|| Error::malformed(spec.raw(), format!("invalid MAC address '{value}'")))?),
                _ => extra.push(opt.clone()),
            }
        }

        Ok(Self {
            spec,
            connection,
            id,
            model,
            mac,
            extra,
        })
    }
}

/// Complete a MAC address. A leading `:` fills the missing octets from `52:54:00:12:34:00`,
/// so `:05` becomes `52:54:00:12:34:05`.
pub fn expand_mac(value: &str) -> Option<String> {
    let octets: Vec<&str> = match value.strip_prefix(':') {
        Some(tail) => {
            let tail: Vec<&str> = tail.split(':').collect();
            if tail.len() >= DEFAULT_MAC_PREFIX.len() {
                return None;
            }
            DEFAULT_MAC_PREFIX[..DEFAULT_MAC_PREFIX.len() - tail.len()].iter().copied().chain(tail).collect()
        }
        None => value.split(':').collect(),
    };

    let valid = octets.len() == 6 && octets.iter().all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then(|| octets.join(":").to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connections() {
        let net = NetSpec::parse("user,hostfwd=tcp::2222-:22").unwrap();
        assert_eq!(net.connection, Connection::User);
        assert_eq!(net.extra, vec![Opt::new("hostfwd", "tcp::2222-:22")]);

        let net = NetSpec::parse("br0,macaddr=:05,model=e1000,id=lan").unwrap();
        assert_eq!(net.connection, Connection::Bridge("br0".into()));
        assert_eq!(net.connection.bridge(), Some("br0"));
        assert_eq!(net.mac.as_deref(), Some("52:54:00:12:34:05"));
        assert_eq!(net.model.as_deref(), Some("e1000"));
        assert_eq!(net.id.as_deref(), Some("lan"));
    }

    #[test]
    fn first_field_must_be_bare() {
        assert!(matches!(NetSpec::parse("bridge=br0"), Err(Error::MalformedSpec { .. })));
        assert!(matches!(NetSpec::parse("br0,mac=zz"), Err(Error::MalformedSpec { .. })));
    }

    #[test]
    fn macs() {
        assert_eq!(expand_mac("52:54:00:AB:CD:EF").as_deref(), Some("52:54:00:ab:cd:ef"));
        assert_eq!(expand_mac(":a0:05").as_deref(), Some("52:54:00:12:a0:05"));
        assert_eq!(expand_mac(":05:06:07:08:09:10"), None);
        assert_eq!(expand_mac("52:54:00"), None);
        assert_eq!(expand_mac(":5"), None);
    }
}
