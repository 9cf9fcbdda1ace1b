use std::{
    ffi::{OsStr, OsString},
    fmt,
    str::FromStr,
};

use crate::error::Error;

/// One `key=value` or bare `key` token of a device specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opt {
    pub key: String,
    pub value: Option<String>,
}

impl Opt {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
    pub fn flag(key: impl Into<String>) -> Self {
        Self { key: key.into(), value: None }
    }
}

impl fmt::Display for Opt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.key, value.replace(',', ",,")),
            None => f.write_str(&self.key),
        }
    }
}

/// The ordered tokens of one comma separated user argument.
///
/// A doubled comma (`,,`) is a literal comma inside a token, as in QEMU's own option syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    raw: String,
    tokens: Vec<Opt>,
}

impl DeviceSpec {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let tokens = split_escaped(raw)
            .into_iter()
            .filter(|token| !token.is_empty())
            .map(|token| match token.split_once('=') {
                Some(("", _)) => Err(Error::malformed(raw, format!("token '{token}' has an empty key"))),
                Some((key, value)) => Ok(Opt::new(key, value)),
                None => Ok(Opt::flag(token)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if tokens.is_empty() {
            return Err(Error::malformed(raw, "no options given"));
        }
        Ok(Self { raw: raw.to_string(), tokens })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn tokens(&self) -> &[Opt] {
        &self.tokens
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub(crate) fn split_escaped(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ',' if chars.peek() == Some(&',') => {
                chars.next();
                current.push(',');
            }
            ',' => tokens.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    tokens.push(current);
    tokens
}

/// Append `value` to a QEMU option string, doubling any commas it contains.
pub(crate) fn push_escaped(target: &mut OsString, value: &OsStr) {
    match value.to_str() {
        Some(s) if s.contains(',') => target.push(s.replace(',', ",,")),
        _ => target.push(value),
    }
}

/// Join rendered options onto a leading value, e.g. `virtio-blk,drive=disk00,serial=x`.
pub(crate) fn join_opts<'a>(head: OsString, opts: impl IntoIterator<Item = &'a Opt>) -> OsString {
    opts.into_iter().fold(head, |mut acc, opt| {
        if !acc.is_empty() {
            acc.push(",");
        }
        acc.push(opt.to_string());
        acc
    })
}
