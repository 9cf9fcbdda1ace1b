use std::{borrow::Cow, ffi::OsStr, fmt};

pub type QemuArg = Cow<'static, OsStr>;

#[macro_export]
macro_rules! arg {
    ($arg:expr) => {
        std::borrow::Cow::Borrowed(std::ffi::OsStr::new($arg))
    };
}

#[macro_export]
macro_rules! oarg {
    ($arg:expr) => {
        std::borrow::Cow::Owned(std::ffi::OsString::from($arg))
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArgDisplay {
    pub name: Cow<'static, str>,
    pub value: Cow<'static, str>,
}

impl fmt::Display for ArgDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " - {}: {}", self.name, self.value)
    }
}

pub trait EmulatorArgs {
    fn display(&self) -> impl IntoIterator<Item = ArgDisplay> {
        std::iter::empty()
    }
    fn qemu_args(&self) -> impl IntoIterator<Item = QemuArg> {
        std::iter::empty()
    }
}

pub(crate) fn plural_if(b: bool) -> &'static str {
    if b {
        "s"
    } else {
        ""
    }
}

/// Quote an argument so the rendered command line can be pasted into a POSIX shell.
pub fn shell_quote(arg: &OsStr) -> Cow<'_, str> {
    let arg = arg.to_string_lossy();
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ',' | '.' | '_' | '-' | '/' | '=' | ':' | '+' | '@' | '%'));
    if safe {
        arg
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}
