use std::{
    path::{Path, PathBuf},
    process::Command,
};

use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ImageInfo {
    pub format: String,
    pub virtual_size: u64,
}

pub trait Inspect {
    fn inspect(&self, path: &Path) -> Result<ImageInfo, Error>;
}

/// Reads image metadata through `qemu-img info`.
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl Inspect for QemuImg {
    fn inspect(&self, path: &Path) -> Result<ImageInfo, Error> {
        let output = Command::new(&self.binary)
            .arg("info")
            .arg("--output=json")
            .arg(path)
            .output()
            .map_err(|e| Error::Command(self.binary.display().to_string(), e.to_string()))?;

        if !output.status.success() {
            return Err(Error::DiskImage(path.to_path_buf(), String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        parse_info(path, &output.stdout)
    }
}

fn parse_info(path: &Path, json: &[u8]) -> Result<ImageInfo, Error> {
    serde_json::from_slice(json).map_err(|e| Error::DiskImage(path.to_path_buf(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qemu_img_json() {
        let json = br#"{
    "virtual-size": 10737418240,
    "filename": "root.qcow2",
    "cluster-size": 65536,
    "format": "qcow2",
    "actual-size": 200704,
    "dirty-flag": false
}"#;
        let info = parse_info(Path::new("root.qcow2"), json).unwrap();
        assert_eq!(
            info,
            ImageInfo {
                format: "qcow2".into(),
                virtual_size: 10 * 1024 * 1024 * 1024
            }
        );
    }

    #[test]
    fn garbage() {
        assert!(matches!(parse_info(Path::new("x"), b"qemu-img: error"), Err(Error::DiskImage(..))));
    }
}
