//! Install receipts.
//!
//! Every successful install leaves an `INSTALL_RECEIPT.json` in the version
//! directory it created: formulae record what was installed and when, casks
//! additionally record the paths uninstall must clean up (the moved app
//! bundle and every linked binary stub).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, io_context};

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaReceipt {
    pub name: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub tap_dir: String,
}

impl FormulaReceipt {
    pub fn new(name: &str, version: &str, tap_dir: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            installed_at: Utc::now(),
            tap_dir: tap_dir.to_string(),
        }
    }

    pub fn write(&self, install_dir: &Path) -> Result<()> {
        write_receipt(install_dir, self)
    }

    pub fn read(install_dir: &Path) -> Result<Self> {
        read_receipt(install_dir)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaskReceipt {
    pub token: String,
    pub version: String,
    pub app_path: PathBuf,
    #[serde(default)]
    pub linked_binaries: Vec<PathBuf>,
}

impl CaskReceipt {
    pub fn write(&self, version_dir: &Path) -> Result<()> {
        write_receipt(version_dir, self)
    }

    pub fn read(version_dir: &Path) -> Result<Self> {
        read_receipt(version_dir)
    }
}

fn write_receipt<T: Serialize>(dir: &Path, receipt: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(receipt)?;
    let path = dir.join(RECEIPT_FILE);
    std::fs::write(&path, json)
        .map_err(|err| io_context(format!("write receipt {:?}", path.display()), err))
}

fn read_receipt<T: for<'de> Deserialize<'de>>(dir: &Path) -> Result<T> {
    let path = dir.join(RECEIPT_FILE);
    let data = std::fs::read(&path)
        .map_err(|err| io_context(format!("read receipt {:?}", path.display()), err))?;
    Ok(serde_json::from_slice(&data)?)
}
