//! Process-scoped install lock.
//!
//! A `.ub.lock` sentinel is exclusively created inside the prefix directory
//! being mutated and holds the owner's PID. There is no blocking wait and no
//! retry; contention surfaces immediately so two `ub` processes never race
//! the same prefix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, UbError, io_context};

const LOCK_FILE: &str = ".ub.lock";

#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
    held: bool,
}

impl InstallLock {
    /// Exclusively create the sentinel under `root`, writing our PID into it.
    pub fn acquire(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|err| io_context("create root dir for lock", err))?;

        let path = root.join(LOCK_FILE);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(UbError::AlreadyLocked(path));
            }
            Err(err) => return Err(io_context("acquire lock", err)),
        };

        if let Err(err) = file.write_all(std::process::id().to_string().as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(io_context("write lock pid", err));
        }

        Ok(Self { path, held: true })
    }

    /// Remove the sentinel. Idempotent on an already-released lock.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_context("release lock", err)),
        }
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
        }
    }
}
