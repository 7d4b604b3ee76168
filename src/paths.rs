//! Prefix layout and base-directory detection.
//!
//! Everything `ub` writes lives under a single base directory:
//!
//! ```text
//! <base>/ub/            # prefix
//!   Cellar/  Caskroom/  Applications/  bin/  sbin/  cache/
//! <base>/unbrew/        # companion metadata repository
//! ```
//!
//! The base is taken from `UB_BASE_DIR` when set, otherwise the first
//! writable candidate root is used (`/opt`, then `/usr/local`, then `$HOME`
//! on macOS; `~/.local`, then `$HOME` elsewhere).

use std::fs;
use std::path::{Path, PathBuf};

/// Process-wide directory layout, derived once at startup.
#[derive(Debug, Clone)]
pub struct Paths {
    pub base_dir: PathBuf,
    pub prefix: PathBuf,
    pub repo: PathBuf,
    pub cellar: PathBuf,
    pub caskroom: PathBuf,
    pub cache: PathBuf,
    pub bin: PathBuf,
    pub sbin: PathBuf,
    pub applications: PathBuf,
}

impl Paths {
    /// Derive the layout from `UB_BASE_DIR`, falling back to probing.
    pub fn from_env() -> Self {
        let base = match std::env::var("UB_BASE_DIR") {
            Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => detect_writable_base_dir(),
        };
        Self::from_base(&base)
    }

    /// Derive the full layout from an explicit base directory.
    pub fn from_base(base: &Path) -> Self {
        let prefix = base.join("ub");
        Self {
            base_dir: base.to_path_buf(),
            repo: base.join("unbrew"),
            cellar: prefix.join("Cellar"),
            caskroom: prefix.join("Caskroom"),
            cache: prefix.join("cache"),
            bin: prefix.join("bin"),
            sbin: prefix.join("sbin"),
            applications: prefix.join("Applications"),
            prefix,
        }
    }

    /// Every directory the install pipeline expects to exist.
    pub fn layout_dirs(&self) -> [&Path; 8] {
        [
            &self.prefix,
            &self.repo,
            &self.cellar,
            &self.caskroom,
            &self.cache,
            &self.bin,
            &self.sbin,
            &self.applications,
        ]
    }
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .ok()
        .filter(|home| !home.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Probe candidate roots for one we can create `<root>/ub` under.
fn detect_writable_base_dir() -> PathBuf {
    let home = home_dir();

    let candidates: Vec<PathBuf> = if cfg!(target_os = "macos") {
        vec![
            PathBuf::from("/opt"),
            PathBuf::from("/usr/local"),
            home.clone(),
        ]
    } else {
        vec![home.join(".local"), home.clone()]
    };

    for base in candidates {
        if fs::create_dir_all(base.join("ub")).is_ok() {
            return base;
        }
    }

    home
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_the_base() {
        let paths = Paths::from_base(Path::new("/tmp/ub-test-base"));
        assert_eq!(paths.prefix, PathBuf::from("/tmp/ub-test-base/ub"));
        assert_eq!(paths.repo, PathBuf::from("/tmp/ub-test-base/unbrew"));
        assert_eq!(paths.cellar, PathBuf::from("/tmp/ub-test-base/ub/Cellar"));
        assert_eq!(
            paths.caskroom,
            PathBuf::from("/tmp/ub-test-base/ub/Caskroom")
        );
        assert_eq!(paths.cache, PathBuf::from("/tmp/ub-test-base/ub/cache"));
        assert_eq!(paths.bin, PathBuf::from("/tmp/ub-test-base/ub/bin"));
        assert_eq!(
            paths.applications,
            PathBuf::from("/tmp/ub-test-base/ub/Applications")
        );
    }

    #[test]
    fn layout_dirs_cover_the_whole_prefix() {
        let paths = Paths::from_base(Path::new("/tmp/ub-test-base"));
        let dirs = paths.layout_dirs();
        assert_eq!(dirs.len(), 8);
        assert!(dirs.contains(&paths.cellar.as_path()));
        assert!(dirs.contains(&paths.sbin.as_path()));
    }
}
