//! Homebrew JSON API client.
//!
//! Formula and cask metadata come from `https://formulae.brew.sh/api`. Every
//! endpoint is fetched through the content-addressed download cache; this
//! client adds no caching layer of its own. Once per process it also mirrors
//! the signed manifest pair (`formula.jws.json`, `cask.jws.json`) into the
//! companion repository directory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::error::{Result, UbError, io_context};
use crate::reporter;

const DEFAULT_BASE_URL: &str = "https://formulae.brew.sh/api";
const REPO_MANIFESTS: [&str; 2] = ["cask.jws.json", "formula.jws.json"];

/// One row of the full formula index.
#[derive(Debug, Clone, Deserialize)]
pub struct FormulaSummary {
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub desc: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BottleFile {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Versions {
    #[serde(default)]
    pub stable: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BottleSpec {
    /// Platform tag → bottle file. Ordered so fallback selection is
    /// deterministic.
    #[serde(default)]
    pub files: BTreeMap<String, BottleFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bottle {
    #[serde(default)]
    pub stable: BottleSpec,
}

/// Formula metadata, reduced to the fields the install engine consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Formula {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub versions: Versions,
    #[serde(default)]
    pub bottle: Bottle,
}

/// One entry of a cask's `artifacts` sequence: a single-keyed map whose key
/// discriminates the variant. Unrecognized keys parse as `Other`.
#[derive(Debug, Clone)]
pub enum CaskArtifact {
    App(String),
    Binary {
        source: String,
        target: Option<String>,
    },
    Other,
}

impl<'de> Deserialize<'de> for CaskArtifact {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArtifactVisitor;

        impl<'de> Visitor<'de> for ArtifactVisitor {
            type Value = CaskArtifact;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a single-keyed artifact map")
            }

            fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut artifact = CaskArtifact::Other;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "app" => {
                            // Tolerate malformed payloads: a bad entry parses
                            // as `Other` instead of failing the whole cask.
                            let payload: serde_json::Value = map.next_value()?;
                            let app = payload
                                .as_array()
                                .and_then(|entries| entries.first())
                                .and_then(|value| value.as_str())
                                .unwrap_or_default();
                            if !app.trim().is_empty() {
                                artifact = CaskArtifact::App(app.to_string());
                            }
                        }
                        "binary" => {
                            let payload: serde_json::Value = map.next_value()?;
                            let Some(entries) = payload.as_array() else {
                                continue;
                            };
                            let source = entries
                                .first()
                                .and_then(|value| value.as_str())
                                .unwrap_or_default();
                            if source.trim().is_empty() {
                                continue;
                            }
                            let target = entries
                                .get(1)
                                .and_then(|value| value.get("target"))
                                .and_then(|value| value.as_str())
                                .map(str::trim)
                                .filter(|target| !target.is_empty())
                                .map(str::to_string);
                            artifact = CaskArtifact::Binary {
                                source: source.to_string(),
                                target,
                            };
                        }
                        _ => {
                            let _: serde::de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                Ok(artifact)
            }
        }

        deserializer.deserialize_map(ArtifactVisitor)
    }
}

/// A binary stub a cask asks to link into `<prefix>/bin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaskBinary {
    pub source: String,
    pub target: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Cask {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub name: Vec<String>,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub artifacts: Vec<CaskArtifact>,
}

impl Cask {
    /// The first non-empty `app` artifact path, if any.
    pub fn app_artifact(&self) -> Option<&str> {
        self.artifacts.iter().find_map(|artifact| match artifact {
            CaskArtifact::App(path) => Some(path.as_str()),
            _ => None,
        })
    }

    /// Every `binary` artifact as `(source, optional target)`.
    pub fn binary_artifacts(&self) -> Vec<CaskBinary> {
        self.artifacts
            .iter()
            .filter_map(|artifact| match artifact {
                CaskArtifact::Binary { source, target } => Some(CaskBinary {
                    source: source.clone(),
                    target: target.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

pub struct MetadataClient {
    fetcher: Cache,
    repo_dir: PathBuf,
    base_url: String,
    repo_synced: tokio::sync::OnceCell<()>,
}

impl MetadataClient {
    /// Client against the upstream API, caching under `<cache_dir>/api` and
    /// mirroring the signed manifests into `repo_dir`.
    pub fn new(cache_dir: &Path, repo_dir: &Path) -> Self {
        Self::with_base_url(cache_dir, repo_dir, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(cache_dir: &Path, repo_dir: &Path, base_url: &str) -> Self {
        Self {
            fetcher: Cache::new(cache_dir.join("api")),
            repo_dir: repo_dir.to_path_buf(),
            base_url: base_url.trim_end_matches('/').to_string(),
            repo_synced: tokio::sync::OnceCell::new(),
        }
    }

    pub async fn list_formulae(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<FormulaSummary>> {
        self.ensure_local_repository(cancel).await?;
        let url = format!("{}/formula.json", self.base_url);
        let file = self.fetcher.fetch(cancel, &url).await?;
        let data = std::fs::read(&file).map_err(|err| io_context("read formula list", err))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn formula(&self, cancel: &CancellationToken, name: &str) -> Result<Formula> {
        self.ensure_local_repository(cancel).await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(UbError::Config("formula name is required".to_string()));
        }
        let url = format!("{}/formula/{}.json", self.base_url, name);
        let file = self.fetcher.fetch(cancel, &url).await?;
        let data = std::fs::read(&file)
            .map_err(|err| io_context(format!("read formula {name:?} metadata"), err))?;
        let formula: Formula = serde_json::from_slice(&data)?;
        if formula.name.is_empty() {
            return Err(UbError::Config(format!(
                "formula {name:?} metadata is missing name"
            )));
        }
        Ok(formula)
    }

    pub async fn cask(&self, cancel: &CancellationToken, token: &str) -> Result<Cask> {
        self.ensure_local_repository(cancel).await?;
        let token = token.trim();
        if token.is_empty() {
            return Err(UbError::Config("cask name is required".to_string()));
        }
        let url = format!("{}/cask/{}.json", self.base_url, token);
        let file = self.fetcher.fetch(cancel, &url).await?;
        let data = std::fs::read(&file)
            .map_err(|err| io_context(format!("read cask {token:?} metadata"), err))?;
        let cask: Cask = serde_json::from_slice(&data)?;
        if cask.token.trim().is_empty() {
            return Err(UbError::Config(format!(
                "cask {token:?} metadata is missing token"
            )));
        }
        Ok(cask)
    }

    /// Drop the on-disk api cache so the next call refetches.
    pub fn invalidate_disk_cache(&self) -> Result<()> {
        match std::fs::remove_dir_all(self.fetcher.dir()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_context("clear api cache", err)),
        }
    }

    /// Mirror the signed manifest pair into the repository directory, once
    /// per process. A failed sync is retried on the next metadata call.
    async fn ensure_local_repository(&self, cancel: &CancellationToken) -> Result<()> {
        if self.repo_dir.as_os_str().is_empty() {
            return Ok(());
        }
        self.repo_synced
            .get_or_try_init(|| self.sync_local_repository(cancel))
            .await?;
        Ok(())
    }

    async fn sync_local_repository(&self, cancel: &CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&self.repo_dir)
            .map_err(|err| io_context("create local repository dir", err))?;

        for manifest in REPO_MANIFESTS {
            let url = format!("{}/{}", self.base_url, manifest);
            let source = self.fetcher.fetch(cancel, &url).await?;
            let target = self.repo_dir.join(manifest);
            copy_file(&source, &target)?;
            if let Ok(meta) = std::fs::metadata(&source) {
                let size = reporter::format_size(meta.len());
                println!("✔︎ JSON API {manifest:<56} Downloaded {size:>8}/{size:>8}");
            }
        }
        Ok(())
    }
}

/// Copy through a `.tmp` sibling and rename, so a partially written target
/// never shadows a complete one.
fn copy_file(source: &Path, target: &Path) -> Result<()> {
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::copy(source, &tmp)
        .map_err(|err| io_context(format!("copy file to {:?}", target.display()), err))?;
    if let Err(err) = std::fs::rename(&tmp, target) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_context(
            format!("publish target {:?}", target.display()),
            err,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_artifact_takes_the_first_nonempty_entry() {
        let cask: Cask = serde_json::from_str(
            r#"{"token":"cursor","artifacts":[{"zap":["x"]},{"app":["Cursor.app"]}]}"#,
        )
        .unwrap();
        assert_eq!(cask.app_artifact(), Some("Cursor.app"));
    }

    #[test]
    fn missing_app_artifact_is_none() {
        let cask: Cask = serde_json::from_str(
            r#"{"token":"foo","artifacts":[{"binary":["$APPDIR/Foo.app/Contents/MacOS/foo"]}]}"#,
        )
        .unwrap();
        assert_eq!(cask.app_artifact(), None);
    }

    #[test]
    fn binary_artifacts_carry_an_optional_target() {
        let cask: Cask = serde_json::from_str(
            r#"{"token":"cursor","artifacts":[
                {"binary":["$APPDIR/Cursor.app/Contents/Resources/app/bin/code",{"target":"cursor"}]},
                {"binary":["$APPDIR/Cursor.app/Contents/MacOS/cursor-tunnel"]}
            ]}"#,
        )
        .unwrap();

        let binaries = cask.binary_artifacts();
        assert_eq!(binaries.len(), 2);
        assert_eq!(
            binaries[0],
            CaskBinary {
                source: "$APPDIR/Cursor.app/Contents/Resources/app/bin/code".to_string(),
                target: Some("cursor".to_string()),
            }
        );
        assert_eq!(binaries[1].target, None);
    }

    #[test]
    fn unknown_artifact_tags_are_ignored() {
        let cask: Cask = serde_json::from_str(
            r#"{"token":"x","artifacts":[{"pkg":["X.pkg"]},{"uninstall":[{"quit":"com.x"}]}]}"#,
        )
        .unwrap();
        assert_eq!(cask.app_artifact(), None);
        assert!(cask.binary_artifacts().is_empty());
    }

    #[test]
    fn formula_deserializes_with_defaults() {
        let formula: Formula = serde_json::from_str(
            r#"{"name":"hello","versions":{"stable":"2.12.2"},
                "bottle":{"stable":{"files":{"arm64_sonoma":{"url":"https://x/blob","sha256":"ab"}}}}}"#,
        )
        .unwrap();
        assert_eq!(formula.versions.stable, "2.12.2");
        assert!(formula.dependencies.is_empty());
        assert!(formula.bottle.stable.files.contains_key("arm64_sonoma"));
    }
}
