//! Install, uninstall, and autoremove coordination.
//!
//! The manager owns whole-layout transitions: it locks the prefix, resolves
//! the dependency closure, fans the work out through the scheduler, and
//! drives the cache/extract/link pipeline per formula. Cask installs follow
//! the same shape with a single archive and an app-bundle move instead of a
//! link pass.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::api::{BottleFile, Cask, Formula, FormulaSummary, MetadataClient};
use crate::cache::Cache;
use crate::error::{Result, UbError, io_context};
use crate::extract::{extract_tar_gz, extract_zip, is_zip_archive, normalize};
use crate::lock::InstallLock;
use crate::paths::Paths;
use crate::receipt::{CaskReceipt, FormulaReceipt};
use crate::reporter::{InstallReporter, UninstallReporter, format_size};
use crate::scheduler::{Executor, FnJob, Job, JobContext, JobFuture};

/// Progress callback for tree removal: `(removed, total, done)`.
pub type RemoveProgressFn<'a> = &'a (dyn Fn(usize, usize, bool) + Send + Sync);

#[derive(Debug, Clone)]
pub struct UninstallRecord {
    pub name: String,
    pub path: PathBuf,
    pub files: usize,
    pub size_bytes: u64,
    pub size_human: String,
}

#[derive(Debug, Clone, Default)]
pub struct UninstallSummary {
    pub removed: Vec<UninstallRecord>,
    pub auto_remove: Vec<UninstallRecord>,
}

pub struct Manager {
    pub api: Arc<MetadataClient>,
    pub fetch: Arc<Cache>,
    pub paths: Paths,
    pub workers: usize,
    /// Ordered bottle tag preference for the running platform.
    pub bottle_tags: Vec<String>,
}

impl Manager {
    /// Manager over the environment-derived layout. `workers == 0` picks the
    /// platform default.
    pub fn new(workers: usize) -> Self {
        Self::with_paths(Paths::from_env(), workers)
    }

    pub fn with_paths(paths: Paths, workers: usize) -> Self {
        let api = MetadataClient::new(&paths.cache, &paths.repo);
        Self::with_api(paths, api, workers)
    }

    pub fn with_api(paths: Paths, api: MetadataClient, workers: usize) -> Self {
        Self {
            api: Arc::new(api),
            fetch: Arc::new(Cache::new(paths.cache.join("bottles"))),
            workers: if workers == 0 {
                default_workers()
            } else {
                workers
            },
            bottle_tags: default_bottle_tags(),
            paths,
        }
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for dir in self.paths.layout_dirs() {
            std::fs::create_dir_all(dir)
                .map_err(|err| io_context(format!("create directory {:?}", dir.display()), err))?;
        }
        Ok(())
    }

    /// Case-insensitive substring search over name and description. An empty
    /// query lists the first 50 entries; matches are capped at 100.
    pub async fn search(
        &self,
        cancel: &CancellationToken,
        query: &str,
    ) -> Result<Vec<FormulaSummary>> {
        let list = self.api.list_formulae(cancel).await?;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(list.into_iter().take(50).collect());
        }

        let mut results: Vec<FormulaSummary> = list
            .into_iter()
            .filter(|item| {
                item.name.to_lowercase().contains(&query)
                    || item.desc.to_lowercase().contains(&query)
            })
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results.truncate(100);
        Ok(results)
    }

    pub async fn info(&self, cancel: &CancellationToken, name: &str) -> Result<Formula> {
        self.api.formula(cancel, name).await
    }

    /// Drop the metadata disk cache and refetch the formula index.
    pub async fn update(&self, cancel: &CancellationToken) -> Result<()> {
        self.api.invalidate_disk_cache()?;
        self.api.list_formulae(cancel).await?;
        Ok(())
    }

    /// Installed formula names, lexicographic.
    pub fn list_installed(&self) -> Result<Vec<String>> {
        list_subdirs(&self.paths.cellar)
    }

    pub fn list_installed_casks(&self) -> Result<Vec<String>> {
        list_subdirs(&self.paths.caskroom)
    }

    /// The latest installed version directory for `prefix <name>`.
    pub fn installed_prefix(&self, name: &str) -> Result<PathBuf> {
        let formula_dir = self.paths.cellar.join(name);
        if !formula_dir.is_dir() {
            return Err(UbError::FormulaNotInstalled(name.to_string()));
        }
        let versions = list_subdirs(&formula_dir)?;
        versions
            .last()
            .map(|latest| formula_dir.join(latest))
            .ok_or_else(|| UbError::NoInstalledVersions(name.to_string()))
    }

    /// Depth-first transitive closure over upstream formula metadata. The
    /// DFS runs on an explicit stack; a `visiting` set catches cycles and a
    /// failed dependency lookup is reported with both parent and child.
    pub async fn resolve_closure(
        &self,
        cancel: &CancellationToken,
        roots: &[String],
    ) -> Result<BTreeMap<String, Formula>> {
        enum Frame {
            Enter { name: String, parent: Option<String> },
            Exit { name: String },
        }

        let mut seen: BTreeMap<String, Formula> = BTreeMap::new();
        let mut fetched: BTreeMap<String, Formula> = BTreeMap::new();
        let mut visiting: HashSet<String> = HashSet::new();
        let mut stack: Vec<Frame> = roots
            .iter()
            .rev()
            .map(|root| Frame::Enter {
                name: root.clone(),
                parent: None,
            })
            .collect();

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Enter { name, parent } => {
                    if seen.contains_key(&name) {
                        continue;
                    }
                    if visiting.contains(&name) {
                        return Err(wrap_dependency_error(
                            UbError::DependencyCycle(name.clone()),
                            parent,
                            &name,
                        ));
                    }

                    let formula = match self.api.formula(cancel, &name).await {
                        Ok(formula) => formula,
                        Err(err) => return Err(wrap_dependency_error(err, parent, &name)),
                    };

                    visiting.insert(name.clone());
                    stack.push(Frame::Exit { name: name.clone() });
                    for dep in formula.dependencies.iter().rev() {
                        if dep == &formula.name {
                            return Err(UbError::SelfDependency(formula.name.clone()));
                        }
                        stack.push(Frame::Enter {
                            name: dep.clone(),
                            parent: Some(name.clone()),
                        });
                    }
                    fetched.insert(name, formula);
                }
                Frame::Exit { name } => {
                    visiting.remove(&name);
                    if let Some(formula) = fetched.remove(&name) {
                        seen.insert(name, formula);
                    }
                }
            }
        }

        Ok(seen)
    }

    /// Install formulae and/or casks, dispatching per name by probing the
    /// metadata API: a 404 on the formula endpoint demotes the name to a
    /// cask lookup.
    pub async fn install(&self, cancel: &CancellationToken, names: &[String]) -> Result<()> {
        let mut formula_roots = Vec::new();
        let mut casks = Vec::new();
        for raw in names {
            let name = raw.trim();
            if name.is_empty() {
                continue;
            }
            match self.api.formula(cancel, name).await {
                Ok(_) => formula_roots.push(name.to_string()),
                Err(err) if err.is_not_found() => {
                    casks.push(self.api.cask(cancel, name).await?);
                }
                Err(err) => return Err(err),
            }
        }

        if !formula_roots.is_empty() {
            self.install_formulae(cancel, &formula_roots).await?;
        }
        for cask in casks {
            self.install_cask(cancel, cask).await?;
        }
        Ok(())
    }

    pub async fn install_formulae(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<()> {
        self.ensure_layout()?;
        let mut lock = InstallLock::acquire(&self.paths.cellar)?;
        let result = self.install_formulae_locked(cancel, names).await;
        let _ = lock.release();
        result
    }

    async fn install_formulae_locked(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<()> {
        let closure = self.resolve_closure(cancel, names).await?;
        let reporter = Arc::new(InstallReporter::new(
            self.paths.clone(),
            names,
            closure.keys().cloned(),
            self.workers,
        ));
        reporter.print_plan();

        let root_set: HashSet<&String> = names.iter().collect();
        let jobs: Vec<Arc<dyn Job>> = closure
            .into_values()
            .map(|formula| {
                Arc::new(InstallJob {
                    fetch: Arc::clone(&self.fetch),
                    paths: self.paths.clone(),
                    bottle_tags: self.bottle_tags.clone(),
                    is_root: root_set.contains(&formula.name),
                    reporter: Arc::clone(&reporter),
                    formula,
                }) as Arc<dyn Job>
            })
            .collect();

        Executor::new(self.workers).run(cancel, jobs).await?;
        reporter.print_summary();
        Ok(())
    }

    pub async fn install_cask(&self, cancel: &CancellationToken, cask: Cask) -> Result<()> {
        self.ensure_layout()?;
        let mut lock = InstallLock::acquire(&self.paths.caskroom)?;
        let result = self.install_cask_locked(cancel, cask).await;
        let _ = lock.release();
        result
    }

    async fn install_cask_locked(&self, cancel: &CancellationToken, cask: Cask) -> Result<()> {
        let version = {
            let trimmed = cask.version.trim();
            if trimmed.is_empty() { "latest" } else { trimmed }.to_string()
        };
        let cask_dir = self.paths.caskroom.join(&cask.token).join(&version);

        let app_name = cask
            .app_artifact()
            .map(str::trim)
            .filter(|app| !app.is_empty())
            .ok_or_else(|| UbError::NoAppArtifact(cask.token.clone()))?
            .to_string();

        let reporter = Arc::new(InstallReporter::new(
            self.paths.clone(),
            &[],
            std::iter::empty(),
            self.workers,
        ));
        reporter.print_cask_downloading(&cask.token);

        let label = format!("Cask {}", cask.token);
        let hook_reporter = Arc::clone(&reporter);
        let hook = move |progress: crate::cache::Progress| {
            hook_reporter.on_download_progress(&label, progress);
        };
        let archive = self
            .fetch
            .fetch_with_progress(cancel, &cask.url, Some(&hook))
            .await?;
        verify_sha256(&archive, &cask.sha256).await?;

        remove_dir_if_present(&cask_dir)?;
        std::fs::create_dir_all(&cask_dir)
            .map_err(|err| io_context("create cask version dir", err))?;

        if is_zip_archive(&archive)? {
            extract_zip(&archive, &cask_dir)?;
        } else {
            extract_tar_gz(&archive, &cask_dir)?;
        }

        let app_base = Path::new(&app_name)
            .file_name()
            .map(|base| base.to_string_lossy().into_owned())
            .unwrap_or(app_name.clone());
        let app_source = find_file_in_tree(&cask_dir, &app_base)?;
        let app_dest = self.paths.applications.join(&app_base);

        reporter.print_cask_installing(&cask.token);
        remove_dir_if_present(&app_dest)?;
        std::fs::rename(&app_source, &app_dest)
            .map_err(|err| io_context("move app bundle", err))?;
        reporter.print_cask_moved(&app_base, &app_dest);

        let applications = self.paths.applications.to_string_lossy().into_owned();
        let mut linked = Vec::new();
        for binary in cask.binary_artifacts() {
            let source = binary.source.replace("$APPDIR", &applications);
            let target = binary
                .target
                .filter(|target| !target.is_empty())
                .unwrap_or_else(|| {
                    Path::new(&source)
                        .file_name()
                        .map(|base| base.to_string_lossy().into_owned())
                        .unwrap_or_else(|| source.clone())
                });
            let dest = self.paths.bin.join(&target);
            match std::fs::remove_file(&dest) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_context("replace binary link", err)),
            }
            std::os::unix::fs::symlink(&source, &dest)
                .map_err(|err| io_context("link cask binary", err))?;
            let source_base = Path::new(&source)
                .file_name()
                .map(|base| base.to_string_lossy().into_owned())
                .unwrap_or_else(|| source.clone());
            reporter.print_cask_linked(&source_base, &dest);
            linked.push(dest);
        }

        let receipt = CaskReceipt {
            token: cask.token.clone(),
            version,
            app_path: app_dest,
            linked_binaries: linked,
        };
        receipt.write(&cask_dir)?;

        reporter.print_cask_done(&cask.token);
        Ok(())
    }

    /// Uninstall the named formulae/casks, then autoremove formulae that were
    /// only ever needed as their dependencies.
    pub async fn uninstall_with_autoremove(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<UninstallSummary> {
        self.ensure_layout()?;
        let mut lock = InstallLock::acquire(&self.paths.cellar)?;
        let result = self.uninstall_with_autoremove_locked(cancel, names).await;
        let _ = lock.release();
        result
    }

    async fn uninstall_with_autoremove_locked(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<UninstallSummary> {
        let reporter = Arc::new(UninstallReporter::new());

        let trimmed: Vec<String> = names
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();

        let mut formula_targets = Vec::new();
        let mut cask_targets = Vec::new();
        for name in &trimmed {
            if self.paths.cellar.join(name).is_dir() {
                formula_targets.push(name.clone());
            } else if self.paths.caskroom.join(name).is_dir() {
                cask_targets.push(name.clone());
            } else {
                return Err(UbError::NotInstalled(name.clone()));
            }
        }

        // Candidate set: every pre-removal dependency of the requested
        // formulae, minus the roots themselves.
        let mut candidate_deps = BTreeSet::new();
        let mut root_set = HashSet::new();
        for name in &formula_targets {
            root_set.insert(name.clone());
            let closure = self
                .resolve_closure(cancel, std::slice::from_ref(name))
                .await?;
            for dep in closure.keys() {
                if dep != name {
                    candidate_deps.insert(dep.clone());
                }
            }
        }

        let mut summary = UninstallSummary::default();
        summary.removed.extend(
            self.uninstall_formula_batch(cancel, &formula_targets, &reporter)
                .await?,
        );
        summary.removed.extend(
            self.uninstall_cask_batch(cancel, &cask_targets, &reporter)
                .await?,
        );

        let remaining = self.list_installed()?;
        let remaining_set: HashSet<&String> = remaining.iter().collect();

        let non_candidate_roots: Vec<String> = remaining
            .iter()
            .filter(|name| !candidate_deps.contains(*name))
            .cloned()
            .collect();

        let mut required = HashSet::new();
        if !non_candidate_roots.is_empty() {
            let closure = self.resolve_closure(cancel, &non_candidate_roots).await?;
            for dep in closure.keys() {
                if remaining_set.contains(dep) {
                    required.insert(dep.clone());
                }
            }
        }

        let mut auto_remove: Vec<String> = remaining
            .iter()
            .filter(|name| {
                !root_set.contains(*name)
                    && candidate_deps.contains(*name)
                    && !required.contains(*name)
            })
            .cloned()
            .collect();
        auto_remove.sort();

        summary.auto_remove = self
            .uninstall_formula_batch(cancel, &auto_remove, &reporter)
            .await?;

        Ok(summary)
    }

    async fn uninstall_formula_batch(
        &self,
        cancel: &CancellationToken,
        names: &[String],
        reporter: &Arc<UninstallReporter>,
    ) -> Result<Vec<UninstallRecord>> {
        self.uninstall_batch(cancel, names, reporter, "formula", uninstall_formula_tree)
            .await
    }

    async fn uninstall_cask_batch(
        &self,
        cancel: &CancellationToken,
        names: &[String],
        reporter: &Arc<UninstallReporter>,
    ) -> Result<Vec<UninstallRecord>> {
        self.uninstall_batch(cancel, names, reporter, "cask", uninstall_cask_tree)
            .await
    }

    /// Run per-name removals through the scheduler with no declared
    /// dependencies, preserving input order in the returned records.
    async fn uninstall_batch(
        &self,
        cancel: &CancellationToken,
        names: &[String],
        reporter: &Arc<UninstallReporter>,
        kind: &str,
        remove: fn(&Paths, &str, Option<&UninstallReporter>) -> Result<UninstallRecord>,
    ) -> Result<Vec<UninstallRecord>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let records: Arc<Mutex<Vec<Option<UninstallRecord>>>> =
            Arc::new(Mutex::new(vec![None; names.len()]));

        let jobs: Vec<Arc<dyn Job>> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let paths = self.paths.clone();
                let name = name.clone();
                let reporter = Arc::clone(reporter);
                let records = Arc::clone(&records);
                Arc::new(FnJob::new(
                    format!("{kind}:{name}:{idx}"),
                    move |_ctx: JobContext| {
                        let paths = paths.clone();
                        let name = name.clone();
                        let reporter = Arc::clone(&reporter);
                        let records = Arc::clone(&records);
                        async move {
                            let record = remove(&paths, &name, Some(reporter.as_ref()))?;
                            records.lock().expect("uninstall records poisoned")[idx] = Some(record);
                            Ok(())
                        }
                    },
                )) as Arc<dyn Job>
            })
            .collect();

        Executor::new(self.workers).run(cancel, jobs).await?;

        let records = records.lock().expect("uninstall records poisoned");
        Ok(records.iter().flatten().cloned().collect())
    }

    /// Uninstall everything, then remove and recreate the cache.
    pub async fn reset(&self, cancel: &CancellationToken) -> Result<()> {
        let mut targets = self.list_installed()?;
        targets.extend(self.list_installed_casks()?);
        self.uninstall_with_autoremove(cancel, &targets).await?;
        remove_dir_if_present(&self.paths.cache)?;
        self.ensure_layout()
    }
}

struct InstallJob {
    fetch: Arc<Cache>,
    paths: Paths,
    bottle_tags: Vec<String>,
    formula: Formula,
    reporter: Arc<InstallReporter>,
    is_root: bool,
}

impl Job for InstallJob {
    fn id(&self) -> String {
        self.formula.name.clone()
    }

    fn requires(&self) -> Vec<String> {
        self.formula.dependencies.clone()
    }

    fn run(&self, ctx: JobContext) -> JobFuture<'_> {
        Box::pin(self.install(ctx))
    }
}

impl InstallJob {
    async fn install(&self, ctx: JobContext) -> Result<()> {
        let name = &self.formula.name;
        let version = &self.formula.versions.stable;

        if is_installed(&self.paths, name, version) {
            self.reporter.print_already_installed(name, version);
            return Ok(());
        }

        let (bottle, tag) = select_bottle(&self.formula, &self.bottle_tags)?;

        let label = format!("Bottle {name} ({version})");
        let hook_reporter = Arc::clone(&self.reporter);
        let hook = move |progress: crate::cache::Progress| {
            hook_reporter.on_download_progress(&label, progress);
        };
        let archive = self
            .fetch
            .fetch_with_progress(&ctx.cancel, &bottle.url, Some(&hook))
            .await?;

        self.reporter.print_installing(
            name,
            version,
            &tag,
            self.is_root,
            &bottle.url,
            ctx.worker_id,
        );

        verify_sha256(&archive, &bottle.sha256).await?;

        let install_dir = self.paths.cellar.join(name).join(version);
        remove_dir_if_present(&install_dir)?;
        extract_tar_gz(&archive, &self.paths.cellar)?;

        let linked_version = link_formula(&self.paths, name, version)?;

        let resolved_dir = self.paths.cellar.join(name).join(&linked_version);
        FormulaReceipt::new(name, &linked_version, &self.paths.repo.to_string_lossy())
            .write(&resolved_dir)?;

        self.reporter.print_poured(name, &linked_version);
        Ok(())
    }
}

fn wrap_dependency_error(err: UbError, parent: Option<String>, child: &str) -> UbError {
    let Some(parent) = parent else { return err };
    match err {
        wrapped @ UbError::DependencyResolution { .. } => wrapped,
        other => UbError::DependencyResolution {
            parent,
            child: child.to_string(),
            source: Box::new(other),
        },
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|cores| cores.get())
        .unwrap_or(1)
        .max(1)
}

fn default_bottle_tags() -> Vec<String> {
    let tags: &[&str] = if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
        &[
            "arm64_sequoia",
            "arm64_sonoma",
            "arm64_ventura",
            "sonoma",
            "ventura",
        ]
    } else if cfg!(target_os = "macos") && cfg!(target_arch = "x86_64") {
        &["sonoma", "ventura", "monterey"]
    } else if cfg!(target_os = "linux") && cfg!(target_arch = "aarch64") {
        &["arm64_linux", "x86_64_linux"]
    } else {
        &["x86_64_linux", "arm64_linux", "sonoma", "arm64_sonoma"]
    };
    tags.iter().map(|tag| tag.to_string()).collect()
}

/// Pick the first preferred tag present in the formula's bottle files, else
/// any available bottle (deterministically, the lexicographically first).
fn select_bottle(formula: &Formula, preferred: &[String]) -> Result<(BottleFile, String)> {
    let files = &formula.bottle.stable.files;
    if files.is_empty() {
        return Err(UbError::NoStableBottle(formula.name.clone()));
    }

    for tag in preferred {
        if let Some(file) = files.get(tag) {
            return Ok((file.clone(), tag.clone()));
        }
    }

    files
        .iter()
        .next()
        .map(|(tag, file)| (file.clone(), tag.clone()))
        .ok_or_else(|| UbError::NoStableBottle(formula.name.clone()))
}

fn is_installed(paths: &Paths, name: &str, version: &str) -> bool {
    if version.trim().is_empty() {
        return false;
    }
    paths.cellar.join(name).join(version).exists()
}

/// Resolve the on-disk install directory for a declared version, tolerating
/// bottle revision suffixes (`<version>_N`). Exact match first, then
/// `<version>_` prefixes, then any sibling; lexicographically last wins.
fn resolve_installed_formula_dir(
    cellar: &Path,
    name: &str,
    version: &str,
) -> Result<(PathBuf, String)> {
    let formula_dir = cellar.join(name);
    let exact = formula_dir.join(version);
    if exact.is_dir() {
        return Ok((exact, version.to_string()));
    }

    if !formula_dir.is_dir() {
        return Err(UbError::FormulaNotInstalled(name.to_string()));
    }
    let entries = list_subdirs(&formula_dir)?;

    let prefix = format!("{version}_");
    let mut matches: Vec<&String> = entries
        .iter()
        .filter(|entry| entry.as_str() == version || entry.starts_with(&prefix))
        .collect();
    if matches.is_empty() {
        matches = entries.iter().collect();
    }

    matches
        .last()
        .map(|resolved| (formula_dir.join(resolved), resolved.to_string()))
        .ok_or_else(|| UbError::NoInstalledVersions(name.to_string()))
}

/// Symlink every non-directory entry of the version's `bin/` and `sbin/`
/// into the prefix, replacing whatever sat at the destination.
fn link_formula(paths: &Paths, name: &str, version: &str) -> Result<String> {
    let (install_dir, linked_version) =
        resolve_installed_formula_dir(&paths.cellar, name, version)?;
    link_tree(&install_dir, &paths.bin, "bin")?;
    link_tree(&install_dir, &paths.sbin, "sbin")?;
    Ok(linked_version)
}

fn link_tree(install_dir: &Path, link_root: &Path, leaf: &str) -> Result<()> {
    let src_dir = install_dir.join(leaf);
    let entries = match std::fs::read_dir(&src_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(io_context(format!("read {leaf} dir"), err)),
    };

    for entry in entries {
        let entry = entry.map_err(|err| io_context(format!("read {leaf} dir"), err))?;
        if entry.path().is_dir() {
            continue;
        }
        let dest = link_root.join(entry.file_name());
        let _ = std::fs::remove_file(&dest);
        std::os::unix::fs::symlink(entry.path(), &dest)
            .map_err(|err| io_context(format!("link {:?}", dest.display()), err))?;
    }
    Ok(())
}

/// Remove every symlink under `link_root` whose target points into any
/// installed version of the formula. Links pointing elsewhere are untouched.
fn unlink_tree(formula_dir: &Path, link_root: &Path, leaf: &str) -> Result<()> {
    let versions = match std::fs::read_dir(formula_dir) {
        Ok(versions) => versions,
        Err(err) => return Err(io_context("read formula dir", err)),
    };

    let owned_prefix = format!("{}/", formula_dir.display());
    for version in versions {
        let version = version.map_err(|err| io_context("read formula dir", err))?;
        if !version.path().is_dir() {
            continue;
        }
        let src_dir = version.path().join(leaf);
        let entries = match std::fs::read_dir(&src_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_context(format!("read {leaf} dir"), err)),
        };

        for entry in entries {
            let entry = entry.map_err(|err| io_context(format!("read {leaf} dir"), err))?;
            let dest = link_root.join(entry.file_name());
            let meta = match std::fs::symlink_metadata(&dest) {
                Ok(meta) => meta,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_context("stat link", err)),
            };
            if !meta.file_type().is_symlink() {
                continue;
            }
            let target = std::fs::read_link(&dest)
                .map_err(|err| io_context("read link target", err))?;
            if target.to_string_lossy().contains(&owned_prefix) {
                std::fs::remove_file(&dest)
                    .map_err(|err| io_context("remove stale link", err))?;
            }
        }
    }
    Ok(())
}

/// Remove one installed formula: stat the display version, drop its
/// `bin`/`sbin` links, and delete the whole tree with progress events.
pub fn uninstall_formula_tree(
    paths: &Paths,
    name: &str,
    reporter: Option<&UninstallReporter>,
) -> Result<UninstallRecord> {
    let formula_dir = paths.cellar.join(name);
    if !formula_dir.is_dir() {
        return Err(UbError::FormulaNotInstalled(name.to_string()));
    }

    let versions = list_subdirs(&formula_dir)?;
    let display_path = versions
        .last()
        .map(|latest| formula_dir.join(latest))
        .unwrap_or_else(|| formula_dir.clone());

    let (files, size) = dir_stats(&display_path)?;

    unlink_tree(&formula_dir, &paths.bin, "bin")?;
    unlink_tree(&formula_dir, &paths.sbin, "sbin")?;

    let label = format!("Uninstall {name}");
    let hook = reporter.map(|reporter| {
        move |removed: usize, total: usize, done: bool| {
            reporter.on_remove_progress(&label, removed, total, done);
        }
    });
    remove_tree_with_progress(
        &formula_dir,
        hook.as_ref()
            .map(|hook| hook as &(dyn Fn(usize, usize, bool) + Send + Sync)),
    )?;

    Ok(UninstallRecord {
        name: name.to_string(),
        path: display_path,
        files,
        size_bytes: size,
        size_human: format_size(size),
    })
}

/// Remove one installed cask: best-effort removal of everything its receipt
/// lists, then the caskroom subtree with progress events.
pub fn uninstall_cask_tree(
    paths: &Paths,
    name: &str,
    reporter: Option<&UninstallReporter>,
) -> Result<UninstallRecord> {
    let cask_root = paths.caskroom.join(name);
    if !cask_root.is_dir() {
        return Err(UbError::CaskNotInstalled(name.to_string()));
    }
    let versions = list_subdirs(&cask_root)?;
    let latest = versions
        .last()
        .ok_or_else(|| UbError::NoInstalledCaskVersions(name.to_string()))?;
    let version_dir = cask_root.join(latest);

    if let Ok(receipt) = CaskReceipt::read(&version_dir) {
        for candidate in
            cask_app_removal_candidates(&receipt.app_path, &paths.applications, home_dir().as_deref())
        {
            let _ = std::fs::remove_dir_all(&candidate);
            let _ = std::fs::remove_file(&candidate);
        }
        for binary in &receipt.linked_binaries {
            let _ = std::fs::remove_file(binary);
        }
    }

    let (files, size) = dir_stats(&version_dir)?;

    let label = format!("Uninstall cask {name}");
    let hook = reporter.map(|reporter| {
        move |removed: usize, total: usize, done: bool| {
            reporter.on_remove_progress(&label, removed, total, done);
        }
    });
    remove_tree_with_progress(
        &cask_root,
        hook.as_ref()
            .map(|hook| hook as &(dyn Fn(usize, usize, bool) + Send + Sync)),
    )?;

    Ok(UninstallRecord {
        name: name.to_string(),
        path: version_dir,
        files,
        size_bytes: size,
        size_human: format_size(size),
    })
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .filter(|home| !home.trim().is_empty())
        .map(PathBuf::from)
}

/// Everywhere an installed app bundle might live, deduplicated by cleaned
/// path: the receipt's literal path, then (for `.app` bundles only) the
/// managed Applications dir, `~/Applications`, and `/Applications` on macOS.
fn cask_app_removal_candidates(
    app_path: &Path,
    managed_applications: &Path,
    home: Option<&Path>,
) -> Vec<PathBuf> {
    fn push_candidate(seen: &mut HashSet<PathBuf>, out: &mut Vec<PathBuf>, path: PathBuf) {
        let cleaned = normalize(&path);
        if cleaned.as_os_str().is_empty() {
            return;
        }
        if seen.insert(cleaned.clone()) {
            out.push(cleaned);
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(4);
    push_candidate(&mut seen, &mut out, app_path.to_path_buf());

    let Some(base) = app_path.file_name().map(|base| base.to_os_string()) else {
        return out;
    };
    let is_app_bundle = Path::new(&base)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("app"));
    if !is_app_bundle {
        return out;
    }

    push_candidate(&mut seen, &mut out, managed_applications.join(&base));
    if let Some(home) = home {
        push_candidate(&mut seen, &mut out, home.join("Applications").join(&base));
    }
    if cfg!(target_os = "macos") {
        push_candidate(&mut seen, &mut out, PathBuf::from("/Applications").join(&base));
    }

    out
}

/// Remove a tree file-by-file, emitting `(removed, total, done)` events,
/// then clear the directories bottom-up.
pub fn remove_tree_with_progress(
    root: &Path,
    on_progress: Option<RemoveProgressFn<'_>>,
) -> Result<()> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|err| io_context("walk tree", std::io::Error::other(err)))?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        } else {
            files.push(entry.into_path());
        }
    }

    let total = files.len();
    let mut removed = 0;
    if let Some(on_progress) = on_progress {
        on_progress(removed, total, false);
    }

    for file in files {
        std::fs::remove_file(&file)
            .map_err(|err| io_context(format!("remove {:?}", file.display()), err))?;
        removed += 1;
        if let Some(on_progress) = on_progress {
            on_progress(removed, total, false);
        }
    }

    for dir in dirs.iter().rev() {
        match std::fs::remove_dir(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_context(format!("remove {:?}", dir.display()), err)),
        }
    }

    if let Some(on_progress) = on_progress {
        on_progress(removed, total, true);
    }
    Ok(())
}

/// File count and byte total of a directory tree.
pub fn dir_stats(root: &Path) -> Result<(usize, u64)> {
    let mut files = 0;
    let mut size = 0;
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|err| io_context("walk tree", std::io::Error::other(err)))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|err| io_context("stat file", std::io::Error::other(err)))?;
        files += 1;
        size += meta.len();
    }
    Ok((files, size))
}

/// Locate a file or directory by base name: direct child first, then the
/// first match in a depth-first walk.
fn find_file_in_tree(root: &Path, base_name: &str) -> Result<PathBuf> {
    let base_name = base_name.trim();
    if base_name.is_empty() {
        return Err(UbError::Config("file name is required".to_string()));
    }

    let candidate = root.join(base_name);
    if candidate.exists() {
        return Ok(candidate);
    }

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|err| io_context("walk tree", std::io::Error::other(err)))?;
        if entry.file_name().to_string_lossy() == base_name {
            return Ok(entry.into_path());
        }
    }

    Err(UbError::AppBundleNotFound {
        name: base_name.to_string(),
        root: root.to_path_buf(),
    })
}

/// SHA-256 verification; an empty expected digest skips the check.
pub async fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Ok(());
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| io_context(format!("open {:?}", path.display()), err))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|err| io_context("read for checksum", err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let got = hex::encode(hasher.finalize());
    if !got.eq_ignore_ascii_case(expected) {
        return Err(UbError::ChecksumMismatch {
            expected: expected.to_string(),
            got,
        });
    }
    Ok(())
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_context(format!("read {:?}", dir.display()), err)),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| io_context(format!("read {:?}", dir.display()), err))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        out.push(name);
    }
    out.sort();
    Ok(out)
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_context(format!("remove {:?}", dir.display()), err)),
    }
}
