//! Terminal rendering over the core's semantic progress events.
//!
//! The install engine only ever emits `(downloaded, total, speed, cached,
//! done)` and `(removed, total, done)` callbacks; everything visual lives
//! here. Bars go through a single `MultiProgress` so concurrent workers
//! never interleave partial lines.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::cache::Progress;
use crate::manager::{UninstallSummary, dir_stats};
use crate::paths::Paths;

/// Fallback terminal width for label layout when the real width is unknown
/// (`COLUMNS`, then 100).
pub(crate) fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|columns| columns.trim().parse::<usize>().ok())
        .filter(|width| *width > 0)
        .unwrap_or(100)
}

pub(crate) fn truncate_text(value: &str, max_len: usize) -> String {
    if max_len <= 3 || value.chars().count() <= max_len {
        return value.to_string();
    }
    let prefix: String = value.chars().take(max_len - 3).collect();
    format!("{prefix}...")
}

/// `[] -> ""`, `[a] -> "a"`, `[a,b] -> "a and b"`, `[a,b,c] -> "a, b and c"`.
pub fn join_with_and(parts: &[String]) -> String {
    match parts {
        [] => String::new(),
        [only] => only.clone(),
        [first, second] => format!("{first} and {second}"),
        [head @ .., last] => format!("{} and {last}", head.join(", ")),
    }
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

fn url_basename(raw: &str) -> String {
    let path = match reqwest::Url::parse(raw) {
        Ok(url) => url.path().to_string(),
        Err(_) => raw.to_string(),
    };
    std::path::Path::new(&path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.clone())
}

/// `<name>--<version>.<tag>.bottle.tar.gz`, or the URL basename when any
/// part is missing.
pub(crate) fn bottle_archive_name(name: &str, version: &str, tag: &str, fallback_url: &str) -> String {
    let (name, version, tag) = (name.trim(), version.trim(), tag.trim());
    if !name.is_empty() && !version.is_empty() && !tag.is_empty() {
        return format!("{name}--{version}.{tag}.bottle.tar.gz");
    }
    url_basename(fallback_url)
}

/// The exact line sequence `uninstall` prints: one removal line per record,
/// then the autoremove header, names, and removal lines when applicable.
pub fn uninstall_summary_lines(summary: &UninstallSummary) -> Vec<String> {
    let mut lines =
        Vec::with_capacity(summary.removed.len() + summary.auto_remove.len() * 2 + 1);
    for record in &summary.removed {
        lines.push(format!(
            "Uninstalling {}... ({} files, {})",
            record.path.display(),
            record.files,
            record.size_human
        ));
    }
    if summary.auto_remove.is_empty() {
        return lines;
    }
    lines.push(format!(
        "==> Autoremoving {} unneeded formulae:",
        summary.auto_remove.len()
    ));
    for record in &summary.auto_remove {
        lines.push(record.name.clone());
    }
    for record in &summary.auto_remove {
        lines.push(format!(
            "Uninstalling {}... ({} files, {})",
            record.path.display(),
            record.files,
            record.size_human
        ));
    }
    lines
}

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("⬇ {msg} [{bar:32.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╸")
}

fn removal_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("🗑 {msg} [{bar:32.red/white}] {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╸")
}

/// Renders install-side output: the plan header, per-worker install lines,
/// download bars, poured lines, and the final summary.
pub struct InstallReporter {
    paths: Paths,
    roots: Vec<String>,
    deps: Vec<String>,
    workers: usize,
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
    installed: Mutex<Vec<String>>,
}

impl InstallReporter {
    pub fn new(
        paths: Paths,
        roots: &[String],
        closure_names: impl IntoIterator<Item = String>,
        workers: usize,
    ) -> Self {
        let root_set: BTreeSet<&String> = roots.iter().collect();
        let deps: Vec<String> = closure_names
            .into_iter()
            .filter(|name| !root_set.contains(name))
            .collect();

        Self {
            paths,
            roots: roots.to_vec(),
            deps,
            workers,
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            installed: Mutex::new(Vec::new()),
        }
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }

    pub fn print_plan(&self) {
        if self.roots.is_empty() {
            return;
        }
        self.println(format!(
            "{} Fetching downloads for: {}",
            "==>".blue().bold(),
            self.roots.join(", ")
        ));
        self.println(format!(
            "{} Using {} worker(s)",
            "==>".blue().bold(),
            self.workers
        ));
        if !self.deps.is_empty() {
            self.println(format!(
                "{} Installing dependencies for {}: {}",
                "==>".blue().bold(),
                self.roots.join(", "),
                join_with_and(&self.deps)
            ));
        }
    }

    /// Handle one semantic download event for the bar labeled `label`.
    pub fn on_download_progress(&self, label: &str, progress: Progress) {
        let mut bars = self.bars.lock().expect("reporter state poisoned");

        if progress.cached {
            if let Some(bar) = bars.remove(label) {
                bar.finish_and_clear();
            }
            drop(bars);
            self.println(format!("✔︎ {:<64} Using cached file", label));
            return;
        }

        let bar = bars.entry(label.to_string()).or_insert_with(|| {
            let bar = self
                .multi
                .add(ProgressBar::new(progress.total_bytes.unwrap_or(0)));
            bar.set_style(download_style());
            let label_width = terminal_width().saturating_sub(62).max(12);
            bar.set_message(truncate_text(label, label_width));
            bar
        });
        if let Some(total) = progress.total_bytes {
            bar.set_length(total);
        }
        bar.set_position(progress.downloaded_bytes);

        if progress.done {
            bar.finish_and_clear();
            bars.remove(label);
            drop(bars);
            self.println(format!(
                "⬇ {:<64} Downloaded {:>8}",
                label,
                format_size(progress.downloaded_bytes)
            ));
        }
    }

    pub fn print_installing(
        &self,
        name: &str,
        version: &str,
        tag: &str,
        is_root: bool,
        bottle_url: &str,
        worker_id: usize,
    ) {
        let prefix = if worker_id > 0 {
            format!("==> [w{worker_id}]")
        } else {
            "==>".to_string()
        };
        let prefix = prefix.blue().bold();
        if is_root {
            self.println(format!("{prefix} Installing {name}"));
        } else {
            self.println(format!("{prefix} Installing dependency: {name}"));
        }
        let archive = bottle_archive_name(name, version, tag, bottle_url);
        if !archive.is_empty() {
            self.println(format!("{prefix} Pouring {archive}"));
        }
    }

    pub fn print_already_installed(&self, name: &str, version: &str) {
        self.println(format!(
            "{} {} ({}) already installed",
            "==>".blue().bold(),
            name,
            version
        ));
    }

    pub fn print_poured(&self, name: &str, version: &str) {
        let install_dir = self.paths.cellar.join(name).join(version);
        let Ok((files, size)) = dir_stats(&install_dir) else {
            return;
        };
        self.println(format!(
            "🍺  {}: {} files, {}",
            install_dir.display(),
            files,
            format_size(size)
        ));
        self.installed
            .lock()
            .expect("reporter state poisoned")
            .push(name.to_string());
    }

    pub fn print_summary(&self) {
        let mut installed = self
            .installed
            .lock()
            .expect("reporter state poisoned")
            .clone();
        if installed.is_empty() {
            return;
        }
        installed.sort();
        self.println(format!("{} Summary", "==>".blue().bold()));
        for name in installed {
            self.println(format!("- {name}"));
        }
    }

    pub fn print_cask_downloading(&self, token: &str) {
        self.println(format!("{} Downloading Cask {token}", "==>".blue().bold()));
    }

    pub fn print_cask_installing(&self, token: &str) {
        self.println(format!("{} Installing Cask {token}", "==>".blue().bold()));
    }

    pub fn print_cask_moved(&self, app: &str, dest: &std::path::Path) {
        self.println(format!(
            "{} Moving App '{}' to '{}'",
            "==>".blue().bold(),
            app,
            dest.display()
        ));
    }

    pub fn print_cask_linked(&self, source: &str, dest: &std::path::Path) {
        self.println(format!(
            "{} Linking Binary '{}' to '{}'",
            "==>".blue().bold(),
            source,
            dest.display()
        ));
    }

    pub fn print_cask_done(&self, token: &str) {
        self.println(format!("🍺  {token} was successfully installed!"));
    }
}

/// Renders removal progress bars for uninstall batches.
pub struct UninstallReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl Default for UninstallReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl UninstallReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one semantic removal event for the bar labeled `label`.
    pub fn on_remove_progress(&self, label: &str, removed: usize, total: usize, done: bool) {
        let mut bars = self.bars.lock().expect("reporter state poisoned");
        let bar = bars.entry(label.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(total as u64));
            bar.set_style(removal_style());
            let label_width = terminal_width().saturating_sub(50).max(12);
            bar.set_message(truncate_text(label, label_width));
            bar
        });
        bar.set_length(total as u64);
        bar.set_position(removed as u64);

        if done {
            bar.finish_and_clear();
            bars.remove(label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::UninstallRecord;
    use std::path::PathBuf;

    fn strings(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|part| part.to_string()).collect()
    }

    #[test]
    fn join_with_and_table() {
        assert_eq!(join_with_and(&[]), "");
        assert_eq!(join_with_and(&strings(&["lame"])), "lame");
        assert_eq!(join_with_and(&strings(&["lame", "opus"])), "lame and opus");
        assert_eq!(
            join_with_and(&strings(&["lame", "libvpx", "opus"])),
            "lame, libvpx and opus"
        );
    }

    #[test]
    fn format_size_breakpoints() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(792 * 1024), "792.0KB");
        assert_eq!(format_size(21 * 1024 * 1024), "21.0MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0GB");
    }

    #[test]
    fn bottle_archive_name_prefers_structured_parts() {
        assert_eq!(
            bottle_archive_name(
                "ffmpeg",
                "8.0.1",
                "arm64_sonoma",
                "https://example.com/blob/sha256:abc"
            ),
            "ffmpeg--8.0.1.arm64_sonoma.bottle.tar.gz"
        );
    }

    #[test]
    fn bottle_archive_name_falls_back_to_the_url_basename() {
        assert_eq!(
            bottle_archive_name(
                "",
                "",
                "",
                "https://example.com/path/ffmpeg--8.0.1.arm64_sonoma.bottle.tar.gz"
            ),
            "ffmpeg--8.0.1.arm64_sonoma.bottle.tar.gz"
        );
    }

    #[test]
    fn truncate_text_keeps_short_labels() {
        assert_eq!(truncate_text("short", 12), "short");
        assert_eq!(truncate_text("a longer label here", 10), "a longe...");
    }

    fn record(name: &str, path: &str, files: usize, size_human: &str) -> UninstallRecord {
        UninstallRecord {
            name: name.to_string(),
            path: PathBuf::from(path),
            files,
            size_bytes: 0,
            size_human: size_human.to_string(),
        }
    }

    #[test]
    fn summary_lines_without_autoremove() {
        let summary = UninstallSummary {
            removed: vec![record(
                "ffmpeg",
                "/Users/jaden/ub/Cellar/ffmpeg/8.0.1_4",
                284,
                "53.3MB",
            )],
            auto_remove: vec![],
        };
        assert_eq!(
            uninstall_summary_lines(&summary),
            vec!["Uninstalling /Users/jaden/ub/Cellar/ffmpeg/8.0.1_4... (284 files, 53.3MB)"]
        );
    }

    #[test]
    fn summary_lines_with_autoremove() {
        let summary = UninstallSummary {
            removed: vec![record(
                "ffmpeg",
                "/Users/jaden/ub/Cellar/ffmpeg/8.0.1_4",
                284,
                "53.3MB",
            )],
            auto_remove: vec![
                record("lame", "/Users/jaden/ub/Cellar/lame/3.100", 28, "2.3MB"),
                record("opus", "/Users/jaden/ub/Cellar/opus/1.6.1", 16, "1.1MB"),
            ],
        };
        assert_eq!(
            uninstall_summary_lines(&summary),
            vec![
                "Uninstalling /Users/jaden/ub/Cellar/ffmpeg/8.0.1_4... (284 files, 53.3MB)",
                "==> Autoremoving 2 unneeded formulae:",
                "lame",
                "opus",
                "Uninstalling /Users/jaden/ub/Cellar/lame/3.100... (28 files, 2.3MB)",
                "Uninstalling /Users/jaden/ub/Cellar/opus/1.6.1... (16 files, 1.1MB)",
            ]
        );
    }
}
