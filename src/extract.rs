//! Archive extraction with path containment.
//!
//! Bottles arrive as tar.gz; casks ship either zip or tar.gz and are told
//! apart by the four-byte zip signature. Every entry's destination is
//! lexically normalized and must stay inside the extraction root; any escape
//! aborts the extraction before the entry is written.

use std::fs;
use std::io::Read;
use std::os::unix::fs::{OpenOptionsExt, symlink};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::EntryType;

use crate::error::{Result, UbError, io_context};

/// Lexically normalize a path, resolving `.` and `..` without touching the
/// filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir => {}
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Join an archive entry path onto the extraction root, failing when the
/// cleaned result would land outside the root.
fn contained_join(root: &Path, entry: &Path) -> Result<PathBuf> {
    let clean_root = normalize(root);
    let clean_target = normalize(&root.join(entry));
    if clean_target != clean_root && !clean_target.starts_with(&clean_root) {
        return Err(UbError::ArchiveEscape(entry.display().to_string()));
    }
    Ok(clean_target)
}

/// Stream a gzip-compressed tarball into `dest`.
///
/// Directories are created, regular files overwrite with `mode & 0o777`,
/// hardlinks resolve relative link targets against the entry's parent, and
/// symlinks are preserved verbatim. Unrecognized entry types are skipped.
pub fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)
        .map_err(|err| io_context(format!("open archive {:?}", archive_path.display()), err))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive
        .entries()
        .map_err(|err| io_context("read tar entries", err))?
    {
        let mut entry = entry.map_err(|err| io_context("read tar entry", err))?;
        let rel = entry
            .path()
            .map_err(|err| io_context("read tar entry path", err))?
            .into_owned();
        let target = contained_join(dest, &rel)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _ = fs::remove_file(&target);
                let mode = entry
                    .header()
                    .mode()
                    .map_err(|err| io_context("read tar entry mode", err))?
                    & 0o777;
                let mut out = fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode)
                    .open(&target)?;
                std::io::copy(&mut entry, &mut out)?;
            }
            EntryType::Link => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _ = fs::remove_file(&target);
                let link = entry
                    .link_name()
                    .map_err(|err| io_context("read tar link name", err))?
                    .ok_or_else(|| {
                        io_context(
                            "read tar link name",
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "hardlink entry without link name",
                            ),
                        )
                    })?;
                let source = if link.is_absolute() {
                    link.into_owned()
                } else {
                    target
                        .parent()
                        .unwrap_or_else(|| Path::new(""))
                        .join(link)
                };
                fs::hard_link(&source, &target)?;
            }
            EntryType::Symlink => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let _ = fs::remove_file(&target);
                let link = entry
                    .link_name()
                    .map_err(|err| io_context("read tar link name", err))?
                    .ok_or_else(|| {
                        io_context(
                            "read tar link name",
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                "symlink entry without link name",
                            ),
                        )
                    })?;
                symlink(link.as_ref(), &target)?;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Extract a zip archive into `dest` with the same containment rule as the
/// tar path. Stored unix modes are applied to files when present.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)
        .map_err(|err| io_context(format!("open archive {:?}", archive_path.display()), err))?;
    let mut archive = zip::ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let rel = PathBuf::from(entry.name());
        let target = contained_join(dest, &rel)?;

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        if let Some(mode) = entry.unix_mode() {
            options.mode(mode & 0o777);
        }
        let _ = fs::remove_file(&target);
        let mut out = options.open(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

/// Check the four-byte zip signature (`PK\x03\x04`). A short read is a
/// non-zip classification, not an error.
pub fn is_zip_archive(path: &Path) -> Result<bool> {
    let file = fs::File::open(path)
        .map_err(|err| io_context(format!("open archive {:?}", path.display()), err))?;

    let mut header = Vec::with_capacity(4);
    file.take(4).read_to_end(&mut header)?;
    Ok(header == [b'P', b'K', 0x03, 0x04])
}
