//! gzip and tar.gz codecs.
//!
//! Dumps and exports are stored gzip-compressed. Directories and sets of
//! configuration files are stored as tar.gz archives with paths relative to
//! their root, so they can be extracted onto a different checkout.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder};
use walkdir::WalkDir;

pub fn gzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

pub fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Whether `dir` exists and contains at least one file anywhere below it.
///
/// A subdirectory that cannot be read is an error, not an empty directory.
pub fn has_files(dir: &Path) -> io::Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    for entry in WalkDir::new(dir) {
        if entry.map_err(io::Error::from)?.file_type().is_file() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Archive the contents of `dir`. `None` when it is missing or holds no files.
pub fn archive_dir(dir: &Path) -> io::Result<Option<Vec<u8>>> {
    if !has_files(dir)? {
        return Ok(None);
    }
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    Ok(Some(builder.into_inner()?.finish()?))
}

/// Archive those of `paths` (relative to `root`) that exist.
///
/// Directories are archived recursively. `None` when none of the paths exist.
pub fn archive_files(root: &Path, paths: &[PathBuf]) -> io::Result<Option<Vec<u8>>> {
    let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder.follow_symlinks(false);
    let mut appended = 0usize;

    for path in paths {
        let name = relative_name(path);
        if name.as_os_str().is_empty() {
            continue;
        }
        let full = root.join(&name);
        if full.is_file() {
            builder.append_path_with_name(&full, &name)?;
            appended += 1;
        } else if has_files(&full)? {
            builder.append_dir_all(&name, &full)?;
            appended += 1;
        }
    }

    if appended == 0 {
        return Ok(None);
    }
    Ok(Some(builder.into_inner()?.finish()?))
}

/// Extract `blob` onto `dest`, overwriting files that already exist and
/// leaving everything else in place.
pub fn extract(blob: &[u8], dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = Archive::new(GzDecoder::new(blob));
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.unpack(dest)
}

/// Replace `dest` wholesale with the contents of `blob`.
///
/// The archive is fully decoded into a sibling staging directory first, so a
/// corrupt archive leaves `dest` untouched. Previous contents are discarded.
pub fn replace_dir(blob: &[u8], dest: &Path) -> io::Result<()> {
    let staging = staging_path(dest);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    if let Err(e) = extract(blob, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::rename(&staging, dest)
}

fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "restore".to_string());
    dest.with_file_name(format!(".{name}.deckhand-staging"))
}

/// Strip root and prefix components so archive entries stay relative.
fn relative_name(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}
