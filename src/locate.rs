#![forbid(unsafe_code)]

//! Locates the file a downloader subprocess just wrote.
//!
//! yt-dlp picks the output extension itself (`%(ext)s` template), and the
//! process exiting races the directory listing reflecting its writes, so the
//! exact filename is never known up front. The resolution is layered: match
//! by filename prefix first, fall back to the newest file touched within a
//! short window. Best-effort by construction; callers must handle the
//! nothing-found case.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

/// How far back the "any recently touched file" fallback looks.
pub const DEFAULT_RECENT_WINDOW: Duration = Duration::from_secs(15);

/// A file picked out of the downloads directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedFile {
    pub path: PathBuf,
    pub filename: String,
}

impl LocatedFile {
    /// The filename without its final extension, used as a display title.
    pub fn title(&self) -> String {
        match self.filename.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => self.filename.clone(),
        }
    }
}

#[derive(Debug)]
struct ScannedEntry {
    path: PathBuf,
    name: String,
    modified: SystemTime,
}

/// Finds the output of a process that was told to write `<base_name>.%(ext)s`
/// into `dir`.
///
/// Preference order:
/// 1. the unique file whose name starts with `base_name`,
/// 2. the newest of several such files,
/// 3. the newest file modified within `window` (the process may have renamed
///    its temp file to something unexpected),
/// 4. `None`.
pub fn locate_output(dir: &Path, base_name: &str, window: Duration) -> Result<Option<LocatedFile>> {
    let entries = scan_dir(dir)?;

    let mut matches: Vec<&ScannedEntry> = entries
        .iter()
        .filter(|entry| entry.name.starts_with(base_name))
        .collect();

    matches.sort_by_key(|entry| entry.modified);
    if let Some(newest) = matches.last() {
        return Ok(Some(located(newest)));
    }

    // Nothing carries the expected prefix. The process may still have written
    // something (different template expansion, post-processing rename), so
    // accept any file touched since just before the spawn.
    let now = SystemTime::now();
    let mut recent: Vec<&ScannedEntry> = entries
        .iter()
        .filter(|entry| {
            now.duration_since(entry.modified)
                .map(|age| age <= window)
                .unwrap_or(true)
        })
        .collect();

    if recent.is_empty() {
        return Ok(None);
    }

    recent.sort_by_key(|entry| entry.modified);
    Ok(recent.last().map(|entry| located(entry)))
}

fn located(entry: &ScannedEntry) -> LocatedFile {
    LocatedFile {
        path: entry.path.clone(),
        filename: entry.name.clone(),
    }
}

/// Flat scan of `dir`; only regular files count. Entries whose metadata
/// cannot be read (deleted mid-scan) are skipped rather than failing the
/// whole lookup.
fn scan_dir(dir: &Path) -> Result<Vec<ScannedEntry>> {
    let mut entries = Vec::new();
    let read_dir =
        fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?;

    for entry in read_dir {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let modified = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let name = entry
            .file_name()
            .into_string()
            .unwrap_or_else(|os| os.to_string_lossy().into_owned());
        entries.push(ScannedEntry {
            path: entry.path(),
            name,
            modified,
        });
    }

    Ok(entries)
}
