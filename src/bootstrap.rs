#![forbid(unsafe_code)]

//! Filesystem bootstrapping and downloader setup.
//!
//! Everything here runs once at startup: create the directories the request
//! handlers assume exist, read the real-downloads marker file, and make sure
//! a usable downloader binary is on disk (fetching one from the release page
//! when the host has none). Setup problems never abort the server; they
//! degrade the deployment to simulation mode.

use anyhow::{Context, Result};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::fetcher::ensure_program_available;

pub const DOWNLOADS_SUBDIR: &str = "downloads";
pub const COOKIES_SUBDIR: &str = "cookies";
pub const REAL_DOWNLOADS_MARKER: &str = "ENABLE_REAL_DOWNLOADS";
pub const YTDLP_BINARY: &str = "yt-dlp";

const YTDLP_RELEASE_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp";

/// Convenience wrapper around every filesystem location the server touches.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_root: PathBuf,
    pub downloads: PathBuf,
    pub cookies: PathBuf,
    pub www_root: PathBuf,
}

impl AppPaths {
    /// Builds the struct using the provided data and www roots.
    pub fn with_roots(data_root: &Path, www_root: &Path) -> Self {
        let data_root = data_root.to_path_buf();
        let downloads = data_root.join(DOWNLOADS_SUBDIR);
        let cookies = data_root.join(COOKIES_SUBDIR);
        Self {
            data_root,
            downloads,
            cookies,
            www_root: www_root.to_path_buf(),
        }
    }

    /// Creates every directory we might write to. This allows subsequent
    /// request handling to assume the filesystem exists.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.downloads)
            .with_context(|| format!("creating {}", self.downloads.display()))?;
        fs::create_dir_all(&self.cookies)
            .with_context(|| format!("creating {}", self.cookies.display()))?;
        fs::create_dir_all(&self.www_root)
            .with_context(|| format!("creating {}", self.www_root.display()))?;
        Ok(())
    }

    /// Real downloads stay off unless the operator drops the marker file into
    /// the data root. The flag is read once at startup, like the original
    /// deployment did.
    pub fn real_downloads_enabled(&self) -> bool {
        self.data_root.join(REAL_DOWNLOADS_MARKER).exists()
    }

    /// Where a self-fetched downloader binary lives.
    pub fn local_ytdlp(&self) -> PathBuf {
        self.data_root.join(YTDLP_BINARY)
    }
}

/// Resolves a working downloader binary, fetching one when necessary.
///
/// Resolution order: the configured path, a previously fetched copy in the
/// data root, `yt-dlp` on PATH, then a fresh fetch from the release page.
/// Returns `None` when nothing works; the server then serves report files
/// instead of real downloads.
pub fn ensure_ytdlp(paths: &AppPaths, configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(candidate) = resolve_downloader(paths, configured) {
        return Some(candidate);
    }

    println!("Downloader not found, fetching latest release...");
    match fetch_release_binary(YTDLP_RELEASE_URL, &paths.local_ytdlp()) {
        Ok(()) => {
            let local = paths.local_ytdlp();
            match ensure_program_available(&local) {
                Ok(()) => {
                    println!("Downloader fetched to {}", local.display());
                    Some(local)
                }
                Err(err) => {
                    eprintln!("Warning: fetched downloader does not run: {err}");
                    None
                }
            }
        }
        Err(err) => {
            eprintln!("Warning: could not fetch downloader: {err}");
            eprintln!("Warning: real downloads will fall back to report files.");
            None
        }
    }
}

/// Checks the places a binary may already exist, without touching the
/// network.
pub fn resolve_downloader(paths: &AppPaths, configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() && ensure_executable(path).is_ok() {
            return Some(path.to_path_buf());
        }
        eprintln!(
            "Warning: configured downloader {} is not usable",
            path.display()
        );
    }

    // A copy we fetched ourselves is pinned; it beats whatever PATH holds.
    let local = paths.local_ytdlp();
    if local.is_file() && ensure_executable(&local).is_ok() {
        return Some(local);
    }

    let system = PathBuf::from(YTDLP_BINARY);
    if ensure_program_available(&system).is_ok() {
        return Some(system);
    }

    None
}

/// Downloads a release binary to `dest` and marks it executable.
fn fetch_release_binary(url: &str, dest: &Path) -> Result<()> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("requesting {url}"))?;
    let mut reader = response.into_reader();
    let mut file =
        fs::File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
    io::copy(&mut reader, &mut file).with_context(|| format!("writing {}", dest.display()))?;
    drop(file);
    ensure_executable(dest)
}

/// Sets 0o755 on the binary so a copy fetched over HTTP can actually run.
fn ensure_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata =
            fs::metadata(path).with_context(|| format!("inspecting {}", path.display()))?;
        let mut perms = metadata.permissions();
        if perms.mode() & 0o111 == 0 {
            perms.set_mode(0o755);
            fs::set_permissions(path, perms)
                .with_context(|| format!("marking {} executable", path.display()))?;
        }
    }
    Ok(())
}
