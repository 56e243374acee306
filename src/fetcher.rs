#![forbid(unsafe_code)]

//! Drives the external downloader for a single media URL.
//!
//! The contract mirrors what the frontend expects: every fetch produces a
//! file in the downloads directory and a link to it, even when the download
//! itself fails. Failures are written out as plain-text report files so the
//! client always has something to show the user.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    thread,
};

use crate::locate::{self, DEFAULT_RECENT_WINDOW};

/// How much of a subprocess output line makes it into our own log.
const LOG_LINE_LIMIT: usize = 200;

/// Everything a fetch needs to know, resolved once at startup.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub downloads_dir: PathBuf,
    pub cookies_dir: PathBuf,
    /// Resolved downloader binary. `None` means bootstrap could not provide
    /// one; real fetches then degrade to a report file.
    pub downloader: Option<PathBuf>,
    /// Cleared when the deployment runs without the marker file; every fetch
    /// is then simulated.
    pub real_downloads: bool,
}

/// Payload returned to API clients after a fetch attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub success: bool,
    pub title: String,
    pub download_url: String,
    pub filename: String,
    pub simulated: bool,
    pub error: bool,
}

impl FetchOutcome {
    fn for_file(title: impl Into<String>, filename: String) -> Self {
        Self {
            success: true,
            title: title.into(),
            download_url: download_url_for(&filename),
            filename,
            simulated: false,
            error: false,
        }
    }
}

static OUTPUT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Unique base name for one fetch. The extension is appended by the
/// downloader itself via the `%(ext)s` template, so only the stem is fixed
/// here. The sequence keeps concurrent requests within one process apart.
pub fn next_output_base() -> String {
    let seq = OUTPUT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("video_{}_{}", Utc::now().timestamp_millis(), seq)
}

/// Runs `<name> --version` to fail loudly when the downloader is missing.
pub fn ensure_program_available(binary: &Path) -> Result<()> {
    let status = Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            binary.display()
        ),
        Err(err) => bail!("{} cannot be executed: {}", binary.display(), err),
    }
}

/// Fetches one URL to completion and reports where the result landed.
///
/// Only infrastructure problems (spawn failure, unreadable downloads
/// directory) surface as `Err`; downloader failures come back as a
/// successful outcome pointing at a report file.
pub fn fetch_media(ctx: &FetchContext, url: &str, cookie_file: Option<&str>) -> Result<FetchOutcome> {
    if !ctx.real_downloads {
        return simulate_fetch(ctx, url);
    }

    let Some(downloader) = &ctx.downloader else {
        let message = "downloader executable not found; cannot proceed with download";
        eprintln!("Warning: {message}");
        let filename = write_report(&ctx.downloads_dir, "error_noytdlp", message)?;
        let mut outcome = FetchOutcome::for_file("Downloader Missing", filename);
        outcome.error = true;
        return Ok(outcome);
    };

    let base_name = next_output_base();
    let template = ctx
        .downloads_dir
        .join(format!("{base_name}.%(ext)s"));

    println!("Starting download for: {url}");
    println!("Output template: {}", template.display());

    let mut command = Command::new(downloader);
    command
        .arg(url)
        .arg("--no-check-certificate")
        .arg("--socket-timeout")
        .arg("45")
        .arg("--retries")
        .arg("2")
        .arg("--no-progress")
        .arg("-f")
        .arg("bv*[height<=?720]+ba/b")
        .arg("-o")
        .arg(&template)
        .arg("--newline");

    if let Some(name) = cookie_file {
        let cookie_path = ctx.cookies_dir.join(name);
        if cookie_path.is_file() {
            println!("Using cookies for authentication");
            command.arg("--cookies").arg(&cookie_path);
        } else {
            eprintln!("Warning: cookie file not found: {}", cookie_path.display());
        }
    }

    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let content = format!("Failed to start downloader: {err}\nURL: {url}");
            write_report(&ctx.downloads_dir, "error_spawn", &content)?;
            return Err(err).with_context(|| "launching downloader".to_string());
        }
    };

    // `--newline` makes the downloader flush line-by-line, so both pipes can
    // be tailed while it runs. Stdout moves to a helper thread; stderr is
    // drained here.
    let stdout_handle = child.stdout.take().map(|stdout| {
        thread::spawn(move || {
            let mut collected = String::new();
            for line in BufReader::new(stdout).lines().map_while(|line| line.ok()) {
                if !line.trim().is_empty() {
                    println!("[downloader] {}", truncate_line(&line));
                }
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        })
    });

    let mut stderr_data = String::new();
    if let Some(stderr) = child.stderr.take() {
        for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
            if !line.trim().is_empty() {
                eprintln!("[downloader] {}", truncate_line(&line));
            }
            stderr_data.push_str(&line);
            stderr_data.push('\n');
        }
    }

    let stdout_data = stdout_handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    let status = child.wait().context("waiting for downloader to exit")?;
    println!("Downloader exited with {status}");

    if !status.success() {
        let code = status
            .code()
            .map(|code| code.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let content = format!(
            "Download failed!\nURL: {url}\nExit: {status}\nTime: {}\n--- Output ---\nSTDOUT:\n{stdout_data}\nSTDERR:\n{stderr_data}",
            Utc::now().to_rfc3339(),
        );
        let filename = write_report(&ctx.downloads_dir, &format!("error_failed_{code}"), &content)?;
        let mut outcome = FetchOutcome::for_file("Download Failed", filename);
        outcome.error = true;
        return Ok(outcome);
    }

    match locate::locate_output(&ctx.downloads_dir, &base_name, DEFAULT_RECENT_WINDOW)? {
        Some(found) => {
            println!("Located downloaded file: {}", found.filename);
            Ok(FetchOutcome::for_file(found.title(), found.filename))
        }
        None => {
            eprintln!(
                "Warning: downloader succeeded but no file matched '{base_name}*' in {}",
                ctx.downloads_dir.display()
            );
            let content = format!(
                "Download process reported success, but the file could not be located.\nExpected base: {base_name}\nURL: {url}\nTime: {}\n--- Output ---\nSTDOUT:\n{stdout_data}\nSTDERR:\n{stderr_data}",
                Utc::now().to_rfc3339(),
            );
            let filename = write_report(&ctx.downloads_dir, "error_notfound", &content)?;
            let mut outcome = FetchOutcome::for_file("File Not Found", filename);
            outcome.error = true;
            Ok(outcome)
        }
    }
}

fn simulate_fetch(ctx: &FetchContext, url: &str) -> Result<FetchOutcome> {
    println!("Real downloads not enabled, simulating fetch for {url}");
    let filename = format!("simulation_{}.txt", Utc::now().timestamp_millis());
    let content = format!(
        "Download Simulation\nURL: {url}\nTimestamp: {}\nReal downloads are disabled.",
        Utc::now().to_rfc3339(),
    );
    let path = ctx.downloads_dir.join(&filename);
    fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;

    let mut outcome = FetchOutcome::for_file("Simulation File", filename);
    outcome.simulated = true;
    Ok(outcome)
}

/// Writes a plain-text report into the downloads directory and returns its
/// filename so the caller can link to it.
fn write_report(downloads_dir: &Path, slug: &str, content: &str) -> Result<String> {
    let filename = format!("{slug}_{}.txt", Utc::now().timestamp_millis());
    let path = downloads_dir.join(&filename);
    fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
    Ok(filename)
}

/// Public download link for a file in the downloads directory.
pub fn download_url_for(filename: &str) -> String {
    format!("/downloads/{}", encode_path_component(filename))
}

/// Percent-encodes a single path segment. Unreserved characters pass through
/// unchanged; everything else (spaces, brackets, non-ASCII) is escaped so the
/// link survives inside JSON and HTML attributes.
pub fn encode_path_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push('%');
                encoded.push_str(&format!("{byte:02X}"));
            }
        }
    }
    encoded
}

fn truncate_line(line: &str) -> &str {
    let trimmed = line.trim();
    match trimmed.char_indices().nth(LOG_LINE_LIMIT) {
        Some((index, _)) => &trimmed[..index],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn test_context(base: &Path, downloader: Option<PathBuf>, real: bool) -> FetchContext {
        let downloads = base.join("downloads");
        let cookies = base.join("cookies");
        fs::create_dir_all(&downloads).unwrap();
        fs::create_dir_all(&cookies).unwrap();
        FetchContext {
            downloads_dir: downloads,
            cookies_dir: cookies,
            downloader,
            real_downloads: real,
        }
    }

    fn install_downloader_stub(dir: &Path, body: &str) -> PathBuf {
        let script_path = dir.join("yt-dlp-stub");
        let script = format!("#!/usr/bin/env bash\nset -eu\n{body}\n");
        fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    // Extracts the `-o` template and writes an .mp4 where it points.
    const WRITE_OUTPUT_STUB: &str = r#"
output=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o)
      shift
      output="$1"
      ;;
  esac
  shift
done
target="${output//%(ext)s/mp4}"
echo "[download] writing $target"
echo "video-bytes" > "$target"
"#;

    #[test]
    fn simulation_writes_marker_file() {
        let temp = tempdir().unwrap();
        let ctx = test_context(temp.path(), None, false);

        let outcome = fetch_media(&ctx, "https://example.com/watch?v=abc", None).unwrap();
        assert!(outcome.success);
        assert!(outcome.simulated);
        assert!(!outcome.error);
        assert!(outcome.filename.starts_with("simulation_"));
        assert!(outcome.download_url.starts_with("/downloads/simulation_"));

        let content = fs::read_to_string(ctx.downloads_dir.join(&outcome.filename)).unwrap();
        assert!(content.contains("https://example.com/watch?v=abc"));
        assert!(content.contains("Real downloads are disabled."));
    }

    #[test]
    fn missing_downloader_produces_report_link() {
        let temp = tempdir().unwrap();
        let ctx = test_context(temp.path(), None, true);

        let outcome = fetch_media(&ctx, "https://example.com/v", None).unwrap();
        assert!(outcome.success);
        assert!(outcome.error);
        assert_eq!(outcome.title, "Downloader Missing");
        assert!(outcome.filename.starts_with("error_noytdlp_"));
        assert!(ctx.downloads_dir.join(&outcome.filename).is_file());
    }

    #[test]
    fn successful_fetch_locates_written_file() {
        let temp = tempdir().unwrap();
        let stub = install_downloader_stub(temp.path(), WRITE_OUTPUT_STUB);
        let ctx = test_context(temp.path(), Some(stub), true);

        let outcome = fetch_media(&ctx, "https://example.com/v", None).unwrap();
        assert!(outcome.success);
        assert!(!outcome.error);
        assert!(!outcome.simulated);
        assert!(outcome.filename.starts_with("video_"));
        assert!(outcome.filename.ends_with(".mp4"));
        assert_eq!(outcome.title, outcome.filename.trim_end_matches(".mp4"));
        assert!(ctx.downloads_dir.join(&outcome.filename).is_file());
    }

    #[test]
    fn failed_fetch_writes_exit_code_report() {
        let temp = tempdir().unwrap();
        let stub = install_downloader_stub(temp.path(), "echo 'ERROR: no formats' >&2\nexit 3");
        let ctx = test_context(temp.path(), Some(stub), true);

        let outcome = fetch_media(&ctx, "https://example.com/v", None).unwrap();
        assert!(outcome.success);
        assert!(outcome.error);
        assert_eq!(outcome.title, "Download Failed");
        assert!(outcome.filename.starts_with("error_failed_3_"));

        let content = fs::read_to_string(ctx.downloads_dir.join(&outcome.filename)).unwrap();
        assert!(content.contains("ERROR: no formats"));
        assert!(content.contains("https://example.com/v"));
    }

    #[test]
    fn success_without_output_writes_notfound_report() {
        let temp = tempdir().unwrap();
        let stub = install_downloader_stub(temp.path(), "echo 'nothing to do'");
        let ctx = test_context(temp.path(), Some(stub), true);

        let outcome = fetch_media(&ctx, "https://example.com/v", None).unwrap();
        assert!(outcome.success);
        assert!(outcome.error);
        assert_eq!(outcome.title, "File Not Found");
        assert!(outcome.filename.starts_with("error_notfound_"));

        let content = fs::read_to_string(ctx.downloads_dir.join(&outcome.filename)).unwrap();
        assert!(content.contains("nothing to do"));
    }

    #[test]
    fn existing_cookie_file_is_passed_through() {
        let temp = tempdir().unwrap();
        let argv_log = temp.path().join("argv.txt");
        let body = format!(
            "printf '%s\\n' \"$@\" > {}\n{}",
            argv_log.display(),
            WRITE_OUTPUT_STUB
        );
        let stub = install_downloader_stub(temp.path(), &body);
        let ctx = test_context(temp.path(), Some(stub), true);
        fs::write(ctx.cookies_dir.join("cookies_1.txt"), "# cookies").unwrap();

        fetch_media(&ctx, "https://example.com/v", Some("cookies_1.txt")).unwrap();

        let argv = fs::read_to_string(&argv_log).unwrap();
        assert!(argv.contains("--cookies"));
        assert!(argv.contains("cookies_1.txt"));
    }

    #[test]
    fn absent_cookie_file_is_skipped() {
        let temp = tempdir().unwrap();
        let argv_log = temp.path().join("argv.txt");
        let body = format!(
            "printf '%s\\n' \"$@\" > {}\n{}",
            argv_log.display(),
            WRITE_OUTPUT_STUB
        );
        let stub = install_downloader_stub(temp.path(), &body);
        let ctx = test_context(temp.path(), Some(stub), true);

        fetch_media(&ctx, "https://example.com/v", Some("missing.txt")).unwrap();

        let argv = fs::read_to_string(&argv_log).unwrap();
        assert!(!argv.contains("--cookies"));
    }

    #[test]
    fn output_bases_are_unique() {
        let first = next_output_base();
        let second = next_output_base();
        assert_ne!(first, second);
        assert!(first.starts_with("video_"));
    }

    #[test]
    fn encode_path_component_escapes_specials() {
        assert_eq!(encode_path_component("plain-name.mp4"), "plain-name.mp4");
        assert_eq!(
            encode_path_component("My Video [720p].mp4"),
            "My%20Video%20%5B720p%5D.mp4"
        );
    }

    #[test]
    fn ensure_program_available_rejects_missing_binary() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("not-a-binary");
        assert!(ensure_program_available(&missing).is_err());
    }

    #[test]
    fn ensure_program_available_accepts_working_stub() {
        let temp = tempdir().unwrap();
        let stub = install_downloader_stub(temp.path(), "exit 0");
        assert!(ensure_program_available(&stub).is_ok());
    }
}
