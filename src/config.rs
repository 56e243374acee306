#![forbid(unsafe_code)]

//! Runtime configuration for the GrabTube binaries.
//!
//! Values come from three layers: an optional `.env`-style file in the
//! working directory, the process environment, and per-binary CLI overrides.
//! CLI wins over env, env wins over the file, and everything falls back to a
//! default that matches a bare checkout (data in `.`, site in `./public`).

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATA_ROOT: &str = ".";
pub const DEFAULT_WWW_ROOT: &str = "public";
pub const DEFAULT_GRABTUBE_PORT: u16 = 10000;
pub const DEFAULT_GRABTUBE_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub data_root: PathBuf,
    pub www_root: PathBuf,
    pub grabtube_port: u16,
    pub grabtube_host: String,
    pub ytdlp_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub data_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub grabtube_port: Option<u16>,
    pub grabtube_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_paths(overrides: RuntimeOverrides) -> Result<RuntimePaths> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_paths_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_paths(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimePaths> {
    build_runtime_paths_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_paths_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimePaths> {
    let data_root = overrides
        .data_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DATA_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DATA_ROOT.to_string());
    let www_root = overrides
        .www_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_WWW_ROOT.to_string());
    let grabtube_port = overrides
        .grabtube_port
        .or_else(|| {
            lookup_value("GRABTUBE_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_GRABTUBE_PORT);
    let grabtube_host = overrides
        .grabtube_host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .or_else(|| lookup_value("GRABTUBE_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_GRABTUBE_HOST.to_string());
    let ytdlp_path = lookup_value("GRABTUBE_YTDLP", file_vars, &env_lookup)
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from);
    Ok(RuntimePaths {
        data_root: PathBuf::from(data_root),
        www_root: PathBuf::from(www_root),
        grabtube_port,
        grabtube_host,
        ytdlp_path,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn runtime_from(contents: &str) -> RuntimePaths {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_paths(&vars, |_| None).unwrap()
    }

    #[test]
    fn runtime_paths_read_port() {
        let runtime = runtime_from("DATA_ROOT=\"/srv/grab\"\nGRABTUBE_PORT=\"4242\"\n");
        assert_eq!(runtime.grabtube_port, 4242);
        assert_eq!(runtime.data_root, PathBuf::from("/srv/grab"));
    }

    #[test]
    fn runtime_paths_default_everything() {
        let runtime = runtime_from("");
        assert_eq!(runtime.data_root, PathBuf::from(DEFAULT_DATA_ROOT));
        assert_eq!(runtime.www_root, PathBuf::from(DEFAULT_WWW_ROOT));
        assert_eq!(runtime.grabtube_port, DEFAULT_GRABTUBE_PORT);
        assert_eq!(runtime.grabtube_host, DEFAULT_GRABTUBE_HOST);
        assert!(runtime.ytdlp_path.is_none());
    }

    #[test]
    fn runtime_paths_read_host_and_ytdlp() {
        let runtime =
            runtime_from("GRABTUBE_HOST=\"127.0.0.1\"\nGRABTUBE_YTDLP=\"/opt/bin/yt-dlp\"\n");
        assert_eq!(runtime.grabtube_host, "127.0.0.1");
        assert_eq!(runtime.ytdlp_path, Some(PathBuf::from("/opt/bin/yt-dlp")));
    }

    #[test]
    fn build_runtime_paths_prefers_env_over_file() {
        let vars = read_env_file(make_config("DATA_ROOT=\"/file\"\n").path()).unwrap();
        let runtime = build_runtime_paths(&vars, |key| {
            if key == "DATA_ROOT" {
                Some("/env".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(runtime.data_root, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export DATA_ROOT="/data"
            WWW_ROOT='/www'
            GRABTUBE_HOST =  "0.0.0.0"
            GRABTUBE_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("DATA_ROOT").unwrap(), "/data");
        assert_eq!(vars.get("WWW_ROOT").unwrap(), "/www");
        assert_eq!(vars.get("GRABTUBE_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("GRABTUBE_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn build_runtime_paths_override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("DATA_ROOT".to_string(), "/file-data".to_string());
        vars.insert("WWW_ROOT".to_string(), "/file-www".to_string());
        vars.insert("GRABTUBE_HOST".to_string(), "file-host".to_string());
        vars.insert("GRABTUBE_PORT".to_string(), "7000".to_string());

        let overrides = RuntimeOverrides {
            data_root: Some(PathBuf::from("/override-data")),
            www_root: None,
            grabtube_port: Some(9000),
            grabtube_host: Some("override-host".into()),
            env_path: None,
        };

        let runtime = build_runtime_paths_with_overrides(
            &vars,
            |key| {
                if key == "WWW_ROOT" {
                    Some("/env-www".to_string())
                } else if key == "GRABTUBE_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(runtime.data_root, PathBuf::from("/override-data"));
        assert_eq!(runtime.www_root, PathBuf::from("/env-www"));
        assert_eq!(runtime.grabtube_port, 9000);
        assert_eq!(runtime.grabtube_host, "override-host");
    }

    #[test]
    fn build_runtime_paths_ignores_blank_host() {
        let vars = read_env_file(make_config("").path()).unwrap();
        let runtime = build_runtime_paths_with_overrides(
            &vars,
            |_| None,
            RuntimeOverrides {
                grabtube_host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(runtime.grabtube_host, DEFAULT_GRABTUBE_HOST);
    }

    #[test]
    fn build_runtime_paths_invalid_port_defaults() {
        let vars = read_env_file(make_config("GRABTUBE_PORT=\"nope\"\n").path()).unwrap();
        let runtime = build_runtime_paths(&vars, |_| None).unwrap();
        assert_eq!(runtime.grabtube_port, DEFAULT_GRABTUBE_PORT);
    }
}
