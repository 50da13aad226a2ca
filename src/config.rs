//! Configuration loading.
//!
//! `$APP_HOME/conf.yaml` holds the primary identity and run-time tunables;
//! an optional sibling `additional_cookies.yaml` holds extra identities that
//! get logged in alongside the primary one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, #[source] source: serde_yaml::Error },
    #[error("{field} must be set in conf.yaml")]
    MissingField { field: &'static str },
    #[error("ARCHIVIST_HOME/APPDATA is not set and no platform config directory is available")]
    NoHomeDirectory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookiePair {
    pub auth_token: String,
    pub ct0: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub root_path: PathBuf,
    pub cookie: CookiePair,
    #[serde(default)]
    pub max_download_routine: Option<usize>,
}

impl Config {
    fn validate(self) -> Result<Self, ConfigError> {
        if self.root_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField { field: "root_path" });
        }
        if self.cookie.auth_token.is_empty() {
            return Err(ConfigError::MissingField { field: "cookie.auth_token" });
        }
        if self.cookie.ct0.is_empty() {
            return Err(ConfigError::MissingField { field: "cookie.ct0" });
        }
        Ok(self)
    }
}

/// Resolve `$APP_HOME`: the `ARCHIVIST_HOME` environment variable if set,
/// otherwise `dirs::config_dir()/archivist`.
pub fn app_home() -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = std::env::var("ARCHIVIST_HOME") {
        return Ok(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join("archivist")).ok_or(ConfigError::NoHomeDirectory)
}

/// Load `conf.yaml` from `app_home`. Returns `Ok(None)` if the file does not exist
/// (the caller should then run the configuration prompt).
pub fn load(app_home: &Path) -> Result<Option<Config>, ConfigError> {
    let path = app_home.join("conf.yaml");
    match std::fs::read_to_string(&path) {
        Ok(data) => {
            let parsed: Config = serde_yaml::from_str(&data)
                .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
            Ok(Some(parsed.validate()?))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Read { path, source }),
    }
}

/// Persist `conf.yaml` under `app_home`, creating the directory if needed.
pub fn save(app_home: &Path, config: &Config) -> Result<(), ConfigError> {
    std::fs::create_dir_all(app_home)
        .map_err(|source| ConfigError::Write { path: app_home.to_path_buf(), source })?;
    let path = app_home.join("conf.yaml");
    let data = serde_yaml::to_string(config)
        .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
    std::fs::write(&path, data).map_err(|source| ConfigError::Write { path, source })
}

/// Load the optional `additional_cookies.yaml` sibling file. Missing file is not an error.
pub fn load_additional_cookies(app_home: &Path) -> Result<Vec<CookiePair>, ConfigError> {
    let path = app_home.join("additional_cookies.yaml");
    match std::fs::read_to_string(&path) {
        Ok(data) => {
            let cookies: Vec<CookiePair> = serde_yaml::from_str(&data)
                .map_err(|source| ConfigError::Parse { path: path.clone(), source })?;
            Ok(cookies)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(ConfigError::Read { path, source }),
    }
}

/// Deduplicate additional cookies against already-resolved handles (identities
/// that logged in to the same account as an earlier cookie are dropped).
pub fn dedup_by_handle(cookies: Vec<(CookiePair, String)>) -> Vec<(CookiePair, String)> {
    let mut seen = std::collections::HashSet::new();
    cookies
        .into_iter()
        .filter(|(_, handle)| seen.insert(handle.clone()))
        .collect()
}

/// Hook for the interactive `-conf` prompt flow. The actual terminal UI is an
/// external collaborator this crate does not implement; callers that need a
/// real prompt should supply `prompt` themselves.
pub fn run_config_prompt(
    app_home: &Path,
    prompt: impl FnOnce() -> Result<Config, ConfigError>,
) -> Result<Config, ConfigError> {
    let config = prompt()?;
    save(app_home, &config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            root_path: PathBuf::from("/tmp/archive"),
            cookie: CookiePair { auth_token: "tok".into(), ct0: "ct0val".into() },
            max_download_routine: None,
        }
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &sample()).unwrap();
        let loaded = load(dir.path()).unwrap().expect("config should exist");
        assert_eq!(loaded.root_path, sample().root_path);
        assert_eq!(loaded.cookie.auth_token, "tok");
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn missing_auth_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("conf.yaml"),
            "root_path: /tmp/x\ncookie:\n  auth_token: \"\"\n  ct0: \"y\"\n",
        )
        .unwrap();
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "cookie.auth_token" }));
    }

    #[test]
    fn additional_cookies_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_additional_cookies(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn dedup_by_handle_keeps_first_occurrence() {
        let a = (CookiePair { auth_token: "a".into(), ct0: "a".into() }, "same".to_string());
        let b = (CookiePair { auth_token: "b".into(), ct0: "b".into() }, "same".to_string());
        let c = (CookiePair { auth_token: "c".into(), ct0: "c".into() }, "other".to_string());
        let deduped = dedup_by_handle(vec![a.clone(), b, c.clone()]);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].0.auth_token, "a");
        assert_eq!(deduped[1].0.auth_token, "c");
    }
}
