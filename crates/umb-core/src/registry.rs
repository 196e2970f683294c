use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const REGISTRY_DIR_NAME: &str = ".unity-mcp";
pub const PORT_FILE_PREFIX: &str = "unity-mcp-port-";
pub const STATUS_FILE_PREFIX: &str = "unity-mcp-status-";
pub const LEGACY_PORT_FILE: &str = "unity-mcp-port.json";
const JSON_SUFFIX: &str = ".json";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not read registry file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not parse registry file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub unity_port: Option<Value>,
    #[serde(default)]
    pub reloading: Option<bool>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub unity_version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl RegistryFile {
    pub fn port(&self) -> Option<u16> {
        self.unity_port
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0)
    }

    pub fn declares_reloading(&self) -> bool {
        self.reloading == Some(true) || self.reason.as_deref() == Some("reloading")
    }

    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.project_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
        let path = self.project_path.as_deref()?.trim().trim_end_matches(['/', '\\']);
        let base = path.rsplit(['/', '\\']).next()?;
        (!base.is_empty()).then(|| base.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub path: PathBuf,
    pub hash: Option<String>,
    pub modified: SystemTime,
    pub file: RegistryFile,
}

impl RegistryEntry {
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.modified)
            .unwrap_or_default()
    }

    pub fn is_stale(&self, stale_after: Option<Duration>) -> bool {
        stale_after.is_some_and(|limit| self.age() > limit)
    }

    /// A stale status file is treated as "ready" even if it still says reloading.
    pub fn reports_reloading(&self, stale_after: Option<Duration>) -> bool {
        self.file.declares_reloading() && !self.is_stale(stale_after)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryReader {
    dir: PathBuf,
}

impl RegistryReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(REGISTRY_DIR_NAME))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn port_files(&self) -> Vec<PathBuf> {
        self.list_prefixed(PORT_FILE_PREFIX)
    }

    pub fn status_files(&self) -> Vec<PathBuf> {
        self.list_prefixed(STATUS_FILE_PREFIX)
    }

    pub fn legacy_file(&self) -> Option<PathBuf> {
        let path = self.dir.join(LEGACY_PORT_FILE);
        path.is_file().then_some(path)
    }

    pub fn candidate_files(&self) -> Vec<PathBuf> {
        let mut files = self.port_files();
        if let Some(legacy) = self.legacy_file() {
            files.push(legacy);
        }
        files
    }

    pub fn port_file_for(&self, hash: &str) -> Option<PathBuf> {
        let path = self
            .dir
            .join(format!("{PORT_FILE_PREFIX}{hash}{JSON_SUFFIX}"));
        path.is_file().then_some(path)
    }

    pub fn latest_status(&self) -> Option<RegistryEntry> {
        self.status_files()
            .into_iter()
            .next()
            .and_then(|path| self.read_logged(&path))
    }

    pub fn status_for(&self, hash: &str) -> Option<RegistryEntry> {
        let path = self
            .dir
            .join(format!("{STATUS_FILE_PREFIX}{hash}{JSON_SUFFIX}"));
        if !path.is_file() {
            return None;
        }
        self.read_logged(&path)
    }

    pub fn instances(&self) -> Vec<RegistryEntry> {
        self.port_files()
            .iter()
            .filter_map(|path| self.read_logged(path))
            .collect()
    }

    pub fn read(&self, path: &Path) -> Result<RegistryEntry, RegistryError> {
        let raw = fs::read(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let modified = fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map_err(|source| RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let file: RegistryFile =
            serde_json::from_slice(&raw).map_err(|source| RegistryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(RegistryEntry {
            path: path.to_path_buf(),
            hash: hash_from_path(path),
            modified,
            file,
        })
    }

    fn read_logged(&self, path: &Path) -> Option<RegistryEntry> {
        match self.read(path) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(event = "registry_read_error", error = %err);
                None
            }
        }
    }

    fn list_prefixed(&self, prefix: &str) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(
                    event = "registry_dir_unreadable",
                    dir = %self.dir.display(),
                    error = %err
                );
                return Vec::new();
            }
        };

        let mut files = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !is_prefixed_json(&name, prefix) {
                    return None;
                }
                let modified = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                Some((entry.path(), modified))
            })
            .collect::<Vec<_>>();
        files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        files.into_iter().map(|(path, _)| path).collect()
    }
}

fn is_prefixed_json(name: &str, prefix: &str) -> bool {
    name.len() > prefix.len() + JSON_SUFFIX.len()
        && name.starts_with(prefix)
        && name.ends_with(JSON_SUFFIX)
}

fn hash_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    [PORT_FILE_PREFIX, STATUS_FILE_PREFIX]
        .iter()
        .find(|prefix| is_prefixed_json(name, prefix))
        .map(|prefix| name[prefix.len()..name.len() - JSON_SUFFIX.len()].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, body: &str, age: Duration) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create");
        file.write_all(body.as_bytes()).expect("write");
        file.set_modified(SystemTime::now() - age).expect("mtime");
        path
    }

    #[test]
    fn candidates_are_newest_first_with_legacy_last() {
        let dir = TempDir::new().expect("tempdir");
        write_file(dir.path(), LEGACY_PORT_FILE, r#"{"unity_port": 6400}"#, Duration::ZERO);
        write_file(
            dir.path(),
            "unity-mcp-port-old.json",
            r#"{"unity_port": 6401}"#,
            Duration::from_secs(60),
        );
        write_file(
            dir.path(),
            "unity-mcp-port-new.json",
            r#"{"unity_port": 6402}"#,
            Duration::from_secs(5),
        );
        write_file(dir.path(), "unrelated.json", "{}", Duration::ZERO);

        let reader = RegistryReader::new(dir.path());
        let names = reader
            .candidate_files()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "unity-mcp-port-new.json",
                "unity-mcp-port-old.json",
                LEGACY_PORT_FILE
            ]
        );
    }

    #[test]
    fn missing_directory_yields_nothing() {
        let reader = RegistryReader::new("/definitely/not/a/registry/dir");
        assert!(reader.candidate_files().is_empty());
        assert!(reader.latest_status().is_none());
        assert!(reader.instances().is_empty());
    }

    #[test]
    fn entry_carries_hash_from_file_name() {
        let dir = TempDir::new().expect("tempdir");
        write_file(
            dir.path(),
            "unity-mcp-port-abc123.json",
            r#"{"unity_port": 6401, "project_name": "Demo"}"#,
            Duration::ZERO,
        );
        let reader = RegistryReader::new(dir.path());
        let entries = reader.instances();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hash.as_deref(), Some("abc123"));
        assert_eq!(entries[0].file.port(), Some(6401));
        assert_eq!(entries[0].file.display_name().as_deref(), Some("Demo"));
    }

    #[test]
    fn port_must_be_an_integer_in_range() {
        let parse = |body: &str| serde_json::from_str::<RegistryFile>(body).expect("parse").port();
        assert_eq!(parse(r#"{"unity_port": 6400}"#), Some(6400));
        assert_eq!(parse(r#"{"unity_port": "6400"}"#), None);
        assert_eq!(parse(r#"{"unity_port": 70000}"#), None);
        assert_eq!(parse(r#"{"unity_port": 0}"#), None);
        assert_eq!(parse("{}"), None);
    }

    #[test]
    fn display_name_falls_back_to_project_path_basename() {
        let file: RegistryFile =
            serde_json::from_str(r#"{"project_path": "/work/games/Space Game/"}"#).expect("parse");
        assert_eq!(file.display_name().as_deref(), Some("Space Game"));
        assert_eq!(RegistryFile::default().display_name(), None);
    }

    #[test]
    fn latest_status_wins_and_stale_reload_flag_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        write_file(
            dir.path(),
            "unity-mcp-status-aaa.json",
            r#"{"unity_port": 6401, "reloading": false}"#,
            Duration::from_secs(30),
        );
        write_file(
            dir.path(),
            "unity-mcp-status-bbb.json",
            r#"{"unity_port": 6402, "reloading": true}"#,
            Duration::from_secs(10),
        );
        let reader = RegistryReader::new(dir.path());
        let status = reader.latest_status().expect("status");
        assert_eq!(status.hash.as_deref(), Some("bbb"));
        assert!(status.reports_reloading(None));
        assert!(status.reports_reloading(Some(Duration::from_secs(60))));
        assert!(!status.reports_reloading(Some(Duration::from_secs(5))));
    }

    #[test]
    fn reason_field_also_signals_reload() {
        let file: RegistryFile = serde_json::from_str(r#"{"reason": "reloading"}"#).expect("parse");
        assert!(file.declares_reloading());
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        write_file(dir.path(), "unity-mcp-port-bad.json", "{not json", Duration::ZERO);
        write_file(
            dir.path(),
            "unity-mcp-port-good.json",
            r#"{"unity_port": 6500}"#,
            Duration::from_secs(1),
        );
        let reader = RegistryReader::new(dir.path());
        assert_eq!(reader.port_files().len(), 2);
        let instances = reader.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].hash.as_deref(), Some("good"));
        assert!(matches!(
            reader.read(&dir.path().join("unity-mcp-port-bad.json")),
            Err(RegistryError::Parse { .. })
        ));
    }
}
