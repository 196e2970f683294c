use crate::probe::LivenessProbe;
use tracing::{info, warn};
use umb_core::{
    registry::{RegistryFile, RegistryReader},
    BridgeConfig,
};

#[derive(Debug, Clone)]
pub struct PortResolver {
    registry: RegistryReader,
    probe: LivenessProbe,
    default_port: u16,
}

impl PortResolver {
    pub fn new(registry: RegistryReader, probe: LivenessProbe, default_port: u16) -> Self {
        Self {
            registry,
            probe,
            default_port,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.registry(),
            LivenessProbe::from_config(config),
            config.default_port,
        )
    }

    pub fn registry(&self) -> &RegistryReader {
        &self.registry
    }

    pub fn probe(&self) -> &LivenessProbe {
        &self.probe
    }

    pub fn discover(&self) -> u16 {
        if let Some(port) = self
            .registry
            .latest_status()
            .and_then(|status| status.file.port())
        {
            if self.probe.is_alive(port) {
                info!(event = "port_from_status", port);
                return port;
            }
        }

        let mut first_seen: Option<u16> = None;
        for path in self.registry.candidate_files() {
            let entry = match self.registry.read(&path) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(event = "port_registry_unreadable", error = %err);
                    continue;
                }
            };
            let Some(port) = entry.file.port() else {
                continue;
            };
            first_seen.get_or_insert(port);
            if self.probe.is_alive(port) {
                info!(event = "port_from_registry", port, file = %path.display());
                return port;
            }
        }

        match first_seen {
            Some(port) => {
                info!(event = "port_first_seen_fallback", port);
                port
            }
            None => {
                info!(event = "port_default_fallback", port = self.default_port);
                self.default_port
            }
        }
    }

    pub fn discover_for(&self, hash: &str) -> u16 {
        let status_port = self
            .registry
            .status_for(hash)
            .and_then(|status| status.file.port());
        let file_port = self
            .registry
            .port_file_for(hash)
            .and_then(|path| self.registry.read(&path).ok())
            .and_then(|entry| entry.file.port());
        for port in [status_port, file_port].into_iter().flatten() {
            if self.probe.is_alive(port) {
                info!(event = "port_from_instance", hash = %hash, port);
                return port;
            }
        }
        self.discover()
    }

    pub fn port_config(&self) -> Option<RegistryFile> {
        self.registry
            .candidate_files()
            .iter()
            .find_map(|path| match self.registry.read(path) {
                Ok(entry) => Some(entry.file),
                Err(err) => {
                    warn!(event = "port_config_unreadable", error = %err);
                    None
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::{closed_port, spawn_pong_host};
    use std::{
        fs::File,
        io::Write,
        path::Path,
        time::{Duration, SystemTime},
    };
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, body: String, age_secs: u64) {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create");
        file.write_all(body.as_bytes()).expect("write");
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .expect("mtime");
    }

    fn resolver(dir: &Path) -> PortResolver {
        PortResolver::new(
            RegistryReader::new(dir),
            LivenessProbe::new("127.0.0.1", Duration::from_millis(300)),
            6400,
        )
    }

    #[test]
    fn responsive_instance_file_beats_dead_legacy_file() {
        let dir = TempDir::new().expect("tempdir");
        let dead = closed_port();
        let live = spawn_pong_host(true);
        write_file(dir.path(), "unity-mcp-port.json", format!(r#"{{"unity_port": {dead}}}"#), 0);
        write_file(
            dir.path(),
            "unity-mcp-port-abc.json",
            format!(r#"{{"unity_port": {live}}}"#),
            30,
        );
        assert_eq!(resolver(dir.path()).discover(), live);
    }

    #[test]
    fn newer_dead_file_is_skipped_for_older_live_one() {
        let dir = TempDir::new().expect("tempdir");
        let dead = closed_port();
        let live = spawn_pong_host(false);
        write_file(dir.path(), "unity-mcp-port-new.json", format!(r#"{{"unity_port": {dead}}}"#), 1);
        write_file(dir.path(), "unity-mcp-port-old.json", format!(r#"{{"unity_port": {live}}}"#), 60);
        assert_eq!(resolver(dir.path()).discover(), live);
    }

    #[test]
    fn live_status_file_short_circuits() {
        let dir = TempDir::new().expect("tempdir");
        let live = spawn_pong_host(true);
        write_file(
            dir.path(),
            "unity-mcp-status-abc.json",
            format!(r#"{{"unity_port": {live}, "reloading": false}}"#),
            0,
        );
        write_file(dir.path(), "unity-mcp-port-abc.json", r#"{"unity_port": 1}"#.to_string(), 0);
        assert_eq!(resolver(dir.path()).discover(), live);
    }

    #[test]
    fn falls_back_to_first_seen_then_default() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(resolver(dir.path()).discover(), 6400);

        let first = closed_port();
        let second = closed_port();
        write_file(dir.path(), "unity-mcp-port-a.json", format!(r#"{{"unity_port": {first}}}"#), 1);
        write_file(dir.path(), "unity-mcp-port-b.json", format!(r#"{{"unity_port": {second}}}"#), 20);
        write_file(dir.path(), "unity-mcp-port-c.json", r#"{"unity_port": "nope"}"#.to_string(), 0);
        assert_eq!(resolver(dir.path()).discover(), first);
    }

    #[test]
    fn discover_for_prefers_the_named_instance() {
        let dir = TempDir::new().expect("tempdir");
        let mine = spawn_pong_host(true);
        let other = spawn_pong_host(true);
        write_file(dir.path(), "unity-mcp-port-mine.json", format!(r#"{{"unity_port": {mine}}}"#), 60);
        write_file(dir.path(), "unity-mcp-port-other.json", format!(r#"{{"unity_port": {other}}}"#), 0);
        let resolver = resolver(dir.path());
        assert_eq!(resolver.discover(), other);
        assert_eq!(resolver.discover_for("mine"), mine);
        assert_eq!(resolver.discover_for("missing"), other);
    }

    #[test]
    fn port_config_reads_newest_file() {
        let dir = TempDir::new().expect("tempdir");
        assert!(resolver(dir.path()).port_config().is_none());
        write_file(dir.path(), "unity-mcp-port.json", r#"{"unity_port": 6400}"#.to_string(), 0);
        write_file(
            dir.path(),
            "unity-mcp-port-abc.json",
            r#"{"unity_port": 6401, "project_name": "Demo"}"#.to_string(),
            10,
        );
        let config = resolver(dir.path()).port_config().expect("config");
        assert_eq!(config.port(), Some(6401));
        assert_eq!(config.project_name.as_deref(), Some("Demo"));
    }
}
