use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceKey(String);

impl InstanceKey {
    pub fn new(name: &str, hash: &str) -> Self {
        Self(format!("{name}@{hash}"))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let (name, hash) = trimmed.rsplit_once('@')?;
        if name.is_empty() || hash.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.rsplit_once('@').map(|(name, _)| name).unwrap_or(&self.0)
    }

    pub fn hash(&self) -> &str {
        self.0.rsplit_once('@').map(|(_, hash)| hash).unwrap_or_default()
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstanceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub key: InstanceKey,
    pub display_name: String,
    pub hash: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(display_name: &str, hash: &str, port: Option<u16>) -> Self {
        let now = Utc::now();
        Self {
            key: InstanceKey::new(display_name, hash),
            display_name: display_name.to_string(),
            hash: hash.to_string(),
            port,
            connected_at: now,
            last_seen: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_splits_on_last_at_sign() {
        let key = InstanceKey::parse("My@Game@abc123").expect("key");
        assert_eq!(key.name(), "My@Game");
        assert_eq!(key.hash(), "abc123");
        assert_eq!(key.to_string(), "My@Game@abc123");
    }

    #[test]
    fn key_parse_rejects_partial_forms() {
        assert!(InstanceKey::parse("abc123").is_none());
        assert!(InstanceKey::parse("@abc123").is_none());
        assert!(InstanceKey::parse("Proj@").is_none());
        assert_eq!(
            InstanceKey::parse("  Proj@abc  ").map(|key| key.to_string()),
            Some("Proj@abc".to_string())
        );
    }

    #[test]
    fn record_touch_advances_last_seen_only() {
        let mut record = InstanceRecord::new("Proj", "abc123", Some(6401));
        let connected = record.connected_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        record.touch();
        assert_eq!(record.connected_at, connected);
        assert!(record.last_seen > connected);
        assert_eq!(record.key.as_str(), "Proj@abc123");
    }
}
