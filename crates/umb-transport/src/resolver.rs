use async_trait::async_trait;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::{debug, info, warn};
use umb_core::{CommandOutcome, InstanceKey, InstanceRecord};
use umb_hub::PluginHub;

pub const INSTANCE_ARGUMENT: &str = "unity_instance";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("Unity instance '{0}' not found")]
    NotFound(String),
    #[error("No Unity instance found on port {0}")]
    PortNotFound(u16),
    #[error("Port-based instance selection ('{0}') is not supported in HTTP transport mode")]
    PortUnsupported(String),
    #[error("No running Unity instance matches '{0}'")]
    NoMatch(String),
    #[error("Instance prefix '{prefix}' is ambiguous; candidates: {}", .candidates.join(", "))]
    Ambiguous {
        prefix: String,
        candidates: Vec<String>,
    },
    #[error("No running Unity instance found")]
    NoInstances,
    #[error("Multiple Unity instances are running ({}); pass unity_instance to pick one", .candidates.join(", "))]
    MultipleInstances { candidates: Vec<String> },
    #[error("instance discovery failed: {0}")]
    Discovery(String),
}

impl ResolveError {
    pub fn outcome(&self) -> CommandOutcome {
        CommandOutcome::NotExecuted
    }
}

#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    async fn instances(&self) -> Result<Vec<InstanceRecord>, ResolveError>;
}

#[async_trait]
impl InstanceDirectory for PluginHub {
    async fn instances(&self) -> Result<Vec<InstanceRecord>, ResolveError> {
        Ok(PluginHub::instances(self))
    }
}

pub fn resolve_descriptor(
    descriptor: &str,
    instances: &[InstanceRecord],
    allow_ports: bool,
) -> Result<InstanceKey, ResolveError> {
    let descriptor = descriptor.trim();
    if descriptor.contains('@') {
        return instances
            .iter()
            .find(|record| record.key.as_str() == descriptor)
            .map(|record| record.key.clone())
            .ok_or_else(|| ResolveError::NotFound(descriptor.to_string()));
    }

    if !descriptor.is_empty() && descriptor.bytes().all(|b| b.is_ascii_digit()) {
        if !allow_ports {
            return Err(ResolveError::PortUnsupported(descriptor.to_string()));
        }
        let port = descriptor
            .parse::<u16>()
            .map_err(|_| ResolveError::NoMatch(descriptor.to_string()))?;
        return instances
            .iter()
            .find(|record| record.port == Some(port))
            .map(|record| record.key.clone())
            .ok_or(ResolveError::PortNotFound(port));
    }

    let matches = instances
        .iter()
        .filter(|record| !descriptor.is_empty() && record.hash.starts_with(descriptor))
        .collect::<Vec<_>>();
    match matches.as_slice() {
        [] => Err(ResolveError::NoMatch(descriptor.to_string())),
        [only] => Ok(only.key.clone()),
        many => Err(ResolveError::Ambiguous {
            prefix: descriptor.to_string(),
            candidates: many.iter().map(|record| record.key.to_string()).collect(),
        }),
    }
}

pub fn take_instance_argument(args: &mut Map<String, Value>) -> Option<String> {
    match args.remove(INSTANCE_ARGUMENT)? {
        Value::String(raw) => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(port) => Some(port.to_string()),
        _ => None,
    }
}

pub struct InstanceResolver {
    directory: Arc<dyn InstanceDirectory>,
    allow_ports: bool,
    active: Mutex<HashMap<String, InstanceKey>>,
}

impl InstanceResolver {
    pub fn new(directory: Arc<dyn InstanceDirectory>, allow_ports: bool) -> Self {
        Self {
            directory,
            allow_ports,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn active_map(&self) -> MutexGuard<'_, HashMap<String, InstanceKey>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn resolve(&self, descriptor: &str) -> Result<InstanceKey, ResolveError> {
        let instances = self.directory.instances().await?;
        resolve_descriptor(descriptor, &instances, self.allow_ports)
    }

    pub async fn set_active_instance(
        &self,
        session: &str,
        descriptor: &str,
    ) -> Result<InstanceKey, ResolveError> {
        let key = self.resolve(descriptor).await?;
        self.active_map().insert(session.to_string(), key.clone());
        info!(event = "active_instance_set", session = %session, instance = %key);
        Ok(key)
    }

    pub fn active_instance(&self, session: &str) -> Option<InstanceKey> {
        self.active_map().get(session).cloned()
    }

    pub fn clear_active_instance(&self, session: &str) -> Option<InstanceKey> {
        self.active_map().remove(session)
    }

    /// Instance for one call. The result is request-scoped and never persisted.
    pub async fn resolve_for_call(
        &self,
        session: &str,
        override_descriptor: Option<&str>,
    ) -> Result<InstanceKey, ResolveError> {
        if let Some(descriptor) = override_descriptor
            .map(str::trim)
            .filter(|descriptor| !descriptor.is_empty())
        {
            let key = self.resolve(descriptor).await?;
            debug!(event = "instance_override", session = %session, instance = %key);
            return Ok(key);
        }
        let instances = self.directory.instances().await?;
        if let Some(key) = self.active_instance(session) {
            if instances.iter().any(|record| record.key == key) {
                return Ok(key);
            }
            warn!(event = "active_instance_missing", session = %session, instance = %key);
            return Err(ResolveError::NotFound(key.to_string()));
        }

        match instances.as_slice() {
            [] => Err(ResolveError::NoInstances),
            [only] => {
                debug!(event = "instance_auto_selected", session = %session, instance = %only.key);
                Ok(only.key.clone())
            }
            many => Err(ResolveError::MultipleInstances {
                candidates: many.iter().map(|record| record.key.to_string()).collect(),
            }),
        }
    }
}
