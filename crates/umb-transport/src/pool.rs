use crate::{
    dispatch::{DispatchError, ReloadPolicy, RetryingDispatcher},
    port::PortResolver,
    resolver::{InstanceDirectory, ResolveError},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Instant,
};
use tracing::{debug, info};
use umb_core::{BridgeConfig, InstanceRecord};
use umb_hub::hub::DEFAULT_PROJECT_NAME;

const DEFAULT_LINK: &str = "";

type Link = Arc<Mutex<RetryingDispatcher>>;

struct CachedDiscovery {
    at: Instant,
    instances: Vec<InstanceRecord>,
}

struct PoolInner {
    config: Arc<BridgeConfig>,
    resolver: PortResolver,
    links: Mutex<HashMap<String, Link>>,
    cache: Mutex<Option<CachedDiscovery>>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionPool {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        let resolver = PortResolver::from_config(&config);
        Self::with_resolver(config, resolver)
    }

    pub fn with_resolver(config: Arc<BridgeConfig>, resolver: PortResolver) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                resolver,
                links: Mutex::new(HashMap::new()),
                cache: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Arc<BridgeConfig> {
        &self.inner.config
    }

    pub fn discover_all_instances(&self, force_refresh: bool) -> Vec<InstanceRecord> {
        let ttl = self.inner.config.discovery_cache_ttl;
        if !force_refresh {
            if let Some(cached) = lock(&self.inner.cache).as_ref() {
                if cached.at.elapsed() < ttl {
                    return cached.instances.clone();
                }
            }
        }

        let registry = self.inner.resolver.registry();
        let probe = self.inner.resolver.probe();
        let mut seen = HashSet::new();
        let mut instances = Vec::new();
        for entry in registry.instances() {
            let (Some(hash), Some(port)) = (entry.hash.clone(), entry.file.port()) else {
                continue;
            };
            if !seen.insert(hash.clone()) {
                continue;
            }
            if !probe.is_alive(port) {
                debug!(event = "instance_not_alive", hash = %hash, port);
                continue;
            }
            let name = entry
                .file
                .display_name()
                .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string());
            let mut record = InstanceRecord::new(&name, &hash, Some(port));
            record.last_seen = DateTime::<Utc>::from(entry.modified);
            instances.push(record);
        }
        info!(event = "instances_discovered", count = instances.len());

        *lock(&self.inner.cache) = Some(CachedDiscovery {
            at: Instant::now(),
            instances: instances.clone(),
        });
        instances
    }

    pub fn get_default(&self) -> Link {
        if let Some(link) = lock(&self.inner.links).get(DEFAULT_LINK) {
            return link.clone();
        }
        let port = self.inner.resolver.discover();
        self.insert_link(DEFAULT_LINK, port, None)
    }

    pub fn get(&self, instance: &str) -> Result<Link, ResolveError> {
        let record = match self.find(instance, false) {
            Some(record) => record,
            None => self
                .find(instance, true)
                .ok_or_else(|| ResolveError::NotFound(instance.to_string()))?,
        };

        let key = record.key.to_string();
        if let Some(link) = lock(&self.inner.links).get(&key) {
            return Ok(link.clone());
        }
        let port = record
            .port
            .unwrap_or_else(|| self.inner.resolver.discover_for(&record.hash));
        Ok(self.insert_link(&key, port, Some(record.hash)))
    }

    // Discovery runs before this, outside the links lock. A link created by
    // a racing caller in the meantime wins.
    fn insert_link(&self, key: &str, port: u16, hash: Option<String>) -> Link {
        let mut links = lock(&self.inner.links);
        links
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(event = "pool_link_created", instance = %key, port);
                Arc::new(Mutex::new(RetryingDispatcher::new(
                    self.inner.config.clone(),
                    self.inner.resolver.clone(),
                    port,
                    hash,
                )))
            })
            .clone()
    }

    fn find(&self, instance: &str, force_refresh: bool) -> Option<InstanceRecord> {
        self.discover_all_instances(force_refresh)
            .into_iter()
            .find(|record| record.key.as_str() == instance || record.hash == instance)
    }

    pub fn send_command(
        &self,
        instance: Option<&str>,
        command: &str,
        params: Value,
        policy: ReloadPolicy,
    ) -> Result<Value, DispatchError> {
        let link = match instance.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => self.get(name)?,
            None => self.get_default(),
        };
        let mut dispatcher = lock(&*link);
        dispatcher.send_command_with_retry(command, params, policy)
    }
}

#[async_trait]
impl InstanceDirectory for ConnectionPool {
    async fn instances(&self) -> Result<Vec<InstanceRecord>, ResolveError> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.discover_all_instances(false))
            .await
            .map_err(|err| ResolveError::Discovery(err.to_string()))
    }
}
