pub mod connection;
pub mod dispatch;
pub mod mutation;
pub mod pool;
pub mod port;
pub mod probe;
pub mod resolver;

pub use dispatch::{DispatchError, ReloadPolicy, RetryingDispatcher};
pub use pool::ConnectionPool;
pub use resolver::{InstanceDirectory, InstanceResolver, ResolveError};

use serde_json::{json, Map, Value};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use umb_core::{reload, BridgeConfig, InstanceKey, TransportMode};
use umb_hub::{HubError, PluginHub};

pub const EDITOR_STATE_COMMAND: &str = "get_editor_state";

pub struct Bridge {
    config: Arc<BridgeConfig>,
    pool: ConnectionPool,
    hub: Option<Arc<PluginHub>>,
    resolver: InstanceResolver,
}

impl Bridge {
    pub fn new(config: BridgeConfig, hub: Option<Arc<PluginHub>>) -> Self {
        let config = Arc::new(config);
        let pool = ConnectionPool::new(config.clone());
        let directory: Arc<dyn InstanceDirectory> = match (config.transport_mode, &hub) {
            (TransportMode::Http, Some(hub)) => hub.clone() as Arc<dyn InstanceDirectory>,
            _ => Arc::new(pool.clone()),
        };
        let resolver = InstanceResolver::new(directory, config.allows_port_descriptors());
        info!(
            event = "bridge_start",
            transport = %config.transport_mode,
            hub = hub.is_some()
        );
        Self {
            config,
            pool,
            hub,
            resolver,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn resolver(&self) -> &InstanceResolver {
        &self.resolver
    }

    pub async fn set_active_instance(
        &self,
        session: &str,
        descriptor: &str,
    ) -> Result<InstanceKey, DispatchError> {
        Ok(self.resolver.set_active_instance(session, descriptor).await?)
    }

    pub fn active_instance(&self, session: &str) -> Option<InstanceKey> {
        self.resolver.active_instance(session)
    }

    pub fn clear_active_instance(&self, session: &str) -> Option<InstanceKey> {
        self.resolver.clear_active_instance(session)
    }

    pub async fn resolve_instance(
        &self,
        session: &str,
        descriptor: Option<&str>,
    ) -> Result<InstanceKey, DispatchError> {
        Ok(self.resolver.resolve_for_call(session, descriptor).await?)
    }

    pub async fn dispatch(
        &self,
        instance: Option<&str>,
        command: &str,
        params: Value,
    ) -> Result<Value, DispatchError> {
        self.dispatch_with(instance, command, params, ReloadPolicy::from_config(&self.config))
            .await
    }

    pub async fn dispatch_with(
        &self,
        instance: Option<&str>,
        command: &str,
        params: Value,
        policy: ReloadPolicy,
    ) -> Result<Value, DispatchError> {
        if command.trim().is_empty() {
            return Err(DispatchError::InvalidCommand);
        }
        match self.config.transport_mode {
            TransportMode::Stdio => {
                let pool = self.pool.clone();
                let instance = instance.map(str::to_string);
                let command = command.to_string();
                tokio::task::spawn_blocking(move || {
                    pool.send_command(instance.as_deref(), &command, params, policy)
                })
                .await
                .map_err(|err| DispatchError::Worker(err.to_string()))?
            }
            TransportMode::Http => self.dispatch_via_hub(instance, command, params, policy).await,
        }
    }

    async fn dispatch_via_hub(
        &self,
        instance: Option<&str>,
        command: &str,
        params: Value,
        policy: ReloadPolicy,
    ) -> Result<Value, DispatchError> {
        let hub = self.hub.as_ref().ok_or(HubError::NoSessions)?;
        let mut response = hub
            .send_command_for_instance(instance, command, params.clone())
            .await?;
        if !policy.retry_on_reload {
            return Ok(response);
        }
        let mut retries = 0u32;
        while reload::is_reloading_response(&response) {
            if retries >= policy.max_retries {
                warn!(event = "hub_reload_retries_exhausted", command = %command, retries);
                return Err(DispatchError::ReloadTimeout {
                    retries,
                    last: response,
                });
            }
            let delay_ms = reload::retry_after_ms(&response).unwrap_or(policy.retry_ms);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            retries += 1;
            response = hub
                .send_command_for_instance(instance, command, params.clone())
                .await?;
        }
        Ok(response)
    }

    pub async fn call_tool(
        &self,
        session: &str,
        command: &str,
        args: &mut Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        let descriptor = resolver::take_instance_argument(args);
        let key = self
            .resolver
            .resolve_for_call(session, descriptor.as_deref())
            .await?;
        self.dispatch(Some(key.as_str()), command, Value::Object(args.clone()))
            .await
    }

    pub async fn wait_for_ready(&self, instance: Option<&str>, timeout: Duration) -> (bool, Duration) {
        mutation::wait_for_ready(|| self.editor_state(instance), timeout).await
    }

    async fn editor_state(&self, instance: Option<&str>) -> Result<Value, DispatchError> {
        let policy = ReloadPolicy::from_config(&self.config).without_reload_retry();
        self.dispatch_with(instance, EDITOR_STATE_COMMAND, json!({}), policy)
            .await
    }

    pub async fn send_mutation<V, VF>(
        &self,
        instance: Option<&str>,
        command: &str,
        params: Value,
        verify: Option<V>,
        ready_timeout: Duration,
    ) -> Result<Value, DispatchError>
    where
        V: FnOnce() -> VF,
        VF: std::future::Future<Output = Option<Value>>,
    {
        let policy = ReloadPolicy::from_config(&self.config).without_reload_retry();
        mutation::send_mutation(
            || self.dispatch_with(instance, command, params.clone(), policy),
            || self.editor_state(instance),
            verify,
            ready_timeout,
        )
        .await
    }
}
