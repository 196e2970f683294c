use crate::{
    error::HubError,
    hub::{PluginHub, SessionInfo},
};
use serde_json::Value;
use std::{
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tokio::{runtime::Handle, sync::oneshot};
use tracing::warn;

#[derive(Clone)]
pub struct HubHandle {
    hub: Arc<PluginHub>,
    runtime: Handle,
}

// spawn_blocking threads carry a runtime handle but may park; only async
// workers make tokio refuse a blocking receive.
fn on_async_worker() -> bool {
    if Handle::try_current().is_err() {
        return false;
    }
    let (tx, rx) = oneshot::channel::<()>();
    drop(tx);
    panic::catch_unwind(AssertUnwindSafe(move || {
        let _ = rx.blocking_recv();
    }))
    .is_err()
}

impl HubHandle {
    pub fn new(hub: Arc<PluginHub>, runtime: Handle) -> Self {
        Self { hub, runtime }
    }

    pub fn current(hub: Arc<PluginHub>) -> Self {
        Self::new(hub, Handle::current())
    }

    pub fn hub(&self) -> &Arc<PluginHub> {
        &self.hub
    }

    pub fn run_blocking<F, T>(&self, fut: F) -> Result<T, HubError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if on_async_worker() {
            warn!(event = "hub_blocking_call_rejected");
            return Err(HubError::SameRuntime);
        }
        let (tx, rx) = oneshot::channel();
        self.runtime.spawn(async move {
            let _ = tx.send(fut.await);
        });
        rx.blocking_recv().map_err(|_| HubError::RuntimeGone)
    }

    pub fn send_command_blocking(
        &self,
        instance: Option<&str>,
        name: &str,
        params: Value,
    ) -> Result<Value, HubError> {
        let hub = self.hub.clone();
        let instance = instance.map(str::to_string);
        let name = name.to_string();
        self.run_blocking(async move {
            hub.send_command_for_instance(instance.as_deref(), &name, params)
                .await
        })?
    }

    pub fn sessions_blocking(&self) -> Result<Vec<SessionInfo>, HubError> {
        let hub = self.hub.clone();
        self.run_blocking(async move { hub.sessions() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::HubConfig,
        hub::Registration,
    };
    use axum::extract::ws::Message;
    use serde_json::json;
    use tokio::sync::mpsc;
    use umb_core::wire::HubMessage;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_call_inside_runtime_fails_fast() {
        let handle = HubHandle::current(Arc::new(PluginHub::new(HubConfig::default())));
        let err = handle
            .send_command_blocking(None, "ping", json!({}))
            .expect_err("same runtime");
        assert!(matches!(err, HubError::SameRuntime));
    }

    fn hub_with_echo_plugin() -> (Arc<PluginHub>, tokio::task::JoinHandle<()>) {
        let hub = Arc::new(PluginHub::new(HubConfig::default()));
        let (tx, mut rx) = mpsc::channel::<Message>(8);
        hub.register_session(
            "conn-1",
            tx,
            Registration {
                session_id: "s1".to_string(),
                project_name: "Demo".to_string(),
                project_hash: "abc123".to_string(),
                unity_version: "6000.0".to_string(),
            },
        );

        let plugin = tokio::spawn({
            let hub = hub.clone();
            async move {
                let Some(Message::Text(text)) = rx.recv().await else {
                    panic!("expected execute")
                };
                let HubMessage::Execute { id, name, .. } =
                    serde_json::from_str::<HubMessage>(&text).expect("execute")
                else {
                    panic!("expected execute")
                };
                hub.complete(&id, json!({"ran": name}));
            }
        });
        (hub, plugin)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_call_from_plain_thread_round_trips() {
        let (hub, plugin) = hub_with_echo_plugin();
        let handle = HubHandle::current(hub);
        let (done_tx, done_rx) = oneshot::channel();
        std::thread::spawn(move || {
            let sessions = handle.sessions_blocking();
            let result = handle.send_command_blocking(Some("abc123"), "manage_editor", json!({}));
            let _ = done_tx.send((sessions, result));
        });

        let (sessions, result) = done_rx.await.expect("thread result");
        assert_eq!(sessions.expect("sessions").len(), 1);
        assert_eq!(result.expect("result"), json!({"ran": "manage_editor"}));
        plugin.await.expect("plugin");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_call_from_spawn_blocking_round_trips() {
        let (hub, plugin) = hub_with_echo_plugin();
        let handle = HubHandle::current(hub);
        let result = tokio::task::spawn_blocking(move || {
            handle.send_command_blocking(Some("abc123"), "manage_scene", json!({}))
        })
        .await
        .expect("join");
        assert_eq!(result.expect("result"), json!({"ran": "manage_scene"}));
        plugin.await.expect("plugin");
    }

    #[test]
    fn worker_detection_distinguishes_threads() {
        assert!(!on_async_worker());
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("runtime");
        assert!(runtime.block_on(async { on_async_worker() }));
        let from_pool = runtime
            .block_on(async { tokio::task::spawn_blocking(on_async_worker).await })
            .expect("join");
        assert!(!from_pool);
    }
}
