use crate::{
    config::{HubConfig, PendingPolicy},
    error::HubError,
};
use axum::extract::ws::{CloseFrame, Message};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use umb_core::{instance::InstanceKey, wire::HubMessage, InstanceRecord};
use uuid::Uuid;

pub const DEFAULT_PROJECT_NAME: &str = "Unknown Project";
pub const DEFAULT_UNITY_VERSION: &str = "Unknown";
pub const CLOSE_INVALID_REGISTRATION: u16 = 4400;
const CLOSE_STALE: u16 = 1008;
const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub session_id: String,
    pub project_name: String,
    pub project_hash: String,
    pub unity_version: String,
}

impl Registration {
    pub fn from_message(message: &HubMessage) -> Option<Self> {
        let HubMessage::Register {
            session_id,
            project_name,
            project_hash,
            unity_version,
        } = message
        else {
            return None;
        };
        let session_id = non_blank(session_id.as_deref())?;
        let project_hash = non_blank(project_hash.as_deref())?;
        Some(Self {
            session_id,
            project_hash,
            project_name: non_blank(project_name.as_deref())
                .unwrap_or_else(|| DEFAULT_PROJECT_NAME.to_string()),
            unity_version: non_blank(unity_version.as_deref())
                .unwrap_or_else(|| DEFAULT_UNITY_VERSION.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub project: String,
    pub hash: String,
    pub unity_version: String,
    pub connected_at: String,
}

enum PendingResult {
    Completed(Value),
    Disconnected,
}

struct PendingCommand {
    session_id: String,
    issued_at: Instant,
    tx: oneshot::Sender<PendingResult>,
}

struct Channel {
    conn_id: String,
    sender: mpsc::Sender<Message>,
}

struct Session {
    record: InstanceRecord,
    unity_version: String,
    seq: u64,
}

#[derive(Default)]
struct HubTables {
    channels: HashMap<String, Channel>,
    sessions: HashMap<String, Session>,
    pending: HashMap<String, PendingCommand>,
}

impl HubTables {
    fn ordered_sessions(&self) -> Vec<(&String, &Session)> {
        let mut sessions = self.sessions.iter().collect::<Vec<_>>();
        sessions.sort_by_key(|(_, session)| session.seq);
        sessions
    }

    // Drops the session and its channel. Under `Fail` its pending commands
    // are handed back for the caller to resolve outside the lock.
    fn unbind(&mut self, session_id: &str, policy: PendingPolicy) -> Vec<PendingCommand> {
        self.channels.remove(session_id);
        self.sessions.remove(session_id);
        match policy {
            PendingPolicy::Fail => {
                let ids = self
                    .pending
                    .iter()
                    .filter(|(_, pending)| pending.session_id == session_id)
                    .map(|(id, _)| id.clone())
                    .collect::<Vec<_>>();
                ids.into_iter()
                    .filter_map(|id| self.pending.remove(&id))
                    .collect()
            }
            PendingPolicy::Timeout => Vec::new(),
        }
    }
}

struct PendingGuard<'a> {
    hub: &'a PluginHub,
    command_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.hub.tables().pending.remove(&self.command_id);
    }
}

/// Every table lives behind one lock that is only held for map mutations,
/// never across an await.
pub struct PluginHub {
    config: HubConfig,
    conn_counter: AtomicU64,
    session_seq: AtomicU64,
    closed: AtomicBool,
    tables: Mutex<HubTables>,
}

impl PluginHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            session_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            tables: Mutex::new(HubTables::default()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn tables(&self) -> MutexGuard<'_, HubTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn welcome(&self) -> HubMessage {
        HubMessage::Welcome {
            server_timeout: self.config.server_timeout.as_secs(),
            keep_alive_interval: self.config.keep_alive_interval.as_secs(),
        }
    }

    pub fn register_session(
        &self,
        conn_id: &str,
        sender: mpsc::Sender<Message>,
        registration: Registration,
    ) -> InstanceRecord {
        let mut tables = self.tables();
        let replaced = tables
            .channels
            .iter()
            .filter(|(session_id, channel)| {
                channel.conn_id == conn_id && **session_id != registration.session_id
            })
            .map(|(session_id, _)| session_id.clone())
            .collect::<Vec<_>>();
        let mut orphaned = Vec::new();
        for session_id in &replaced {
            orphaned.extend(tables.unbind(session_id, self.config.pending_on_disconnect));
        }
        let seq = tables
            .sessions
            .get(&registration.session_id)
            .map(|session| session.seq)
            .unwrap_or_else(|| self.session_seq.fetch_add(1, Ordering::SeqCst));
        let record = InstanceRecord::new(
            &registration.project_name,
            &registration.project_hash,
            None,
        );
        tables.sessions.insert(
            registration.session_id.clone(),
            Session {
                record: record.clone(),
                unity_version: registration.unity_version.clone(),
                seq,
            },
        );
        let previous = tables.channels.insert(
            registration.session_id.clone(),
            Channel {
                conn_id: conn_id.to_string(),
                sender,
            },
        );
        drop(tables);

        for pending in orphaned {
            let _ = pending.tx.send(PendingResult::Disconnected);
        }
        for session_id in replaced {
            info!(
                event = "hub_session_replaced",
                conn_id = %conn_id,
                old_session_id = %session_id,
                session_id = %registration.session_id
            );
        }
        if let Some(previous) = previous.filter(|channel| channel.conn_id != conn_id) {
            info!(
                event = "hub_session_rebound",
                session_id = %registration.session_id,
                old_conn_id = %previous.conn_id,
                conn_id = %conn_id
            );
        }
        info!(
            event = "hub_session_registered",
            conn_id = %conn_id,
            session_id = %registration.session_id,
            project = %registration.project_name,
            hash = %registration.project_hash,
            unity_version = %registration.unity_version
        );
        record
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.tables().sessions.get_mut(session_id) {
            session.record.touch();
        }
    }

    pub fn handle_disconnect(&self, conn_id: &str) -> Option<String> {
        let mut tables = self.tables();
        let session_id = tables
            .channels
            .iter()
            .find(|(_, channel)| channel.conn_id == conn_id)
            .map(|(session_id, _)| session_id.clone())?;
        let orphaned = tables.unbind(&session_id, self.config.pending_on_disconnect);
        drop(tables);

        let failed = orphaned.len();
        for pending in orphaned {
            let _ = pending.tx.send(PendingResult::Disconnected);
        }
        info!(
            event = "hub_session_disconnected",
            conn_id = %conn_id,
            session_id = %session_id,
            failed_pending = failed
        );
        Some(session_id)
    }

    pub fn complete(&self, command_id: &str, result: Value) -> bool {
        let pending = self.tables().pending.remove(command_id);
        match pending {
            Some(pending) => {
                debug!(
                    event = "hub_command_completed",
                    command_id = %command_id,
                    session_id = %pending.session_id,
                    elapsed_ms = pending.issued_at.elapsed().as_millis() as u64
                );
                pending.tx.send(PendingResult::Completed(result)).is_ok()
            }
            None => {
                warn!(event = "hub_result_unmatched", command_id = %command_id);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut tables = self.tables();
        let channels = tables.channels.drain().collect::<Vec<_>>();
        tables.sessions.clear();
        let pending = tables.pending.drain().map(|(_, pending)| pending).collect::<Vec<_>>();
        drop(tables);

        for (_, channel) in &channels {
            let _ = channel.sender.try_send(Message::Close(Some(CloseFrame {
                code: CLOSE_GOING_AWAY,
                reason: "hub shutting down".into(),
            })));
        }
        let failed = pending.len();
        for pending in pending {
            let _ = pending.tx.send(PendingResult::Disconnected);
        }
        info!(event = "hub_shutdown", sessions = channels.len(), failed_pending = failed);
        channels.len()
    }

    pub fn pending_count(&self) -> usize {
        self.tables().pending.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.tables()
            .ordered_sessions()
            .into_iter()
            .map(|(session_id, session)| SessionInfo {
                session_id: session_id.clone(),
                project: session.record.display_name.clone(),
                hash: session.record.hash.clone(),
                unity_version: session.unity_version.clone(),
                connected_at: session.record.connected_at.to_rfc3339(),
            })
            .collect()
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.tables()
            .ordered_sessions()
            .into_iter()
            .map(|(_, session)| session.record.clone())
            .collect()
    }

    pub fn resolve_session_id(&self, instance: Option<&str>) -> Result<String, HubError> {
        let tables = self.tables();
        let sessions = tables.ordered_sessions();
        match instance.map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => {
                let hash = InstanceKey::parse(raw)
                    .map(|key| key.hash().to_string())
                    .unwrap_or_else(|| raw.to_string());
                sessions
                    .into_iter()
                    .find(|(_, session)| session.record.hash == hash)
                    .map(|(session_id, _)| session_id.clone())
                    .ok_or_else(|| HubError::UnknownInstance(raw.to_string()))
            }
            None => sessions
                .first()
                .map(|(session_id, _)| (*session_id).clone())
                .ok_or(HubError::NoSessions),
        }
    }

    pub async fn send_command_for_instance(
        &self,
        instance: Option<&str>,
        name: &str,
        params: Value,
    ) -> Result<Value, HubError> {
        let session_id = self.resolve_session_id(instance)?;
        self.send_command(&session_id, name, params).await
    }

    pub async fn send_command(
        &self,
        session_id: &str,
        name: &str,
        params: Value,
    ) -> Result<Value, HubError> {
        let command_id = Uuid::new_v4().to_string();
        self.dispatch(session_id, command_id, name, params).await
    }

    async fn dispatch(
        &self,
        session_id: &str,
        command_id: String,
        name: &str,
        params: Value,
    ) -> Result<Value, HubError> {
        let (tx, rx) = oneshot::channel();
        let sender = {
            let mut tables = self.tables();
            let sender = tables
                .channels
                .get(session_id)
                .map(|channel| channel.sender.clone())
                .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
            if tables.pending.contains_key(&command_id) {
                error!(
                    event = "hub_duplicate_command_id",
                    command_id = %command_id,
                    session_id = %session_id
                );
                return Err(HubError::DuplicateCommandId(command_id));
            }
            tables.pending.insert(
                command_id.clone(),
                PendingCommand {
                    session_id: session_id.to_string(),
                    issued_at: Instant::now(),
                    tx,
                },
            );
            sender
        };
        let _guard = PendingGuard {
            hub: self,
            command_id: command_id.clone(),
        };

        let timeout = self.config.command_timeout;
        let execute = HubMessage::Execute {
            id: command_id.clone(),
            name: name.to_string(),
            params,
            timeout: timeout.as_secs(),
        };
        let text = serde_json::to_string(&execute)?;
        if sender.send(Message::Text(text)).await.is_err() {
            return Err(HubError::SendFailed(session_id.to_string()));
        }
        debug!(
            event = "hub_command_sent",
            command_id = %command_id,
            session_id = %session_id,
            name = %name
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(PendingResult::Completed(value))) => Ok(value),
            Ok(Ok(PendingResult::Disconnected)) | Ok(Err(_)) => {
                Err(HubError::SessionDisconnected(session_id.to_string()))
            }
            Err(_) => {
                warn!(
                    event = "hub_command_timeout",
                    command_id = %command_id,
                    session_id = %session_id,
                    name = %name
                );
                Err(HubError::Timeout {
                    name: name.to_string(),
                    timeout,
                })
            }
        }
    }

    pub fn start_keep_alive(
        self: Arc<Self>,
        conn_id: String,
        sender: mpsc::Sender<Message>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.config.keep_alive_interval;
        if interval.is_zero() {
            return None;
        }
        let ping = serde_json::to_string(&HubMessage::Ping).ok()?;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.send(Message::Text(ping.clone())).await.is_err() {
                    debug!(event = "hub_keep_alive_stopped", conn_id = %conn_id);
                    return;
                }
            }
        }))
    }

    pub fn start_reaper(self: Arc<Self>) {
        let stale_after = self.config.server_timeout;
        if stale_after.is_zero() {
            return;
        }
        let interval = (stale_after / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if self.is_closed() {
                    return;
                }
                for (conn_id, sender) in self.stale_channels(stale_after) {
                    warn!(event = "hub_session_stale", conn_id = %conn_id);
                    let _ = sender.try_send(Message::Close(Some(CloseFrame {
                        code: CLOSE_STALE,
                        reason: "stale".into(),
                    })));
                    self.handle_disconnect(&conn_id);
                }
            }
        });
    }

    fn stale_channels(&self, stale_after: Duration) -> Vec<(String, mpsc::Sender<Message>)> {
        let now = Utc::now();
        let tables = self.tables();
        tables
            .sessions
            .iter()
            .filter(|(_, session)| {
                (now - session.record.last_seen).to_std().unwrap_or_default() > stale_after
            })
            .filter_map(|(session_id, _)| tables.channels.get(session_id))
            .map(|channel| (channel.conn_id.clone(), channel.sender.clone()))
            .collect()
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
