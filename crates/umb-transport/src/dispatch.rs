use crate::{
    connection::{ConnectionError, FramedConnection},
    port::PortResolver,
    resolver::ResolveError,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{sync::Arc, thread, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use umb_core::{
    codec,
    reload,
    wire::{CommandRequest, ResponseEnvelope, PING_COMMAND},
    BridgeConfig, CommandOutcome,
};
use umb_hub::HubError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("MCP call missing command_type")]
    InvalidCommand,
    #[error("could not encode command: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("command payload is {size} bytes, over the {max} byte frame limit")]
    PayloadTooLarge { size: u64, max: u64 },
    #[error("{message}")]
    Unity { message: String },
    #[error("Unity communication failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        maybe_executed: bool,
        #[source]
        source: ConnectionError,
    },
    #[error("Unity still reloading after {retries} retries")]
    ReloadTimeout { retries: u32, last: Value },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error("dispatch worker failed: {0}")]
    Worker(String),
}

impl DispatchError {
    pub fn outcome(&self) -> CommandOutcome {
        match self {
            DispatchError::InvalidCommand
            | DispatchError::Encode(_)
            | DispatchError::PayloadTooLarge { .. }
            | DispatchError::ReloadTimeout { .. } => CommandOutcome::NotExecuted,
            DispatchError::Resolve(err) => err.outcome(),
            DispatchError::Unity { .. } => CommandOutcome::Failed,
            DispatchError::Exhausted { maybe_executed, .. } => {
                if *maybe_executed {
                    CommandOutcome::Uncertain
                } else {
                    CommandOutcome::NotExecuted
                }
            }
            DispatchError::Hub(err) => err.outcome(),
            DispatchError::Worker(_) => CommandOutcome::Uncertain,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    FastTransient,
    Reloading,
    Other,
}

impl FailureClass {
    pub fn backoff_cap(self) -> Duration {
        match self {
            FailureClass::FastTransient => Duration::from_millis(250),
            FailureClass::Reloading => Duration::from_millis(800),
            FailureClass::Other => Duration::from_secs(3),
        }
    }
}

/// `min(cap, jitter * 2^attempt)` seconds.
pub fn backoff_delay(attempt: u32, cap: Duration, jitter: f64) -> Duration {
    let exp = 2f64.powi(attempt.min(16) as i32);
    let secs = (jitter * exp).max(0.0);
    Duration::from_secs_f64(secs).min(cap)
}

fn jitter() -> f64 {
    rand::rng().random_range(0.1..0.3)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadPolicy {
    pub retry_on_reload: bool,
    pub max_retries: u32,
    pub retry_ms: u64,
}

impl ReloadPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            retry_on_reload: true,
            max_retries: config.reload_max_retries,
            retry_ms: config.reload_retry_ms,
        }
    }

    pub fn without_reload_retry(self) -> Self {
        Self {
            retry_on_reload: false,
            ..self
        }
    }
}

enum AttemptError {
    Transport(ConnectionError),
    Host(String),
}

impl From<ConnectionError> for AttemptError {
    fn from(err: ConnectionError) -> Self {
        AttemptError::Transport(err)
    }
}

pub struct RetryingDispatcher {
    config: Arc<BridgeConfig>,
    resolver: PortResolver,
    conn: FramedConnection,
    instance_hash: Option<String>,
}

impl RetryingDispatcher {
    pub fn new(
        config: Arc<BridgeConfig>,
        resolver: PortResolver,
        port: u16,
        instance_hash: Option<String>,
    ) -> Self {
        let conn = FramedConnection::new(
            config.host.clone(),
            port,
            config.connect_timeout,
            config.io_timeout,
        );
        Self {
            config,
            resolver,
            conn,
            instance_hash,
        }
    }

    pub fn port(&self) -> u16 {
        self.conn.port()
    }

    pub fn instance_hash(&self) -> Option<&str> {
        self.instance_hash.as_deref()
    }

    pub fn connection(&self) -> &FramedConnection {
        &self.conn
    }

    pub fn send_command(&mut self, command: &str, params: Value) -> Result<Value, DispatchError> {
        if command.trim().is_empty() {
            return Err(DispatchError::InvalidCommand);
        }
        if params.is_null() {
            return Ok(json!({
                "success": false,
                "error": "MCP call received with no parameters (client placeholder?)",
            }));
        }
        if self.status_reports_reloading() {
            info!(event = "unity_reload_preflight", command = %command);
            return Ok(reload::reloading_hint(self.config.reload_retry_ms));
        }

        let payload = if command == PING_COMMAND {
            codec::PING_LITERAL.to_vec()
        } else {
            CommandRequest::new(command, params)
                .to_bytes()
                .map_err(DispatchError::Encode)?
        };
        let size = payload.len() as u64;
        if size > codec::MAX_FRAME_BYTES {
            error!(event = "unity_payload_too_large", command = %command, size);
            return Err(DispatchError::PayloadTooLarge {
                size,
                max: codec::MAX_FRAME_BYTES,
            });
        }

        let attempts = self.config.attempts();
        let mut maybe_executed = false;
        let mut attempt = 0u32;
        loop {
            let err = match self.attempt(command, &payload, attempt > 0) {
                Ok(value) => return Ok(value),
                Err(AttemptError::Host(message)) => return Err(DispatchError::Unity { message }),
                Err(AttemptError::Transport(err)) => err,
            };
            warn!(
                event = "unity_attempt_failed",
                command = %command,
                attempt = attempt + 1,
                error = %err
            );
            maybe_executed |= err.outcome() == CommandOutcome::Uncertain;
            self.conn.disconnect();
            self.rediscover();

            if attempt >= attempts {
                error!(event = "unity_attempts_exhausted", command = %command, attempts = attempt + 1);
                return Err(DispatchError::Exhausted {
                    attempts: attempt + 1,
                    maybe_executed,
                    source: err,
                });
            }
            let class = self.classify(&err);
            let delay = backoff_delay(attempt, class.backoff_cap(), jitter());
            debug!(
                event = "unity_backoff",
                class = ?class,
                delay_ms = delay.as_millis() as u64
            );
            thread::sleep(delay);
            attempt += 1;
        }
    }

    pub fn send_command_with_retry(
        &mut self,
        command: &str,
        params: Value,
        policy: ReloadPolicy,
    ) -> Result<Value, DispatchError> {
        let mut response = self.send_command(command, params.clone())?;
        if !policy.retry_on_reload {
            return Ok(response);
        }
        let mut retries = 0u32;
        while reload::is_reloading_response(&response) {
            if retries >= policy.max_retries {
                warn!(event = "unity_reload_retries_exhausted", command = %command, retries);
                return Err(DispatchError::ReloadTimeout {
                    retries,
                    last: response,
                });
            }
            let delay_ms = reload::retry_after_ms(&response).unwrap_or(policy.retry_ms);
            thread::sleep(Duration::from_millis(delay_ms));
            retries += 1;
            response = self.send_command(command, params.clone())?;
        }
        Ok(response)
    }

    fn attempt(&mut self, command: &str, payload: &[u8], retrying: bool) -> Result<Value, AttemptError> {
        self.conn.connect()?;
        if retrying {
            let _ = self.conn.set_receive_timeout(self.config.retry_io_timeout);
        }
        let raw = self.conn.round_trip(payload)?;
        if retrying {
            let _ = self.conn.restore_receive_timeout();
        }

        let value: Value = serde_json::from_slice(&raw).map_err(ConnectionError::from)?;
        let envelope = ResponseEnvelope::deserialize(&value).map_err(ConnectionError::from)?;
        if command == PING_COMMAND {
            if envelope.is_pong() {
                return Ok(json!({"message": "pong"}));
            }
            return Err(ConnectionError::UnexpectedReply("ping unsuccessful".to_string()).into());
        }
        if envelope.is_error() {
            return Err(AttemptError::Host(envelope.error_message()));
        }
        Ok(value.get("result").cloned().unwrap_or_else(|| json!({})))
    }

    fn status_reports_reloading(&self) -> bool {
        let registry = self.resolver.registry();
        let status = match self.instance_hash.as_deref() {
            Some(hash) => registry.status_for(hash),
            None => registry.latest_status(),
        };
        status.is_some_and(|status| status.reports_reloading(self.config.status_stale_after))
    }

    fn classify(&self, err: &ConnectionError) -> FailureClass {
        if self.status_reports_reloading() {
            FailureClass::Reloading
        } else if err.is_fast_transient() {
            FailureClass::FastTransient
        } else {
            FailureClass::Other
        }
    }

    fn rediscover(&mut self) {
        let port = match self.instance_hash.as_deref() {
            Some(hash) => self.resolver.discover_for(hash),
            None => self.resolver.discover(),
        };
        self.conn.set_port(port);
    }
}
