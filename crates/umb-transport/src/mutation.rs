use crate::dispatch::DispatchError;
use serde_json::Value;
use std::{
    fmt::Display,
    future::Future,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use umb_core::{reload, CommandOutcome};

pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub async fn wait_for_ready<F, Fut, E>(mut fetch_state: F, timeout: Duration) -> (bool, Duration)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, E>>,
    E: Display,
{
    let started = Instant::now();
    loop {
        match fetch_state().await {
            Ok(state) if reload::editor_ready(&state) => return (true, started.elapsed()),
            Ok(_) => {}
            Err(err) => debug!(event = "editor_state_unavailable", error = %err),
        }
        if started.elapsed() + READY_POLL_INTERVAL > timeout {
            warn!(
                event = "editor_ready_timeout",
                waited_ms = started.elapsed().as_millis() as u64
            );
            return (false, started.elapsed());
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

fn lost_after_send(response: &Result<Value, DispatchError>) -> bool {
    match response {
        Ok(value) => reload::is_connection_lost_after_send(value),
        Err(err) => err.outcome() == CommandOutcome::Uncertain,
    }
}

pub async fn send_mutation<S, SF, R, RF, E, V, VF>(
    mut send: S,
    mut fetch_state: R,
    verify: Option<V>,
    ready_timeout: Duration,
) -> Result<Value, DispatchError>
where
    S: FnMut() -> SF,
    SF: Future<Output = Result<Value, DispatchError>>,
    R: FnMut() -> RF,
    RF: Future<Output = Result<Value, E>>,
    E: Display,
    V: FnOnce() -> VF,
    VF: Future<Output = Option<Value>>,
{
    let mut response = send().await;

    if matches!(&response, Ok(value) if reload::is_reloading_rejection(value)) {
        info!(event = "mutation_rejected_reloading");
        wait_for_ready(&mut fetch_state, ready_timeout).await;
        response = send().await;
    }

    if lost_after_send(&response) {
        if let Some(verify) = verify {
            info!(event = "mutation_verify_after_disconnect");
            wait_for_ready(&mut fetch_state, ready_timeout).await;
            if let Some(verified) = verify().await {
                response = Ok(verified);
            }
        }
    }

    let (ready, waited) = wait_for_ready(&mut fetch_state, ready_timeout).await;
    debug!(event = "mutation_settled", ready, waited_ms = waited.as_millis() as u64);
    response
}
