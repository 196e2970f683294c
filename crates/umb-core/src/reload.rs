use serde_json::{json, Value};

pub const REAL_BLOCKING_REASONS: [&str; 4] =
    ["compiling", "domain_reload", "running_tests", "asset_import"];

pub const RELOADING_STATE: &str = "reloading";

pub fn reloading_hint(retry_after_ms: u64) -> Value {
    json!({
        "success": false,
        "state": RELOADING_STATE,
        "retry_after_ms": retry_after_ms,
        "error": "Unity domain reload in progress",
        "message": "Unity is reloading scripts; please retry shortly",
    })
}

pub fn is_reloading_response(resp: &Value) -> bool {
    let Some(obj) = resp.as_object() else {
        return false;
    };
    if obj.get("state").and_then(Value::as_str) == Some(RELOADING_STATE) {
        return true;
    }
    let text = obj
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| obj.get("error").and_then(Value::as_str))
        .unwrap_or_default();
    text.to_lowercase().contains("reload")
}

pub fn retry_after_ms(resp: &Value) -> Option<u64> {
    resp.get("retry_after_ms").and_then(Value::as_u64)
}

pub fn is_reloading_rejection(resp: &Value) -> bool {
    let Some(obj) = resp.as_object() else {
        return false;
    };
    if is_truthy(obj.get("success")) {
        return false;
    }
    let reason = obj
        .get("data")
        .and_then(|data| data.get("reason"))
        .and_then(Value::as_str);
    reason == Some(RELOADING_STATE) && obj.get("hint").and_then(Value::as_str) == Some("retry")
}

pub fn is_connection_lost_after_send(resp: &Value) -> bool {
    let Some(obj) = resp.as_object() else {
        return false;
    };
    if is_truthy(obj.get("success")) {
        return false;
    }
    let text = obj
        .get("error")
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .or_else(|| obj.get("message").and_then(Value::as_str))
        .unwrap_or_default()
        .to_lowercase();
    text.contains("connection closed") || text.contains("disconnected") || text.contains("aborted")
}

pub fn editor_ready(state: &Value) -> bool {
    let Some(advice) = state
        .get("data")
        .and_then(|data| data.get("advice"))
        .and_then(Value::as_object)
    else {
        return false;
    };
    if advice.get("ready_for_tools").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    let blocking = advice
        .get("blocking_reasons")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    !blocking
        .iter()
        .filter_map(Value::as_str)
        .any(|reason| REAL_BLOCKING_REASONS.contains(&reason))
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reloading_hint_is_recognised_as_reloading() {
        let hint = reloading_hint(250);
        assert!(is_reloading_response(&hint));
        assert_eq!(retry_after_ms(&hint), Some(250));
        assert_eq!(hint["success"], json!(false));
    }

    #[test]
    fn reload_flavored_messages_count() {
        assert!(is_reloading_response(&json!({"success": false, "message": "Domain Reload pending"})));
        assert!(is_reloading_response(&json!({"error": "reloading assemblies"})));
        assert!(!is_reloading_response(&json!({"success": false, "error": "file not found"})));
        assert!(!is_reloading_response(&json!("reloading")));
    }

    #[test]
    fn rejection_needs_reason_and_hint() {
        let rejected = json!({"success": false, "hint": "retry", "data": {"reason": "reloading"}});
        assert!(is_reloading_rejection(&rejected));
        assert!(!is_reloading_rejection(&json!({"success": false, "data": {"reason": "reloading"}})));
        assert!(!is_reloading_rejection(
            &json!({"success": true, "hint": "retry", "data": {"reason": "reloading"}})
        ));
    }

    #[test]
    fn lost_after_send_matches_connection_errors() {
        assert!(is_connection_lost_after_send(&json!({"success": false, "error": "Connection closed by peer"})));
        assert!(is_connection_lost_after_send(&json!({"success": false, "message": "client disconnected"})));
        assert!(is_connection_lost_after_send(&json!({"success": false, "error": "", "message": "request aborted"})));
        assert!(!is_connection_lost_after_send(&json!({"success": true, "error": "aborted"})));
        assert!(!is_connection_lost_after_send(&json!({"success": false, "error": "compile error"})));
    }

    #[test]
    fn readiness_ignores_stale_status_only() {
        let ready = json!({"data": {"advice": {"ready_for_tools": true, "blocking_reasons": []}}});
        let compiling =
            json!({"data": {"advice": {"ready_for_tools": false, "blocking_reasons": ["compiling"]}}});
        let stale =
            json!({"data": {"advice": {"ready_for_tools": false, "blocking_reasons": ["stale_status"]}}});
        let mixed = json!({"data": {"advice": {"blocking_reasons": ["stale_status", "asset_import"]}}});
        assert!(editor_ready(&ready));
        assert!(!editor_ready(&compiling));
        assert!(editor_ready(&stale));
        assert!(!editor_ready(&mixed));
        assert!(!editor_ready(&json!({"data": {}})));
    }
}
