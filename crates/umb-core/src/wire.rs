use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";
pub const PING_COMMAND: &str = "ping";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: Value,
}

impl CommandRequest {
    pub fn new(command_type: impl Into<String>, params: Value) -> Self {
        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };
        Self {
            command_type: command_type.into(),
            params,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }

    pub fn is_error(&self) -> bool {
        self.status == STATUS_ERROR
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .filter(|value| !value.is_empty())
            .or_else(|| self.message.clone().filter(|value| !value.is_empty()))
            .unwrap_or_else(|| "Unknown Unity error".to_string())
    }

    pub fn into_result(self) -> Value {
        self.result
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    pub fn is_pong(&self) -> bool {
        self.is_success()
            && self
                .result
                .as_ref()
                .and_then(|result| result.get("message"))
                .and_then(Value::as_str)
                == Some("pong")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Register {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        project_name: Option<String>,
        #[serde(default)]
        project_hash: Option<String>,
        #[serde(default)]
        unity_version: Option<String>,
    },
    Welcome {
        #[serde(rename = "serverTimeout")]
        server_timeout: u64,
        #[serde(rename = "keepAliveInterval")]
        keep_alive_interval: u64,
    },
    Execute {
        id: String,
        name: String,
        #[serde(default)]
        params: Value,
        timeout: u64,
    },
    CommandResult {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        result: Option<Value>,
    },
    Ping,
    Pong {
        #[serde(default)]
        session_id: Option<String>,
    },
}

impl HubMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::Register { .. } => "register",
            HubMessage::Welcome { .. } => "welcome",
            HubMessage::Execute { .. } => "execute",
            HubMessage::CommandResult { .. } => "command_result",
            HubMessage::Ping => "ping",
            HubMessage::Pong { .. } => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_uses_type_and_params_keys() {
        let request = CommandRequest::new("manage_scene", json!({"action": "get_active"}));
        let encoded: Value = serde_json::from_slice(&request.to_bytes().expect("encode")).expect("json");
        assert_eq!(encoded, json!({"type": "manage_scene", "params": {"action": "get_active"}}));

        let empty = CommandRequest::new("read_console", Value::Null);
        assert_eq!(empty.params, json!({}));
    }

    #[test]
    fn response_error_text_prefers_error_then_message() {
        let with_error: ResponseEnvelope =
            serde_json::from_value(json!({"status": "error", "error": "boom", "message": "ignored"}))
                .expect("parse");
        assert!(with_error.is_error());
        assert_eq!(with_error.error_message(), "boom");

        let with_message: ResponseEnvelope =
            serde_json::from_value(json!({"status": "error", "message": "only message"})).expect("parse");
        assert_eq!(with_message.error_message(), "only message");

        let bare: ResponseEnvelope = serde_json::from_value(json!({"status": "error"})).expect("parse");
        assert_eq!(bare.error_message(), "Unknown Unity error");
    }

    #[test]
    fn pong_detection() {
        let pong: ResponseEnvelope =
            serde_json::from_value(json!({"status": "success", "result": {"message": "pong"}}))
                .expect("parse");
        assert!(pong.is_pong());

        let other: ResponseEnvelope =
            serde_json::from_value(json!({"status": "success", "result": {"message": "ok"}}))
                .expect("parse");
        assert!(!other.is_pong());
    }

    #[test]
    fn hub_messages_match_plugin_wire_shapes() {
        let welcome = HubMessage::Welcome {
            server_timeout: 30,
            keep_alive_interval: 15,
        };
        assert_eq!(
            serde_json::to_value(&welcome).expect("encode"),
            json!({"type": "welcome", "serverTimeout": 30, "keepAliveInterval": 15})
        );

        let execute = HubMessage::Execute {
            id: "cmd-1".to_string(),
            name: "manage_scene".to_string(),
            params: json!({"action": "save"}),
            timeout: 30,
        };
        assert_eq!(
            serde_json::to_value(&execute).expect("encode"),
            json!({"type": "execute", "id": "cmd-1", "name": "manage_scene", "params": {"action": "save"}, "timeout": 30})
        );

        assert_eq!(
            serde_json::to_value(HubMessage::Ping).expect("encode"),
            json!({"type": "ping"})
        );

        let register: HubMessage = serde_json::from_value(json!({
            "type": "register",
            "session_id": "sess-1",
            "project_name": "Demo",
            "project_hash": "abc123",
            "unity_version": "2022.3.1f1"
        }))
        .expect("register");
        assert_eq!(register.kind(), "register");

        let partial: HubMessage =
            serde_json::from_value(json!({"type": "register", "session_id": "sess-2"})).expect("partial");
        match partial {
            HubMessage::Register { project_hash, .. } => assert!(project_hash.is_none()),
            other => panic!("unexpected message: {other:?}"),
        }

        let result: HubMessage =
            serde_json::from_value(json!({"type": "command_result", "id": "cmd-1", "result": {"ok": true}}))
                .expect("result");
        assert_eq!(
            result,
            HubMessage::CommandResult {
                id: Some("cmd-1".to_string()),
                result: Some(json!({"ok": true})),
            }
        );
    }

    #[test]
    fn unknown_hub_message_types_fail_to_parse() {
        assert!(serde_json::from_value::<HubMessage>(json!({"type": "telemetry"})).is_err());
    }
}
