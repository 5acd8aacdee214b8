use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::INVOCATION_NODE;

/// A single client-originated action. The shape is owned by the state tree
/// layer; the only field the transport layer reads is the target node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Invocation(pub Map<String, Value>);

impl Invocation {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn node_id(&self) -> Option<i64> {
        self.0.get(INVOCATION_NODE).and_then(Value::as_i64)
    }
}

impl From<Value> for Invocation {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self(map)
            }
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Outgoing request body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UidlRequest {
    #[serde(rename = "csrfToken", default, skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
    pub rpc: Vec<Invocation>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub resynchronize: bool,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    #[serde(rename = "syncId", default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UidlRequest {
    pub fn new(rpc: Vec<Invocation>) -> Self {
        Self {
            rpc,
            ..Self::default()
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppError {
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Presence alone is meaningful, so the raw value is kept.
    #[serde(rename = "sessionExpired", default, skip_serializing_if = "Option::is_none")]
    pub session_expired: Option<Value>,
    #[serde(rename = "appError", default, skip_serializing_if = "Option::is_none")]
    pub app_error: Option<AppError>,
    #[serde(rename = "async", default, skip_serializing_if = "Option::is_none")]
    pub is_async: Option<Value>,
}

impl Meta {
    pub fn session_expired(&self) -> bool {
        self.session_expired.is_some()
    }

    pub fn app_error(&self) -> Option<&AppError> {
        self.app_error.as_ref()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Redirect {
    #[serde(default)]
    pub url: Option<String>,
}

/// Server message after the envelope has been stripped.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UidlMessage {
    #[serde(rename = "syncId", default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<i64>,
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constants: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Redirect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resynchronize: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<Value>,
    #[serde(rename = "Vaadin-Security-Key", default, skip_serializing_if = "Option::is_none")]
    pub security_key: Option<String>,
    #[serde(rename = "Vaadin-Push-ID", default, skip_serializing_if = "Option::is_none")]
    pub push_id: Option<String>,
}

impl UidlMessage {
    /// The message's sequence id, or -1 for id-less messages.
    pub fn server_sync_id(&self) -> i64 {
        self.sync_id.unwrap_or(-1)
    }

    pub fn is_resynchronize(&self) -> bool {
        self.resynchronize.is_some()
    }

    /// Asynchronous pushes carry `meta.async`; everything else answers a request.
    pub fn is_response(&self) -> bool {
        self.meta
            .as_ref()
            .map(|meta| meta.is_async.is_none())
            .unwrap_or(true)
    }

    pub fn session_expired(&self) -> bool {
        self.meta.as_ref().is_some_and(Meta::session_expired)
    }

    pub fn app_error(&self) -> Option<&AppError> {
        self.meta.as_ref().and_then(Meta::app_error)
    }

    /// True when an `execute` entry asks the page to reload. Checked even
    /// while a resynchronization is outstanding.
    pub fn requests_reload(&self) -> bool {
        self.execute
            .as_ref()
            .is_some_and(|commands| commands.iter().any(contains_reload))
    }
}

fn contains_reload(value: &Value) -> bool {
    match value {
        Value::String(text) => text.contains("reload"),
        Value::Array(items) => items.iter().any(contains_reload),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_absent_fields() {
        let request = UidlRequest::new(vec![Invocation::from(json!({"node": 3, "type": "event"}))]);
        let text = request.to_json().expect("serialize");
        assert_eq!(text, r#"{"rpc":[{"node":3,"type":"event"}]}"#);
    }

    #[test]
    fn request_carries_resync_and_ids() {
        let mut request = UidlRequest::new(Vec::new());
        request.resynchronize = true;
        request.client_id = Some(4);
        request.sync_id = Some(7);
        request.csrf_token = Some("abc".into());
        let value: Value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(
            value,
            json!({"csrfToken": "abc", "rpc": [], "resynchronize": true, "clientId": 4, "syncId": 7})
        );
    }

    #[test]
    fn message_defaults_to_response_without_id() {
        let message: UidlMessage = serde_json::from_str("{}").expect("parse");
        assert_eq!(message.server_sync_id(), -1);
        assert!(message.is_response());
        assert!(!message.is_resynchronize());
    }

    #[test]
    fn async_meta_marks_push() {
        let message: UidlMessage =
            serde_json::from_value(json!({"syncId": 3, "meta": {"async": true}})).expect("parse");
        assert!(!message.is_response());
        assert_eq!(message.server_sync_id(), 3);
    }

    #[test]
    fn session_expired_key_presence_counts() {
        let message: UidlMessage =
            serde_json::from_value(json!({"meta": {"sessionExpired": false}})).expect("parse");
        assert!(message.session_expired());
    }

    #[test]
    fn reload_command_is_found_in_nested_execute() {
        let message: UidlMessage = serde_json::from_value(json!({
            "execute": [["$0.reload()", {"node": 1}]]
        }))
        .expect("parse");
        assert!(message.requests_reload());
    }

    #[test]
    fn invocation_reports_node() {
        let invocation = Invocation::from(json!({"node": 12}));
        assert_eq!(invocation.node_id(), Some(12));
        assert_eq!(Invocation::from(json!("x")).node_id(), None);
    }
}
