//! Kernel wire messages (Jupyter messaging protocol v5.3).
//!
//! Only the envelope is strongly typed; `content` stays a JSON value until
//! [`KernelMessage::event`] classifies it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::{error::TransportError, output::Output};

/// Protocol version spoken by the bridge.
pub const PROTOCOL_VERSION: &str = "5.3";

const USERNAME: &str = "notebook-bridge";

/// Opaque id linking an execute request to every message it causes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationToken {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Control,
    Stdin,
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub version: String,
}

impl MessageHeader {
    fn new(msg_id: String, msg_type: &str, session: &str) -> Self {
        Self {
            msg_id,
            msg_type: msg_type.to_string(),
            username: USERNAME.to_string(),
            session: session.to_string(),
            date: chrono::Utc::now().to_rfc3339(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A single message on the multiplexed kernel stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    pub header: MessageHeader,
    /// The kernel sends `{}` when there is no parent.
    #[serde(default, with = "parent_header")]
    pub parent_header: Option<MessageHeader>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

mod parent_header {
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
    use serde_json::{Map, Value};

    use super::MessageHeader;

    pub fn serialize<S: Serializer>(
        header: &Option<MessageHeader>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match header {
            Some(h) => h.serialize(serializer),
            None => Map::new().serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<MessageHeader>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            other => serde_json::from_value(other).map(Some).map_err(D::Error::custom),
        }
    }
}

/// Kernel execution state reported on `status` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
    #[serde(other)]
    Unknown,
}

/// Classified content of a kernel message.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Status(ExecutionState),
    /// Echo of the code being run, carrying the ordinal it was assigned.
    ExecuteInput { execution_count: Option<u32> },
    /// Stream text, a rich result, a display or an error.
    Output(Output),
    ClearOutput { wait: bool },
    ExecuteReply {
        status: String,
        execution_count: Option<u32>,
    },
    Other(String),
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: ExecutionState,
}

#[derive(Deserialize)]
struct CountContent {
    #[serde(default)]
    execution_count: Option<u32>,
}

#[derive(Deserialize)]
struct ReplyContent {
    #[serde(default)]
    status: String,
    #[serde(default)]
    execution_count: Option<u32>,
}

#[derive(Deserialize)]
struct ClearContent {
    #[serde(default)]
    wait: bool,
}

impl KernelMessage {
    /// Build a fresh request message.
    #[must_use]
    pub fn request(msg_type: &str, session: &str, channel: Channel, content: Value) -> Self {
        Self {
            header: MessageHeader::new(Uuid::new_v4().to_string(), msg_type, session),
            parent_header: None,
            metadata: Map::new(),
            content,
            channel: Some(channel),
        }
    }

    /// Build an `execute_request` whose `msg_id` is `token`.
    #[must_use]
    pub fn execute_request(token: &CorrelationToken, session: &str, code: &str) -> Self {
        let mut msg = Self::request(
            "execute_request",
            session,
            Channel::Shell,
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        );
        msg.header.msg_id = token.as_str().to_string();
        msg
    }

    /// Build a message sent in response to `parent`.
    #[must_use]
    pub fn reply_to(parent: &Self, msg_type: &str, channel: Channel, content: Value) -> Self {
        Self {
            header: MessageHeader::new(
                Uuid::new_v4().to_string(),
                msg_type,
                &parent.header.session,
            ),
            parent_header: Some(parent.header.clone()),
            metadata: Map::new(),
            content,
            channel: Some(channel),
        }
    }

    #[must_use]
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Token of this message itself.
    #[must_use]
    pub fn token(&self) -> CorrelationToken {
        CorrelationToken(self.header.msg_id.clone())
    }

    /// Token of the request this message answers, if any.
    #[must_use]
    pub fn parent_token(&self) -> Option<CorrelationToken> {
        self.parent_header
            .as_ref()
            .filter(|h| !h.msg_id.is_empty())
            .map(|h| CorrelationToken(h.msg_id.clone()))
    }

    /// Classify the content by message type.
    ///
    /// # Errors
    /// Returns `Protocol` if the content does not match its message type.
    pub fn event(&self) -> Result<KernelEvent, TransportError> {
        let malformed =
            |e: serde_json::Error| TransportError::Protocol(format!("malformed {}: {e}", self.msg_type()));

        match self.msg_type() {
            "status" => {
                let c: StatusContent =
                    serde_json::from_value(self.content.clone()).map_err(malformed)?;
                Ok(KernelEvent::Status(c.execution_state))
            }
            "execute_input" => {
                let c: CountContent =
                    serde_json::from_value(self.content.clone()).map_err(malformed)?;
                Ok(KernelEvent::ExecuteInput {
                    execution_count: c.execution_count,
                })
            }
            "stream" | "execute_result" | "display_data" | "error" => {
                let mut content = match &self.content {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                content.insert("output_type".into(), Value::String(self.msg_type().into()));
                let output: Output =
                    serde_json::from_value(Value::Object(content)).map_err(malformed)?;
                Ok(KernelEvent::Output(output))
            }
            "clear_output" => {
                let c: ClearContent =
                    serde_json::from_value(self.content.clone()).map_err(malformed)?;
                Ok(KernelEvent::ClearOutput { wait: c.wait })
            }
            "execute_reply" => {
                let c: ReplyContent =
                    serde_json::from_value(self.content.clone()).map_err(malformed)?;
                Ok(KernelEvent::ExecuteReply {
                    status: c.status,
                    execution_count: c.execution_count,
                })
            }
            other => Ok(KernelEvent::Other(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::StreamName;

    #[test]
    fn test_execute_request_carries_token() {
        let token = CorrelationToken::generate();
        let msg = KernelMessage::execute_request(&token, "s1", "x = 1");
        assert_eq!(msg.token(), token);
        assert_eq!(msg.msg_type(), "execute_request");
        assert_eq!(msg.content["code"], "x = 1");
        assert_eq!(msg.parent_token(), None);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["parent_header"], json!({}));
        assert_eq!(json["channel"], "shell");
    }

    #[test]
    fn test_parse_iopub_stream() {
        let raw = json!({
            "header": {"msg_id": "m2", "msg_type": "stream", "session": "k", "date": "", "version": "5.3", "username": "u"},
            "parent_header": {"msg_id": "req-1", "msg_type": "execute_request"},
            "metadata": {},
            "content": {"name": "stderr", "text": "warn\n"},
            "channel": "iopub"
        });
        let msg: KernelMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.parent_token(), Some(CorrelationToken::from("req-1")));
        assert_eq!(
            msg.event().unwrap(),
            KernelEvent::Output(Output::stream(StreamName::Stderr, "warn\n"))
        );
    }

    #[test]
    fn test_status_and_unknown_states() {
        let parent = KernelMessage::execute_request(&CorrelationToken::generate(), "s", "");
        let busy = KernelMessage::reply_to(&parent, "status", Channel::Iopub, json!({"execution_state": "busy"}));
        assert_eq!(busy.event().unwrap(), KernelEvent::Status(ExecutionState::Busy));

        let odd = KernelMessage::reply_to(&parent, "status", Channel::Iopub, json!({"execution_state": "restarting"}));
        assert_eq!(odd.event().unwrap(), KernelEvent::Status(ExecutionState::Unknown));
    }

    #[test]
    fn test_malformed_content_is_protocol_error() {
        let parent = KernelMessage::execute_request(&CorrelationToken::generate(), "s", "");
        let bad = KernelMessage::reply_to(&parent, "status", Channel::Iopub, json!({"nope": 1}));
        assert!(matches!(bad.event(), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn test_error_content() {
        let parent = KernelMessage::execute_request(&CorrelationToken::generate(), "s", "");
        let err = KernelMessage::reply_to(
            &parent,
            "error",
            Channel::Iopub,
            json!({"ename": "ValueError", "evalue": "boom", "traceback": ["t1"]}),
        );
        assert_eq!(
            err.event().unwrap(),
            KernelEvent::Output(Output::error("ValueError", "boom", vec!["t1".into()]))
        );
    }
}
