use chrono::{SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;
pub const CURRENT_CHANNEL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelVersion(pub u16);

impl ChannelVersion {
    pub const CURRENT: Self = Self(CURRENT_CHANNEL_VERSION);
}

impl Default for ChannelVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ChannelVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ChannelVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ChannelVersionVisitor;

        impl<'de> Visitor<'de> for ChannelVersionVisitor {
            type Value = ChannelVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a channel version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("channel version out of range: {value}")))?;
                Ok(ChannelVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "channel version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid channel version '{value}': {err}"))
                })?;
                Ok(ChannelVersion(version))
            }
        }

        deserializer.deserialize_any(ChannelVersionVisitor)
    }
}

/// One text frame on the realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelEnvelope {
    #[serde(default)]
    pub version: ChannelVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    #[serde(flatten)]
    pub msg: ChannelMsg,
}

impl ChannelEnvelope {
    pub fn new(msg: ChannelMsg) -> Self {
        Self {
            version: ChannelVersion::CURRENT,
            sent_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelMsg {
    Hello(HelloPayload),
    ChatStarted(ChatStartedPayload),
    SessionJoined(SessionPayload),
    CustomerDisconnected(SessionPayload),
    JoinSession(SessionPayload),
    LeaveSession(SessionPayload),
}

impl ChannelMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMsg::Hello(_) => "hello",
            ChannelMsg::ChatStarted(_) => "chat_started",
            ChannelMsg::SessionJoined(_) => "session_joined",
            ChannelMsg::CustomerDisconnected(_) => "customer_disconnected",
            ChannelMsg::JoinSession(_) => "join_session",
            ChannelMsg::LeaveSession(_) => "leave_session",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(alias = "agent_id")]
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatStartedPayload {
    #[serde(alias = "agent_id")]
    pub agent_id: String,
    #[serde(alias = "escalation_id")]
    pub escalation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    #[serde(alias = "session_id")]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_text(envelope: &ChannelEnvelope, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_text(text: &str, max_frame_bytes: usize) -> Result<ChannelEnvelope, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chat_started_with_camel_or_snake_fields() {
        let camel = decode_text(
            r#"{"version":1,"type":"chat_started","payload":{"agentId":"agent-7","escalationId":"E1"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("camel payload");
        let snake = decode_text(
            r#"{"type":"chat_started","payload":{"agent_id":"agent-7","escalation_id":"E1"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("snake payload");

        let expected = ChannelMsg::ChatStarted(ChatStartedPayload {
            agent_id: "agent-7".to_string(),
            escalation_id: "E1".to_string(),
        });
        assert_eq!(camel.msg, expected);
        assert_eq!(snake.msg, expected);
        assert_eq!(snake.version, ChannelVersion::CURRENT);
    }

    #[test]
    fn encoded_join_carries_type_tag_and_string_version() {
        let envelope = ChannelEnvelope::new(ChannelMsg::JoinSession(SessionPayload {
            session_id: "S1".to_string(),
        }));
        let text = encode_text(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let raw: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(raw["type"], "join_session");
        assert_eq!(raw["version"], "1");
        assert_eq!(raw["payload"]["sessionId"], "S1");
        assert!(raw["sent_at"].is_string());
    }

    #[test]
    fn unknown_message_type_is_a_decode_error() {
        let result = decode_text(
            r#"{"type":"typing","payload":{"sessionId":"S1"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let envelope = ChannelEnvelope::new(ChannelMsg::Hello(HelloPayload {
            agent_id: "a".repeat(256),
        }));
        assert!(matches!(
            encode_text(&envelope, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let text = format!(
            r#"{{"type":"hello","payload":{{"agentId":"{}"}}}}"#,
            "x".repeat(256)
        );
        assert!(matches!(
            decode_text(&text, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn version_rejects_negative_numbers() {
        let result = decode_text(
            r#"{"version":-1,"type":"session_joined","payload":{"sessionId":"S1"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        );
        assert!(result.is_err());
    }
}
