use rmpv::Value;
use thiserror::Error;

/// Routing scope of a frame: one peer or one group channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Private = 0,
    Group = 1,
}

impl ChannelType {
    fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(ChannelType::Private),
            1 => Some(ChannelType::Group),
            _ => None,
        }
    }
}

// ── Message type values ──────────────────────────────────────────────────────

pub const MSG_TEXT: u32 = 1;
pub const MSG_AUDIO: u32 = 3;
pub const MSG_ACK: u32 = 4;
pub const MSG_REGISTER: u32 = 6;
/// Device-token update carried over the GROUP channel.
pub const MSG_CONNECTION: u32 = 7;
/// Sent to a connection displaced by a newer login; close follows.
pub const MSG_LOGIN_DUPLICATED: u32 = 20;
pub const MSG_CONNECTION_ACK: u32 = 21;
pub const MSG_HEARTBEAT: u32 = 30;
pub const MSG_PRESENCE_UPDATE: u32 = 31;
pub const MSG_PRESENCE_SNAPSHOT: u32 = 32;

/// Destination value for frames addressed to no one user in particular.
pub const TO_BROADCAST: &str = "broadcast";

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unsupported channel type: {0}")]
    UnsupportedType(u64),
}

/// One wire frame: a positional five-field MessagePack array
/// `[channelType, messageType, fromId, toId, payload]`.
///
/// The payload is opaque to the codec: raw bytes for audio, a structured
/// value for heartbeat metadata and presence events, or nil.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: ChannelType,
    pub message_type: u32,
    pub from: String,
    pub to: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(
        channel: ChannelType,
        message_type: u32,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            channel,
            message_type,
            from: from.into(),
            to: to.into(),
            payload,
        }
    }

    /// Server-originated frame with no meaningful sender.
    fn server(message_type: u32, to: impl Into<String>, payload: Value) -> Self {
        Self::new(ChannelType::Private, message_type, "", to, payload)
    }

    pub fn connection_ack(to: impl Into<String>) -> Self {
        Self::server(MSG_CONNECTION_ACK, to, Value::Nil)
    }

    pub fn login_duplicated(to: impl Into<String>) -> Self {
        Self::server(MSG_LOGIN_DUPLICATED, to, Value::Nil)
    }

    /// PRESENCE_UPDATE frame carrying the transition JSON as a structured
    /// MessagePack value.
    pub fn presence_update(update: &serde_json::Value) -> Self {
        Self::server(
            MSG_PRESENCE_UPDATE,
            TO_BROADCAST,
            json_to_value(update),
        )
    }

    /// PRESENCE_SNAPSHOT frame sent to a dashboard right after accept.
    pub fn presence_snapshot(to: impl Into<String>, snapshot: &serde_json::Value) -> Self {
        Self::server(MSG_PRESENCE_SNAPSHOT, to, json_to_value(snapshot))
    }

    /// Encode into the positional binary form. Total: every well-formed frame
    /// produces bytes that decode back to an equal frame.
    pub fn encode(&self) -> Vec<u8> {
        let value = Value::Array(vec![
            Value::from(self.channel as u8),
            Value::from(self.message_type),
            Value::from(self.from.as_str()),
            Value::from(self.to.as_str()),
            self.payload.clone(),
        ]);

        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        rmpv::encode::write_value(&mut buf, &value).expect("encoding into Vec is infallible");
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        let mut cursor = bytes;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| FrameError::Malformed(e.to_string()))?;

        let Value::Array(fields) = value else {
            return Err(FrameError::Malformed("frame is not an array".into()));
        };
        let [raw_channel, raw_type, raw_from, raw_to, payload]: [Value; 5] = fields
            .try_into()
            .map_err(|fields: Vec<Value>| {
                FrameError::Malformed(format!("expected 5 fields, got {}", fields.len()))
            })?;

        let raw_channel = as_uint(&raw_channel)
            .ok_or_else(|| FrameError::Malformed("channelType is not an integer".into()))?;
        let channel =
            ChannelType::from_u64(raw_channel).ok_or(FrameError::UnsupportedType(raw_channel))?;

        let message_type = as_uint(&raw_type)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| FrameError::Malformed("messageType is not an integer".into()))?;

        let from = as_id(raw_from)
            .ok_or_else(|| FrameError::Malformed("fromId is not a string".into()))?;
        // toId may legitimately be the integer 0 for non-routed frames.
        let to = as_id(raw_to)
            .ok_or_else(|| FrameError::Malformed("toId is not a string".into()))?;

        Ok(Frame {
            channel,
            message_type,
            from,
            to,
            payload,
        })
    }
}

fn as_uint(value: &Value) -> Option<u64> {
    value.as_u64()
}

/// Identity fields arrive as strings, but legacy clients send `0` for an
/// absent destination; both normalize to a `String`.
fn as_id(value: Value) -> Option<String> {
    match value {
        Value::String(s) => s.into_str(),
        Value::Integer(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_to_value(json: &serde_json::Value) -> Value {
    rmpv::ext::to_value(json).unwrap_or(Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let decoded = Frame::decode(&frame.encode()).expect("frame should decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn text_frame_roundtrips() {
        roundtrip(Frame::new(
            ChannelType::Private,
            MSG_TEXT,
            "TELENET_81*14946*0011",
            "TELENET_81*14946*0022",
            Value::from("hello"),
        ));
    }

    #[test]
    fn audio_frame_with_binary_payload_roundtrips() {
        roundtrip(Frame::new(
            ChannelType::Group,
            MSG_AUDIO,
            "alice",
            "dispatch-channel",
            Value::Binary(vec![0u8, 1, 2, 255, 254, 128]),
        ));
    }

    #[test]
    fn heartbeat_with_empty_payload_roundtrips() {
        roundtrip(Frame::new(
            ChannelType::Private,
            MSG_HEARTBEAT,
            "alice",
            "0",
            Value::Nil,
        ));
    }

    #[test]
    fn structured_payload_roundtrips() {
        let update = serde_json::json!({
            "type": "presence_update",
            "userId": "alice",
            "status": "online",
            "timestamp": 1_700_000_000_000_i64,
        });
        let frame = Frame::presence_update(&update);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.message_type, MSG_PRESENCE_UPDATE);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn all_known_message_types_roundtrip() {
        for message_type in [
            MSG_TEXT,
            MSG_AUDIO,
            MSG_ACK,
            MSG_REGISTER,
            MSG_CONNECTION,
            MSG_LOGIN_DUPLICATED,
            MSG_CONNECTION_ACK,
            MSG_HEARTBEAT,
            MSG_PRESENCE_UPDATE,
            MSG_PRESENCE_SNAPSHOT,
        ] {
            roundtrip(Frame::new(
                ChannelType::Group,
                message_type,
                "from",
                "to",
                Value::Nil,
            ));
        }
    }

    #[test]
    fn integer_destination_normalizes_to_string() {
        let value = Value::Array(vec![
            Value::from(0u8),
            Value::from(MSG_HEARTBEAT),
            Value::from("alice"),
            Value::from(0u8),
            Value::Nil,
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();

        let frame = Frame::decode(&buf).unwrap();
        assert_eq!(frame.to, "0");
    }

    #[test]
    fn truncated_bytes_are_malformed() {
        let frame = Frame::new(ChannelType::Private, MSG_TEXT, "a", "b", Value::from("x"));
        let bytes = frame.encode();
        let result = Frame::decode(&bytes[..bytes.len() - 2]);
        assert!(matches!(result, Err(FrameError::Malformed(_))));
    }

    #[test]
    fn non_array_input_is_malformed() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from("not a frame")).unwrap();
        assert!(matches!(
            Frame::decode(&buf),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn wrong_field_count_is_malformed() {
        let value = Value::Array(vec![Value::from(0u8), Value::from(1u8)]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert!(matches!(
            Frame::decode(&buf),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_channel_type_is_unsupported() {
        let value = Value::Array(vec![
            Value::from(7u8),
            Value::from(MSG_TEXT),
            Value::from("a"),
            Value::from("b"),
            Value::Nil,
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        assert_eq!(Frame::decode(&buf), Err(FrameError::UnsupportedType(7)));
    }

    #[test]
    fn garbage_bytes_are_malformed() {
        assert!(matches!(
            Frame::decode(&[0xc1, 0xff, 0x00]),
            Err(FrameError::Malformed(_))
        ));
    }
}
