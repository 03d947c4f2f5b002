// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use jsonwebtoken::{encode, EncodingKey, Header};
use rmpv::Value;
use serde_json::json;

use talkback_server::protocol::{ChannelType, Frame, MSG_AUDIO, MSG_TEXT};

pub const TEST_SECRET: &str = "test-secret-min-32-characters-long!!";

/// Sign a claims object into a compact JWT with the given secret.
pub fn sign_token(claims: &serde_json::Value, secret: &str) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("signing should succeed")
}

/// A mobile-role token for `user_id`, signed with the test secret.
pub fn mobile_token(user_id: &str) -> String {
    sign_token(&json!({ "uid": user_id, "role": "mobile" }), TEST_SECRET)
}

pub fn text_frame(from: &str, to: &str, body: &str) -> Frame {
    Frame::new(ChannelType::Private, MSG_TEXT, from, to, Value::from(body))
}

pub fn audio_frame(from: &str, group: &str, chunk: &[u8]) -> Frame {
    Frame::new(
        ChannelType::Group,
        MSG_AUDIO,
        from,
        group,
        Value::Binary(chunk.to_vec()),
    )
}
