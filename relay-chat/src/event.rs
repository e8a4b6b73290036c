//! Wire event model.
//!
//! An [`Event`] is the unit of transmission between a client and the server. On
//! the wire it travels as `{"v": 1, "op": <opcode>, "payload": {...}}`; the
//! opcode alone decides which payload type is decoded, so a payload that happens
//! to look like another variant is rejected instead of coerced.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

/// Version stamped into every frame body.
pub const PROTOCOL_VERSION: u8 = 1;

/// Stable, wire-significant operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Hello = 0,
    Goodbye = 1,
    UserJoin = 2,
    UserLeave = 3,
    Message = 4,
    DirectMessage = 5,
    ChangeName = 8,
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OpCode::Hello),
            1 => Ok(OpCode::Goodbye),
            2 => Ok(OpCode::UserJoin),
            3 => Ok(OpCode::UserLeave),
            4 => Ok(OpCode::Message),
            5 => Ok(OpCode::DirectMessage),
            8 => Ok(OpCode::ChangeName),
            other => Err(ProtocolError::UnknownOpCode(other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame body: {0}")]
    MalformedFrame(#[source] serde_json::Error),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown opcode {0}")]
    UnknownOpCode(u8),
    #[error("malformed {opcode:?} payload: {source}")]
    MalformedPayload {
        opcode: OpCode,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode {opcode:?} event: {source}")]
    Encode {
        opcode: OpCode,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MessageSend {
    pub author: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DirectMessage {
    pub sender_name: String,
    pub target_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserJoin {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserLeave {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChangeName {
    pub old_name: String,
    pub new_name: String,
}

/// Payload of `HELLO` and `GOODBYE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Empty {}

/// An opcode together with its typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Hello,
    Goodbye,
    UserJoin(UserJoin),
    UserLeave(UserLeave),
    Message(MessageSend),
    DirectMessage(DirectMessage),
    ChangeName(ChangeName),
}

#[derive(Serialize)]
struct OutgoingFrame<'a, P: Serialize> {
    v: u8,
    op: u8,
    payload: &'a P,
}

#[derive(Deserialize)]
struct IncomingFrame {
    v: u8,
    op: u8,
    payload: Value,
}

impl Event {
    pub fn hello() -> Self {
        Event::Hello
    }

    pub fn goodbye() -> Self {
        Event::Goodbye
    }

    pub fn user_join(name: impl Into<String>) -> Self {
        Event::UserJoin(UserJoin { name: name.into() })
    }

    pub fn user_leave(name: impl Into<String>) -> Self {
        Event::UserLeave(UserLeave { name: name.into() })
    }

    pub fn message(author: impl Into<String>, content: impl Into<String>) -> Self {
        Event::Message(MessageSend {
            author: author.into(),
            content: content.into(),
        })
    }

    pub fn direct_message(
        sender: impl Into<String>,
        target: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Event::DirectMessage(DirectMessage {
            sender_name: sender.into(),
            target_name: target.into(),
            content: content.into(),
        })
    }

    pub fn change_name(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Event::ChangeName(ChangeName {
            old_name: old_name.into(),
            new_name: new_name.into(),
        })
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Event::Hello => OpCode::Hello,
            Event::Goodbye => OpCode::Goodbye,
            Event::UserJoin(_) => OpCode::UserJoin,
            Event::UserLeave(_) => OpCode::UserLeave,
            Event::Message(_) => OpCode::Message,
            Event::DirectMessage(_) => OpCode::DirectMessage,
            Event::ChangeName(_) => OpCode::ChangeName,
        }
    }

    /// Serializes the event into a frame body (without the length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let opcode = self.opcode();
        let encoded = match self {
            Event::Hello | Event::Goodbye => encode_frame(opcode, &Empty {}),
            Event::UserJoin(payload) => encode_frame(opcode, payload),
            Event::UserLeave(payload) => encode_frame(opcode, payload),
            Event::Message(payload) => encode_frame(opcode, payload),
            Event::DirectMessage(payload) => encode_frame(opcode, payload),
            Event::ChangeName(payload) => encode_frame(opcode, payload),
        };
        encoded.map_err(|source| ProtocolError::Encode { opcode, source })
    }

    /// Parses a frame body produced by [`Event::encode`].
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let frame: IncomingFrame =
            serde_json::from_slice(body).map_err(ProtocolError::MalformedFrame)?;
        if frame.v != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(frame.v));
        }

        let opcode = OpCode::try_from(frame.op)?;
        let payload = frame.payload;
        let event = match opcode {
            OpCode::Hello => {
                decode_payload::<Empty>(opcode, payload)?;
                Event::Hello
            }
            OpCode::Goodbye => {
                decode_payload::<Empty>(opcode, payload)?;
                Event::Goodbye
            }
            OpCode::UserJoin => Event::UserJoin(decode_payload(opcode, payload)?),
            OpCode::UserLeave => Event::UserLeave(decode_payload(opcode, payload)?),
            OpCode::Message => Event::Message(decode_payload(opcode, payload)?),
            OpCode::DirectMessage => Event::DirectMessage(decode_payload(opcode, payload)?),
            OpCode::ChangeName => Event::ChangeName(decode_payload(opcode, payload)?),
        };
        Ok(event)
    }
}

fn encode_frame<P: Serialize>(opcode: OpCode, payload: &P) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&OutgoingFrame {
        v: PROTOCOL_VERSION,
        op: opcode.into(),
        payload,
    })
}

fn decode_payload<P: DeserializeOwned>(opcode: OpCode, payload: Value) -> Result<P, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::MalformedPayload { opcode, source })
}
