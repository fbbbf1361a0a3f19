//! The on-wire multipart message shape.
//!
//! Every logical message is an ordered list of opaque byte frames. The first
//! frame is always the message kind (`"request"`, `"response"`,
//! `"notification"`, `"ping"`, `"pong"`); the second is always the request
//! id, rendered as decimal ASCII.

use bytes::Bytes;

pub const KIND_REQUEST: &[u8] = b"request";
pub const KIND_RESPONSE: &[u8] = b"response";
pub const KIND_NOTIFICATION: &[u8] = b"notification";
pub const KIND_PING: &[u8] = b"ping";
pub const KIND_PONG: &[u8] = b"pong";

const RESPONSE_CODE_OK: &[u8] = b"200";

/// A single multipart message, as delivered by a `Transport`.
pub type Frames = Vec<Bytes>;

/// A request id, unique within one engine's outgoing direction for as long
/// as the request is pending. Rendered on the wire as decimal ASCII.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn to_bytes(self) -> Bytes {
        Bytes::from(self.0.to_string().into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<RequestId> {
        std::str::from_utf8(bytes)
            .ok()?
            .parse::<u64>()
            .ok()
            .map(RequestId)
    }
}

/// A parsed incoming multipart message.
#[derive(Debug, Clone)]
pub enum Incoming {
    Request { id: RequestId, payload: Frames },
    ResponseOk { id: RequestId, payload: Frames },
    ResponseErr { id: RequestId, code: u16, message: String },
    Notification { id: RequestId, payload: Frames },
    Ping { id: RequestId },
    Pong { id: RequestId },
}

/// Parse a raw multipart message into an `Incoming`.
///
/// A message shorter than two frames is silently dropped rather than
/// treated as an error — malformed input from a misbehaving peer shouldn't
/// tear down the whole connection.
pub fn parse(mut frames: Frames) -> Option<Incoming> {
    if frames.len() < 2 {
        return None;
    }

    let kind = frames.remove(0);
    let id_frame = frames.remove(0);
    let id = RequestId::from_bytes(&id_frame)?;

    match kind.as_ref() {
        KIND_REQUEST => Some(Incoming::Request { id, payload: frames }),
        KIND_RESPONSE => Some(parse_response(id, frames)),
        KIND_NOTIFICATION => Some(Incoming::Notification { id, payload: frames }),
        KIND_PING => Some(Incoming::Ping { id }),
        KIND_PONG => Some(Incoming::Pong { id }),
        _ => None,
    }
}

fn parse_response(id: RequestId, mut frames: Frames) -> Incoming {
    if frames.is_empty() {
        return Incoming::ResponseErr {
            id,
            code: 0,
            message: "The received reply is invalid.".to_string(),
        };
    }

    let code_frame = frames.remove(0);

    if code_frame.as_ref() == RESPONSE_CODE_OK {
        return Incoming::ResponseOk { id, payload: frames };
    }

    let code = std::str::from_utf8(&code_frame)
        .ok()
        .and_then(|s| s.parse::<u16>().ok());

    match code {
        Some(code) => {
            let message = frames
                .first()
                .and_then(|f| std::str::from_utf8(f).ok())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "The received reply is invalid.".to_string());
            Incoming::ResponseErr { id, code, message }
        }
        None => Incoming::ResponseErr {
            id,
            code: 0,
            message: "The received reply is invalid.".to_string(),
        },
    }
}

pub fn encode_request(id: RequestId, payload: Frames) -> Frames {
    let mut frames = vec![Bytes::from_static(KIND_REQUEST), id.to_bytes()];
    frames.extend(payload);
    frames
}

pub fn encode_response_ok(id: RequestId, payload: Frames) -> Frames {
    let mut frames = vec![
        Bytes::from_static(KIND_RESPONSE),
        id.to_bytes(),
        Bytes::from_static(RESPONSE_CODE_OK),
    ];
    frames.extend(payload);
    frames
}

pub fn encode_response_err(id: RequestId, code: u16, message: &str) -> Frames {
    vec![
        Bytes::from_static(KIND_RESPONSE),
        id.to_bytes(),
        Bytes::from(code.to_string().into_bytes()),
        Bytes::from(message.as_bytes().to_vec()),
    ]
}

pub fn encode_notification(id: RequestId, payload: Frames) -> Frames {
    let mut frames = vec![Bytes::from_static(KIND_NOTIFICATION), id.to_bytes()];
    frames.extend(payload);
    frames
}

pub fn encode_ping(id: RequestId) -> Frames {
    vec![Bytes::from_static(KIND_PING), id.to_bytes()]
}

pub fn encode_pong(id: RequestId) -> Frames {
    vec![Bytes::from_static(KIND_PONG), id.to_bytes()]
}
