//! Error types shared by the Pylar wire protocol.
//!
//! `Error` is an `error_chain!`-generated type for infrastructure failures
//! (transport gone, codec errors, engine misuse). `CallError` is not an
//! `error_chain` error: it is the protocol-level payload carried in a
//! `response`'s error frames, and every `Error` has a conversion into it so
//! it can be surfaced across the wire.

use std::fmt;

error_chain::error_chain! {
    foreign_links {
        Json(serde_json::Error);
        Io(std::io::Error);
    }

    errors {
        TransportClosed {
            description("transport closed")
            display("the underlying transport is no longer reachable")
        }
        EngineClosing {
            description("engine closing")
            display("the peer engine is closing and refuses new requests")
        }
        MalformedFrame(detail: String) {
            description("malformed wire frame")
            display("malformed wire frame: {}", detail)
        }
    }
}

/// A numeric, HTTP-like error code plus a human-readable message, as carried
/// by `response` error frames on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    pub code: u16,
    pub message: String,
}

impl CallError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        CallError {
            code,
            message: message.into(),
        }
    }

    /// `400 Bad request.`
    pub fn bad_request() -> Self {
        CallError::new(400, "Bad request.")
    }

    /// `401 Invalid shared secret.`
    pub fn invalid_shared_secret() -> Self {
        CallError::new(401, "Invalid shared secret.")
    }

    /// `404 No such domain: <domain>.`
    pub fn no_such_domain(domain: &[u8]) -> Self {
        CallError::new(
            404,
            format!("No such domain: {}.", String::from_utf8_lossy(domain)),
        )
    }

    /// `404 Unknown command.`
    pub fn unknown_command() -> Self {
        CallError::new(404, "Unknown command.")
    }

    /// `408 Request timed out.`
    pub fn request_timed_out() -> Self {
        CallError::new(408, "Request timed out.")
    }

    /// `412 Not registered.`
    pub fn not_registered() -> Self {
        CallError::new(412, "Not registered.")
    }

    /// `500 Internal error.`
    pub fn internal_error() -> Self {
        CallError::new(500, "Internal error.")
    }

    /// `503 Authentication service unavailable.`
    pub fn authentication_unavailable() -> Self {
        CallError::new(503, "Authentication service unavailable.")
    }

    /// `503 Request cancelled.` — surfaced when a pending request's
    /// connection is torn down before a reply arrives.
    pub fn request_cancelled() -> Self {
        CallError::new(503, "Request cancelled.")
    }

    /// `0 The received reply is invalid.`
    pub fn invalid_reply() -> Self {
        CallError::new(0, "The received reply is invalid.")
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CallError {}

impl From<CallError> for Error {
    fn from(err: CallError) -> Error {
        ErrorKind::MalformedFrame(err.to_string()).into()
    }
}
