//! The Connection Resource boundary.
//!
//! A [`ConnectionResource`] is one live bidirectional stream connection. Wire
//! framing and handshake are its implementer's job; the manager only sends
//! requests over it, watches for its close event, and shuts it down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};

use crate::Result;
use crate::transport::TransportVariant;

/// Close code for a deliberate local disconnect. No reconnect.
pub const NORMAL_DISCONNECT_CODE: u16 = 3000;

/// Close code for a session taken over elsewhere. No reconnect.
pub const CONNECTED_ELSEWHERE_CODE: u16 = 4409;

/// Request body. Anything beyond bytes or text is not representable.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Vec<u8>),
    Text(String),
}

impl Body {
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
        }
    }
}

/// A request sent by the client over a live connection.
#[non_exhaustive]
#[derive(Debug, Clone, bon::Builder)]
pub struct OutgoingRequest {
    pub verb: Method,
    pub path: String,
    #[builder(default)]
    pub headers: HeaderMap,
    pub body: Option<Body>,
    pub timeout: Option<Duration>,
}

/// Response to an [`OutgoingRequest`], returned verbatim to the caller.
#[non_exhaustive]
#[derive(Debug, Clone, bon::Builder)]
pub struct Response {
    pub status: StatusCode,
    #[builder(default)]
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// A request pushed by the server over a live connection.
///
/// Held in the manager's buffer until a handler registers, so it must be
/// cheap to clone for replay to multiple handlers.
#[non_exhaustive]
#[derive(Debug, Clone, bon::Builder)]
pub struct IncomingRequest {
    pub id: u64,
    pub verb: Method,
    pub path: String,
    #[builder(default)]
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

/// Close event emitted once per connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Sentinel codes that must not trigger a reconnect.
    #[must_use]
    pub fn suppresses_reconnect(&self) -> bool {
        matches!(
            self.code,
            NORMAL_DISCONNECT_CODE | CONNECTED_ELSEWHERE_CODE
        )
    }
}

/// Consumer of inbound pushed requests, installed on the authenticated
/// channel's resource.
pub type RequestSink = Arc<dyn Fn(IncomingRequest) + Send + Sync>;

/// Options the adapter uses to construct a resource around a raw connection.
#[non_exhaustive]
pub struct ResourceOptions {
    /// Channel name, for diagnostics
    pub name: &'static str,
    /// Path probed by the resource's keep-alive machinery
    pub keepalive_path: String,
    /// Where inbound pushed requests go. `None` means the resource terminates
    /// them itself.
    pub handle_request: Option<RequestSink>,
    pub variant: TransportVariant,
}

impl fmt::Debug for ResourceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceOptions")
            .field("name", &self.name)
            .field("keepalive_path", &self.keepalive_path)
            .field("handle_request", &self.handle_request.is_some())
            .field("variant", &self.variant)
            .finish()
    }
}

/// One live bidirectional stream connection.
#[async_trait]
pub trait ConnectionResource: Send + Sync + fmt::Debug {
    /// Send a request and await its response.
    async fn send_request(&self, request: OutgoingRequest) -> Result<Response>;

    /// Resolves when the connection closes, however that happens.
    async fn closed(&self) -> CloseFrame;

    /// Tear the connection down. Idempotent.
    async fn shutdown(&self);

    /// Force an immediate keep-alive probe, optionally with a shortened
    /// timeout (used while the device believes it is offline).
    fn force_keepalive(&self, timeout_override: Option<Duration>);
}
