//! Persistent-connection manager for a chat client.
//!
//! A [`SocketManager`] owns two long-lived bidirectional channels to the
//! server: an authenticated one carrying the user's session and an
//! unauthenticated one for anonymous traffic. It reconnects the authenticated
//! channel with jittered backoff, rotates the unauthenticated channel on a
//! fixed interval, buffers server-pushed requests until the application
//! registers a handler, and exposes connection status as a watchable value.
//!
//! The transport itself is pluggable through the [`transport::Transport`]
//! trait; this crate handles lifecycle, not wire framing.

pub mod auth;
pub mod backoff;
pub mod error;
pub mod manager;
pub mod process;
pub mod registry;
pub mod resource;
pub mod transport;

pub use auth::{CredentialProvider, Credentials};
pub use error::{ConnectError, Error, Kind};
pub use manager::{SocketEvent, SocketManager, SocketManagerConfig, SocketStatus};
pub use registry::{HandlerId, RequestHandler, RequestHandlerRegistry};
pub use resource::{
    Body, CloseFrame, ConnectionResource, IncomingRequest, OutgoingRequest, Response,
};
pub use transport::{
    ConnectOptions, FeatureFlagProvider, ProxyAgent, ProxyResolver, ReleaseChannel, Transport,
    TransportVariant,
};

pub type Result<T> = std::result::Result<T, Error>;
