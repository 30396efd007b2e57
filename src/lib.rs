//! # KCP Session Relay
//!
//! A relay server for host-authoritative multiplayer sessions across
//! restrictive NATs. A host allocates a session over a small HTTP control
//! plane, clients join it, and the server forwards application payloads
//! between them over reliable UDP (KCP) while keeping transport-level
//! connection identities private to the server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   Control Plane     │  HTTP: list / allocate / join / modify → tokens
//! ├─────────────────────┤
//! │   Relay Core        │  Auth state machine, routing, session registry
//! ├─────────────────────┤
//! │   KCP Transport     │  Per-connection ARQ engines over one UDP socket
//! └─────────────────────┘
//! ```
//!
//! The two surfaces meet in the pending token stores: the control plane
//! deposits a short-lived cache entry and returns its token; the data plane
//! consumes the token on the first KCP frame and promotes the connection to
//! host or client. Tokens and unauthenticated connections expire after 30
//! seconds.

pub mod config;
pub mod control;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod pending;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;
pub mod uid;
pub mod wire;

// Re-exports
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use relay::{PendingCaches, RelayCore};
pub use transport::{Channel, KcpTransport, SessionLink, TransportEvent};
pub use wire::{ConnectionId, DisconnectReason, LocalId, SessionId, SessionInfo, Token};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
