//! Device gateway: channel registry, realtime WebSocket transport and the
//! control-plane API, served from one listening socket.

pub mod control;
pub mod origin;
pub mod registry;
pub mod server;
pub mod transport;

/// Cross-origin policy for the handshake and the control plane.
pub use origin::AllowedOrigins;
/// Channel membership and fan-out.
pub use registry::{ChannelRegistry, EventPublisher};
/// Shared-listener server, request classifier and handler state.
pub use server::{GatewayConfig, GatewayServer, GatewayState, RequestKind, classify};
