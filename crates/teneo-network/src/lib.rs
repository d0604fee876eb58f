//! Live session runtime for the Teneo agent SDK.
//!
//! Three pieces, connected by two one-way seams: the [`SessionTransport`]
//! owns the framed WebSocket link and its reconnect loop, the
//! [`ProtocolHandler`] runs the challenge/register handshake over it and
//! classifies inbound frames, and the [`TaskCoordinator`] executes tasks
//! against the operator's handler with rate limiting, streaming, and
//! cancellation.

pub mod coordinator;
pub mod protocol;
pub mod transport;

pub use coordinator::{OutboundSink, TaskCoordinator};
pub use protocol::{HandshakeState, ProtocolHandler, TaskSink};
pub use transport::{SessionTransport, TransportEvent};
