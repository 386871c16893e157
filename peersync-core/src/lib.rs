//! peersync session core: client/server state machines replicating LWW variables.
//! Host-driven: no I/O; the host passes transport events and ticks, the core sends through injected channels.

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod variable;
pub mod wire;

pub use client::{ClientEvent, ClientSession, ClientState};
pub use config::SessionConfig;
pub use correlation::PendingResponse;
pub use error::{DisconnectReason, RequestError, TransportError};
pub use identity::PeerId;
pub use protocol::{Envelope, Message, Response, VarMode, PROTOCOL_VERSION};
pub use server::{LeaveReason, PostRequest, ReplyTo, Responder, ServerCore, ServerEvent};
pub use transport::{Channel, Transport};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
