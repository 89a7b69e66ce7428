//! Transport layer of the metronome runtime.
//!
//! A [`CommsInterface`] owns the transmit/receive state machine shared by
//! every transport; concrete transports implement the [`CommsDriver`]
//! capability and realize the abstract queue duties over tcp, tcp single
//! socket, udp, or in-process queues. The [`adapter::CommsBroker`] binds a
//! comms interface to a core or broker kernel.

pub mod adapter;
pub mod allocator;
pub mod broker_server;
pub mod codec;
pub mod defaults;
pub mod inproc;
pub mod interface;
pub mod network;
pub mod tcp;
pub mod tcp_ss;
pub mod tripwire;
pub mod udp;

pub use adapter::{CommsBroker, KernelRole};
pub use allocator::PortAllocator;
pub use codec::ActionCodec;
pub use interface::{
    CommsConfig, CommsDriver, CommsHandle, CommsInterface, ConnectionStatus, DriverContext,
};
pub use network::NetworkCommsData;

#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    #[error("comms interface is in the wrong state for this operation")]
    InvalidState,
    #[error("could not bind {address}: {source}")]
    Bind { address: String, source: std::io::Error },
    #[error("could not connect to {address}: {source}")]
    Connect { address: String, source: std::io::Error },
    #[error("connection negotiation failed after {retries} attempts")]
    NegotiationFailed { retries: u32 },
    #[error("broker name does not match the broker connection")]
    NameNotFound,
    #[error("malformed network address: {0}")]
    BadAddress(String),
    #[error("codec failure: {0}")]
    Codec(#[from] metronome_core::command::CommandError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
