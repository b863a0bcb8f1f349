//! Weft relay fabric.
//!
//! Connects an engine process to plugin hosts over bidirectional byte
//! pipes. Requests address capabilities by URN; the switch routes each
//! request flow to the host that registered a matching cap and tracks its
//! origin so responses (and failures) find their way back, whether the
//! caller was the engine or a peer host.
//!
//! # Components
//!
//! - [`SeqAssigner`] / [`ReorderBuffer`]: per-flow ordering at every
//!   output and input stage.
//! - [`handshake`]: HELLO/RELAY_NOTIFY exchange, limit negotiation, cap
//!   manifests.
//! - [`SlaveEndpoint`]: plugin-host side of one pipe, running two
//!   forwarding pumps plus relay-control interception.
//! - [`MasterEndpoint`]: the switch-side peer of a single slave.
//! - [`RelaySwitch`]: many masters, one cap-routing core.
//!
//! All pipes are embedder-supplied [`tokio::io`] halves; the fabric mandates
//! no sockets, CLI, or on-disk layout of its own.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod flow;
pub mod handshake;
pub mod identity;
mod master;
mod pipe;
mod reorder;
mod slave;
mod switch;

pub use error::RelayError;
pub use flow::{FlowKey, SeqAssigner};
pub use handshake::{HandshakeConfig, Manifest};
pub use master::MasterEndpoint;
pub use pipe::{BoxReader, BoxWriter, SocketPair};
pub use reorder::ReorderBuffer;
pub use slave::SlaveEndpoint;
pub use switch::{CODE_MASTER_DIED, CODE_UNKNOWN, RelaySwitch, SwitchConfig};
