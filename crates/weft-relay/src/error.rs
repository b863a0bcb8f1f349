//! Relay error types.

use thiserror::Error;
use weft_caps::UrnError;
use weft_proto::{MessageId, WireError};

use crate::flow::FlowKey;

/// Errors produced by the relay fabric.
///
/// Propagation policy: codec errors fail the call that hit them; reorder
/// protocol errors abort the reader task for that connection (treated as
/// master death); routing errors on the engine API are returned to the
/// caller; routing errors while forwarding on behalf of a peer master are
/// converted into an ERR frame back to that peer.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Wire codec failure (I/O, size limit, encode/decode).
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Cap or media URN failed to parse.
    #[error(transparent)]
    Urn(#[from] UrnError),

    /// A flow frame arrived with a sequence number already consumed or
    /// already buffered.
    #[error("stale or duplicate frame on flow {flow}: seq {seq}, expected {expected}")]
    StaleFrame {
        /// The flow the frame belongs to
        flow: FlowKey,
        /// Sequence number of the offending frame
        seq: u64,
        /// Next sequence number the buffer would accept
        expected: u64,
    },

    /// A flow exceeded its reorder budget.
    #[error(
        "reorder buffer overflow on flow {flow}: {buffered} frames buffered, \
         expected seq {expected}, got {seq}"
    )]
    ReorderOverflow {
        /// The flow the frame belongs to
        flow: FlowKey,
        /// Frames already buffered for this flow
        buffered: usize,
        /// Next sequence number the buffer would accept
        expected: u64,
        /// Sequence number of the offending frame
        seq: u64,
    },

    /// Peer violated the protocol: nonce mismatch during identity
    /// verification, a manifest without the identity cap, a REQ from a
    /// plugin host carrying a routing id, an unexpected frame type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake failed: missing limit keys, missing manifest on the
    /// plugin side, wrong first-frame type, or timeout.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No registered capability matches the request URN.
    #[error("no handler for capability {0}")]
    NoHandler(String),

    /// Continuation frame for a request with no routing entry.
    #[error("no routing entry for request {0}")]
    UnknownRequest(MessageId),

    /// Every master in the switch is marked dead.
    #[error("all masters are unhealthy")]
    AllMastersUnhealthy,
}
