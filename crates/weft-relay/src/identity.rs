//! The mandatory identity capability.
//!
//! Every plugin host must serve the fully generic capability: the switch
//! uses it to verify a newly connected host by round-tripping a nonce
//! before any routing table learns about the connection. Handlers simply
//! echo the request's accumulated CHUNK payload back as a single stream.

use bytes::Bytes;
use weft_caps::CapUrn;
use weft_proto::{Frame, MessageId};

/// URN of the capability every host must serve.
pub const IDENTITY_CAP: &str = "cap:in=media:;out=media:";

/// The identity capability as a parsed pattern.
#[must_use]
pub fn identity_cap() -> CapUrn {
    CapUrn::generic()
}

/// Build the echo response for an identity request.
///
/// Produces STREAM_START, CHUNK (the echoed bytes, checksummed),
/// STREAM_END, and END, each carrying the request's RID and, when given,
/// its XID. The caller stamps sequence numbers through its output
/// stage's assigner before writing.
#[must_use]
pub fn echo_frames(rid: MessageId, xid: Option<MessageId>, payload: Bytes) -> Vec<Frame> {
    let stamp = |frame: Frame| match xid {
        Some(xid) => frame.with_routing_id(xid),
        None => frame,
    };

    vec![
        stamp(Frame::stream_start(rid)),
        stamp(Frame::chunk(rid, 0, payload)),
        stamp(Frame::stream_end(rid, 1)),
        stamp(Frame::end(rid)),
    ]
}
