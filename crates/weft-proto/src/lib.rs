//! Weft wire protocol.
//!
//! The on-pipe unit is a length-prefixed CBOR frame: a 4-byte big-endian
//! length followed by a CBOR map whose keys are small unsigned integers.
//! This crate owns the frame data model ([`Frame`], [`FrameType`],
//! [`MessageId`]), the codec ([`FrameReader`], [`FrameWriter`]), protocol
//! limits and their negotiation ([`Limits`]), and the FNV-1a-64 payload
//! checksum.
//!
//! The codec is deliberately dumb: it enforces structural validity
//! (mandatory fields, per-type constraints, size limits) and nothing
//! else. Flow ordering, routing, and handshake semantics live in
//! `weft-relay`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod errors;
mod frame;
mod limits;
mod message_id;
mod wire;

pub use checksum::fnv1a64;
pub use errors::WireError;
pub use frame::{Frame, FrameType, Metadata, PROTOCOL_VERSION};
pub use limits::{
    HARD_FRAME_CEILING, Limits, META_MANIFEST, META_MAX_CHUNK, META_MAX_FRAME,
    META_MAX_REORDER_BUFFER, META_VERSION,
};
pub use message_id::MessageId;
pub use wire::{FrameReader, FrameWriter, SharedLimits, decode_frame, encode_frame};
