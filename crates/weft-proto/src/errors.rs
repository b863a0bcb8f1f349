//! Wire-level error types.

use thiserror::Error;

use crate::frame::FrameType;

/// Errors produced by the frame codec.
#[derive(Error, Debug)]
pub enum WireError {
    /// Pipe read or write failed, including unexpected EOF mid-frame.
    ///
    /// A clean EOF at a frame boundary is not an error: the reader
    /// reports it as "no frame".
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Declared or encoded frame length exceeds the current budget.
    ///
    /// The budget is the smaller of the negotiated `max_frame` and the
    /// hard 16 MiB ceiling.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Offending frame length in bytes
        len: usize,
        /// The budget that was exceeded
        max: usize,
    },

    /// CBOR serialization failed.
    #[error("frame encode failed: {0}")]
    Encode(String),

    /// CBOR was structurally wrong: not a map, bad key or value shape,
    /// missing mandatory field, unknown frame type.
    #[error("frame decode failed: {0}")]
    Decode(String),

    /// A per-type mandatory field was absent.
    #[error("{frame_type:?} frame is missing mandatory field `{field}`")]
    MissingField {
        /// Frame type whose constraint was violated
        frame_type: FrameType,
        /// The absent field
        field: &'static str,
    },
}
