//! Protocol limits and their negotiation.

use ciborium::value::Value;

/// Hard ceiling on any single encoded frame, regardless of negotiation.
pub const HARD_FRAME_CEILING: usize = 16 * 1024 * 1024;

/// Metadata key carrying `max_frame` in HELLO and RELAY_NOTIFY frames.
pub const META_MAX_FRAME: &str = "max_frame";

/// Metadata key carrying `max_chunk` in HELLO and RELAY_NOTIFY frames.
pub const META_MAX_CHUNK: &str = "max_chunk";

/// Metadata key carrying `max_reorder_buffer` in HELLO and RELAY_NOTIFY
/// frames.
pub const META_MAX_REORDER_BUFFER: &str = "max_reorder_buffer";

/// Metadata key carrying the protocol version in HELLO and RELAY_NOTIFY
/// frames.
pub const META_VERSION: &str = "version";

/// Metadata key carrying the JSON-encoded cap manifest.
pub const META_MANIFEST: &str = "manifest";

/// Negotiable protocol limits.
///
/// Both sides of a pipe announce their limits during the handshake; the
/// effective value is the component-wise minimum. [`HARD_FRAME_CEILING`]
/// applies on top of whatever is negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted encoded frame, in bytes.
    pub max_frame: u64,
    /// Largest accepted CHUNK payload, in bytes.
    pub max_chunk: u64,
    /// Most out-of-order frames buffered per flow before overflow.
    pub max_reorder_buffer: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame: 3_670_016,    // 3.5 MiB
            max_chunk: 262_144,      // 256 KiB
            max_reorder_buffer: 64,  // frames
        }
    }
}

impl Limits {
    /// Component-wise minimum of two limit sets.
    ///
    /// Commutative and idempotent; both sides compute the same effective
    /// limits from the same exchange.
    #[must_use]
    pub fn negotiate(self, other: Self) -> Self {
        Self {
            max_frame: self.max_frame.min(other.max_frame),
            max_chunk: self.max_chunk.min(other.max_chunk),
            max_reorder_buffer: self.max_reorder_buffer.min(other.max_reorder_buffer),
        }
    }

    /// The frame-size budget currently in force: the negotiated
    /// `max_frame` capped by [`HARD_FRAME_CEILING`].
    #[must_use]
    pub fn frame_budget(&self) -> usize {
        usize::try_from(self.max_frame).map_or(HARD_FRAME_CEILING, |v| v.min(HARD_FRAME_CEILING))
    }

    /// Render the three limit keys as handshake metadata entries.
    #[must_use]
    pub fn to_meta(&self) -> Vec<(String, Value)> {
        vec![
            (META_MAX_FRAME.to_string(), Value::Integer(self.max_frame.into())),
            (META_MAX_CHUNK.to_string(), Value::Integer(self.max_chunk.into())),
            (META_MAX_REORDER_BUFFER.to_string(), Value::Integer(self.max_reorder_buffer.into())),
        ]
    }

    /// Extract limits from handshake metadata entries.
    ///
    /// Returns `None` when any of the three keys is absent or not an
    /// unsigned integer; the handshake treats that as fatal.
    #[must_use]
    pub fn from_meta(meta: &[(String, Value)]) -> Option<Self> {
        let lookup = |key: &str| {
            meta.iter().find(|(k, _)| k == key).and_then(|(_, v)| match v {
                Value::Integer(i) => u64::try_from(*i).ok(),
                _ => None,
            })
        };

        Some(Self {
            max_frame: lookup(META_MAX_FRAME)?,
            max_chunk: lookup(META_MAX_CHUNK)?,
            max_reorder_buffer: lookup(META_MAX_REORDER_BUFFER)?,
        })
    }
}
