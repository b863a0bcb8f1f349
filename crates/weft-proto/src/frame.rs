//! Frame data model.

use bytes::Bytes;
use ciborium::value::Value;

use crate::{checksum::fnv1a64, errors::WireError, message_id::MessageId};

/// Current protocol version, carried in every frame.
pub const PROTOCOL_VERSION: u8 = 2;

/// Ordered text-to-CBOR-value mapping used for frame metadata.
///
/// Insertion order is preserved on the wire.
pub type Metadata = Vec<(String, Value)>;

/// Frame type discriminants, stable on the wire.
///
/// Value 2 is retired and must stay unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Handshake announcement with limits (and, on the plugin side, the
    /// cap manifest).
    Hello,
    /// Start of a request for a capability.
    Req,
    /// One chunk of streamed payload.
    Chunk,
    /// Terminal frame of a flow: the request or response is complete.
    End,
    /// Out-of-band log record attached to a flow.
    Log,
    /// Terminal failure of a flow, with `code`/`message` metadata.
    Err,
    /// Link-level keepalive; never sequenced, never routed.
    Heartbeat,
    /// Start of a payload stream within a flow.
    StreamStart,
    /// End of a payload stream; carries the sender's chunk count.
    StreamEnd,
    /// Relay control: cap manifest and limits announcement.
    RelayNotify,
    /// Relay control: opaque resource state pushed downstream.
    RelayState,
}

impl FrameType {
    /// Wire discriminant for this frame type.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Hello => 0,
            Self::Req => 1,
            Self::Chunk => 3,
            Self::End => 4,
            Self::Log => 5,
            Self::Err => 6,
            Self::Heartbeat => 7,
            Self::StreamStart => 8,
            Self::StreamEnd => 9,
            Self::RelayNotify => 10,
            Self::RelayState => 11,
        }
    }

    /// Frame type for a wire discriminant. `None` for unknown values,
    /// including the retired value 2.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Hello),
            1 => Some(Self::Req),
            3 => Some(Self::Chunk),
            4 => Some(Self::End),
            5 => Some(Self::Log),
            6 => Some(Self::Err),
            7 => Some(Self::Heartbeat),
            8 => Some(Self::StreamStart),
            9 => Some(Self::StreamEnd),
            10 => Some(Self::RelayNotify),
            11 => Some(Self::RelayState),
            _ => None,
        }
    }

    /// Whether frames of this type participate in per-flow sequencing.
    ///
    /// HELLO, HEARTBEAT, RELAY_NOTIFY and RELAY_STATE bypass sequencing
    /// and reorder buffering entirely.
    #[must_use]
    pub fn is_flow(self) -> bool {
        matches!(
            self,
            Self::Req
                | Self::Chunk
                | Self::End
                | Self::Log
                | Self::Err
                | Self::StreamStart
                | Self::StreamEnd
        )
    }

    /// Whether this type terminates its flow.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Err)
    }
}

/// A protocol frame.
///
/// `version`, `frame_type`, `id` and `seq` are mandatory on the wire;
/// everything else is optional and type-dependent. [`Frame::validate`]
/// enforces the per-type constraints (CHUNK needs `chunk_index` and
/// `checksum`, STREAM_END needs `chunk_count`); the codec applies it on
/// both encode and decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Protocol version, currently [`PROTOCOL_VERSION`].
    pub version: u8,
    /// Frame type.
    pub frame_type: FrameType,
    /// Request identifier (RID).
    pub id: MessageId,
    /// Per-flow sequence number; 0 for non-flow frames.
    pub seq: u64,
    /// Routing identifier (XID) stamped by the switch.
    pub routing_id: Option<MessageId>,
    /// Short stream label within a flow.
    pub stream_id: Option<String>,
    /// Media URN describing the payload stream.
    pub media_urn: Option<String>,
    /// Content type of the payload.
    pub content_type: Option<String>,
    /// Ordered metadata mapping.
    pub metadata: Option<Metadata>,
    /// Opaque payload bytes.
    pub payload: Option<Bytes>,
    /// Total stream length in bytes; first chunk only.
    pub total_len: Option<u64>,
    /// Byte offset of this chunk within its stream.
    pub offset: Option<u64>,
    /// Whether this frame ends its stream.
    pub eof: Option<bool>,
    /// Capability URN addressed by a REQ.
    pub cap_urn: Option<String>,
    /// Chunk index within the stream, starting at 0.
    pub chunk_index: Option<u64>,
    /// Sender's total chunk count, carried by STREAM_END.
    pub chunk_count: Option<u64>,
    /// FNV-1a-64 checksum of `payload`.
    pub checksum: Option<u64>,
}

impl Frame {
    /// Create a frame with the mandatory fields and nothing else.
    #[must_use]
    pub fn new(frame_type: FrameType, id: MessageId) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            id,
            seq: 0,
            routing_id: None,
            stream_id: None,
            media_urn: None,
            content_type: None,
            metadata: None,
            payload: None,
            total_len: None,
            offset: None,
            eof: None,
            cap_urn: None,
            chunk_index: None,
            chunk_count: None,
            checksum: None,
        }
    }

    /// HELLO frame with the given handshake metadata.
    #[must_use]
    pub fn hello(metadata: Metadata) -> Self {
        let mut frame = Self::new(FrameType::Hello, MessageId::HELLO);
        frame.metadata = Some(metadata);
        frame
    }

    /// REQ frame addressing a capability.
    #[must_use]
    pub fn req(id: MessageId, cap_urn: impl Into<String>) -> Self {
        let mut frame = Self::new(FrameType::Req, id);
        frame.cap_urn = Some(cap_urn.into());
        frame
    }

    /// STREAM_START frame for a flow.
    #[must_use]
    pub fn stream_start(id: MessageId) -> Self {
        Self::new(FrameType::StreamStart, id)
    }

    /// CHUNK frame carrying one payload piece; the checksum is computed
    /// here.
    #[must_use]
    pub fn chunk(id: MessageId, chunk_index: u64, payload: Bytes) -> Self {
        let mut frame = Self::new(FrameType::Chunk, id);
        frame.chunk_index = Some(chunk_index);
        frame.checksum = Some(fnv1a64(&payload));
        frame.payload = Some(payload);
        frame
    }

    /// STREAM_END frame with the sender's total chunk count.
    #[must_use]
    pub fn stream_end(id: MessageId, chunk_count: u64) -> Self {
        let mut frame = Self::new(FrameType::StreamEnd, id);
        frame.chunk_count = Some(chunk_count);
        frame
    }

    /// END frame terminating a flow.
    #[must_use]
    pub fn end(id: MessageId) -> Self {
        Self::new(FrameType::End, id)
    }

    /// ERR frame terminating a flow with `code`/`message` metadata.
    #[must_use]
    pub fn err(id: MessageId, code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut frame = Self::new(FrameType::Err, id);
        frame.metadata = Some(vec![
            ("code".to_string(), Value::Text(code.into())),
            ("message".to_string(), Value::Text(message.into())),
        ]);
        frame
    }

    /// LOG frame attached to a flow.
    #[must_use]
    pub fn log(id: MessageId, payload: Bytes) -> Self {
        let mut frame = Self::new(FrameType::Log, id);
        frame.payload = Some(payload);
        frame
    }

    /// HEARTBEAT keepalive frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, MessageId::HELLO)
    }

    /// RELAY_NOTIFY control frame with manifest/limit metadata.
    #[must_use]
    pub fn relay_notify(metadata: Metadata) -> Self {
        let mut frame = Self::new(FrameType::RelayNotify, MessageId::HELLO);
        frame.metadata = Some(metadata);
        frame
    }

    /// RELAY_STATE control frame carrying opaque state bytes.
    #[must_use]
    pub fn relay_state(payload: Bytes) -> Self {
        let mut frame = Self::new(FrameType::RelayState, MessageId::HELLO);
        frame.payload = Some(payload);
        frame
    }

    /// Set the routing identifier, builder style.
    #[must_use]
    pub fn with_routing_id(mut self, xid: MessageId) -> Self {
        self.routing_id = Some(xid);
        self
    }

    /// Set the sequence number, builder style.
    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Look up a metadata value by key.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Look up a text metadata value by key.
    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        match self.meta(key)? {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Insert or replace a metadata entry, preserving insertion order for
    /// new keys.
    pub fn meta_set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let metadata = self.metadata.get_or_insert_with(Vec::new);
        match metadata.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => metadata.push((key, value)),
        }
    }

    /// Whether this frame participates in per-flow sequencing.
    #[must_use]
    pub fn is_flow(&self) -> bool {
        self.frame_type.is_flow()
    }

    /// Whether this frame terminates its flow.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.frame_type.is_terminal()
    }

    /// Check the declared checksum against the payload.
    ///
    /// True when no checksum is declared or when it matches the payload
    /// (an absent payload hashes as empty).
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        match self.checksum {
            None => true,
            Some(declared) => {
                let payload = self.payload.as_deref().unwrap_or_default();
                fnv1a64(payload) == declared
            },
        }
    }

    /// Enforce per-type mandatory fields.
    ///
    /// # Errors
    ///
    /// [`WireError::MissingField`] when a CHUNK lacks `chunk_index` or
    /// `checksum`, or a STREAM_END lacks `chunk_count`.
    pub fn validate(&self) -> Result<(), WireError> {
        match self.frame_type {
            FrameType::Chunk => {
                if self.chunk_index.is_none() {
                    return Err(WireError::MissingField {
                        frame_type: self.frame_type,
                        field: "chunk_index",
                    });
                }
                if self.checksum.is_none() {
                    return Err(WireError::MissingField {
                        frame_type: self.frame_type,
                        field: "checksum",
                    });
                }
                Ok(())
            },
            FrameType::StreamEnd => {
                if self.chunk_count.is_none() {
                    return Err(WireError::MissingField {
                        frame_type: self.frame_type,
                        field: "chunk_count",
                    });
                }
                Ok(())
            },
            _ => Ok(()),
        }
    }
}
