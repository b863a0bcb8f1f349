//! Length-prefixed CBOR codec.
//!
//! The outermost wire unit is `4-byte big-endian length || CBOR bytes`.
//! The CBOR document is a map with small unsigned-integer keys; unknown
//! keys are ignored so newer peers can add fields without breaking older
//! readers. The mandatory fields (`version`, `type`, `id`) and the
//! per-type constraints from [`Frame::validate`] are enforced on both
//! directions.
//!
//! Readers and writers are independent instances sharing a
//! [`SharedLimits`] handle; the handshake installs the negotiated limits
//! on both halves of an endpoint through that handle.

use std::{io, sync::Arc};

use bytes::Bytes;
use ciborium::value::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::{
    errors::WireError,
    frame::{Frame, FrameType, Metadata},
    limits::Limits,
    message_id::MessageId,
};

// Wire map keys. Stable; do not renumber.
const KEY_VERSION: u8 = 0;
const KEY_TYPE: u8 = 1;
const KEY_ID: u8 = 2;
const KEY_SEQ: u8 = 3;
const KEY_CONTENT_TYPE: u8 = 4;
const KEY_META: u8 = 5;
const KEY_PAYLOAD: u8 = 6;
const KEY_LEN: u8 = 7;
const KEY_OFFSET: u8 = 8;
const KEY_EOF: u8 = 9;
const KEY_CAP: u8 = 10;
const KEY_STREAM_ID: u8 = 11;
const KEY_MEDIA_URN: u8 = 12;
const KEY_ROUTING_ID: u8 = 13;
const KEY_CHUNK_INDEX: u8 = 14;
const KEY_CHUNK_COUNT: u8 = 15;
const KEY_CHECKSUM: u8 = 16;

/// Limits shared between the reader and writer of one endpoint.
///
/// Cheap to clone; the handshake calls [`SharedLimits::set`] once the
/// negotiated values are known and both codec halves pick them up on
/// their next frame.
#[derive(Debug, Clone)]
pub struct SharedLimits {
    inner: Arc<Mutex<Limits>>,
}

impl SharedLimits {
    /// Create a handle holding the given limits.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        Self { inner: Arc::new(Mutex::new(limits)) }
    }

    /// Current limits.
    pub async fn get(&self) -> Limits {
        *self.inner.lock().await
    }

    /// Install new limits; subsequent frames are checked against them.
    pub async fn set(&self, limits: Limits) {
        *self.inner.lock().await = limits;
    }
}

impl Default for SharedLimits {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

/// Encode a frame to its CBOR document (without the length prefix).
///
/// # Errors
///
/// Per-type constraint violations ([`WireError::MissingField`]) and CBOR
/// serialization failures.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    frame.validate()?;

    let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(8);
    let mut put = |key: u8, value: Value| pairs.push((Value::Integer(key.into()), value));

    put(KEY_VERSION, Value::Integer(frame.version.into()));
    put(KEY_TYPE, Value::Integer(frame.frame_type.to_u8().into()));
    put(KEY_ID, id_to_value(frame.id));
    put(KEY_SEQ, Value::Integer(frame.seq.into()));
    if let Some(content_type) = &frame.content_type {
        put(KEY_CONTENT_TYPE, Value::Text(content_type.clone()));
    }
    if let Some(metadata) = &frame.metadata {
        put(KEY_META, meta_to_value(metadata));
    }
    if let Some(payload) = &frame.payload {
        put(KEY_PAYLOAD, Value::Bytes(payload.to_vec()));
    }
    if let Some(total_len) = frame.total_len {
        put(KEY_LEN, Value::Integer(total_len.into()));
    }
    if let Some(offset) = frame.offset {
        put(KEY_OFFSET, Value::Integer(offset.into()));
    }
    if let Some(eof) = frame.eof {
        put(KEY_EOF, Value::Bool(eof));
    }
    if let Some(cap_urn) = &frame.cap_urn {
        put(KEY_CAP, Value::Text(cap_urn.clone()));
    }
    if let Some(stream_id) = &frame.stream_id {
        put(KEY_STREAM_ID, Value::Text(stream_id.clone()));
    }
    if let Some(media_urn) = &frame.media_urn {
        put(KEY_MEDIA_URN, Value::Text(media_urn.clone()));
    }
    if let Some(routing_id) = frame.routing_id {
        put(KEY_ROUTING_ID, id_to_value(routing_id));
    }
    if let Some(chunk_index) = frame.chunk_index {
        put(KEY_CHUNK_INDEX, Value::Integer(chunk_index.into()));
    }
    if let Some(chunk_count) = frame.chunk_count {
        put(KEY_CHUNK_COUNT, Value::Integer(chunk_count.into()));
    }
    if let Some(checksum) = frame.checksum {
        put(KEY_CHECKSUM, Value::Integer(checksum.into()));
    }

    let mut buf = Vec::new();
    ciborium::ser::into_writer(&Value::Map(pairs), &mut buf)
        .map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a frame from its CBOR document (without the length prefix).
///
/// Lenient about unknown keys; strict about the mandatory fields and the
/// per-type constraints.
///
/// # Errors
///
/// [`WireError::Decode`] on malformed CBOR or missing mandatory fields,
/// [`WireError::MissingField`] on per-type violations.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    let doc: Value =
        ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))?;
    let Value::Map(pairs) = doc else {
        return Err(WireError::Decode("frame document is not a map".to_string()));
    };

    let mut version = None;
    let mut type_code = None;
    let mut id = None;
    let mut seq = 0;
    let mut frame = Frame::new(FrameType::Hello, MessageId::HELLO);

    for (key, value) in pairs {
        let Value::Integer(key) = key else {
            continue; // unknown key shape, skip
        };
        let Ok(key) = u8::try_from(key) else {
            continue;
        };
        match key {
            KEY_VERSION => version = Some(expect_u8(&value, "version")?),
            KEY_TYPE => type_code = Some(expect_u8(&value, "type")?),
            KEY_ID => id = Some(id_from_value(&value)?),
            KEY_SEQ => seq = expect_u64(&value, "seq")?,
            KEY_CONTENT_TYPE => frame.content_type = Some(expect_text(value, "content-type")?),
            KEY_META => frame.metadata = Some(meta_from_value(value)?),
            KEY_PAYLOAD => frame.payload = Some(expect_bytes(value, "payload")?),
            KEY_LEN => frame.total_len = Some(expect_u64(&value, "len")?),
            KEY_OFFSET => frame.offset = Some(expect_u64(&value, "offset")?),
            KEY_EOF => frame.eof = Some(expect_bool(&value, "eof")?),
            KEY_CAP => frame.cap_urn = Some(expect_text(value, "cap")?),
            KEY_STREAM_ID => frame.stream_id = Some(expect_text(value, "stream-id")?),
            KEY_MEDIA_URN => frame.media_urn = Some(expect_text(value, "media-urn")?),
            KEY_ROUTING_ID => frame.routing_id = Some(id_from_value(&value)?),
            KEY_CHUNK_INDEX => frame.chunk_index = Some(expect_u64(&value, "chunk-index")?),
            KEY_CHUNK_COUNT => frame.chunk_count = Some(expect_u64(&value, "chunk-count")?),
            KEY_CHECKSUM => frame.checksum = Some(expect_u64(&value, "checksum")?),
            _ => {}, // unknown key, skip
        }
    }

    frame.version =
        version.ok_or_else(|| WireError::Decode("missing mandatory field `version`".to_string()))?;
    let type_code =
        type_code.ok_or_else(|| WireError::Decode("missing mandatory field `type`".to_string()))?;
    frame.frame_type = FrameType::from_u8(type_code)
        .ok_or_else(|| WireError::Decode(format!("unknown frame type {type_code}")))?;
    frame.id = id.ok_or_else(|| WireError::Decode("missing mandatory field `id`".to_string()))?;
    frame.seq = seq;

    frame.validate()?;
    Ok(frame)
}

fn id_to_value(id: MessageId) -> Value {
    match id {
        MessageId::Opaque(bytes) => Value::Bytes(bytes.to_vec()),
        MessageId::Int(value) => Value::Integer(value.into()),
    }
}

fn id_from_value(value: &Value) -> Result<MessageId, WireError> {
    match value {
        Value::Bytes(bytes) => {
            let bytes: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
                WireError::Decode(format!("opaque id must be 16 bytes, got {}", bytes.len()))
            })?;
            Ok(MessageId::Opaque(bytes))
        },
        Value::Integer(i) => u64::try_from(*i)
            .map(MessageId::Int)
            .map_err(|_| WireError::Decode("integer id out of range".to_string())),
        _ => Err(WireError::Decode("id is neither bytes nor integer".to_string())),
    }
}

fn meta_to_value(metadata: &Metadata) -> Value {
    Value::Map(metadata.iter().map(|(k, v)| (Value::Text(k.clone()), v.clone())).collect())
}

fn meta_from_value(value: Value) -> Result<Metadata, WireError> {
    let Value::Map(pairs) = value else {
        return Err(WireError::Decode("meta is not a map".to_string()));
    };
    pairs
        .into_iter()
        .map(|(key, value)| match key {
            Value::Text(key) => Ok((key, value)),
            _ => Err(WireError::Decode("meta key is not text".to_string())),
        })
        .collect()
}

fn expect_u64(value: &Value, field: &str) -> Result<u64, WireError> {
    match value {
        Value::Integer(i) => u64::try_from(*i)
            .map_err(|_| WireError::Decode(format!("field `{field}` out of u64 range"))),
        _ => Err(WireError::Decode(format!("field `{field}` is not an integer"))),
    }
}

fn expect_u8(value: &Value, field: &str) -> Result<u8, WireError> {
    let wide = expect_u64(value, field)?;
    u8::try_from(wide).map_err(|_| WireError::Decode(format!("field `{field}` out of u8 range")))
}

fn expect_text(value: Value, field: &str) -> Result<String, WireError> {
    match value {
        Value::Text(text) => Ok(text),
        _ => Err(WireError::Decode(format!("field `{field}` is not text"))),
    }
}

fn expect_bytes(value: Value, field: &str) -> Result<Bytes, WireError> {
    match value {
        Value::Bytes(bytes) => Ok(Bytes::from(bytes)),
        _ => Err(WireError::Decode(format!("field `{field}` is not a byte string"))),
    }
}

fn expect_bool(value: &Value, field: &str) -> Result<bool, WireError> {
    match value {
        Value::Bool(b) => Ok(*b),
        _ => Err(WireError::Decode(format!("field `{field}` is not a bool"))),
    }
}

/// Writing half of the codec.
pub struct FrameWriter<W> {
    writer: W,
    limits: SharedLimits,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    /// Wrap a write half with a limits handle.
    pub fn new(writer: W, limits: SharedLimits) -> Self {
        Self { writer, limits }
    }

    /// Encode and write one frame, then flush.
    ///
    /// # Errors
    ///
    /// [`WireError::FrameTooLarge`] when the encoded frame exceeds the
    /// current budget, plus encode and I/O errors.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), WireError> {
        let body = encode_frame(frame)?;
        let budget = self.limits.get().await.frame_budget();
        if body.len() > budget {
            return Err(WireError::FrameTooLarge { len: body.len(), max: budget });
        }

        self.writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the underlying write half, propagating EOF to the peer.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// The limits handle shared with this endpoint's reader.
    #[must_use]
    pub fn limits(&self) -> &SharedLimits {
        &self.limits
    }
}

/// Reading half of the codec.
pub struct FrameReader<R> {
    reader: R,
    limits: SharedLimits,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap a read half with a limits handle.
    pub fn new(reader: R, limits: SharedLimits) -> Self {
        Self { reader, limits }
    }

    /// Read one frame.
    ///
    /// Returns `Ok(None)` on a clean EOF (zero bytes at the start of the
    /// length prefix). EOF anywhere else is an
    /// [`io::ErrorKind::UnexpectedEof`] error.
    ///
    /// # Errors
    ///
    /// [`WireError::FrameTooLarge`] when the declared length exceeds the
    /// current budget, plus decode and I/O errors.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, WireError> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self.reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(WireError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside length prefix",
                )));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let budget = self.limits.get().await.frame_budget();
        if len > budget {
            return Err(WireError::FrameTooLarge { len, max: budget });
        }

        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;
        decode_frame(&body).map(Some)
    }

    /// The limits handle shared with this endpoint's writer.
    #[must_use]
    pub fn limits(&self) -> &SharedLimits {
        &self.limits
    }
}
