//! Handshake: HELLO exchange, limit negotiation, cap manifests.
//!
//! Two roles share one wire shape. The initiator (engine or switch side)
//! sends its HELLO first; the responder (plugin side) replies with a
//! HELLO that additionally carries its cap manifest. Both compute the
//! component-wise minimum of the announced limits and install it on
//! their codec halves. RELAY_NOTIFY frames reuse the same metadata
//! layout; for cap and limit learning they are a plugin HELLO by another
//! name.

use std::time::Duration;

use ciborium::value::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use weft_caps::CapUrn;
use weft_proto::{
    Frame, FrameReader, FrameType, FrameWriter, Limits, META_MANIFEST, META_VERSION, Metadata,
    PROTOCOL_VERSION,
};

use crate::{error::RelayError, identity::identity_cap};

/// Time allowed to complete a handshake or identity verification.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handshake configuration.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { timeout: DEFAULT_HANDSHAKE_TIMEOUT }
    }
}

/// A plugin host's capability manifest: the cap URNs it serves.
///
/// On the wire this is a JSON-encoded array of strings inside the
/// `manifest` metadata key. Parsing validates every URN and requires one
/// that conforms to the identity cap: a host that cannot be verified is
/// rejected before it is ever routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    urns: Vec<String>,
    caps: Vec<CapUrn>,
}

impl Manifest {
    /// Build a manifest from cap-URN strings.
    ///
    /// # Errors
    ///
    /// [`RelayError::Urn`] on a malformed entry, [`RelayError::Protocol`]
    /// when no entry conforms to the identity cap.
    pub fn new(urns: Vec<String>) -> Result<Self, RelayError> {
        let caps =
            urns.iter().map(|urn| CapUrn::parse(urn)).collect::<Result<Vec<_>, _>>()?;

        let identity = identity_cap();
        if !caps.iter().any(|cap| cap.conforms_to(&identity)) {
            return Err(RelayError::Protocol(format!(
                "manifest of {} caps is missing the identity cap",
                caps.len()
            )));
        }

        Ok(Self { urns, caps })
    }

    /// Parse a manifest from its JSON wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self, RelayError> {
        let urns: Vec<String> = serde_json::from_slice(bytes)
            .map_err(|e| RelayError::Protocol(format!("manifest is not a json array: {e}")))?;
        Self::new(urns)
    }

    /// Render the manifest to its JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>, RelayError> {
        serde_json::to_vec(&self.urns)
            .map_err(|e| RelayError::Protocol(format!("manifest encode failed: {e}")))
    }

    /// The cap URNs as announced, in order.
    #[must_use]
    pub fn urns(&self) -> &[String] {
        &self.urns
    }

    /// The parsed caps, parallel to [`Manifest::urns`].
    #[must_use]
    pub fn caps(&self) -> &[CapUrn] {
        &self.caps
    }
}

/// Metadata for a HELLO or RELAY_NOTIFY: limits, version, and optionally
/// the manifest.
fn announcement_meta(limits: Limits, manifest: Option<&Manifest>) -> Result<Metadata, RelayError> {
    let mut meta = limits.to_meta();
    meta.push((META_VERSION.to_string(), Value::Integer(PROTOCOL_VERSION.into())));
    if let Some(manifest) = manifest {
        meta.push((META_MANIFEST.to_string(), Value::Bytes(manifest.to_json()?)));
    }
    Ok(meta)
}

/// Build a HELLO frame announcing `limits` (and, on the plugin side, the
/// manifest).
pub fn hello_frame(limits: Limits, manifest: Option<&Manifest>) -> Result<Frame, RelayError> {
    Ok(Frame::hello(announcement_meta(limits, manifest)?))
}

/// Build a RELAY_NOTIFY frame announcing `limits` and the manifest.
pub fn notify_frame(limits: Limits, manifest: &Manifest) -> Result<Frame, RelayError> {
    Ok(Frame::relay_notify(announcement_meta(limits, Some(manifest))?))
}

/// Extract limits and (optionally) the manifest from a HELLO or
/// RELAY_NOTIFY frame.
///
/// # Errors
///
/// [`RelayError::Handshake`] when a limit key is missing, the manifest is
/// required but absent, or the metadata is malformed.
pub fn parse_announcement(
    frame: &Frame,
    require_manifest: bool,
) -> Result<(Limits, Option<Manifest>), RelayError> {
    let meta = frame
        .metadata
        .as_deref()
        .ok_or_else(|| RelayError::Handshake("announcement carries no metadata".to_string()))?;

    let limits = Limits::from_meta(meta).ok_or_else(|| {
        RelayError::Handshake("announcement is missing a limit key".to_string())
    })?;

    let announced_version = frame.meta(META_VERSION).and_then(|value| match value {
        Value::Integer(version) => u64::try_from(*version).ok(),
        _ => None,
    });
    if announced_version != Some(u64::from(PROTOCOL_VERSION)) {
        tracing::warn!(?announced_version, "peer announced an unexpected protocol version");
    }

    let manifest = match frame.meta(META_MANIFEST) {
        Some(Value::Bytes(bytes)) => Some(Manifest::from_json(bytes)?),
        Some(_) => {
            return Err(RelayError::Handshake("manifest is not a byte string".to_string()));
        },
        None if require_manifest => {
            return Err(RelayError::Handshake("announcement is missing the manifest".to_string()));
        },
        None => None,
    };

    Ok((limits, manifest))
}

/// Await one frame of the given type, failing the handshake otherwise.
async fn expect_frame<R>(
    reader: &mut FrameReader<R>,
    wanted: FrameType,
) -> Result<Frame, RelayError>
where
    R: AsyncRead + Unpin,
{
    let frame = reader
        .read_frame()
        .await?
        .ok_or_else(|| RelayError::Handshake(format!("peer closed before {wanted:?}")))?;

    if frame.frame_type != wanted {
        return Err(RelayError::Handshake(format!(
            "expected {wanted:?} as first frame, got {:?}",
            frame.frame_type
        )));
    }
    Ok(frame)
}

/// Run the initiator side: send HELLO, await the plugin HELLO with its
/// manifest, negotiate limits and install them on both codec halves.
///
/// Returns the negotiated limits and the peer's manifest.
pub async fn initiate<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local: Limits,
    config: &HandshakeConfig,
) -> Result<(Limits, Manifest), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        writer.write_frame(&hello_frame(local, None)?).await?;

        let reply = expect_frame(reader, FrameType::Hello).await?;
        let (peer_limits, manifest) = parse_announcement(&reply, true)?;
        let manifest = manifest
            .ok_or_else(|| RelayError::Handshake("announcement is missing the manifest".to_string()))?;

        let negotiated = local.negotiate(peer_limits);
        reader.limits().set(negotiated).await;
        writer.limits().set(negotiated).await;

        tracing::debug!(?negotiated, caps = manifest.urns().len(), "handshake complete");
        Ok((negotiated, manifest))
    };

    tokio::time::timeout(config.timeout, exchange)
        .await
        .map_err(|_| RelayError::Handshake("handshake timed out".to_string()))?
}

/// Run the responder (plugin) side: await the initiator HELLO, reply with
/// HELLO plus manifest, negotiate limits and install them on both codec
/// halves.
pub async fn respond<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local: Limits,
    manifest: &Manifest,
    config: &HandshakeConfig,
) -> Result<Limits, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        let hello = expect_frame(reader, FrameType::Hello).await?;
        let (peer_limits, _) = parse_announcement(&hello, false)?;

        writer.write_frame(&hello_frame(local, Some(manifest))?).await?;

        let negotiated = local.negotiate(peer_limits);
        reader.limits().set(negotiated).await;
        writer.limits().set(negotiated).await;

        tracing::debug!(?negotiated, "handshake complete");
        Ok(negotiated)
    };

    tokio::time::timeout(config.timeout, exchange)
        .await
        .map_err(|_| RelayError::Handshake("handshake timed out".to_string()))?
}
