//! Master endpoint: the switch-side peer of a single slave.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use weft_proto::{Frame, FrameReader, FrameType, FrameWriter, Limits};

use crate::{
    error::RelayError,
    flow::FlowKey,
    handshake::{Manifest, parse_announcement},
    reorder::ReorderBuffer,
};

/// Single-master relay consumer.
///
/// Learns the peer's caps and limits from its initial RELAY_NOTIFY,
/// keeps both up to date as the host re-announces, and hands ordered
/// frames to the caller one per [`MasterEndpoint::read_frame`] call.
/// For a multi-master fabric use [`crate::RelaySwitch`] instead.
#[derive(Debug)]
pub struct MasterEndpoint {
    manifest: Manifest,
    limits: Limits,
    local_limits: Limits,
    reorder: ReorderBuffer,
    ready: VecDeque<Frame>,
}

impl MasterEndpoint {
    /// Block until the initial RELAY_NOTIFY arrives, then build the
    /// endpoint around its manifest and limits.
    ///
    /// The negotiated limits (local minimum peer) are installed on the
    /// reader's shared handle, so a writer sharing it is covered too.
    ///
    /// # Errors
    ///
    /// [`RelayError::Handshake`] when the peer closes first or its first
    /// frame is not a RELAY_NOTIFY.
    pub async fn connect<R>(reader: &mut FrameReader<R>) -> Result<Self, RelayError>
    where
        R: AsyncRead + Unpin,
    {
        let frame = reader.read_frame().await?.ok_or_else(|| {
            RelayError::Handshake("peer closed before relay notify".to_string())
        })?;
        if frame.frame_type != FrameType::RelayNotify {
            return Err(RelayError::Handshake(format!(
                "expected RelayNotify as first frame, got {:?}",
                frame.frame_type
            )));
        }

        let (peer_limits, manifest) = parse_announcement(&frame, true)?;
        let manifest = manifest.ok_or_else(|| {
            RelayError::Handshake("announcement is missing the manifest".to_string())
        })?;

        let local_limits = reader.limits().get().await;
        let negotiated = local_limits.negotiate(peer_limits);
        reader.limits().set(negotiated).await;

        tracing::info!(caps = manifest.urns().len(), ?negotiated, "master connected");

        Ok(Self {
            manifest,
            limits: peer_limits,
            local_limits,
            reorder: ReorderBuffer::new(negotiated.max_reorder_buffer as usize),
            ready: VecDeque::new(),
        })
    }

    /// Read the next ordered frame.
    ///
    /// RELAY_NOTIFY frames are intercepted to refresh the stored
    /// manifest and limits and never surface. When the reorder buffer
    /// releases several frames at once they are queued and returned one
    /// per call. `Ok(None)` on clean EOF.
    pub async fn read_frame<R>(
        &mut self,
        reader: &mut FrameReader<R>,
    ) -> Result<Option<Frame>, RelayError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let Some(frame) = reader.read_frame().await? else {
                return Ok(None);
            };

            if frame.frame_type == FrameType::RelayNotify {
                let (peer_limits, manifest) = parse_announcement(&frame, true)?;
                if let Some(manifest) = manifest {
                    tracing::debug!(caps = manifest.urns().len(), "cap set refreshed");
                    self.manifest = manifest;
                }
                self.limits = peer_limits;
                reader.limits().set(self.local_limits.negotiate(peer_limits)).await;
                continue;
            }

            for ready in self.reorder.accept(frame)? {
                if ready.is_terminal() {
                    if let Some(key) = FlowKey::of(&ready) {
                        self.reorder.cleanup(&key);
                    }
                }
                self.ready.push_back(ready);
            }
        }
    }

    /// Write a RELAY_STATE frame carrying `state` downstream.
    pub async fn send_state<W>(
        writer: &mut FrameWriter<W>,
        state: &[u8],
    ) -> Result<(), RelayError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_frame(&Frame::relay_state(Bytes::copy_from_slice(state))).await?;
        Ok(())
    }

    /// The peer's last-announced manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The peer's last-announced limits.
    #[must_use]
    pub fn limits(&self) -> Limits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use weft_proto::{MessageId, SharedLimits};

    use super::*;
    use crate::{handshake::notify_frame, identity::IDENTITY_CAP};

    fn manifest(extra: &[&str]) -> Manifest {
        let mut urns = vec![IDENTITY_CAP.to_string()];
        urns.extend(extra.iter().map(ToString::to_string));
        Manifest::new(urns).unwrap()
    }

    fn pipes() -> (
        FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    ) {
        let (slave_side, master_side) = tokio::io::duplex(1 << 16);
        let (_, sw) = tokio::io::split(slave_side);
        let (mr, _) = tokio::io::split(master_side);
        (FrameWriter::new(sw, SharedLimits::default()), FrameReader::new(mr, SharedLimits::default()))
    }

    #[tokio::test]
    async fn connect_blocks_for_the_initial_notify() {
        let (mut slave, mut reader) = pipes();

        let limits = Limits { max_frame: 1 << 20, max_chunk: 1 << 10, max_reorder_buffer: 8 };
        slave.write_frame(&notify_frame(limits, &manifest(&[])).unwrap()).await.unwrap();

        let endpoint = MasterEndpoint::connect(&mut reader).await.unwrap();
        assert_eq!(endpoint.limits(), limits);
        assert_eq!(endpoint.manifest().urns(), [IDENTITY_CAP]);

        // Negotiated limits landed on the reader's shared handle.
        assert_eq!(reader.limits().get().await, Limits::default().negotiate(limits));
    }

    #[tokio::test]
    async fn connect_rejects_other_first_frames() {
        let (mut slave, mut reader) = pipes();
        slave.write_frame(&Frame::heartbeat()).await.unwrap();

        let err = MasterEndpoint::connect(&mut reader).await.unwrap_err();
        assert!(matches!(err, RelayError::Handshake(_)));
    }

    #[tokio::test]
    async fn notify_refreshes_without_surfacing() {
        let (mut slave, mut reader) = pipes();
        slave
            .write_frame(&notify_frame(Limits::default(), &manifest(&[])).unwrap())
            .await
            .unwrap();

        let mut endpoint = MasterEndpoint::connect(&mut reader).await.unwrap();

        let refreshed = manifest(&["cap:in=media:;out=media:pdf"]);
        slave
            .write_frame(&notify_frame(Limits::default(), &refreshed).unwrap())
            .await
            .unwrap();
        let rid = MessageId::Opaque([2; 16]);
        slave.write_frame(&Frame::end(rid)).await.unwrap();

        let frame = endpoint.read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::End);
        assert_eq!(endpoint.manifest().urns().len(), 2);
    }

    #[tokio::test]
    async fn drains_reordered_frames_one_per_call() {
        let (mut slave, mut reader) = pipes();
        slave
            .write_frame(&notify_frame(Limits::default(), &manifest(&[])).unwrap())
            .await
            .unwrap();

        let mut endpoint = MasterEndpoint::connect(&mut reader).await.unwrap();

        let rid = MessageId::Opaque([3; 16]);
        let chunk =
            Frame::chunk(rid, 0, Bytes::from_static(b"hi")).with_seq(0);
        let end = Frame::end(rid).with_seq(1);

        // Out of order on the wire; in order out of the endpoint.
        slave.write_frame(&end).await.unwrap();
        slave.write_frame(&chunk).await.unwrap();

        let first = endpoint.read_frame(&mut reader).await.unwrap().unwrap();
        let second = endpoint.read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Chunk);
        assert_eq!(second.frame_type, FrameType::End);
    }

    #[tokio::test]
    async fn send_state_writes_relay_state() {
        let (local, remote) = tokio::io::duplex(1 << 16);
        let handle = SharedLimits::default();
        let mut writer = FrameWriter::new(local, handle.clone());
        let mut reader = FrameReader::new(remote, handle);

        MasterEndpoint::send_state(&mut writer, b"resource").await.unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::RelayState);
        assert_eq!(frame.payload.as_deref(), Some(b"resource".as_slice()));
    }
}
