//! Slave endpoint: the plugin-host side of one master connection.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use weft_proto::{Frame, FrameReader, FrameType, FrameWriter, Limits, SharedLimits};

use crate::{
    error::RelayError,
    flow::FlowKey,
    handshake::{Manifest, notify_frame},
    pipe::{BoxReader, BoxWriter, SocketPair},
    reorder::ReorderBuffer,
};

/// Bridges a local plugin-host byte channel to a master-facing socket.
///
/// Two independent pumps forward frames, each re-verifying flow order
/// through its own reorder buffer. Relay-control frames are intercepted:
/// RELAY_STATE from the master lands in a thread-safe slot (see
/// [`SlaveEndpoint::resource_state`]) instead of reaching the plugin
/// host, while RELAY_NOTIFY is only legal in the upward direction, where
/// it carries cap-set updates toward the switch.
#[derive(Debug, Default)]
pub struct SlaveEndpoint {
    state: Arc<Mutex<Option<Bytes>>>,
}

impl SlaveEndpoint {
    /// Create an endpoint with an empty resource-state slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent RELAY_STATE payload received from the master, if
    /// any.
    pub async fn resource_state(&self) -> Option<Bytes> {
        self.state.lock().await.clone()
    }

    /// Run both forwarding pumps until EOF or failure.
    ///
    /// `local` faces the in-process plugin host, `socket` faces the
    /// master. When `announce` is given, a RELAY_NOTIFY carrying the
    /// manifest and limits is written to the socket before the pumps
    /// start.
    ///
    /// Each pump closes its write handle on exit so EOF propagates to
    /// the opposite side. Returns the first error observed (downstream
    /// checked first when both pumps fail), or `Ok(())` on clean EOF.
    pub async fn run(
        &self,
        local: SocketPair,
        socket: SocketPair,
        announce: Option<(Manifest, Limits)>,
    ) -> Result<(), RelayError> {
        let limits = announce.as_ref().map_or_else(Limits::default, |(_, limits)| *limits);

        let local_handle = SharedLimits::new(limits);
        let socket_handle = SharedLimits::new(limits);
        let local_reader = FrameReader::new(local.reader, local_handle.clone());
        let local_writer = FrameWriter::new(local.writer, local_handle);
        let socket_reader = FrameReader::new(socket.reader, socket_handle.clone());
        let mut socket_writer = FrameWriter::new(socket.writer, socket_handle);

        if let Some((manifest, limits)) = &announce {
            socket_writer.write_frame(&notify_frame(*limits, manifest)?).await?;
            tracing::debug!(caps = manifest.urns().len(), "announced manifest to master");
        }

        let reorder_down = ReorderBuffer::new(limits.max_reorder_buffer as usize);
        let reorder_up = ReorderBuffer::new(limits.max_reorder_buffer as usize);
        let slot = Arc::clone(&self.state);

        let downstream =
            tokio::spawn(pump_downstream(socket_reader, local_writer, reorder_down, slot));
        let upstream = tokio::spawn(pump_upstream(local_reader, socket_writer, reorder_up));

        let (down, up) = tokio::join!(downstream, upstream);
        flatten(down).and(flatten(up))
    }
}

fn flatten(joined: Result<Result<(), RelayError>, tokio::task::JoinError>) -> Result<(), RelayError> {
    joined.map_err(|e| RelayError::Protocol(format!("forwarding pump terminated abnormally: {e}")))?
}

/// Push a frame through the pump's reorder buffer and write every ready
/// frame, dropping flow state once a terminal frame has gone out.
async fn forward_ready(
    reorder: &mut ReorderBuffer,
    frame: Frame,
    writer: &mut FrameWriter<BoxWriter>,
) -> Result<(), RelayError> {
    for ready in reorder.accept(frame)? {
        let key = FlowKey::of(&ready);
        let terminal = ready.is_terminal();
        writer.write_frame(&ready).await?;
        if terminal {
            if let Some(key) = key {
                reorder.cleanup(&key);
            }
        }
    }
    Ok(())
}

/// Socket → local: deliver master traffic to the plugin host.
async fn pump_downstream(
    mut reader: FrameReader<BoxReader>,
    mut writer: FrameWriter<BoxWriter>,
    mut reorder: ReorderBuffer,
    slot: Arc<Mutex<Option<Bytes>>>,
) -> Result<(), RelayError> {
    let result = async {
        loop {
            let Some(frame) = reader.read_frame().await? else {
                return Ok(());
            };
            match frame.frame_type {
                FrameType::RelayState => {
                    let payload = frame.payload.unwrap_or_default();
                    tracing::debug!(bytes = payload.len(), "stored resource state");
                    *slot.lock().await = Some(payload);
                },
                FrameType::RelayNotify => {
                    tracing::warn!("dropping relay notify from master: wrong direction");
                },
                _ => forward_ready(&mut reorder, frame, &mut writer).await?,
            }
        }
    }
    .await;

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "local writer close failed");
    }
    result
}

/// Local → socket: deliver plugin-host traffic (including RELAY_NOTIFY
/// cap updates) to the master.
async fn pump_upstream(
    mut reader: FrameReader<BoxReader>,
    mut writer: FrameWriter<BoxWriter>,
    mut reorder: ReorderBuffer,
) -> Result<(), RelayError> {
    let result = async {
        loop {
            let Some(frame) = reader.read_frame().await? else {
                return Ok(());
            };
            match frame.frame_type {
                FrameType::RelayState => {
                    tracing::warn!("dropping relay state from plugin host: wrong direction");
                },
                _ => forward_ready(&mut reorder, frame, &mut writer).await?,
            }
        }
    }
    .await;

    if let Err(e) = writer.shutdown().await {
        tracing::debug!(error = %e, "socket writer close failed");
    }
    result
}
