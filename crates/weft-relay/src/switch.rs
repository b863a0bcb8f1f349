//! The relay switch: cap routing over many masters.
//!
//! The switch owns one verified connection per plugin host. Requests,
//! whether from the engine or from a peer host, are matched against the
//! registered cap URNs, stamped with a switch-allocated routing id
//! (XID), and forwarded to the chosen master. Every in-flight request is
//! tracked in a routing table keyed by `(XID, RID)` so continuation and
//! response frames find their way: XID presence on an incoming frame
//! means "response, route toward the origin", absence means "request
//! continuation, route toward the destination".
//!
//! One reader task per master feeds a bounded channel consumed by a
//! central dispatcher; engine-bound frames flow out through a second
//! bounded channel. All routing state sits behind a single mutex, which
//! is never held across a pipe write; each master's writer and sequence
//! assigner sit behind their own async mutexes, and reorder buffers are
//! owned outright by their reader tasks, so draining a pipe never
//! touches the switch mutex. Lock order is switch state before any
//! per-master lock, never the reverse.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use rand::RngCore;
use tokio::sync::{Mutex, mpsc, watch};
use weft_caps::CapUrn;
use weft_proto::{Frame, FrameReader, FrameType, FrameWriter, Limits, MessageId, SharedLimits};

use crate::{
    error::RelayError,
    flow::{FlowKey, SeqAssigner},
    handshake::{HandshakeConfig, Manifest, parse_announcement},
    identity::IDENTITY_CAP,
    pipe::{BoxReader, BoxWriter, SocketPair},
    reorder::ReorderBuffer,
};

/// ERR code for requests whose destination master died mid-flight.
pub const CODE_MASTER_DIED: &str = "MASTER_DIED";

/// ERR code for routing failures reported back to a peer master.
pub const CODE_UNKNOWN: &str = "UNKNOWN";

/// Switch configuration.
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    /// The switch's own limits, announced to every master and the floor
    /// of every negotiation.
    pub limits: Limits,
    /// Capacity of the reader-to-dispatcher and engine-bound channels.
    pub channel_capacity: usize,
    /// Deadline for attaching one master (initial notify plus identity
    /// verification).
    pub handshake: HandshakeConfig,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            channel_capacity: 256,
            handshake: HandshakeConfig::default(),
        }
    }
}

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// The engine, through [`RelaySwitch::send_to_master`].
    External,
    /// A peer master, by index.
    Master(usize),
}

/// One in-flight request.
#[derive(Debug, Clone, Copy)]
struct RouteEntry {
    source: Origin,
    dest: usize,
}

/// One registered capability.
#[derive(Debug, Clone)]
struct CapEntry {
    cap: CapUrn,
    master: usize,
}

/// Per-master connection state.
///
/// The writer and the sequence assigner are shared between the
/// dispatcher, the engine API, and death handling, so each sits behind
/// its own async mutex; the reorder buffer is owned exclusively by the
/// master's reader task.
struct MasterConn {
    writer: Arc<Mutex<FrameWriter<BoxWriter>>>,
    seq: Arc<Mutex<SeqAssigner>>,
    limits_handle: SharedLimits,
    manifest: Manifest,
    limits: Limits,
    healthy: bool,
}

/// Mutable routing state, all behind one mutex.
struct SwitchState {
    masters: Vec<MasterConn>,
    cap_table: Vec<CapEntry>,
    routing: HashMap<(MessageId, MessageId), RouteEntry>,
    rid_to_xid: HashMap<MessageId, MessageId>,
    next_xid: u64,
}

impl SwitchState {
    fn new() -> Self {
        Self {
            masters: Vec::new(),
            cap_table: Vec::new(),
            routing: HashMap::new(),
            rid_to_xid: HashMap::new(),
            next_xid: 1,
        }
    }

    fn alloc_xid(&mut self) -> MessageId {
        let xid = self.next_xid;
        self.next_xid += 1;
        MessageId::Int(xid)
    }

    fn rebuild_cap_table(&mut self) {
        self.cap_table.clear();
        for (index, master) in self.masters.iter().enumerate() {
            if !master.healthy {
                continue;
            }
            for cap in master.manifest.caps() {
                self.cap_table.push(CapEntry { cap: cap.clone(), master: index });
            }
        }
    }

    fn healthy_count(&self) -> usize {
        self.masters.iter().filter(|m| m.healthy).count()
    }

    /// Pick a master for a request URN.
    ///
    /// Candidates are registered caps the request accepts; a
    /// `preferred_cap` broadens the test to either-direction acceptance
    /// and short-circuits on the first registered cap equivalent to the
    /// preference. Otherwise the candidate whose specificity is closest
    /// to the request's wins, ties to the first encountered. A generic
    /// request must land on a generic handler, a specific request on a
    /// specific one.
    fn find_master_for_cap(
        &self,
        cap_urn: &str,
        preferred_cap: Option<&str>,
    ) -> Result<usize, RelayError> {
        if !self.masters.is_empty() && self.healthy_count() == 0 {
            return Err(RelayError::AllMastersUnhealthy);
        }

        let request = CapUrn::parse(cap_urn)?;
        let preferred = preferred_cap.map(CapUrn::parse).transpose()?;

        let mut best: Option<(usize, u64)> = None;
        for entry in &self.cap_table {
            let accepts = request.accepts(&entry.cap);
            let candidate = match &preferred {
                Some(_) => accepts || entry.cap.accepts(&request),
                None => accepts,
            };
            if !candidate {
                continue;
            }

            if let Some(preferred) = &preferred {
                if preferred.accepts(&entry.cap) && entry.cap.accepts(preferred) {
                    return Ok(entry.master);
                }
            }

            let distance = entry.cap.specificity().abs_diff(request.specificity());
            if best.is_none_or(|(_, current)| distance < current) {
                best = Some((entry.master, distance));
            }
        }

        best.map(|(master, _)| master).ok_or_else(|| RelayError::NoHandler(cap_urn.to_string()))
    }
}

/// What a reader task hands the dispatcher.
enum ReaderEvent {
    Frame { master: usize, frame: Frame },
    Closed { master: usize, error: Option<RelayError> },
}

struct Shared {
    state: Mutex<SwitchState>,
    events_tx: mpsc::Sender<ReaderEvent>,
    engine_tx: mpsc::Sender<Frame>,
    shutdown: AtomicBool,
    healthy: AtomicUsize,
    /// Flipped once at shutdown. Reader tasks select on this; it is the
    /// only signal allowed to cancel an in-flight pipe read (a death
    /// elsewhere must not tear a partially-read frame off a healthy
    /// pipe).
    shutdown_watch: watch::Sender<bool>,
    /// Epoch counter bumped on shutdown and master death to wake an
    /// engine reader blocked in [`RelaySwitch::read_from_masters`].
    signal: watch::Sender<u64>,
    config: SwitchConfig,
}

impl Shared {
    fn bump_signal(&self) {
        self.signal.send_modify(|epoch| *epoch += 1);
    }
}

/// Cap-aware multiplexer over many plugin-host connections.
///
/// See the module docs for the routing model. Construction verifies
/// every master's identity before any frame is routed; an empty master
/// list is legal and can be grown later with [`RelaySwitch::add_master`].
pub struct RelaySwitch {
    shared: Arc<Shared>,
    engine_rx: Mutex<mpsc::Receiver<Frame>>,
}

impl RelaySwitch {
    /// Connect and verify the given masters with default configuration.
    pub async fn connect(pairs: Vec<SocketPair>) -> Result<Self, RelayError> {
        Self::with_config(pairs, SwitchConfig::default()).await
    }

    /// Connect and verify the given masters.
    ///
    /// Fails if any master cannot be attached; masters already verified
    /// by then are dropped with the switch.
    pub async fn with_config(
        pairs: Vec<SocketPair>,
        config: SwitchConfig,
    ) -> Result<Self, RelayError> {
        let capacity = config.channel_capacity.max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (engine_tx, engine_rx) = mpsc::channel(capacity);
        let (shutdown_watch, _) = watch::channel(false);
        let (signal, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            state: Mutex::new(SwitchState::new()),
            events_tx,
            engine_tx,
            shutdown: AtomicBool::new(false),
            healthy: AtomicUsize::new(0),
            shutdown_watch,
            signal,
            config,
        });

        let switch = Self { shared: Arc::clone(&shared), engine_rx: Mutex::new(engine_rx) };
        for pair in pairs {
            switch.add_master(pair).await?;
        }

        tokio::spawn(run_dispatcher(shared, events_rx));
        Ok(switch)
    }

    /// Attach and verify one more master; returns its index.
    ///
    /// Two phases: read the initial RELAY_NOTIFY (caps and limits), then
    /// verify identity by round-tripping a nonce through the mandatory
    /// identity cap. RELAY_NOTIFY frames interleaved with the echo are
    /// accepted as cap-set refreshes; hosts routinely re-announce once
    /// their own plugins finish starting.
    pub async fn add_master(&self, pair: SocketPair) -> Result<usize, RelayError> {
        let config = &self.shared.config;
        let limits_handle = SharedLimits::new(config.limits);
        let mut reader = FrameReader::new(pair.reader, limits_handle.clone());
        let mut writer = FrameWriter::new(pair.writer, limits_handle.clone());

        let xid = self.shared.state.lock().await.alloc_xid();
        let seq = Arc::new(Mutex::new(SeqAssigner::new()));

        let attach = async {
            let first = reader.read_frame().await?.ok_or_else(|| {
                RelayError::Handshake("peer closed before relay notify".to_string())
            })?;
            if first.frame_type != FrameType::RelayNotify {
                return Err(RelayError::Handshake(format!(
                    "expected RelayNotify as first frame, got {:?}",
                    first.frame_type
                )));
            }

            let (peer_limits, manifest) = parse_announcement(&first, true)?;
            let mut manifest = manifest.ok_or_else(|| {
                RelayError::Handshake("announcement is missing the manifest".to_string())
            })?;
            let mut negotiated = config.limits.negotiate(peer_limits);
            limits_handle.set(negotiated).await;

            let mut reorder = ReorderBuffer::new(negotiated.max_reorder_buffer as usize);
            verify_identity(
                &mut reader,
                &mut writer,
                &seq,
                &mut reorder,
                xid,
                config.limits,
                &limits_handle,
                &mut manifest,
                &mut negotiated,
            )
            .await?;

            Ok((manifest, negotiated, reorder))
        };

        let (manifest, negotiated, reorder) =
            tokio::time::timeout(config.handshake.timeout, attach)
                .await
                .map_err(|_| {
                    RelayError::Handshake("identity verification timed out".to_string())
                })??;

        let index = {
            let mut state = self.shared.state.lock().await;
            let index = state.masters.len();
            state.masters.push(MasterConn {
                writer: Arc::new(Mutex::new(writer)),
                seq,
                limits_handle,
                manifest,
                limits: negotiated,
                healthy: true,
            });
            state.rebuild_cap_table();
            index
        };
        self.shared.healthy.fetch_add(1, Ordering::SeqCst);
        tracing::info!(master = index, "master verified and attached");

        tokio::spawn(run_reader(reader, reorder, index, Arc::clone(&self.shared)));
        Ok(index)
    }

    /// Route a frame from the engine toward the master that serves it.
    ///
    /// A REQ is assigned an XID (when absent), resolved against the cap
    /// table (`preferred_cap` biases the choice toward an equivalent
    /// registered cap), and recorded with origin "external". Any other
    /// flow frame is a continuation of a known request: its XID is
    /// looked up by RID and it is forwarded to the recorded destination.
    ///
    /// # Errors
    ///
    /// [`RelayError::NoHandler`] / [`RelayError::AllMastersUnhealthy`]
    /// when no master serves the cap, [`RelayError::UnknownRequest`] for
    /// a continuation with no routing entry, plus wire errors.
    pub async fn send_to_master(
        &self,
        mut frame: Frame,
        preferred_cap: Option<&str>,
    ) -> Result<(), RelayError> {
        if !frame.is_flow() {
            return Err(RelayError::Protocol(format!(
                "{:?} frames cannot be routed",
                frame.frame_type
            )));
        }

        let (writer, seq) = {
            // Decide under the state lock, write outside it; the far
            // side's reorder buffer absorbs any write-order inversion.
            let mut state = self.shared.state.lock().await;
            if frame.frame_type == FrameType::Req {
                let cap = frame.cap_urn.clone().ok_or_else(|| {
                    RelayError::Protocol("request carries no cap urn".to_string())
                })?;
                let dest = state.find_master_for_cap(&cap, preferred_cap)?;
                let xid = frame.routing_id.unwrap_or_else(|| state.alloc_xid());
                frame.routing_id = Some(xid);
                state.routing.insert((xid, frame.id), RouteEntry { source: Origin::External, dest });
                state.rid_to_xid.insert(frame.id, xid);
                tracing::debug!(rid = %frame.id, xid = %xid, dest, cap = %cap, "request routed");
                let conn = &state.masters[dest];
                (Arc::clone(&conn.writer), Arc::clone(&conn.seq))
            } else {
                let xid = match frame.routing_id {
                    Some(xid) => xid,
                    None => *state
                        .rid_to_xid
                        .get(&frame.id)
                        .ok_or(RelayError::UnknownRequest(frame.id))?,
                };
                let entry = state
                    .routing
                    .get(&(xid, frame.id))
                    .ok_or(RelayError::UnknownRequest(frame.id))?;
                let conn = &state.masters[entry.dest];
                if !conn.healthy {
                    return Err(RelayError::UnknownRequest(frame.id));
                }
                frame.routing_id = Some(xid);
                (Arc::clone(&conn.writer), Arc::clone(&conn.seq))
            }
        };

        seq.lock().await.assign(&mut frame);
        writer.lock().await.write_frame(&frame).await?;
        Ok(())
    }

    /// Deliver the next frame destined for the engine.
    ///
    /// Peer-to-peer traffic is routed internally and never surfaces
    /// here. Returns `None` on timeout, after [`RelaySwitch::shutdown`],
    /// or once every master is unhealthy and the channel is drained.
    pub async fn read_from_masters(&self, timeout: Option<Duration>) -> Option<Frame> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut rx = self.engine_rx.lock().await;
        let mut signal = self.shared.signal.subscribe();

        loop {
            match rx.try_recv() {
                Ok(frame) => return Some(frame),
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {},
            }

            // Mark the signal epoch seen before re-checking the flags, so
            // a death or shutdown after the check still wakes the select.
            signal.borrow_and_update();
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            if self.shared.healthy.load(Ordering::SeqCst) == 0 {
                return None;
            }

            tokio::select! {
                frame = rx.recv() => return frame,
                _ = signal.changed() => {},
                () = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)),
                    if deadline.is_some() => return None,
            }
        }
    }

    /// Sorted JSON array of every healthy master's cap URNs.
    pub async fn capabilities(&self) -> Result<String, RelayError> {
        let state = self.shared.state.lock().await;
        let union: BTreeSet<&str> = state
            .masters
            .iter()
            .filter(|m| m.healthy)
            .flat_map(|m| m.manifest.urns().iter().map(String::as_str))
            .collect();
        serde_json::to_string(&union)
            .map_err(|e| RelayError::Protocol(format!("capabilities encode failed: {e}")))
    }

    /// Component-wise minimum of every healthy master's limits, or the
    /// switch's own limits when none is healthy.
    pub async fn limits(&self) -> Limits {
        let state = self.shared.state.lock().await;
        state
            .masters
            .iter()
            .filter(|m| m.healthy)
            .map(|m| m.limits)
            .reduce(Limits::negotiate)
            .unwrap_or(self.shared.config.limits)
    }

    /// Write a RELAY_STATE frame to one master.
    pub async fn send_state(&self, master: usize, state_bytes: &[u8]) -> Result<(), RelayError> {
        let writer = {
            let state = self.shared.state.lock().await;
            let conn = state
                .masters
                .get(master)
                .ok_or_else(|| RelayError::Protocol(format!("no master {master}")))?;
            if !conn.healthy {
                return Err(RelayError::Protocol(format!("master {master} is unhealthy")));
            }
            Arc::clone(&conn.writer)
        };

        writer
            .lock()
            .await
            .write_frame(&Frame::relay_state(Bytes::copy_from_slice(state_bytes)))
            .await?;
        Ok(())
    }

    /// Stop reader tasks and the dispatcher; subsequent reads return
    /// `None`.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.shutdown_watch.send_replace(true);
        self.shared.bump_signal();
        tracing::info!("switch shutting down");
    }
}

impl std::fmt::Debug for RelaySwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySwitch")
            .field("healthy", &self.shared.healthy.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Round-trip a nonce through the identity cap before trusting a master.
///
/// The full request (REQ, STREAM_START, CHUNK with the nonce,
/// STREAM_END, END) goes out seq'd on the per-master assigner; the echo
/// must come back as STREAM_START, CHUNK carrying the identical bytes,
/// STREAM_END, END on the same flow. Interleaved RELAY_NOTIFY frames
/// refresh `manifest` and `negotiated` in place.
#[allow(clippy::too_many_arguments)]
async fn verify_identity(
    reader: &mut FrameReader<BoxReader>,
    writer: &mut FrameWriter<BoxWriter>,
    seq: &Mutex<SeqAssigner>,
    reorder: &mut ReorderBuffer,
    xid: MessageId,
    local_limits: Limits,
    limits_handle: &SharedLimits,
    manifest: &mut Manifest,
    negotiated: &mut Limits,
) -> Result<(), RelayError> {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut rid_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut rid_bytes);
    let rid = MessageId::Opaque(rid_bytes);

    let request = [
        Frame::req(rid, IDENTITY_CAP).with_routing_id(xid),
        Frame::stream_start(rid).with_routing_id(xid),
        Frame::chunk(rid, 0, Bytes::copy_from_slice(&nonce)).with_routing_id(xid),
        Frame::stream_end(rid, 1).with_routing_id(xid),
        Frame::end(rid).with_routing_id(xid),
    ];
    for mut frame in request {
        seq.lock().await.assign(&mut frame);
        writer.write_frame(&frame).await?;
    }

    let expected = [FrameType::StreamStart, FrameType::Chunk, FrameType::StreamEnd, FrameType::End];
    let mut stage = 0;
    while stage < expected.len() {
        let frame = reader.read_frame().await?.ok_or_else(|| {
            RelayError::Handshake("peer closed during identity verification".to_string())
        })?;

        match frame.frame_type {
            FrameType::RelayNotify => {
                let (peer_limits, refreshed) = parse_announcement(&frame, true)?;
                if let Some(refreshed) = refreshed {
                    tracing::debug!(
                        caps = refreshed.urns().len(),
                        "cap set refreshed during verification"
                    );
                    *manifest = refreshed;
                }
                *negotiated = local_limits.negotiate(peer_limits);
                limits_handle.set(*negotiated).await;
                continue;
            },
            FrameType::Heartbeat => continue,
            FrameType::Err => {
                return Err(RelayError::Protocol(format!(
                    "identity verification failed: {} {}",
                    frame.meta_str("code").unwrap_or("?"),
                    frame.meta_str("message").unwrap_or_default(),
                )));
            },
            _ => {},
        }

        for ready in reorder.accept(frame)? {
            if stage >= expected.len() || ready.frame_type != expected[stage] {
                return Err(RelayError::Protocol(format!(
                    "unexpected {:?} during identity verification",
                    ready.frame_type
                )));
            }
            if ready.id != rid || ready.routing_id != Some(xid) {
                return Err(RelayError::Protocol(
                    "identity echo carries the wrong flow".to_string(),
                ));
            }
            if ready.frame_type == FrameType::Chunk
                && ready.payload.as_deref() != Some(nonce.as_slice())
            {
                return Err(RelayError::Protocol("identity nonce mismatch".to_string()));
            }
            stage += 1;
        }
    }

    let key = FlowKey { rid, xid: Some(xid) };
    seq.lock().await.cleanup(&key);
    reorder.cleanup(&key);
    Ok(())
}

/// Read one master's pipe, re-verify flow order, feed the dispatcher.
async fn run_reader(
    mut reader: FrameReader<BoxReader>,
    mut reorder: ReorderBuffer,
    index: usize,
    shared: Arc<Shared>,
) {
    let mut shutdown = shared.shutdown_watch.subscribe();
    let result = loop {
        if *shutdown.borrow_and_update() {
            break Ok(());
        }

        let read = tokio::select! {
            _ = shutdown.changed() => continue,
            read = reader.read_frame() => read,
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(RelayError::from(e)),
        };

        match reorder.accept(frame) {
            Ok(ready) => {
                let mut receiver_gone = false;
                for frame in ready {
                    if frame.is_terminal() {
                        if let Some(key) = FlowKey::of(&frame) {
                            reorder.cleanup(&key);
                        }
                    }
                    if shared
                        .events_tx
                        .send(ReaderEvent::Frame { master: index, frame })
                        .await
                        .is_err()
                    {
                        receiver_gone = true;
                        break;
                    }
                }
                if receiver_gone {
                    break Ok(());
                }
            },
            Err(e) => break Err(e),
        }
    };

    let error = result.err();
    let _ = shared.events_tx.send(ReaderEvent::Closed { master: index, error }).await;
}

/// Consume reader events and route frames.
async fn run_dispatcher(shared: Arc<Shared>, mut events: mpsc::Receiver<ReaderEvent>) {
    let mut shutdown = shared.shutdown_watch.subscribe();
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let event = tokio::select! {
            _ = shutdown.changed() => continue,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            ReaderEvent::Frame { master, frame } => dispatch_frame(&shared, master, frame).await,
            ReaderEvent::Closed { master, error } => {
                handle_master_death(&shared, master, error).await;
            },
        }
    }
    tracing::debug!("dispatcher stopped");
}

/// Route one ordered frame received from a master.
async fn dispatch_frame(shared: &Arc<Shared>, from: usize, frame: Frame) {
    match frame.frame_type {
        FrameType::Heartbeat => tracing::trace!(master = from, "heartbeat"),
        FrameType::Hello => tracing::warn!(master = from, "unexpected hello after attach"),
        FrameType::RelayState => {
            tracing::warn!(master = from, "dropping relay state from master: wrong direction");
        },
        FrameType::RelayNotify => refresh_master(shared, from, &frame).await,
        FrameType::Req => route_peer_request(shared, from, frame).await,
        _ if frame.routing_id.is_some() => route_response(shared, from, frame).await,
        _ => route_peer_continuation(shared, from, frame).await,
    }
}

/// A master re-announced its manifest and limits.
async fn refresh_master(shared: &Arc<Shared>, from: usize, frame: &Frame) {
    match parse_announcement(frame, true) {
        Ok((peer_limits, manifest)) => {
            let mut state = shared.state.lock().await;
            let negotiated = shared.config.limits.negotiate(peer_limits);
            let Some(conn) = state.masters.get_mut(from) else {
                return;
            };
            if let Some(manifest) = manifest {
                tracing::info!(master = from, caps = manifest.urns().len(), "cap set refreshed");
                conn.manifest = manifest;
            }
            conn.limits = negotiated;
            conn.limits_handle.set(negotiated).await;
            state.rebuild_cap_table();
        },
        Err(e) => tracing::warn!(master = from, error = %e, "ignoring malformed relay notify"),
    }
}

/// A peer master opened a request of its own.
async fn route_peer_request(shared: &Arc<Shared>, from: usize, mut frame: Frame) {
    if frame.routing_id.is_some() {
        tracing::warn!(master = from, rid = %frame.id, "peer request carries a routing id");
        send_error_to_master(
            shared,
            from,
            frame.id,
            None,
            CODE_UNKNOWN,
            "request must not carry a routing id",
        )
        .await;
        return;
    }

    let decision = {
        let mut state = shared.state.lock().await;
        let resolved = frame
            .cap_urn
            .clone()
            .ok_or_else(|| RelayError::Protocol("request carries no cap urn".to_string()))
            .and_then(|cap| state.find_master_for_cap(&cap, None));
        match resolved {
            Ok(dest) => {
                let xid = state.alloc_xid();
                frame.routing_id = Some(xid);
                state
                    .routing
                    .insert((xid, frame.id), RouteEntry { source: Origin::Master(from), dest });
                state.rid_to_xid.insert(frame.id, xid);
                tracing::debug!(rid = %frame.id, xid = %xid, from, dest, "peer request routed");
                let conn = &state.masters[dest];
                Ok((Arc::clone(&conn.writer), Arc::clone(&conn.seq)))
            },
            Err(e) => Err(e),
        }
    };

    match decision {
        Ok((writer, seq)) => {
            seq.lock().await.assign(&mut frame);
            if let Err(e) = writer.lock().await.write_frame(&frame).await {
                tracing::warn!(error = %e, "peer request forward failed");
            }
        },
        Err(e) => {
            tracing::debug!(master = from, rid = %frame.id, error = %e, "peer request rejected");
            send_error_to_master(shared, from, frame.id, None, CODE_UNKNOWN, &e.to_string()).await;
        },
    }
}

/// A continuation frame (no XID) from a master, flowing toward the
/// request's destination.
async fn route_peer_continuation(shared: &Arc<Shared>, from: usize, mut frame: Frame) {
    let decision = {
        let state = shared.state.lock().await;
        match state.rid_to_xid.get(&frame.id) {
            None => Err(RelayError::UnknownRequest(frame.id)),
            Some(&xid) => match state.routing.get(&(xid, frame.id)) {
                Some(entry) if state.masters[entry.dest].healthy => {
                    let conn = &state.masters[entry.dest];
                    Ok((xid, Arc::clone(&conn.writer), Arc::clone(&conn.seq)))
                },
                _ => Err(RelayError::UnknownRequest(frame.id)),
            },
        }
    };

    match decision {
        Ok((xid, writer, seq)) => {
            frame.routing_id = Some(xid);
            seq.lock().await.assign(&mut frame);
            if let Err(e) = writer.lock().await.write_frame(&frame).await {
                tracing::warn!(error = %e, "continuation forward failed");
            }
        },
        Err(e) => {
            tracing::debug!(master = from, rid = %frame.id, error = %e, "continuation rejected");
            send_error_to_master(shared, from, frame.id, None, CODE_UNKNOWN, &e.to_string()).await;
        },
    }
}

/// Response target resolved under the state lock.
enum ResponseTarget {
    Engine,
    Master(Arc<Mutex<FrameWriter<BoxWriter>>>, Arc<Mutex<SeqAssigner>>),
    Drop,
}

/// A response frame (has XID) from a master, flowing toward its origin.
async fn route_response(shared: &Arc<Shared>, from: usize, mut frame: Frame) {
    let Some(xid) = frame.routing_id else {
        return;
    };
    let rid = frame.id;
    let terminal = frame.is_terminal();

    let target = {
        let mut state = shared.state.lock().await;
        let Some(entry) = state.routing.get(&(xid, rid)).copied() else {
            tracing::warn!(master = from, %rid, %xid, "dropping frame with no routing entry");
            return;
        };

        if terminal {
            state.routing.remove(&(xid, rid));
            state.rid_to_xid.remove(&rid);
            let key = FlowKey { rid, xid: Some(xid) };
            state.masters[entry.dest].seq.lock().await.cleanup(&key);
            if let Origin::Master(source) = entry.source {
                state.masters[source].seq.lock().await.cleanup(&key);
            }
            tracing::debug!(%rid, %xid, "request completed");
        }

        match entry.source {
            Origin::External => ResponseTarget::Engine,
            Origin::Master(source) => {
                let conn = &state.masters[source];
                if conn.healthy {
                    ResponseTarget::Master(Arc::clone(&conn.writer), Arc::clone(&conn.seq))
                } else {
                    tracing::warn!(%rid, source, "response origin is unhealthy, dropping");
                    ResponseTarget::Drop
                }
            },
        }
    };

    match target {
        ResponseTarget::Engine => {
            frame.routing_id = None;
            if shared.engine_tx.send(frame).await.is_err() {
                tracing::warn!(%rid, "engine receiver gone, dropping response");
            }
        },
        ResponseTarget::Master(writer, seq) => {
            seq.lock().await.assign(&mut frame);
            if let Err(e) = writer.lock().await.write_frame(&frame).await {
                tracing::warn!(error = %e, "response forward failed");
            }
        },
        ResponseTarget::Drop => {},
    }
}

/// Send a synthesized ERR frame to a master, best effort.
async fn send_error_to_master(
    shared: &Arc<Shared>,
    master: usize,
    rid: MessageId,
    xid: Option<MessageId>,
    code: &str,
    message: &str,
) {
    let handles = {
        let state = shared.state.lock().await;
        state.masters.get(master).filter(|conn| conn.healthy).map(|conn| {
            (Arc::clone(&conn.writer), Arc::clone(&conn.seq))
        })
    };
    let Some((writer, seq)) = handles else {
        tracing::warn!(master, %rid, code, "cannot deliver error: master unavailable");
        return;
    };

    let mut frame = Frame::err(rid, code, message);
    frame.routing_id = xid;
    seq.lock().await.assign(&mut frame);
    if let Err(e) = writer.lock().await.write_frame(&frame).await {
        tracing::warn!(master, error = %e, "error frame write failed");
    }
    if let Some(key) = FlowKey::of(&frame) {
        seq.lock().await.cleanup(&key);
    }
}

/// A master's pipe closed or its reader hit a protocol error.
///
/// Mark it unhealthy, fail every in-flight request destined for it with
/// ERR(`MASTER_DIED`) toward the recorded source, purge those routing
/// entries, and rebuild the cap table. Never fatal for the switch.
async fn handle_master_death(shared: &Arc<Shared>, index: usize, error: Option<RelayError>) {
    match &error {
        Some(e) => tracing::warn!(master = index, error = %e, "master died"),
        None => tracing::info!(master = index, "master disconnected"),
    }

    let victims = {
        let mut state = shared.state.lock().await;
        let Some(conn) = state.masters.get_mut(index) else {
            return;
        };
        if !conn.healthy {
            return;
        }
        conn.healthy = false;

        let keys: Vec<(MessageId, MessageId)> = state
            .routing
            .iter()
            .filter(|(_, entry)| entry.dest == index)
            .map(|(key, _)| *key)
            .collect();

        let mut victims = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = state.routing.remove(&key) {
                state.rid_to_xid.remove(&key.1);
                let source = match entry.source {
                    Origin::External => None,
                    Origin::Master(source) => {
                        let conn = &state.masters[source];
                        conn.healthy
                            .then(|| (Arc::clone(&conn.writer), Arc::clone(&conn.seq)))
                    },
                };
                victims.push((key.0, key.1, entry.source, source));
            }
        }
        state.rebuild_cap_table();
        victims
    };

    let message = format!("master {index} died");
    for (xid, rid, origin, handles) in victims {
        match origin {
            Origin::External => {
                // Engine-facing frames never carry a routing id.
                let frame = Frame::err(rid, CODE_MASTER_DIED, &message);
                if shared.engine_tx.send(frame).await.is_err() {
                    tracing::warn!(%rid, "engine receiver gone, dropping master-died error");
                }
            },
            Origin::Master(source) => match handles {
                Some((writer, seq)) => {
                    let mut frame =
                        Frame::err(rid, CODE_MASTER_DIED, &message).with_routing_id(xid);
                    seq.lock().await.assign(&mut frame);
                    if let Err(e) = writer.lock().await.write_frame(&frame).await {
                        tracing::warn!(source, error = %e, "master-died error write failed");
                    }
                    seq.lock().await.cleanup(&FlowKey { rid, xid: Some(xid) });
                },
                None => {
                    tracing::warn!(%rid, source, "request source also dead, dropping error");
                },
            },
        }
    }

    shared.healthy.fetch_sub(1, Ordering::SeqCst);
    shared.bump_signal();
    if shared.healthy.load(Ordering::SeqCst) == 0 {
        tracing::warn!("all masters are unhealthy");
    }
}
