//! End-to-end switch tests over in-memory duplex pipes.
//!
//! The mock hosts here speak the slave-side wire protocol directly:
//! announce a manifest, answer the identity verification, then serve or
//! emit requests frame by frame. Manual hosts give the tests exact
//! control over sequence numbers and frame order; the spawned echo host
//! covers the happy path.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::DuplexStream;
use weft_proto::{
    Frame, FrameReader, FrameType, FrameWriter, Limits, MessageId, SharedLimits,
};
use weft_relay::{
    CODE_MASTER_DIED, HandshakeConfig, Manifest, RelayError, RelaySwitch, SeqAssigner, SocketPair,
    SwitchConfig,
    handshake::notify_frame,
    identity::{self, IDENTITY_CAP},
};

const TEXT_CAP: &str = "cap:in=media:;out=media:text";
const PNG_CAP: &str = "cap:in=media:json;out=media:png;image";
const PDF_CAP: &str = "cap:in=media:;out=media:pdf";

const WAIT: Duration = Duration::from_secs(5);
const BRIEF: Duration = Duration::from_millis(200);

/// Honor `RUST_LOG` when debugging a failing test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test-side handle of one host connection.
struct Host {
    reader: FrameReader<tokio::io::ReadHalf<DuplexStream>>,
    writer: FrameWriter<tokio::io::WriteHalf<DuplexStream>>,
    seq: SeqAssigner,
}

impl Host {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let handle = SharedLimits::default();
        Self {
            reader: FrameReader::new(reader, handle.clone()),
            writer: FrameWriter::new(writer, handle),
            seq: SeqAssigner::new(),
        }
    }

    async fn announce(&mut self, caps: &[&str], limits: Limits) {
        let manifest = Manifest::new(caps.iter().map(ToString::to_string).collect()).unwrap();
        self.writer.write_frame(&notify_frame(limits, &manifest).unwrap()).await.unwrap();
    }

    async fn read(&mut self) -> Frame {
        self.reader.read_frame().await.unwrap().unwrap()
    }

    async fn write_seq(&mut self, mut frame: Frame) {
        self.seq.assign(&mut frame);
        self.writer.write_frame(&frame).await.unwrap();
    }

    /// Read one full request flow; returns its rid, xid, and the
    /// accumulated chunk payload.
    async fn read_request(&mut self) -> (MessageId, Option<MessageId>, Bytes) {
        let mut payload = Vec::new();
        loop {
            let frame = self.read().await;
            match frame.frame_type {
                FrameType::Req | FrameType::StreamStart | FrameType::StreamEnd => {},
                FrameType::Chunk => {
                    payload.extend_from_slice(frame.payload.as_deref().unwrap_or_default());
                },
                FrameType::End => return (frame.id, frame.routing_id, Bytes::from(payload)),
                other => panic!("unexpected {other:?} in request flow"),
            }
        }
    }

    /// Answer the switch's identity verification by echoing the nonce.
    async fn verify(&mut self) {
        let (rid, xid, nonce) = self.read_request().await;
        for frame in identity::echo_frames(rid, xid, nonce) {
            self.write_seq(frame).await;
        }
    }

    async fn announce_and_verify(&mut self, caps: &[&str]) {
        self.announce(caps, Limits::default()).await;
        self.verify().await;
    }
}

/// A host task that answers verification and then echoes every request.
fn spawn_echo_host(stream: DuplexStream, caps: Vec<String>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut host = Host::new(stream);
        let manifest = Manifest::new(caps).unwrap();
        host.writer
            .write_frame(&notify_frame(Limits::default(), &manifest).unwrap())
            .await
            .unwrap();

        loop {
            let mut payload = Vec::new();
            let (rid, xid) = loop {
                let Ok(Some(frame)) = host.reader.read_frame().await else {
                    return;
                };
                match frame.frame_type {
                    FrameType::Chunk => {
                        payload.extend_from_slice(frame.payload.as_deref().unwrap_or_default());
                    },
                    FrameType::End => break (frame.id, frame.routing_id),
                    _ => {},
                }
            };
            for frame in identity::echo_frames(rid, xid, Bytes::from(payload)) {
                host.write_seq(frame).await;
            }
        }
    })
}

/// Connect a switch to one manual host, driving verification from both
/// ends concurrently.
async fn connect_with_host(caps: &'static [&'static str]) -> (RelaySwitch, Host) {
    connect_with_host_config(caps, SwitchConfig::default()).await
}

async fn connect_with_host_config(
    caps: &'static [&'static str],
    config: SwitchConfig,
) -> (RelaySwitch, Host) {
    init_tracing();
    let (host_stream, switch_stream) = tokio::io::duplex(1 << 16);
    let mut host = Host::new(host_stream);

    let (switch, ()) = tokio::join!(
        RelaySwitch::with_config(vec![SocketPair::split(switch_stream)], config),
        host.announce_and_verify(caps),
    );
    (switch.unwrap(), host)
}

#[tokio::test]
async fn engine_request_round_trips_through_one_master() {
    let (host_stream, switch_stream) = tokio::io::duplex(1 << 16);
    let _host = spawn_echo_host(host_stream, vec![IDENTITY_CAP.to_string(), TEXT_CAP.to_string()]);

    let switch = RelaySwitch::connect(vec![SocketPair::split(switch_stream)]).await.unwrap();

    let rid = MessageId::Opaque([9; 16]);
    switch.send_to_master(Frame::req(rid, TEXT_CAP), None).await.unwrap();
    switch.send_to_master(Frame::stream_start(rid), None).await.unwrap();
    switch
        .send_to_master(Frame::chunk(rid, 0, Bytes::from_static(b"hi")), None)
        .await
        .unwrap();
    switch.send_to_master(Frame::stream_end(rid, 1), None).await.unwrap();
    switch.send_to_master(Frame::end(rid), None).await.unwrap();

    let mut frames = Vec::new();
    for _ in 0..4 {
        frames.push(switch.read_from_masters(Some(WAIT)).await.unwrap());
    }

    let types: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
    assert_eq!(
        types,
        [FrameType::StreamStart, FrameType::Chunk, FrameType::StreamEnd, FrameType::End]
    );
    for (expected_seq, frame) in frames.iter().enumerate() {
        assert_eq!(frame.id, rid);
        assert_eq!(frame.routing_id, None, "routing id must be stripped for the engine");
        assert_eq!(frame.seq, expected_seq as u64);
    }
    assert_eq!(frames[1].payload.as_deref(), Some(b"hi".as_slice()));
    assert!(frames[1].verify_checksum());
}

#[tokio::test]
async fn out_of_order_response_is_reordered_for_the_engine() {
    let (switch, mut host) = connect_with_host(&[IDENTITY_CAP, TEXT_CAP]).await;

    let rid = MessageId::Opaque([7; 16]);
    switch.send_to_master(Frame::req(rid, TEXT_CAP), None).await.unwrap();

    let req = host.read().await;
    assert_eq!(req.frame_type, FrameType::Req);
    assert_eq!(req.seq, 0);
    let xid = req.routing_id.expect("switch stamps a routing id");

    // Adversarial ordering: the terminal frame first.
    let chunk = Frame::chunk(rid, 0, Bytes::from_static(b"hi")).with_routing_id(xid).with_seq(0);
    let end = Frame::end(rid).with_routing_id(xid).with_seq(1);
    host.writer.write_frame(&end).await.unwrap();
    host.writer.write_frame(&chunk).await.unwrap();

    let first = switch.read_from_masters(Some(WAIT)).await.unwrap();
    let second = switch.read_from_masters(Some(WAIT)).await.unwrap();
    assert_eq!(first.frame_type, FrameType::Chunk);
    assert_eq!(second.frame_type, FrameType::End);
    assert_eq!(first.routing_id, None);
    assert_eq!(second.routing_id, None);
}

#[tokio::test]
async fn reorder_overflow_is_treated_as_master_death() {
    let config = SwitchConfig {
        limits: Limits { max_reorder_buffer: 2, ..Limits::default() },
        ..SwitchConfig::default()
    };
    let (switch, mut host) = connect_with_host_config(&[IDENTITY_CAP, TEXT_CAP], config).await;

    let rid = MessageId::Opaque([8; 16]);
    switch.send_to_master(Frame::req(rid, TEXT_CAP), None).await.unwrap();

    let req = host.read().await;
    let xid = req.routing_id.unwrap();

    // seq 0 never arrives; the third gap frame bursts the buffer.
    for seq in 1..=3u64 {
        let frame = Frame::chunk(rid, seq, Bytes::from_static(b"x"))
            .with_routing_id(xid)
            .with_seq(seq);
        host.writer.write_frame(&frame).await.unwrap();
    }

    let err = switch.read_from_masters(Some(WAIT)).await.unwrap();
    assert_eq!(err.frame_type, FrameType::Err);
    assert_eq!(err.id, rid);
    assert_eq!(err.routing_id, None);
    assert_eq!(err.meta_str("code"), Some(CODE_MASTER_DIED));

    // The only master is gone.
    assert!(switch.read_from_masters(Some(BRIEF)).await.is_none());
}

#[tokio::test]
async fn peer_call_routes_between_masters_without_the_engine() {
    let (a_stream, switch_a) = tokio::io::duplex(1 << 16);
    let (b_stream, switch_b) = tokio::io::duplex(1 << 16);
    let mut host_a = Host::new(a_stream);
    let mut host_b = Host::new(b_stream);

    let (switch, (), ()) = tokio::join!(
        RelaySwitch::connect(vec![SocketPair::split(switch_a), SocketPair::split(switch_b)]),
        host_a.announce_and_verify(&[IDENTITY_CAP]),
        host_b.announce_and_verify(&[IDENTITY_CAP, PNG_CAP]),
    );
    let switch = switch.unwrap();

    // Host A calls a capability only B serves; no frame carries an XID
    // when it leaves A.
    let rid = MessageId::Opaque([4; 16]);
    host_a.write_seq(Frame::req(rid, PNG_CAP)).await;
    host_a.write_seq(Frame::stream_start(rid)).await;
    host_a.write_seq(Frame::chunk(rid, 0, Bytes::from_static(b"img"))).await;
    host_a.write_seq(Frame::stream_end(rid, 1)).await;
    host_a.write_seq(Frame::end(rid)).await;

    // B sees the full request, now stamped with a switch-allocated XID.
    let (got_rid, got_xid, payload) = host_b.read_request().await;
    assert_eq!(got_rid, rid);
    let xid = got_xid.expect("switch stamps peer requests");
    assert!(matches!(xid, MessageId::Int(_)));
    assert_eq!(payload, Bytes::from_static(b"img"));

    // B answers; A gets the response with the XID preserved.
    for frame in identity::echo_frames(rid, Some(xid), payload) {
        host_b.write_seq(frame).await;
    }

    let mut types = Vec::new();
    for expected_seq in 0..4u64 {
        let frame = host_a.read().await;
        assert_eq!(frame.id, rid);
        assert_eq!(frame.routing_id, Some(xid), "peer responses keep their routing id");
        assert_eq!(frame.seq, expected_seq);
        types.push(frame.frame_type);
    }
    assert_eq!(
        types,
        [FrameType::StreamStart, FrameType::Chunk, FrameType::StreamEnd, FrameType::End]
    );

    // The engine never saw any of it.
    assert!(switch.read_from_masters(Some(BRIEF)).await.is_none());
}

#[tokio::test]
async fn master_death_mid_flight_fails_the_request() {
    let (switch, mut host) = connect_with_host(&[IDENTITY_CAP, TEXT_CAP]).await;

    let rid = MessageId::Opaque([5; 16]);
    switch.send_to_master(Frame::req(rid, TEXT_CAP), None).await.unwrap();

    // The host reads the request, then its pipe closes.
    let req = host.read().await;
    assert_eq!(req.frame_type, FrameType::Req);
    drop(host);

    let err = switch.read_from_masters(Some(WAIT)).await.unwrap();
    assert_eq!(err.frame_type, FrameType::Err);
    assert_eq!(err.id, rid);
    assert_eq!(err.routing_id, None, "engine-facing errors carry no routing id");
    assert_eq!(err.meta_str("code"), Some(CODE_MASTER_DIED));

    // The routing entry is gone: a continuation for it is rejected.
    let followup = switch
        .send_to_master(Frame::chunk(rid, 0, Bytes::from_static(b"late")), None)
        .await;
    assert!(matches!(followup, Err(RelayError::UnknownRequest(_))));
}

#[tokio::test]
async fn relay_notify_during_verification_refreshes_the_cap_set() {
    let (host_stream, switch_stream) = tokio::io::duplex(1 << 16);
    let mut host = Host::new(host_stream);

    let verify_with_refresh = async {
        host.announce(&[IDENTITY_CAP], Limits::default()).await;
        let (rid, xid, nonce) = host.read_request().await;

        // The host's own plugins finished starting: re-announce a wider
        // cap set before completing the identity echo.
        let refreshed =
            Manifest::new(vec![IDENTITY_CAP.to_string(), PDF_CAP.to_string()]).unwrap();
        host.writer
            .write_frame(&notify_frame(Limits::default(), &refreshed).unwrap())
            .await
            .unwrap();

        for frame in identity::echo_frames(rid, xid, nonce) {
            host.write_seq(frame).await;
        }
    };

    let (switch, ()) = tokio::join!(
        RelaySwitch::connect(vec![SocketPair::split(switch_stream)]),
        verify_with_refresh,
    );
    let switch = switch.unwrap();

    let caps = switch.capabilities().await.unwrap();
    assert_eq!(caps, format!("[\"{IDENTITY_CAP}\",\"{PDF_CAP}\"]"));
}

#[tokio::test]
async fn capabilities_and_limits_aggregate_healthy_masters() {
    let (a_stream, switch_a) = tokio::io::duplex(1 << 16);
    let (b_stream, switch_b) = tokio::io::duplex(1 << 16);
    let mut host_a = Host::new(a_stream);
    let mut host_b = Host::new(b_stream);

    let limits_a = Limits { max_frame: 1 << 20, max_chunk: 1 << 12, max_reorder_buffer: 16 };

    let (switch, (), ()) = tokio::join!(
        RelaySwitch::connect(vec![SocketPair::split(switch_a), SocketPair::split(switch_b)]),
        async {
            host_a.announce(&[IDENTITY_CAP, TEXT_CAP], limits_a).await;
            host_a.verify().await;
        },
        host_b.announce_and_verify(&[IDENTITY_CAP, PDF_CAP]),
    );
    let switch = switch.unwrap();

    let caps = switch.capabilities().await.unwrap();
    assert_eq!(caps, format!("[\"{IDENTITY_CAP}\",\"{PDF_CAP}\",\"{TEXT_CAP}\"]"));

    let limits = switch.limits().await;
    assert_eq!(limits, Limits::default().negotiate(limits_a));

    // Master A dies; the tables rebuild around B.
    drop(host_a);
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let caps = switch.capabilities().await.unwrap();
        if caps == format!("[\"{IDENTITY_CAP}\",\"{PDF_CAP}\"]") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cap table never rebuilt: {caps}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(switch.limits().await, Limits::default());
}

#[tokio::test]
async fn empty_switch_grows_with_add_master() {
    let switch = RelaySwitch::connect(Vec::new()).await.unwrap();

    let rid = MessageId::Opaque([2; 16]);
    let err = switch.send_to_master(Frame::req(rid, TEXT_CAP), None).await.unwrap_err();
    assert!(matches!(err, RelayError::NoHandler(_)));
    assert!(switch.read_from_masters(Some(BRIEF)).await.is_none());

    let (host_stream, switch_stream) = tokio::io::duplex(1 << 16);
    let _host = spawn_echo_host(host_stream, vec![IDENTITY_CAP.to_string(), TEXT_CAP.to_string()]);
    let index = switch.add_master(SocketPair::split(switch_stream)).await.unwrap();
    assert_eq!(index, 0);

    switch.send_to_master(Frame::req(rid, TEXT_CAP), None).await.unwrap();
    switch.send_to_master(Frame::end(rid), None).await.unwrap();

    let first = switch.read_from_masters(Some(WAIT)).await.unwrap();
    assert_eq!(first.frame_type, FrameType::StreamStart);
    assert_eq!(first.id, rid);
}

#[tokio::test]
async fn unknown_continuation_from_the_engine_is_rejected() {
    let (switch, _host) = connect_with_host(&[IDENTITY_CAP, TEXT_CAP]).await;

    let err = switch
        .send_to_master(Frame::chunk(MessageId::Opaque([1; 16]), 0, Bytes::new()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UnknownRequest(_)));
}

#[tokio::test]
async fn shutdown_stops_reads() {
    let (switch, _host) = connect_with_host(&[IDENTITY_CAP, TEXT_CAP]).await;

    switch.shutdown();
    assert!(switch.read_from_masters(None).await.is_none());
}

#[tokio::test]
async fn send_state_reaches_the_host() {
    let (switch, mut host) = connect_with_host(&[IDENTITY_CAP]).await;

    switch.send_state(0, b"resource blob").await.unwrap();

    let frame = host.read().await;
    assert_eq!(frame.frame_type, FrameType::RelayState);
    assert_eq!(frame.payload.as_deref(), Some(b"resource blob".as_slice()));
}

#[tokio::test]
async fn identity_verification_rejects_a_bad_echo() {
    let (host_stream, switch_stream) = tokio::io::duplex(1 << 16);
    let mut host = Host::new(host_stream);

    let lie = async {
        host.announce(&[IDENTITY_CAP], Limits::default()).await;
        let (rid, xid, _nonce) = host.read_request().await;
        // Echo the wrong bytes.
        for frame in identity::echo_frames(rid, xid, Bytes::from_static(b"forged")) {
            host.write_seq(frame).await;
        }
    };

    let config = SwitchConfig {
        handshake: HandshakeConfig { timeout: Duration::from_secs(2) },
        ..SwitchConfig::default()
    };
    let (result, ()) = tokio::join!(
        RelaySwitch::with_config(vec![SocketPair::split(switch_stream)], config),
        lie,
    );

    let err = result.err().expect("forged nonce must fail verification");
    assert!(matches!(err, RelayError::Protocol(_)), "{err}");
    assert!(err.to_string().contains("nonce mismatch"), "{err}");
}
