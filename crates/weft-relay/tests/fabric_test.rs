//! Full-stack tests: a plugin host behind a slave endpoint, reached
//! through a master endpoint or the switch.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::io::DuplexStream;
use weft_proto::{Frame, FrameReader, FrameType, FrameWriter, Limits, MessageId, SharedLimits};
use weft_relay::{
    Manifest, MasterEndpoint, RelaySwitch, SeqAssigner, SlaveEndpoint, SocketPair,
    identity::{self, IDENTITY_CAP},
};

const TEXT_CAP: &str = "cap:in=media:;out=media:text";
const WAIT: Duration = Duration::from_secs(5);

fn manifest() -> Manifest {
    Manifest::new(vec![IDENTITY_CAP.to_string(), TEXT_CAP.to_string()]).unwrap()
}

/// An in-process plugin host: reads request flows off its local pipe and
/// echoes the accumulated chunk payload back as a single stream.
fn spawn_plugin_host(stream: DuplexStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (r, w) = tokio::io::split(stream);
        let handle = SharedLimits::default();
        let mut reader = FrameReader::new(r, handle.clone());
        let mut writer = FrameWriter::new(w, handle);
        let mut seq = SeqAssigner::new();

        loop {
            let mut payload = Vec::new();
            let (rid, xid) = loop {
                let Ok(Some(frame)) = reader.read_frame().await else {
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
            for mut frame in identity::echo_frames(rid, xid, Bytes::from(payload)) {
                seq.assign(&mut frame);
                if writer.write_frame(&frame).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Wire a host and a slave endpoint together; returns the master-facing
/// stream and the endpoint handle.
fn host_behind_slave() -> (DuplexStream, Arc<SlaveEndpoint>) {
    let (host_stream, slave_local) = tokio::io::duplex(1 << 16);
    let (master_stream, slave_socket) = tokio::io::duplex(1 << 16);

    let _host = spawn_plugin_host(host_stream);

    let endpoint = Arc::new(SlaveEndpoint::new());
    {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move {
            let _ = endpoint
                .run(
                    SocketPair::split(slave_local),
                    SocketPair::split(slave_socket),
                    Some((manifest(), Limits::default())),
                )
                .await;
        });
    }

    (master_stream, endpoint)
}

#[tokio::test]
async fn master_endpoint_reaches_a_host_behind_a_slave() {
    let (master_stream, slave) = host_behind_slave();
    let (r, w) = tokio::io::split(master_stream);
    let handle = SharedLimits::default();
    let mut reader = FrameReader::new(r, handle.clone());
    let mut writer = FrameWriter::new(w, handle);

    let mut master = MasterEndpoint::connect(&mut reader).await.unwrap();
    assert_eq!(master.manifest().urns(), [IDENTITY_CAP, TEXT_CAP]);

    // Drive one request downstream, seq'd like any output stage.
    let mut seq = SeqAssigner::new();
    let rid = MessageId::Opaque([6; 16]);
    let xid = MessageId::Int(41);
    let request = [
        Frame::req(rid, TEXT_CAP).with_routing_id(xid),
        Frame::stream_start(rid).with_routing_id(xid),
        Frame::chunk(rid, 0, Bytes::from_static(b"ping")).with_routing_id(xid),
        Frame::stream_end(rid, 1).with_routing_id(xid),
        Frame::end(rid).with_routing_id(xid),
    ];
    for mut frame in request {
        seq.assign(&mut frame);
        writer.write_frame(&frame).await.unwrap();
    }

    let mut types = Vec::new();
    for expected_seq in 0..4u64 {
        let frame = tokio::time::timeout(WAIT, master.read_frame(&mut reader))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(frame.id, rid);
        assert_eq!(frame.routing_id, Some(xid));
        assert_eq!(frame.seq, expected_seq);
        if frame.frame_type == FrameType::Chunk {
            assert_eq!(frame.payload.as_deref(), Some(b"ping".as_slice()));
        }
        types.push(frame.frame_type);
    }
    assert_eq!(
        types,
        [FrameType::StreamStart, FrameType::Chunk, FrameType::StreamEnd, FrameType::End]
    );

    // Push resource state downstream; the slave captures it without
    // disturbing the host.
    MasterEndpoint::send_state(&mut writer, b"shared resource").await.unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    while slave.resource_state().await.is_none() {
        assert!(tokio::time::Instant::now() < deadline, "resource state never captured");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(slave.resource_state().await, Some(Bytes::from_static(b"shared resource")));
}

#[tokio::test]
async fn switch_reaches_a_host_behind_a_slave() {
    let (master_stream, _slave) = host_behind_slave();

    let switch = RelaySwitch::connect(vec![SocketPair::split(master_stream)]).await.unwrap();

    let rid = MessageId::Opaque([11; 16]);
    switch.send_to_master(Frame::req(rid, TEXT_CAP), None).await.unwrap();
    switch
        .send_to_master(Frame::chunk(rid, 0, Bytes::from_static(b"through the fabric")), None)
        .await
        .unwrap();
    switch.send_to_master(Frame::end(rid), None).await.unwrap();

    let mut payload = Vec::new();
    loop {
        let frame = switch.read_from_masters(Some(WAIT)).await.expect("response frame");
        assert_eq!(frame.id, rid);
        assert_eq!(frame.routing_id, None);
        match frame.frame_type {
            FrameType::Chunk => {
                payload.extend_from_slice(frame.payload.as_deref().unwrap_or_default());
            },
            FrameType::End => break,
            FrameType::StreamStart | FrameType::StreamEnd => {},
            other => panic!("unexpected {other:?} in response"),
        }
    }
    assert_eq!(payload, b"through the fabric");
}
