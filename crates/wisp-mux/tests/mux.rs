//! Session-level tests over an in-memory carrier.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use wisp_mux::extension::{Extension, MOTD_EXTENSION_ID, UDP_EXTENSION_ID};
use wisp_mux::packet::{CloseReason, ConnectPacket, Packet, PacketType, StreamType, WispVersion};
use wisp_mux::{Role, ServerMux, WispError};

/// Inbound side of the fake carrier: frames the "client" pushed.
struct TestRead(mpsc::UnboundedReceiver<Bytes>);

impl Stream for TestRead {
    type Item = Result<Bytes, WispError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.poll_recv(cx).map(|opt| opt.map(Ok))
    }
}

/// Outbound side of the fake carrier: frames the server sent.
#[derive(Clone)]
struct TestWrite(mpsc::UnboundedSender<Bytes>);

impl Sink<Bytes> for TestWrite {
    type Error = WispError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.0.send(item).map_err(|_| WispError::MuxClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl wisp_mux::ws::WebSocketWrite for TestWrite {}

struct Client {
    to_server: mpsc::UnboundedSender<Bytes>,
    from_server: mpsc::UnboundedReceiver<Bytes>,
}

impl Client {
    fn send(&self, packet: Packet) {
        self.to_server.send(packet.encode()).unwrap();
    }

    async fn next_packet(&mut self) -> Packet {
        let frame = timeout(Duration::from_secs(5), self.from_server.recv())
            .await
            .expect("timed out waiting for a server frame")
            .expect("carrier closed");
        Packet::decode(frame, Role::Server, &[UDP_EXTENSION_ID, MOTD_EXTENSION_ID]).unwrap()
    }

    async fn expect_silence(&mut self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            self.from_server.try_recv().is_err(),
            "expected no further frames from the server"
        );
    }
}

fn carrier() -> (Client, TestRead, TestWrite) {
    let (to_server, server_rx) = mpsc::unbounded_channel();
    let (server_tx, from_server) = mpsc::unbounded_channel();
    (
        Client {
            to_server,
            from_server,
        },
        TestRead(server_rx),
        TestWrite(server_tx),
    )
}

async fn serve(
    buffer_size: u32,
    extensions: Option<Vec<Extension>>,
) -> (Client, ServerMux<TestWrite>, JoinHandle<Result<(), WispError>>) {
    let (client, read, write) = carrier();
    let (mux, task) = ServerMux::new(read, write, buffer_size, extensions)
        .await
        .unwrap()
        .with_no_required_extensions();
    (client, mux, tokio::spawn(task))
}

fn connect_packet(host: &str, port: u16, stream_type: StreamType) -> ConnectPacket {
    ConnectPacket {
        stream_type,
        host: host.to_string(),
        port,
    }
}

#[tokio::test]
async fn test_v1_session_echo() {
    let (mut client, mux, _task) = serve(128, None).await;

    // The session opens with a credit grant on the control stream.
    let initial = client.next_packet().await;
    assert_eq!(initial.stream_id, 0);
    assert_eq!(initial.packet_type, PacketType::Continue(128));

    client.send(Packet::new_connect(
        1,
        connect_packet("example.com", 80, StreamType::Tcp),
    ));
    let (connect, mut stream) = mux.wait_for_stream().await.unwrap();
    assert_eq!(connect.host, "example.com");
    assert_eq!(connect.port, 80);
    assert_eq!(connect.stream_type, StreamType::Tcp);
    assert_eq!(stream.stream_id(), 1);

    // Target → client.
    stream.write(Bytes::from_static(b"HI")).await.unwrap();
    let data = client.next_packet().await;
    assert_eq!(data.stream_id, 1);
    assert_eq!(data.packet_type, PacketType::Data(Bytes::from_static(b"HI")));

    // Client → target, including an empty chunk, in order.
    client.send(Packet::new_data(1, Bytes::from_static(b"ping")));
    client.send(Packet::new_data(1, Bytes::new()));
    assert_eq!(stream.read().await.unwrap(), Bytes::from_static(b"ping"));
    assert_eq!(stream.read().await.unwrap(), Bytes::new());
}

#[tokio::test]
async fn test_continue_issued_every_half_capacity() {
    let (mut client, mux, _task) = serve(128, None).await;
    assert_eq!(client.next_packet().await.packet_type, PacketType::Continue(128));

    client.send(Packet::new_connect(
        1,
        connect_packet("example.com", 80, StreamType::Tcp),
    ));
    let (_, mut stream) = mux.wait_for_stream().await.unwrap();

    for _ in 0..65 {
        client.send(Packet::new_data(1, Bytes::from_static(b"x")));
    }
    // Let the packet loop ingest everything before draining.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..65 {
        stream.read().await.unwrap();
    }

    // The 64th drained chunk schedules a credit grant; it goes out ahead of
    // the next read with the remaining buffer space at issuance time
    // (128 entries minus the one chunk still queued).
    let cont = client.next_packet().await;
    assert_eq!(cont.stream_id, 1);
    assert_eq!(cont.packet_type, PacketType::Continue(127));
}

#[tokio::test]
async fn test_client_continue_is_dropped_and_session_survives() {
    let (mut client, mux, _task) = serve(128, None).await;
    client.next_packet().await;

    client.send(Packet::new_connect(
        1,
        connect_packet("example.com", 80, StreamType::Tcp),
    ));
    let (_, mut stream) = mux.wait_for_stream().await.unwrap();

    // Only the server may issue CONTINUE; this one is logged and ignored.
    client.send(Packet::new_continue(1, 0));
    client.send(Packet::new_data(1, Bytes::from_static(b"still alive")));
    assert_eq!(
        stream.read().await.unwrap(),
        Bytes::from_static(b"still alive")
    );
}

#[tokio::test]
async fn test_data_for_unknown_stream_is_dropped() {
    let (mut client, mux, _task) = serve(128, None).await;
    client.next_packet().await;

    client.send(Packet::new_data(9, Bytes::from_static(b"nobody home")));

    // The session keeps serving new streams afterwards.
    client.send(Packet::new_connect(
        1,
        connect_packet("example.com", 80, StreamType::Tcp),
    ));
    let (connect, _stream) = mux.wait_for_stream().await.unwrap();
    assert_eq!(connect.host, "example.com");
}

#[tokio::test]
async fn test_info_on_v1_session_is_dropped() {
    let (mut client, mux, _task) = serve(128, None).await;
    client.next_packet().await;

    // No INFO is ever exchanged on a v1 session; a stray one is ignored.
    client.send(Packet::new_info(WispVersion::CURRENT, vec![]));
    client.send(Packet::new_connect(
        1,
        connect_packet("example.com", 80, StreamType::Tcp),
    ));
    let (connect, _stream) = mux.wait_for_stream().await.unwrap();
    assert_eq!(connect.host, "example.com");
}

#[tokio::test]
async fn test_v2_handshake_negotiates_intersection() {
    let (client_to_server, server_rx) = mpsc::unbounded_channel();
    let (server_tx, mut from_server) = mpsc::unbounded_channel();

    // The client only supports UDP; its INFO is queued before the server
    // starts so the handshake can complete inline.
    client_to_server
        .send(Packet::new_info(WispVersion::CURRENT, vec![Extension::Udp]).encode())
        .unwrap();

    let offered = vec![
        Extension::Udp,
        Extension::Motd {
            message: Some("hi".to_string()),
        },
    ];
    let (mux, task) = ServerMux::new(TestRead(server_rx), TestWrite(server_tx), 128, Some(offered))
        .await
        .unwrap()
        .with_no_required_extensions();
    let _task = tokio::spawn(task);

    let info = Packet::decode(
        from_server.recv().await.unwrap(),
        Role::Server,
        &[UDP_EXTENSION_ID, MOTD_EXTENSION_ID],
    )
    .unwrap();
    assert_eq!(info.stream_id, 0);
    match info.packet_type {
        PacketType::Info(info) => {
            assert_eq!(info.version, WispVersion { major: 2, minor: 0 });
            assert_eq!(
                info.extensions,
                vec![
                    Extension::Udp,
                    Extension::Motd {
                        message: Some("hi".to_string()),
                    },
                ]
            );
        }
        other => panic!("expected info, got {:?}", other),
    }

    let cont = Packet::decode(from_server.recv().await.unwrap(), Role::Server, &[]).unwrap();
    assert_eq!(cont.packet_type, PacketType::Continue(128));

    // Only UDP survives the intersection; the MOTD stays dormant.
    assert_eq!(mux.get_extension_ids(), vec![UDP_EXTENSION_ID]);
}

#[tokio::test]
async fn test_handshake_rejects_non_info_first_packet() {
    let (client_to_server, server_rx) = mpsc::unbounded_channel();
    let (server_tx, mut from_server) = mpsc::unbounded_channel();

    client_to_server
        .send(Packet::new_data(1, Bytes::from_static(b"nope")).encode())
        .unwrap();

    let result = ServerMux::new(
        TestRead(server_rx),
        TestWrite(server_tx),
        128,
        Some(vec![Extension::Udp]),
    )
    .await;
    assert!(matches!(result, Err(WispError::Handshake(_))));

    // Server INFO first, then the close that ended the handshake.
    let _info = from_server.recv().await.unwrap();
    let close = Packet::decode(from_server.recv().await.unwrap(), Role::Server, &[]).unwrap();
    assert_eq!(close.stream_id, 0);
    assert_eq!(
        close.packet_type,
        PacketType::Close(CloseReason::ServerStreamInvalidInfo)
    );
}

#[tokio::test]
async fn test_required_extension_missing_closes_session() {
    let (client_to_server, server_rx) = mpsc::unbounded_channel();
    let (server_tx, mut from_server) = mpsc::unbounded_channel();

    client_to_server
        .send(Packet::new_info(WispVersion::CURRENT, vec![]).encode())
        .unwrap();

    let result = ServerMux::new(
        TestRead(server_rx),
        TestWrite(server_tx),
        128,
        Some(vec![Extension::Udp]),
    )
    .await
    .unwrap()
    .with_required_extensions(&[UDP_EXTENSION_ID])
    .await;
    assert!(matches!(result, Err(WispError::ExtensionsIncompatible)));

    let _info = from_server.recv().await.unwrap();
    let _initial_continue = from_server.recv().await.unwrap();
    let close = Packet::decode(from_server.recv().await.unwrap(), Role::Server, &[]).unwrap();
    assert_eq!(
        close.packet_type,
        PacketType::Close(CloseReason::ExtensionsIncompatible)
    );
}

#[tokio::test]
async fn test_local_close_emits_close_once() {
    let (mut client, mux, _task) = serve(128, None).await;
    client.next_packet().await;

    client.send(Packet::new_connect(
        2,
        connect_packet("example.com", 443, StreamType::Tcp),
    ));
    let (_, stream) = mux.wait_for_stream().await.unwrap();
    let closer = stream.get_close_handle();

    // The destination ended gracefully.
    closer.close(CloseReason::Voluntary).await.unwrap();
    let close = client.next_packet().await;
    assert_eq!(close.stream_id, 2);
    assert_eq!(close.packet_type, PacketType::Close(CloseReason::Voluntary));

    // Teardown is idempotent: no second CLOSE.
    closer.close(CloseReason::Unexpected).await.unwrap();
    stream.close(CloseReason::Voluntary).await.unwrap();
    client.expect_silence().await;
}

#[tokio::test]
async fn test_client_close_is_not_mirrored() {
    let (mut client, mux, _task) = serve(128, None).await;
    client.next_packet().await;

    client.send(Packet::new_connect(
        3,
        connect_packet("example.com", 80, StreamType::Udp),
    ));
    let (_, mut stream) = mux.wait_for_stream().await.unwrap();
    let closer = stream.get_close_handle();

    client.send(Packet::new_close(3, CloseReason::Voluntary));

    // The buffer ends, the pump unwinds, and its mirrored close is a no-op.
    assert!(stream.read().await.is_none());
    closer.close(CloseReason::Voluntary).await.unwrap();
    client.expect_silence().await;
}

#[tokio::test]
async fn test_mux_close_tears_down_streams() {
    let (mut client, mux, task) = serve(128, None).await;
    client.next_packet().await;

    client.send(Packet::new_connect(
        1,
        connect_packet("example.com", 80, StreamType::Tcp),
    ));
    let (_, mut stream) = mux.wait_for_stream().await.unwrap();

    mux.close().await;
    assert!(stream.read().await.is_none());
    assert!(task.await.unwrap().is_ok());
    assert!(mux.wait_for_stream().await.is_none());
}
