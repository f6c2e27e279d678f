//! End-to-end tests over real WebSockets: a server plus raw clients
//! exercising the full join → operation → batch-delivery pipeline.

use std::sync::Arc;
use std::time::Duration;

use fresco_collab::{
    CollabConfig, CompressionConfig, JoinRequest, MemoryStore, MessageKind, OpPayload, Operation,
    ServerConfig, SyncRequest, SyncServer, WireMessage,
};
use fresco_spatial::{BoundingBox, Point};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with a small batch size so single operations flush
/// immediately. Returns the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        collab: CollabConfig {
            compression: CompressionConfig {
                batch_size: 1,
                batch_timeout: Duration::from_millis(50),
                ..CompressionConfig::default()
            },
            ..CollabConfig::default()
        },
    };
    let server = SyncServer::new(config, Arc::new(MemoryStore::new()));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the listener time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn connect(port: u16) -> WsClient {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

async fn send_frame(ws: &mut WsClient, frame: &WireMessage) {
    ws.send(Message::Binary(frame.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Receive the next decodable frame within two seconds.
async fn recv_frame(ws: &mut WsClient) -> WireMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Binary(data) = msg {
            let bytes: Vec<u8> = data.into();
            return WireMessage::decode(&bytes).unwrap();
        }
    }
}

/// Join a room, consuming the snapshot batch reply.
async fn join(ws: &mut WsClient, room: Uuid, user: Uuid) -> WireMessage {
    send_frame(
        ws,
        &WireMessage::join(
            room,
            user,
            &JoinRequest {
                display_name: "tester".into(),
                viewport: None,
            },
        ),
    )
    .await;
    recv_frame(ws).await
}

fn stroke_create(room: Uuid, user: Uuid, stroke: Uuid) -> Operation {
    Operation::new(
        room,
        user,
        OpPayload::StrokeCreate {
            stroke_id: stroke,
            points: vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)],
            color: [0.1, 0.2, 0.3, 1.0],
            thickness: 2.0,
        },
    )
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let result = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await;
    assert!(result.is_ok(), "should connect to server");
}

#[tokio::test]
async fn test_join_receives_snapshot_batch() {
    let port = start_test_server().await;
    let mut ws = connect(port).await;

    let snapshot = join(&mut ws, Uuid::new_v4(), Uuid::new_v4()).await;
    assert_eq!(snapshot.kind, MessageKind::Batch);
    assert_eq!(snapshot.client_version, 0);
    assert!(snapshot.batch_payload().unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_operation_acked_and_batched_to_peer() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = Uuid::new_v4();
    let mut ws_alice = connect(port).await;
    join(&mut ws_alice, room, alice).await;

    let bob = Uuid::new_v4();
    let mut ws_bob = connect(port).await;
    join(&mut ws_bob, room, bob).await;

    let op = stroke_create(room, alice, Uuid::new_v4());
    send_frame(&mut ws_alice, &WireMessage::operation(room, alice, 0, &op)).await;

    // Alice gets the commit ack with the assigned version.
    let ack = recv_frame(&mut ws_alice).await;
    assert_eq!(ack.kind, MessageKind::Operation);
    let committed = ack.operation_payload().unwrap();
    assert_eq!(committed.version, 1);

    // Bob receives the operation through a compressed batch.
    let frame = recv_frame(&mut ws_bob).await;
    assert_eq!(frame.kind, MessageKind::Batch);
    let batch = frame.batch_payload().unwrap();
    assert_eq!(batch.messages.len(), 1);
    assert_eq!(batch.messages[0].version, 1);
}

#[tokio::test]
async fn test_rejected_operation_echoed_to_originator_only() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = Uuid::new_v4();
    let mut ws_alice = connect(port).await;
    join(&mut ws_alice, room, alice).await;

    let bob = Uuid::new_v4();
    let mut ws_bob = connect(port).await;
    join(&mut ws_bob, room, bob).await;

    // Empty point list: invalid geometry, rejected before commit.
    let bad = Operation::new(
        room,
        alice,
        OpPayload::StrokeCreate {
            stroke_id: Uuid::new_v4(),
            points: vec![],
            color: [0.0; 4],
            thickness: 2.0,
        },
    );
    let bad_id = bad.id;
    send_frame(&mut ws_alice, &WireMessage::operation(room, alice, 0, &bad)).await;

    let reply = recv_frame(&mut ws_alice).await;
    assert_eq!(reply.kind, MessageKind::Rejected);
    let rejection = reply.rejection().unwrap();
    assert_eq!(rejection.operation_id, bad_id);
    assert!(rejection.reason.contains("geometry"));

    // Bob sees nothing: the rejection never entered shared state.
    let nothing = timeout(Duration::from_millis(300), ws_bob.next()).await;
    assert!(nothing.is_err(), "rejection must not reach other clients");
}

#[tokio::test]
async fn test_concurrent_update_loses_to_delete_across_clients() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();
    let stroke = Uuid::new_v4();

    let alice = Uuid::new_v4();
    let mut ws_alice = connect(port).await;
    join(&mut ws_alice, room, alice).await;

    // Alice draws the stroke (version 1).
    send_frame(
        &mut ws_alice,
        &WireMessage::operation(room, alice, 0, &stroke_create(room, alice, stroke)),
    )
    .await;
    let ack = recv_frame(&mut ws_alice).await;
    assert_eq!(ack.operation_payload().unwrap().version, 1);

    // Alice deletes it (version 2).
    let delete = Operation::new(room, alice, OpPayload::StrokeDelete { stroke_id: stroke });
    send_frame(&mut ws_alice, &WireMessage::operation(room, alice, 1, &delete)).await;
    loop {
        let frame = recv_frame(&mut ws_alice).await;
        if frame.kind == MessageKind::Operation {
            assert_eq!(frame.operation_payload().unwrap().version, 2);
            break;
        }
    }

    // Bob, still at version 1, updates the deleted stroke: the delete
    // wins and his update commits as a no-op.
    let bob = Uuid::new_v4();
    let mut ws_bob = connect(port).await;
    join(&mut ws_bob, room, bob).await;

    let update = Operation::new(
        room,
        bob,
        OpPayload::StrokeUpdate {
            stroke_id: stroke,
            points: None,
            color: Some([1.0, 0.0, 0.0, 1.0]),
            thickness: None,
        },
    );
    send_frame(&mut ws_bob, &WireMessage::operation(room, bob, 1, &update)).await;
    loop {
        let frame = recv_frame(&mut ws_bob).await;
        if frame.kind == MessageKind::Operation {
            let committed = frame.operation_payload().unwrap();
            assert!(committed.payload.is_noop());
            assert_eq!(committed.version, 3);
            break;
        }
    }
}

#[tokio::test]
async fn test_sync_request_catches_up_missed_operations() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = Uuid::new_v4();
    let mut ws_alice = connect(port).await;
    join(&mut ws_alice, room, alice).await;

    for i in 0..3 {
        let op = stroke_create(room, alice, Uuid::new_v4());
        send_frame(&mut ws_alice, &WireMessage::operation(room, alice, i, &op)).await;
        loop {
            if recv_frame(&mut ws_alice).await.kind == MessageKind::Operation {
                break;
            }
        }
    }

    // A reconnecting client at version 1 asks for everything newer.
    let bob = Uuid::new_v4();
    let mut ws_bob = connect(port).await;
    join(&mut ws_bob, room, bob).await;
    send_frame(
        &mut ws_bob,
        &WireMessage::sync_request(
            room,
            bob,
            &SyncRequest {
                since_version: 1,
                viewport: None,
            },
        ),
    )
    .await;

    let mut versions = Vec::new();
    while versions.len() < 2 {
        let frame = recv_frame(&mut ws_bob).await;
        if frame.kind == MessageKind::SyncOperation {
            versions.push(frame.operation_payload().unwrap().version);
        }
    }
    assert_eq!(versions, vec![2, 3]);
}

#[tokio::test]
async fn test_join_snapshot_contains_existing_strokes() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = Uuid::new_v4();
    let mut ws_alice = connect(port).await;
    join(&mut ws_alice, room, alice).await;
    send_frame(
        &mut ws_alice,
        &WireMessage::operation(room, alice, 0, &stroke_create(room, alice, Uuid::new_v4())),
    )
    .await;
    loop {
        if recv_frame(&mut ws_alice).await.kind == MessageKind::Operation {
            break;
        }
    }

    // A later joiner gets the existing stroke in the snapshot batch.
    let bob = Uuid::new_v4();
    let mut ws_bob = connect(port).await;
    let snapshot = join(&mut ws_bob, room, bob).await;
    assert_eq!(snapshot.client_version, 1);
    let batch = snapshot.batch_payload().unwrap();
    assert_eq!(batch.messages.len(), 1);
    assert!(matches!(
        batch.messages[0].payload,
        OpPayload::StrokeCreate { .. }
    ));
}

#[tokio::test]
async fn test_viewport_scoped_join_excludes_offscreen_strokes() {
    let port = start_test_server().await;
    let room = Uuid::new_v4();

    let alice = Uuid::new_v4();
    let mut ws_alice = connect(port).await;
    join(&mut ws_alice, room, alice).await;

    // Near stroke at the origin, far stroke at (5000, 5000).
    send_frame(
        &mut ws_alice,
        &WireMessage::operation(room, alice, 0, &stroke_create(room, alice, Uuid::new_v4())),
    )
    .await;
    let far = Operation::new(
        room,
        alice,
        OpPayload::StrokeCreate {
            stroke_id: Uuid::new_v4(),
            points: vec![Point::new(5000.0, 5000.0), Point::new(5010.0, 5010.0)],
            color: [0.0; 4],
            thickness: 2.0,
        },
    );
    send_frame(&mut ws_alice, &WireMessage::operation(room, alice, 1, &far)).await;
    let mut acked = 0;
    while acked < 2 {
        if recv_frame(&mut ws_alice).await.kind == MessageKind::Operation {
            acked += 1;
        }
    }

    let bob = Uuid::new_v4();
    let mut ws_bob = connect(port).await;
    send_frame(
        &mut ws_bob,
        &WireMessage::join(
            room,
            bob,
            &JoinRequest {
                display_name: "bob".into(),
                viewport: Some(BoundingBox::new(-50.0, -50.0, 100.0, 100.0)),
            },
        ),
    )
    .await;
    let snapshot = recv_frame(&mut ws_bob).await;
    assert_eq!(snapshot.batch_payload().unwrap().messages.len(), 1);
}
