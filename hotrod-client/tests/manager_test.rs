//! Integration tests for the connection pool over real TCP sockets.

mod common;

use std::time::Duration;

use tokio::net::TcpListener;

use common::{ping_body, response, response_with_topology, segment_topology, MockServer};
use hotrod_client::protocol::wire::write_array;
use hotrod_client::protocol::{OpCode, ProtocolVersion, Status};
use hotrod_client::{ClientConfig, ConnectionEvent, ConnectionManager};

#[tokio::test]
async fn test_manager_connects_probes_and_follows_topology() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = MockServer::new(stream);

        let ping = server.read_request().await;
        assert_eq!(ping.opcode, OpCode::Ping.code());
        server
            .send(&response(
                ping.message_id,
                OpCode::Ping.response_code(),
                0,
                &ping_body(30, &[]),
            ))
            .await;

        // The member this client talks to is no longer part of the cache.
        let get = server.read_request().await;
        server.read_array().await;
        let topology = segment_topology(5, &[("10.9.9.9", 11222)], &[&[0]]);
        server
            .send(&response_with_topology(
                get.message_id,
                OpCode::Get.response_code(),
                Status::KeyDoesNotExist.code(),
                &topology,
                &[],
            ))
            .await;
        server
    });

    let config = ClientConfig::builder()
        .add_address(address)
        .max_protocol_version(ProtocolVersion::V3_0)
        .connection_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let manager = ConnectionManager::new(config);
    let mut events = manager.subscribe();

    manager.start().await.unwrap();
    assert_eq!(manager.connection_count().await, 1);
    assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Connected { .. }));

    let connection = manager.connection_for(b"books", None).await.unwrap();
    assert_eq!(connection.codec().version(), ProtocolVersion::V3_0);

    let header = connection.request(OpCode::Get, b"books");
    let found = connection
        .execute(
            header,
            |_, buf| {
                write_array(buf, b"k");
                Ok(())
            },
            |_, status, _| Ok(status != Status::KeyDoesNotExist),
        )
        .await
        .unwrap();
    assert!(!found);

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ConnectionEvent::Disconnected { address: gone, reason, .. } => {
            assert_eq!(gone.port, address.port());
            assert_eq!(reason, "left the cluster");
        }
        other => panic!("expected disconnect, got {:?}", other),
    }
    assert_eq!(manager.connection_count().await, 0);
    assert!(!connection.is_valid());

    manager.shutdown().await;
    drop(server_task.await.unwrap());
}

#[tokio::test]
async fn test_manager_shutdown_closes_connections() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut server = MockServer::new(stream);
        let ping = server.read_request().await;
        server
            .send(&response(
                ping.message_id,
                OpCode::Ping.response_code(),
                0,
                &ping_body(30, &[]),
            ))
            .await;
        server.is_closed_by_client().await
    });

    let config = ClientConfig::builder()
        .add_address(address)
        .max_protocol_version(ProtocolVersion::V3_0)
        .build()
        .unwrap();
    let manager = ConnectionManager::new(config);
    manager.start().await.unwrap();
    let connection = manager.connection_for(b"books", None).await.unwrap();

    manager.shutdown().await;
    assert_eq!(manager.connection_count().await, 0);
    assert!(!connection.is_valid());
    drop(connection);

    let closed = tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .unwrap()
        .unwrap();
    assert!(closed);
}
