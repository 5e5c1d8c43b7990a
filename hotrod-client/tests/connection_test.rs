//! Integration tests for request multiplexing, event dispatch, topology
//! updates and streaming over a single connection.

mod common;

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use common::{
    array, connect_mock, created_event, error_response, ping_body, response,
    response_with_topology, segment_topology, test_config, Harness,
};
use hotrod_client::protocol::wire::{write_array, write_vint};
use hotrod_client::protocol::{
    ClientEvent, ListenerParams, OpCode, ProtocolVersion, ServerAddress, Status, WireReader,
};
use hotrod_client::{ClientConfig, Connection, HotRodError, Result};

fn write_key(key: &'static [u8]) -> impl FnOnce(&hotrod_client::protocol::Codec, &mut BytesMut) -> Result<()> {
    move |_, buf| {
        write_array(buf, key);
        Ok(())
    }
}

fn read_optional_value(
    _: &hotrod_client::protocol::Codec,
    status: Status,
    reader: &mut WireReader<'_>,
) -> Result<Option<Bytes>> {
    if status == Status::KeyDoesNotExist {
        return Ok(None);
    }
    reader.read_bytes_owned().map(Some)
}

async fn get(connection: &Connection, key: &'static [u8]) -> Result<Option<Bytes>> {
    let header = connection.request(OpCode::Get, b"books");
    connection
        .execute(header, write_key(key), read_optional_value)
        .await
}

#[tokio::test]
async fn test_get_round_trip() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (value, ()) = tokio::join!(get(&connection, b"isbn-1"), async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, OpCode::Get.code());
        assert_eq!(request.version, ProtocolVersion::V3_0.as_byte());
        assert_eq!(&request.cache_name[..], b"books");
        assert_eq!(request.topology_id, -1);
        assert_eq!(&server.read_array().await[..], b"isbn-1");
        server
            .send(&response(
                request.message_id,
                OpCode::Get.response_code(),
                Status::NoError.code(),
                &array(b"Dune"),
            ))
            .await;
    });

    assert_eq!(value.unwrap(), Some(Bytes::from_static(b"Dune")));
    assert_eq!(connection.pending_count(), 0);
}

#[tokio::test]
async fn test_missing_key_uses_status() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (value, ()) = tokio::join!(get(&connection, b"nope"), async {
        let request = server.read_request().await;
        server.read_array().await;
        server
            .send(&response(
                request.message_id,
                OpCode::Get.response_code(),
                Status::KeyDoesNotExist.code(),
                &[],
            ))
            .await;
    });

    assert_eq!(value.unwrap(), None);
}

#[tokio::test]
async fn test_pipelined_responses_complete_in_order() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (first, second, third, ()) = tokio::join!(
        get(&connection, b"a"),
        get(&connection, b"b"),
        get(&connection, b"c"),
        async {
            let mut requests = Vec::new();
            for _ in 0..3 {
                let request = server.read_request().await;
                let key = server.read_array().await;
                requests.push((request, key));
            }
            let mut frames = BytesMut::new();
            for (request, key) in &requests {
                let mut value = b"value-".to_vec();
                value.extend_from_slice(key);
                frames.extend_from_slice(&response(
                    request.message_id,
                    OpCode::Get.response_code(),
                    0,
                    &array(&value),
                ));
            }
            // All three responses arrive in one read.
            server.send(&frames).await;
        }
    );

    assert_eq!(first.unwrap().unwrap(), Bytes::from_static(b"value-a"));
    assert_eq!(second.unwrap().unwrap(), Bytes::from_static(b"value-b"));
    assert_eq!(third.unwrap().unwrap(), Bytes::from_static(b"value-c"));
}

#[tokio::test]
async fn test_response_split_across_reads() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (value, ()) = tokio::join!(get(&connection, b"k"), async {
        let request = server.read_request().await;
        server.read_array().await;
        let frame = response(
            request.message_id,
            OpCode::Get.response_code(),
            0,
            &array(&[7u8; 300]),
        );
        for piece in frame.chunks(7) {
            server.send(piece).await;
            tokio::task::yield_now().await;
        }
    });

    assert_eq!(value.unwrap().unwrap().len(), 300);
}

#[tokio::test]
async fn test_recoverable_server_error_keeps_connection() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (result, ()) = tokio::join!(get(&connection, b"k"), async {
        let request = server.read_request().await;
        server.read_array().await;
        server
            .send(&error_response(
                request.message_id,
                Status::ServerError.code(),
                "cache is being rebalanced",
            ))
            .await;
    });

    match result {
        Err(HotRodError::Server {
            status, message, ..
        }) => {
            assert_eq!(status, 0x85);
            assert_eq!(message, "cache is being rebalanced");
        }
        other => panic!("expected server error, got {:?}", other),
    }
    assert!(connection.is_valid());
}

#[tokio::test]
async fn test_node_suspected_is_retryable() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (result, ()) = tokio::join!(get(&connection, b"k"), async {
        let request = server.read_request().await;
        server.read_array().await;
        server
            .send(&error_response(
                request.message_id,
                Status::NodeSuspected.code(),
                "node-3 suspected",
            ))
            .await;
    });

    let error = result.unwrap_err();
    assert!(matches!(error, HotRodError::NodeSuspected { .. }));
    assert!(error.is_retryable());
    assert!(connection.is_valid());
}

#[tokio::test]
async fn test_fatal_status_fails_pending_requests() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (first, second, ()) = tokio::join!(get(&connection, b"a"), get(&connection, b"b"), async {
        let request = server.read_request().await;
        server.read_array().await;
        server.read_request().await;
        server.read_array().await;
        server
            .send(&error_response(
                request.message_id,
                Status::UnknownVersion.code(),
                "unknown version",
            ))
            .await;
    });

    assert!(matches!(first, Err(HotRodError::Server { status: 0x83, .. })));
    assert!(matches!(second, Err(HotRodError::Connection(_))));
    assert!(!connection.is_valid());
    assert!(matches!(get(&connection, b"c").await, Err(HotRodError::Connection(_))));
}

#[tokio::test]
async fn test_failed_body_reader_closes_connection_with_reason() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let rejecting = async {
        let header = connection.request(OpCode::Get, b"books");
        connection
            .execute(header, write_key(b"a"), |_, _, _| -> Result<Bytes> {
                Err(HotRodError::Unsupported("value format".to_string()))
            })
            .await
    };
    let (first, second, ()) = tokio::join!(rejecting, get(&connection, b"b"), async {
        let request = server.read_request().await;
        server.read_array().await;
        server.read_request().await;
        server.read_array().await;
        server
            .send(&response(
                request.message_id,
                OpCode::Get.response_code(),
                0,
                &array(b"never read"),
            ))
            .await;
    });

    assert!(matches!(first, Err(HotRodError::Unsupported(_))));
    match second {
        Err(HotRodError::Connection(reason)) => {
            assert!(reason.contains("response body not fully decoded"));
            assert!(!reason.contains("invalid magic"));
        }
        other => panic!("expected connection error, got {:?}", other),
    }
    assert!(!connection.is_valid());
}

#[tokio::test]
async fn test_invalid_magic_closes_connection() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (result, ()) = tokio::join!(get(&connection, b"k"), async {
        server.read_request().await;
        server.read_array().await;
        server.send(&[0xA0, 0x01, 0x04, 0x00, 0x00]).await;
    });

    match result {
        Err(HotRodError::Connection(reason)) => assert!(reason.contains("invalid magic")),
        other => panic!("expected connection error, got {:?}", other),
    }
    assert!(!connection.is_valid());
}

#[tokio::test]
async fn test_server_close_fails_pending_request() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());

    let (result, ()) = tokio::join!(get(&connection, b"k"), async {
        server.read_request().await;
        server.read_array().await;
        drop(server);
    });

    assert!(matches!(result, Err(HotRodError::Connection(_))));
    assert!(!connection.is_valid());
}

#[tokio::test]
async fn test_timed_out_response_is_discarded() {
    let config = ClientConfig::builder()
        .max_protocol_version(ProtocolVersion::V3_0)
        .socket_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&config);

    let (result, late) = tokio::join!(get(&connection, b"slow"), async {
        let request = server.read_request().await;
        server.read_array().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        request
    });
    assert!(matches!(result, Err(HotRodError::Timeout(_))));
    assert!(connection.is_valid());

    // The late answer is read and dropped; the next request still matches.
    let (value, ()) = tokio::join!(get(&connection, b"fast"), async {
        server
            .send(&response(late.message_id, OpCode::Get.response_code(), 0, &array(b"stale")))
            .await;
        let request = server.read_request().await;
        server.read_array().await;
        server
            .send(&response(request.message_id, OpCode::Get.response_code(), 0, &array(b"fresh")))
            .await;
    });
    assert_eq!(value.unwrap().unwrap(), Bytes::from_static(b"fresh"));
}

#[tokio::test]
async fn test_event_interleaved_with_response() {
    let Harness {
        connection,
        mut server,
        listeners,
        ..
    } = connect_mock(&test_config());

    let (handle, listener_id) = tokio::join!(
        connection.add_listener(b"books", ListenerParams::default(), None),
        async {
            let request = server.read_request().await;
            assert_eq!(request.opcode, OpCode::AddClientListener.code());
            let listener_id = server.read_array().await;
            assert_eq!(server.read_u8().await, 0, "include current state");
            assert_eq!(server.read_string().await, "", "filter factory");
            assert_eq!(server.read_string().await, "", "converter factory");
            assert_eq!(server.read_u8().await, 0, "raw data");
            assert_eq!(server.read_vint().await, 0x0F, "interests");
            server
                .send(&response(request.message_id, OpCode::AddClientListener.response_code(), 0, &[]))
                .await;
            listener_id
        }
    );
    let mut handle = handle.unwrap();
    assert_eq!(handle.id().as_bytes(), &listener_id);
    assert_eq!(listeners.len(), 1);

    let (value, ()) = tokio::join!(get(&connection, b"isbn-9"), async {
        let request = server.read_request().await;
        server.read_array().await;
        let mut frames = created_event(&listener_id, b"isbn-9", 17);
        frames.extend_from_slice(&response(
            request.message_id,
            OpCode::Get.response_code(),
            0,
            &array(b"Hyperion"),
        ));
        server.send(&frames).await;
    });
    assert_eq!(value.unwrap().unwrap(), Bytes::from_static(b"Hyperion"));

    let event = tokio::time::timeout(Duration::from_secs(1), handle.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        ClientEvent::Created {
            listener_id,
            key: Bytes::from_static(b"isbn-9"),
            version: 17,
            retried: false,
        }
    );
    assert_eq!(listeners.stats().delivered(), 1);
}

#[tokio::test]
async fn test_event_for_unknown_listener_is_counted() {
    let Harness {
        connection,
        mut server,
        listeners,
        ..
    } = connect_mock(&test_config());

    let (value, ()) = tokio::join!(get(&connection, b"k"), async {
        let request = server.read_request().await;
        server.read_array().await;
        let mut frames = created_event(b"stranger", b"k", 1);
        frames.extend_from_slice(&response(
            request.message_id,
            OpCode::Get.response_code(),
            0,
            &array(b"v"),
        ));
        server.send(&frames).await;
    });

    assert_eq!(value.unwrap().unwrap(), Bytes::from_static(b"v"));
    assert_eq!(listeners.stats().unexpected(), 1);
    assert!(connection.is_valid());
}

#[tokio::test]
async fn test_remove_listener_unregisters_locally() {
    let Harness {
        connection,
        mut server,
        listeners,
        ..
    } = connect_mock(&test_config());

    let (handle, ()) = tokio::join!(
        connection.add_listener(b"books", ListenerParams::default(), None),
        async {
            let request = server.read_request().await;
            server.read_array().await;
            server.read_u8().await;
            server.read_string().await;
            server.read_string().await;
            server.read_u8().await;
            server.read_vint().await;
            server
                .send(&response(request.message_id, OpCode::AddClientListener.response_code(), 0, &[]))
                .await;
        }
    );
    let handle = handle.unwrap();

    let (removed, ()) = tokio::join!(connection.remove_listener(b"books", &handle), async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, OpCode::RemoveClientListener.code());
        assert_eq!(&server.read_array().await, handle.id().as_bytes());
        server
            .send(&response(request.message_id, OpCode::RemoveClientListener.response_code(), 0, &[]))
            .await;
    });

    assert!(removed.unwrap());
    assert!(listeners.is_empty());
}

#[tokio::test]
async fn test_topology_update_reaches_routing_table() {
    let Harness {
        connection,
        mut server,
        routing,
        ..
    } = connect_mock(&test_config());
    let mut events = routing.subscribe();

    let (value, ()) = tokio::join!(get(&connection, b"k"), async {
        let request = server.read_request().await;
        server.read_array().await;
        let topology = segment_topology(
            7,
            &[("10.0.0.1", 11222), ("10.0.0.2", 11222)],
            &[&[0, 1], &[1, 0]],
        );
        server
            .send(&response_with_topology(
                request.message_id,
                OpCode::Get.response_code(),
                0,
                &topology,
                &array(b"v"),
            ))
            .await;
    });
    assert_eq!(value.unwrap().unwrap(), Bytes::from_static(b"v"));

    let topology = routing.snapshot(b"books").unwrap();
    assert_eq!(topology.topology_id(), 7);
    assert_eq!(topology.num_segments(), Some(2));
    assert_eq!(
        routing.owners_for_segment(b"books", 1).unwrap(),
        vec![ServerAddress::new("10.0.0.2", 11222), ServerAddress::new("10.0.0.1", 11222)]
    );
    assert!(events.try_recv().is_ok());

    // Later requests carry the new topology id.
    let (_, ()) = tokio::join!(get(&connection, b"k"), async {
        let request = server.read_request().await;
        assert_eq!(request.topology_id, 7);
        server.read_array().await;
        server
            .send(&response(request.message_id, OpCode::Get.response_code(), 2, &[]))
            .await;
    });
}

#[tokio::test]
async fn test_topology_after_cluster_switch_is_ignored() {
    let Harness {
        connection,
        mut server,
        routing,
        ..
    } = connect_mock(&test_config());

    let (value, ()) = tokio::join!(get(&connection, b"k"), async {
        let request = server.read_request().await;
        server.read_array().await;
        // The request was prepared at age 0; the client moves on meanwhile.
        routing.switch_cluster(vec![ServerAddress::new("10.1.0.1", 11222)]);
        let topology = segment_topology(3, &[("10.0.0.1", 11222)], &[&[0]]);
        server
            .send(&response_with_topology(
                request.message_id,
                OpCode::Get.response_code(),
                0,
                &topology,
                &array(b"v"),
            ))
            .await;
    });

    assert!(value.is_ok());
    assert!(routing.snapshot(b"books").is_none());
    assert_eq!(routing.topology_age(), 1);
}

#[tokio::test]
async fn test_probe_negotiates_lower_version() {
    let config = ClientConfig::builder()
        .max_protocol_version(ProtocolVersion::V3_1)
        .build()
        .unwrap();
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&config);

    let (ping, ()) = tokio::join!(connection.probe(), async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, OpCode::Ping.code());
        assert_eq!(request.version, ProtocolVersion::V3_1.as_byte());
        server
            .send(&response(
                request.message_id,
                OpCode::Ping.response_code(),
                0,
                &ping_body(30, &[OpCode::Get.code() as u16]),
            ))
            .await;
    });

    let ping = ping.unwrap();
    assert_eq!(ping.server_version, Some(30));
    assert!(ping.supports_operation(OpCode::Get.code() as u16));
    assert_eq!(connection.codec().version(), ProtocolVersion::V3_0);

    let (_, ()) = tokio::join!(get(&connection, b"k"), async {
        let request = server.read_request().await;
        assert_eq!(request.version, ProtocolVersion::V3_0.as_byte());
        server.read_array().await;
        server
            .send(&response(request.message_id, OpCode::Get.response_code(), 2, &[]))
            .await;
    });
}

#[tokio::test]
async fn test_get_stream_reads_payload_then_resumes() {
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&test_config());
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    let header = connection.request(OpCode::GetStream, b"books");
    let (streamed, ()) = tokio::join!(
        connection.execute_get_stream(
            header,
            |_, buf| {
                write_array(buf, b"big");
                write_vint(buf, 0);
                Ok(())
            },
            |_, status, reader| {
                if status == Status::KeyDoesNotExist {
                    return Ok(None);
                }
                let version = reader.read_i64()?;
                let length = reader.read_vint()?;
                Ok(Some((version, u64::from(length))))
            },
        ),
        async {
            let request = server.read_request().await;
            assert_eq!(request.opcode, OpCode::GetStream.code());
            assert_eq!(&server.read_array().await[..], b"big");
            assert_eq!(server.read_vint().await, 0);
            let mut body = BytesMut::new();
            body.put_i64(99);
            write_vint(&mut body, payload.len() as u32);
            let mut frame = response(
                request.message_id,
                OpCode::GetStream.response_code(),
                0,
                &body,
            );
            frame.extend_from_slice(&payload);
            server.send(&frame).await;
        }
    );

    let (version, mut reader) = streamed.unwrap().unwrap();
    assert_eq!(version, 99);
    assert_eq!(reader.total_length(), Some(payload.len() as u64));
    let value = reader.read_to_end().await.unwrap();
    assert_eq!(&value[..], &payload[..]);
    assert!(reader.is_finished());

    let (value, ()) = tokio::join!(get(&connection, b"after"), async {
        let request = server.read_request().await;
        server.read_array().await;
        server
            .send(&response(request.message_id, OpCode::Get.response_code(), 0, &array(b"ok")))
            .await;
    });
    assert_eq!(value.unwrap().unwrap(), Bytes::from_static(b"ok"));
}

#[tokio::test]
async fn test_put_stream_sends_chunks() {
    let config = ClientConfig::builder()
        .max_protocol_version(ProtocolVersion::V3_0)
        .streaming(|s| s.chunk_size(4).chunks_in_flight(1))
        .build()
        .unwrap();
    let Harness {
        connection,
        mut server,
        ..
    } = connect_mock(&config);

    let upload = async {
        let header = connection.request(OpCode::PutStream, b"books");
        let mut upload = connection
            .execute_put_stream(
                header,
                |codec, buf| {
                    write_array(buf, b"big");
                    codec.write_expiration(buf, &Default::default());
                    buf.put_i64(0);
                    Ok(())
                },
                |_, status, _| Ok(status),
            )
            .await?;
        upload.write(b"abcdef").await?;
        upload.write(b"ghij").await?;
        assert_eq!(upload.bytes_written(), 10);
        upload.finish().await
    };

    let server_side = async {
        let request = server.read_request().await;
        assert_eq!(request.opcode, OpCode::PutStream.code());
        assert_eq!(&server.read_array().await[..], b"big");
        // Expiration: unit byte for default lifespan and max idle.
        server.read_u8().await;
        server.read_exact(8).await;
        let (value, frames) = server.read_chunked().await;
        assert_eq!(value, b"abcdefghij");
        assert_eq!(frames.last(), Some(&0));
        server
            .send(&response(request.message_id, OpCode::PutStream.response_code(), 0, &[]))
            .await;
    };

    let (status, ()) = tokio::join!(upload, server_side);
    assert_eq!(status.unwrap(), Status::NoError);
    assert!(connection.is_valid());
}

#[tokio::test]
async fn test_abandoned_put_stream_closes_connection() {
    let Harness {
        connection,
        server: _server,
        ..
    } = connect_mock(&test_config());

    let header = connection.request(OpCode::PutStream, b"books");
    let mut upload = connection
        .execute_put_stream(
            header,
            |_, buf| {
                write_array(buf, b"big");
                Ok(())
            },
            |_, status, _| Ok(status),
        )
        .await
        .unwrap();
    upload.write(b"partial").await.unwrap();
    drop(upload);

    assert!(!connection.is_valid());
    assert!(matches!(get(&connection, b"k").await, Err(HotRodError::Connection(_))));
}
