//! Session tests against an in-process fake device.
//!
//! Covers request framing, response correlation, device-type fallback,
//! heartbeats and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;

use common::*;
use localtuya::protocol::{CommandType, PROTOCOL_33_HEADER};
use localtuya::{ConnectionState, DeviceBuilder, DeviceType, TuyaError, Version};

const DP_QUERY: u32 = CommandType::DpQuery as u32;
const CONTROL: u32 = CommandType::Control as u32;
const CONTROL_NEW: u32 = CommandType::ControlNew as u32;

// ============================================================================
// Exchange
// ============================================================================

#[tokio::test]
async fn test_set_dps_v33_frame() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.set_dps(true, "1").await });

    let req = next_request(&mut server).await;
    assert_eq!(req.cmd, CONTROL);
    assert!(req.payload.starts_with(&PROTOCOL_33_HEADER));

    let body = decode_request(Version::V3_3, &req);
    assert_eq!(body["devId"], DEVICE_ID);
    assert_eq!(body["uid"], DEVICE_ID);
    assert_eq!(body["dps"], json!({"1": true}));
    let t = body["t"].as_str().expect("t is a string");
    assert!(t.parse::<u64>().is_ok(), "t should be unix seconds: {}", t);

    send(&mut server, &response(req.seqno, req.cmd, Vec::new())).await;
    assert_eq!(handle.await.unwrap().unwrap(), Some(json!({})));
}

#[tokio::test]
async fn test_status_updates_cache_and_listener() {
    let (client, mut server) = pipe();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let device = builder(Version::V3_3)
        .listener(move |status| {
            let _ = tx.send(status.clone());
        })
        .with_stream(client)
        .unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });

    let req = next_request(&mut server).await;
    assert_eq!(req.cmd, DP_QUERY);
    assert!(!req.payload.starts_with(&PROTOCOL_33_HEADER));
    assert_eq!(
        decode_request(Version::V3_3, &req),
        json!({"gwId": DEVICE_ID, "devId": DEVICE_ID})
    );

    let status = json!({"devId": DEVICE_ID, "dps": {"1": true, "2": 50}});
    send(&mut server, &v33_response(req.seqno, req.cmd, &status)).await;

    assert_eq!(handle.await.unwrap().unwrap(), Some(status.clone()));
    assert_eq!(rx.recv().await, Some(status));
    assert_eq!(device.cached_dps()["2"], json!(50));
    assert_eq!(device.dev_type(), DeviceType::TypeA);
}

#[tokio::test]
async fn test_concurrent_exchanges_correlate_by_seqno() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let d1 = device.clone();
    let first = tokio::spawn(async move { d1.set_dps(1, "1").await });
    let d2 = device.clone();
    let second = tokio::spawn(async move { d2.set_dps(2, "1").await });

    let a = next_request(&mut server).await;
    let b = next_request(&mut server).await;
    assert_ne!(a.seqno, b.seqno);

    // Answer in reverse order, echoing the requested dps
    for req in [&b, &a] {
        let body = decode_request(Version::V3_3, req);
        let reply = json!({"dps": body["dps"].clone()});
        send(&mut server, &v33_response(req.seqno, req.cmd, &reply)).await;
    }

    let first = first.await.unwrap().unwrap().unwrap();
    let second = second.await.unwrap().unwrap().unwrap();
    assert_eq!(first["dps"]["1"], json!(1));
    assert_eq!(second["dps"]["1"], json!(2));
    assert_eq!(device.pending_requests(), 0);
}

#[tokio::test]
async fn test_v31_plain_status_and_signed_set() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_1).with_stream(client).unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });
    let req = next_request(&mut server).await;
    assert_eq!(req.cmd, DP_QUERY);
    assert!(req.payload.starts_with(b"{"));
    let reply = json!({"dps": {"1": false}});
    send(&mut server, &response(req.seqno, req.cmd, reply.to_string().into_bytes())).await;
    assert_eq!(handle.await.unwrap().unwrap(), Some(reply));

    let d = device.clone();
    let handle = tokio::spawn(async move { d.set_dps("white", 21).await });
    let req = next_request(&mut server).await;
    assert_eq!(req.cmd, CONTROL);
    assert!(req.payload.starts_with(b"3.1"));
    let signature = std::str::from_utf8(&req.payload[3..19]).unwrap();
    assert_eq!(signature, cipher().sign_v31(&req.payload[19..]));
    assert_eq!(decode_request(Version::V3_1, &req)["dps"], json!({"21": "white"}));

    send(&mut server, &response(req.seqno, req.cmd, Vec::new())).await;
    assert_eq!(handle.await.unwrap().unwrap(), Some(json!({})));
}

#[tokio::test(start_paused = true)]
async fn test_exchange_timeout_cleans_registry() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });
    let _unanswered = next_request(&mut server).await;
    assert_eq!(device.pending_requests(), 1);

    assert_eq!(handle.await.unwrap(), Err(TuyaError::Timeout));
    assert_eq!(device.pending_requests(), 0);
    assert!(device.is_connected());
}

#[tokio::test]
async fn test_decode_error_reaches_caller() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });
    let req = next_request(&mut server).await;

    let garbled = cipher().encode_payload(Version::V3_3, CONTROL, b"not a json document");
    send(&mut server, &response(req.seqno, req.cmd, garbled)).await;

    assert!(matches!(handle.await.unwrap(), Err(TuyaError::DecodeError(_))));
    assert_eq!(device.pending_requests(), 0);
    assert!(device.is_connected());
}

// ============================================================================
// Device type fallback
// ============================================================================

#[tokio::test]
async fn test_fallback_to_type_d() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3)
        .dps_to_request([1])
        .with_stream(client)
        .unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });

    let first = next_request(&mut server).await;
    assert_eq!(first.cmd, DP_QUERY);
    send(&mut server, &sentinel_response(first.seqno, first.cmd)).await;

    let second = next_request(&mut server).await;
    assert_eq!(second.cmd, CONTROL_NEW);
    assert_eq!(second.seqno, first.seqno + 1);
    assert!(second.payload.starts_with(&PROTOCOL_33_HEADER));
    let body = decode_request(Version::V3_3, &second);
    assert_eq!(body["dps"], json!({"1": null}));
    assert!(body.get("t").is_some());

    let status = json!({"dps": {"1": true}});
    send(&mut server, &v33_response(second.seqno, second.cmd, &status)).await;

    assert_eq!(handle.await.unwrap().unwrap(), Some(status));
    assert_eq!(device.dev_type(), DeviceType::TypeD);

    // Later queries go straight to 0x0d
    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });
    let third = next_request(&mut server).await;
    assert_eq!(third.cmd, CONTROL_NEW);
    send(&mut server, &v33_response(third.seqno, third.cmd, &json!({"dps": {"1": false}}))).await;
    assert!(handle.await.unwrap().unwrap().is_some());
}

#[tokio::test]
async fn test_fallback_resends_only_once() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });

    let first = next_request(&mut server).await;
    send(&mut server, &sentinel_response(first.seqno, first.cmd)).await;
    let second = next_request(&mut server).await;
    assert_eq!(second.cmd, CONTROL_NEW);
    send(&mut server, &sentinel_response(second.seqno, second.cmd)).await;

    assert_eq!(handle.await.unwrap().unwrap(), None);
    assert_eq!(device.dev_type(), DeviceType::TypeD);
    assert_eq!(device.pending_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_status_during_fallback() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3)
        .dps_to_request([1])
        .with_stream(client)
        .unwrap();

    let d1 = device.clone();
    let first = tokio::spawn(async move { d1.status().await });
    let d2 = device.clone();
    let second = tokio::spawn(async move { d2.status().await });

    let a = next_request(&mut server).await;
    let b = next_request(&mut server).await;
    assert_eq!((a.cmd, b.cmd), (DP_QUERY, DP_QUERY));

    // The first rejection switches the session before the second reply lands
    send(&mut server, &sentinel_response(a.seqno, a.cmd)).await;
    send(&mut server, &sentinel_response(b.seqno, b.cmd)).await;

    for _ in 0..2 {
        let req = next_request(&mut server).await;
        assert_eq!(req.cmd, CONTROL_NEW);
        let reply = json!({"dps": {"1": true}});
        send(&mut server, &v33_response(req.seqno, req.cmd, &reply)).await;
    }

    let expected = Some(json!({"dps": {"1": true}}));
    assert_eq!(first.await.unwrap(), Ok(expected.clone()));
    assert_eq!(second.await.unwrap(), Ok(expected));
    assert_eq!(device.dev_type(), DeviceType::TypeD);
    assert_eq!(device.pending_requests(), 0);
}

// ============================================================================
// Datapoint detection
// ============================================================================

#[tokio::test]
async fn test_detect_dps_type_a_single_query() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.detect_available_dps().await });

    let req = next_request(&mut server).await;
    assert_eq!(req.cmd, DP_QUERY);
    let dps = json!({"1": true, "2": 10, "101": "auto"});
    send(&mut server, &v33_response(req.seqno, req.cmd, &json!({"dps": dps}))).await;

    let detected = handle.await.unwrap().unwrap();
    assert_eq!(Value::Object(detected), dps);
}

#[tokio::test]
async fn test_detect_dps_type_d_probes_ranges() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3)
        .dps_to_request([5])
        .with_stream(client)
        .unwrap();

    let requested = Arc::new(Mutex::new(Vec::new()));
    let seen = requested.clone();
    let fake = tokio::spawn(async move {
        let supported = ["1", "2", "11", "101"];
        loop {
            let Ok(req) = read_request(&mut server).await else { break };
            match req.cmd {
                DP_QUERY => send(&mut server, &sentinel_response(req.seqno, req.cmd)).await,
                CONTROL_NEW => {
                    let body = decode_request(Version::V3_3, &req);
                    let asked = body["dps"].as_object().unwrap().clone();
                    let dps: serde_json::Map<String, Value> = asked
                        .keys()
                        .filter(|k| supported.contains(&k.as_str()))
                        .map(|k| (k.clone(), json!(k.len())))
                        .collect();
                    seen.lock().push(asked.keys().cloned().collect::<Vec<_>>());
                    let reply = json!({"dps": dps});
                    send(&mut server, &v33_response(req.seqno, req.cmd, &reply)).await;
                }
                _ => {}
            }
        }
    });

    let detected = device.detect_available_dps().await.unwrap();
    let mut keys: Vec<_> = detected.keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, vec!["1", "101", "11", "2"]);

    let requested = requested.lock().clone();
    assert_eq!(requested.len(), 4);
    assert!(requested.iter().all(|r| r.first().map(String::as_str) == Some("1")));
    assert_eq!(requested[0].len(), 10);
    assert_eq!(requested[3].last().map(String::as_str), Some("110"));

    assert_eq!(device.dps_to_request(), vec!["5"]);
    device.close().await;
    let _ = fake.await;
}

// ============================================================================
// Status pushes
// ============================================================================

#[tokio::test]
async fn test_status_push_reaches_listener_and_stream() {
    let (client, mut server) = pipe();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let device = builder(Version::V3_3)
        .listener(move |status| {
            let _ = tx.send(status.clone());
        })
        .with_stream(client)
        .unwrap();

    let stream = device.stream();
    tokio::pin!(stream);

    let push = json!({"devId": DEVICE_ID, "dps": {"3": "auto"}, "t": 1700000000});
    send(&mut server, &v33_response(0, CommandType::Status as u32, &push)).await;

    assert_eq!(rx.recv().await, Some(push.clone()));
    assert_eq!(stream.next().await, Some(push));
    assert_eq!(device.cached_dps()["3"], json!("auto"));

    device.close().await;
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn test_stream_keeps_queued_updates_on_close() {
    let (client, mut server) = pipe();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let device = builder(Version::V3_3)
        .listener(move |status| {
            let _ = tx.send(status.clone());
        })
        .with_stream(client)
        .unwrap();

    let stream = device.stream();
    tokio::pin!(stream);

    let push = json!({"dps": {"7": 12}});
    send(&mut server, &v33_response(0, CommandType::Status as u32, &push)).await;
    assert_eq!(rx.recv().await, Some(push.clone()));

    device.close().await;
    assert_eq!(stream.next().await, Some(push));
    assert_eq!(stream.next().await, None);
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_cadence() {
    let start = Instant::now();
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let beats = Arc::new(Mutex::new(Vec::new()));
    let seen = beats.clone();
    tokio::spawn(async move {
        while let Ok(req) = read_request(&mut server).await {
            if req.cmd == CommandType::HeartBeat as u32 {
                assert_eq!(decode_request(Version::V3_3, &req), json!({}));
                seen.lock().push(start.elapsed());
            } else {
                let reply = json!({"dps": {"1": true}});
                send(&mut server, &v33_response(req.seqno, req.cmd, &reply)).await;
            }
        }
    });

    // Exchanges in between must not disturb the schedule
    device.status().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    device.status().await.unwrap();
    tokio::time::sleep_until(start + Duration::from_secs(99)).await;

    let observed = beats.lock().clone();
    assert_eq!(observed.len(), 5, "heartbeats at {:?}", observed);
    for pair in observed.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_secs(20));
    }

    // No more beats once closed
    device.close().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(beats.lock().len(), 5);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_close_aborts_pending_exchange() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });
    let _req = next_request(&mut server).await;

    device.close().await;
    assert_eq!(handle.await.unwrap(), Ok(None));
    assert_eq!(device.connection_state(), ConnectionState::Closed);
    assert_eq!(device.pending_requests(), 0);

    device.close().await;
    assert_eq!(device.status().await, Err(TuyaError::TransportClosed));
}

#[tokio::test]
async fn test_peer_disconnect_closes_session() {
    let (client, mut server) = pipe();
    let device = builder(Version::V3_3).with_stream(client).unwrap();

    let d = device.clone();
    let handle = tokio::spawn(async move { d.status().await });
    let _req = next_request(&mut server).await;
    drop(server);

    assert_eq!(handle.await.unwrap(), Ok(None));
    assert_eq!(device.connection_state(), ConnectionState::Closed);
}

// ============================================================================
// TCP bootstrap
// ============================================================================

#[tokio::test]
async fn test_connect_over_tcp_with_initial_status() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(req) = read_request(&mut stream).await {
            if req.cmd == DP_QUERY {
                let reply = json!({"dps": {"1": true, "9": 0}});
                send(&mut stream, &v33_response(req.seqno, req.cmd, &reply)).await;
            }
        }
    });

    let device = DeviceBuilder::new(DEVICE_ID, LOCAL_KEY)
        .address("127.0.0.1")
        .port(port)
        .initial_status(true)
        .connect()
        .await
        .unwrap();

    assert!(device.is_connected());
    assert_eq!(device.cached_dps()["9"], json!(0));
    device.close().await;
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = DeviceBuilder::new(DEVICE_ID, LOCAL_KEY)
        .address("127.0.0.1")
        .port(port)
        .connect()
        .await;
    assert!(matches!(result, Err(TuyaError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_invalid_key_fails_before_connecting() {
    let result = DeviceBuilder::new(DEVICE_ID, "short")
        .address("127.0.0.1")
        .port(1)
        .connect()
        .await;
    assert!(matches!(result, Err(TuyaError::InvalidKey)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let result = DeviceBuilder::new(DEVICE_ID, LOCAL_KEY)
        .address("10.255.255.1")
        .connection_timeout(Duration::from_millis(200))
        .connect()
        .await;
    assert!(matches!(result, Err(TuyaError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_connect_type_d_with_requested_dps() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(req) = read_request(&mut stream).await {
            match req.cmd {
                DP_QUERY => send(&mut stream, &sentinel_response(req.seqno, req.cmd)).await,
                CONTROL_NEW => {
                    let body = decode_request(Version::V3_3, &req);
                    assert_eq!(body["dps"], json!({"1": null, "2": null}));
                    let reply = json!({"dps": {"1": true, "2": 30}});
                    send(&mut stream, &v33_response(req.seqno, req.cmd, &reply)).await;
                }
                _ => {}
            }
        }
    });

    let device = DeviceBuilder::new(DEVICE_ID, LOCAL_KEY)
        .address("127.0.0.1")
        .port(port)
        .dps_to_request([1, 2])
        .initial_status(true)
        .connect()
        .await
        .unwrap();

    assert_eq!(device.dev_type(), DeviceType::TypeD);
    assert_eq!(device.cached_dps()["2"], json!(30));
    device.close().await;
}
