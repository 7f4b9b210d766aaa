//! End-to-end relay flow over real sockets: signaling installs a relayed
//! session, the first connectivity check materializes it, and media bytes
//! flow client -> proxy -> server and back.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tower::ServiceExt;

use icegate_ice_proto::classify::{classify, PacketKind};
use icegate_ice_proto::stun::{
    verify_fingerprint, verify_integrity, Attribute, MessageType, StunMessage,
};
use icegate_relay_core::cache::Cache;
use icegate_relay_core::config::{UpstreamConfig, UpstreamMode};
use icegate_relay_core::geo::RouteOracle;
use icegate_relay_core::signal::{router, signal_state};
use icegate_relay_core::transport::udp::UdpRelayListener;
use icegate_relay_core::Hub;

struct AlwaysRelay;

impl RouteOracle for AlwaysRelay {
    fn route_via_proxy(&self, _: IpAddr, _: IpAddr, _: IpAddr) -> bool {
        true
    }
}

fn binding_request(username: &str, key: &[u8]) -> Vec<u8> {
    let mut req = StunMessage::binding_request();
    req.add_attribute(Attribute::Username(username.as_bytes().to_vec()));
    req.add_message_integrity(key);
    req.add_fingerprint();
    req.encode()
}

#[tokio::test]
async fn signaled_session_relays_media_end_to_end() {
    // The media server: a plain UDP socket that records what it gets and
    // can push bytes back.
    let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let server_addr = server.local_addr().unwrap();

    // Signaling: geo says relay, so /webrtc/route installs the pending
    // session and advertises the proxy.
    let cache = Arc::new(Cache::new());
    let state = signal_state(
        cache.clone(),
        Arc::new(AlwaysRelay),
        vec!["a=candidate:9 1 udp 2113937151 198.51.100.7 9001 typ host".to_string()],
        None,
    );
    let app = router(state);

    let body = serde_json::json!({
        "offer_ice": {"ufrag": "c1", "pwd": "opwd"},
        "answer_ice": {"ufrag": "s1", "pwd": "apwd"},
        "candidates": [format!(
            "a=candidate:1 1 udp 2113937151 {} {} typ host",
            server_addr.ip(), server_addr.port()
        )],
    });
    let response = app
        .oneshot(
            axum::http::Request::post("/webrtc/route")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    assert!(cache.get("s1:c1").await.is_some());

    // Data plane: hub plus one UDP listener.
    let hub = Hub::new(
        cache.clone(),
        UpstreamConfig {
            mode: UpstreamMode::Direct,
            prefer_tcp: false,
        },
    );
    let intake = hub.intake();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(hub.clone().run(shutdown_rx.clone()));

    let listener = UdpRelayListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let relay_addr = listener.local_addr();
    tokio::spawn(listener.run(intake, shutdown_rx));

    // The client opens with an authenticated Binding Request.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&binding_request("s1:c1", b"apwd"), relay_addr)
        .await
        .unwrap();

    // Expect the Binding Response in the server's name plus the proxy's own
    // check under the client-side credentials.
    let mut saw_response = false;
    let mut saw_check = false;
    let mut buf = [0u8; 1500];
    while !(saw_response && saw_check) {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("proxy went quiet during the handshake")
            .unwrap();
        let packet = &buf[..n];
        assert_eq!(classify(packet), PacketKind::Stun);
        let msg = StunMessage::decode(packet).unwrap();
        match msg.message_type {
            MessageType::BindingResponse => {
                assert_eq!(
                    msg.xor_mapped_address(),
                    Some(client.local_addr().unwrap())
                );
                assert!(verify_integrity(packet, b"apwd").unwrap());
                assert!(verify_fingerprint(packet).unwrap());
                saw_response = true;
            }
            MessageType::BindingRequest => {
                assert_eq!(msg.username(), Some("c1:s1"));
                assert!(verify_integrity(packet, b"opwd").unwrap());
                saw_check = true;
            }
            other => panic!("unexpected stun type {other:?}"),
        }
    }

    // Quiet the keepalive.
    let answer = StunMessage::binding_response(
        StunMessage::decode(&binding_request("s1:c1", b"apwd"))
            .unwrap()
            .transaction_id,
    );
    client.send_to(&answer.encode(), relay_addr).await.unwrap();

    // Client payload reaches the media server.
    let mut dtls = vec![0u8; 48];
    dtls[0] = 23; // application data record
    client.send_to(&dtls, relay_addr).await.unwrap();

    let (n, proxy_upstream_addr) =
        tokio::time::timeout(Duration::from_secs(5), server.recv_from(&mut buf))
            .await
            .expect("server never saw client bytes")
            .unwrap();
    assert_eq!(&buf[..n], dtls.as_slice());

    // Server payload reaches the client through the same proxy port.
    let mut rtp = vec![0u8; 32];
    rtp[0] = 0x80;
    rtp[1] = 0x60;
    server.send_to(&rtp, proxy_upstream_addr).await.unwrap();

    let payload: Bytes = loop {
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("client never saw server bytes")
            .unwrap();
        assert_eq!(from, relay_addr);
        if classify(&buf[..n]) != PacketKind::Stun {
            break Bytes::copy_from_slice(&buf[..n]);
        }
    };
    assert_eq!(&payload[..], rtp.as_slice());

    // Exactly one session and one connection exist for this client.
    assert_eq!(hub.session_count().await, 1);
    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test]
async fn unsignaled_checks_never_create_state() {
    let cache: Arc<Cache<icegate_relay_core::PendingSession>> = Arc::new(Cache::new());
    let hub = Hub::new(cache, UpstreamConfig::default());
    let intake = hub.intake();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(hub.clone().run(shutdown_rx.clone()));

    let listener = UdpRelayListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let relay_addr = listener.local_addr();
    tokio::spawn(listener.run(intake, shutdown_rx));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(&binding_request("ghost:nobody", b"pwd"), relay_addr)
        .await
        .unwrap();

    // No response comes back and no state is created.
    let mut buf = [0u8; 256];
    let silent = tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf))
        .await
        .is_err();
    assert!(silent);
    assert_eq!(hub.session_count().await, 0);
    assert_eq!(hub.connection_count().await, 0);
}
