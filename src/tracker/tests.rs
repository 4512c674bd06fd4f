use super::packet::{decode_reply, encode_announce, encode_connect, encode_scrape};
use super::*;
use crate::config::TrackerConfig;
use crate::constants::UDP_PROTOCOL_ID;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

fn sample_request() -> AnnounceRequest {
    AnnounceRequest {
        info_hash: [0xAB; 20],
        peer_id: *b"-SB0001-123456789012",
        downloaded: 1000,
        left: 5000,
        uploaded: 200,
        event: TrackerEvent::Started,
        port: 6881,
    }
}

fn txn(id: u32, action: Action) -> Transaction {
    Transaction {
        id,
        action,
        attempt: 0,
        deadline: Instant::now() + Duration::from_secs(1),
        tracker: "udp://test:1".into(),
    }
}

fn fast_config(max_attempt: u32) -> TrackerConfig {
    TrackerConfig {
        retransmit_base_ms: 10,
        max_attempt,
        ..TrackerConfig::default()
    }
}

fn seeded() -> StdRng {
    StdRng::seed_from_u64(7)
}

fn header(action: u32, tid: u32) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&action.to_be_bytes());
    packet.extend_from_slice(&tid.to_be_bytes());
    packet
}

fn connect_reply(tid: u32, connection_id: u64) -> Vec<u8> {
    let mut packet = header(0, tid);
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet
}

fn announce_reply(tid: u32, peers: &[u8]) -> Vec<u8> {
    let mut packet = header(1, tid);
    packet.extend_from_slice(&1800u32.to_be_bytes());
    packet.extend_from_slice(&3u32.to_be_bytes());
    packet.extend_from_slice(&7u32.to_be_bytes());
    packet.extend_from_slice(peers);
    packet
}

fn error_reply(tid: u32, message: &str) -> Vec<u8> {
    let mut packet = header(3, tid);
    packet.extend_from_slice(message.as_bytes());
    packet
}

/// (action, transaction id) of a request; connect and announce share the
/// layout at offsets 8..16.
fn request_ids(packet: &[u8]) -> (u32, u32) {
    let action = u32::from_be_bytes(packet[8..12].try_into().unwrap());
    let tid = u32::from_be_bytes(packet[12..16].try_into().unwrap());
    (action, tid)
}

/// A tracker on loopback answering each datagram with whatever the handler
/// returns.
async fn fake_tracker<F>(mut handler: F) -> SocketAddr
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            for reply in handler(&buf[..n]) {
                let _ = socket.send_to(&reply, from).await;
            }
        }
    });
    addr
}

fn udp_url(addr: SocketAddr) -> String {
    format!("udp://{addr}/announce")
}

#[test]
fn test_tracker_event() {
    assert_eq!(TrackerEvent::Started.as_str(), "started");
    assert_eq!(TrackerEvent::None.as_str(), "");

    assert_eq!(TrackerEvent::None.as_udp_id(), 0);
    assert_eq!(TrackerEvent::Completed.as_udp_id(), 1);
    assert_eq!(TrackerEvent::Started.as_udp_id(), 2);
    assert_eq!(TrackerEvent::Stopped.as_udp_id(), 3);
}

#[test]
fn test_compact_peer_v4() {
    let bytes = [192, 168, 1, 1, 0x1A, 0xE1]; // 192.168.1.1:6881
    let peer = CompactPeer::from_v4_bytes(&bytes).unwrap();
    assert_eq!(peer.to_socket_addr(), "192.168.1.1:6881".parse().unwrap());
    assert!(CompactPeer::from_v4_bytes(&bytes[..5]).is_none());
}

#[test]
fn test_parse_compact_peers() {
    let data = [
        192, 168, 1, 1, 0x1A, 0xE1, // 192.168.1.1:6881
        10, 0, 0, 1, 0x1A, 0xE2, // 10.0.0.1:6882
    ];
    let peers = parse_compact_peers(&data);
    assert_eq!(
        peers,
        vec![
            "192.168.1.1:6881".parse().unwrap(),
            "10.0.0.1:6882".parse().unwrap()
        ]
    );
}

#[test]
fn test_retry_schedule() {
    let policy = RetryPolicy::from_config(&TrackerConfig::default());
    assert_eq!(policy.timeout_for(0), Some(Duration::from_secs(15)));
    assert_eq!(policy.timeout_for(1), Some(Duration::from_secs(30)));
    assert_eq!(policy.timeout_for(8), Some(Duration::from_secs(3840)));
    assert_eq!(policy.timeout_for(9), None);
}

#[test]
fn test_parse_udp_url() {
    assert_eq!(
        parse_udp_url("udp://tracker.example.com:6969/announce").unwrap(),
        ("tracker.example.com".to_string(), 6969)
    );
    assert_eq!(
        parse_udp_url("udp://[::1]:80").unwrap(),
        ("::1".to_string(), 80)
    );
    assert!(matches!(
        parse_udp_url("http://tracker.example.com/announce"),
        Err(TrackerError::UnsupportedProtocol(_))
    ));
    assert!(matches!(
        parse_udp_url("udp://tracker.example.com/announce"),
        Err(TrackerError::InvalidUrl(_))
    ));
    assert!(parse_udp_url("udp://:80").is_err());
}

#[test]
fn test_encode_connect() {
    let packet = encode_connect(0xDEADBEEF);
    assert_eq!(packet.len(), 16);
    assert_eq!(&packet[..8], &UDP_PROTOCOL_ID.to_be_bytes());
    assert_eq!(request_ids(&packet), (0, 0xDEADBEEF));
}

#[test]
fn test_encode_announce_layout() {
    let packet = encode_announce(0x1122334455667788, 42, &sample_request(), 0xCAFE, -1);
    assert_eq!(packet.len(), 98);
    assert_eq!(&packet[..8], &0x1122334455667788u64.to_be_bytes());
    assert_eq!(request_ids(&packet), (1, 42));
    assert_eq!(&packet[16..36], &[0xAB; 20]);
    assert_eq!(&packet[36..56], b"-SB0001-123456789012");
    assert_eq!(&packet[56..64], &1000u64.to_be_bytes());
    assert_eq!(&packet[64..72], &5000u64.to_be_bytes());
    assert_eq!(&packet[72..80], &200u64.to_be_bytes());
    assert_eq!(&packet[80..84], &2u32.to_be_bytes());
    assert_eq!(&packet[84..88], &[0; 4]);
    assert_eq!(&packet[88..92], &0xCAFEu32.to_be_bytes());
    assert_eq!(&packet[92..96], &(-1i32).to_be_bytes());
    assert_eq!(&packet[96..98], &6881u16.to_be_bytes());
}

#[test]
fn test_encode_scrape() {
    let packet = encode_scrape(5, 6, &[[1; 20], [2; 20]]);
    assert_eq!(packet.len(), 56);
    assert_eq!(&packet[36..56], &[2; 20]);
}

#[test]
fn test_decode_connect_reply() {
    let reply = decode_reply(&connect_reply(9, 77), &txn(9, Action::Connect), &[]).unwrap();
    assert_eq!(reply, Some(Reply::Connected { connection_id: 77 }));
}

#[test]
fn test_decode_mismatched_transaction_is_discarded() {
    let reply = decode_reply(&connect_reply(10, 77), &txn(9, Action::Connect), &[]).unwrap();
    assert_eq!(reply, None);

    let reply = decode_reply(&[0, 0, 0], &txn(9, Action::Connect), &[]).unwrap();
    assert_eq!(reply, None);
}

#[test]
fn test_decode_error_reply_needs_matching_transaction() {
    let t = txn(9, Action::Announce);
    let reply = decode_reply(&error_reply(9, "torrent not registered"), &t, &[]).unwrap();
    assert_eq!(reply, Some(Reply::Error("torrent not registered".into())));

    let reply = decode_reply(&error_reply(8, "spoofed"), &t, &[]).unwrap();
    assert_eq!(reply, None);
}

#[test]
fn test_decode_announce_reply() {
    let peers = [127, 0, 0, 1, 0x1A, 0xE1];
    let reply = decode_reply(&announce_reply(4, &peers), &txn(4, Action::Announce), &[]).unwrap();
    let Some(Reply::Announced(response)) = reply else {
        panic!("expected announce reply, got {reply:?}");
    };
    assert_eq!(response.interval, 1800);
    assert_eq!(response.leechers, 3);
    assert_eq!(response.seeders, 7);
    assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
}

#[test]
fn test_decode_announce_rejects_partial_peer() {
    let peers = [127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0];
    let result = decode_reply(&announce_reply(4, &peers), &txn(4, Action::Announce), &[]);
    assert!(matches!(result, Err(TrackerError::InvalidResponse(_))));
}

#[test]
fn test_decode_wrong_action() {
    let result = decode_reply(&connect_reply(4, 1), &txn(4, Action::Announce), &[]);
    assert!(matches!(result, Err(TrackerError::InvalidResponse(_))));
}

#[test]
fn test_decode_scrape_reply() {
    let mut packet = header(2, 3);
    for value in [10u32, 20, 30] {
        packet.extend_from_slice(&value.to_be_bytes());
    }
    let reply = decode_reply(&packet, &txn(3, Action::Scrape), &[[5; 20]]).unwrap();
    assert_eq!(
        reply,
        Some(Reply::Scraped(ScrapeResponse {
            files: vec![ScrapeFile {
                info_hash: [5; 20],
                complete: 10,
                downloaded: 20,
                incomplete: 30,
            }]
        }))
    );
}

#[tokio::test]
async fn test_announce_round_trip() {
    let addr = fake_tracker(|packet| {
        let (action, tid) = request_ids(packet);
        match action {
            0 => vec![connect_reply(tid, 0x5555)],
            1 => {
                assert_eq!(&packet[..8], &0x5555u64.to_be_bytes());
                vec![announce_reply(tid, &[10, 0, 0, 2, 0x1A, 0xE1])]
            }
            _ => vec![],
        }
    })
    .await;

    let mut tracker = UdpTracker::bind(&udp_url(addr), &fast_config(3), seeded())
        .await
        .unwrap();
    assert_eq!(tracker.state(), TrackerState::Connect);

    let response = tracker.announce(&sample_request()).await.unwrap();
    assert_eq!(response.peers, vec!["10.0.0.2:6881".parse().unwrap()]);
    assert_eq!(tracker.connection_id(), Some(0x5555));
    assert_eq!(tracker.state(), TrackerState::Announce);
}

#[tokio::test]
async fn test_unanswered_connect_sends_every_attempt_then_times_out() {
    let sends = Arc::new(AtomicUsize::new(0));
    let counter = sends.clone();
    let addr = fake_tracker(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        vec![]
    })
    .await;

    let config = TrackerConfig {
        retransmit_base_ms: 1,
        max_attempt: 8,
        ..TrackerConfig::default()
    };
    let mut tracker = UdpTracker::bind(&udp_url(addr), &config, seeded())
        .await
        .unwrap();

    let result = tracker.announce(&sample_request()).await;
    assert!(matches!(result, Err(TrackerError::Timeout)));
    assert_eq!(tracker.state(), TrackerState::Error);
    assert_eq!(tracker.connection_id(), None);
    assert_eq!(sends.load(Ordering::SeqCst), 9);
}

#[tokio::test]
async fn test_mismatched_connect_reply_leaves_no_connection_id() {
    let addr = fake_tracker(|packet| {
        let (_, tid) = request_ids(packet);
        vec![connect_reply(tid.wrapping_add(1), 0x9999)]
    })
    .await;

    let mut tracker = UdpTracker::bind(&udp_url(addr), &fast_config(1), seeded())
        .await
        .unwrap();
    let result = tracker.announce(&sample_request()).await;
    assert!(matches!(result, Err(TrackerError::Timeout)));
    assert_eq!(tracker.connection_id(), None);
}

#[tokio::test]
async fn test_matching_reply_after_stray_datagram_wins() {
    let addr = fake_tracker(|packet| {
        let (action, tid) = request_ids(packet);
        match action {
            0 => vec![
                connect_reply(tid ^ 0xFFFF, 0x1111),
                error_reply(tid ^ 0xFFFF, "not yours"),
                connect_reply(tid, 0x2222),
            ],
            1 => vec![announce_reply(tid, &[])],
            _ => vec![],
        }
    })
    .await;

    let mut tracker = UdpTracker::bind(&udp_url(addr), &fast_config(3), seeded())
        .await
        .unwrap();
    let response = tracker.announce(&sample_request()).await.unwrap();
    assert!(response.peers.is_empty());
    assert_eq!(tracker.connection_id(), Some(0x2222));
}

#[tokio::test]
async fn test_expired_connection_id_reconnects() {
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    let addr = fake_tracker(move |packet| {
        let (action, tid) = request_ids(packet);
        match action {
            0 => {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![connect_reply(tid, 1)]
            }
            1 => vec![announce_reply(tid, &[])],
            _ => vec![],
        }
    })
    .await;

    let config = TrackerConfig {
        connection_id_ttl_ms: 0,
        ..fast_config(3)
    };
    let mut tracker = UdpTracker::bind(&udp_url(addr), &config, seeded())
        .await
        .unwrap();
    tracker.announce(&sample_request()).await.unwrap();
    tracker.announce(&sample_request()).await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_connection_id_reused_within_ttl() {
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    let addr = fake_tracker(move |packet| {
        let (action, tid) = request_ids(packet);
        match action {
            0 => {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![connect_reply(tid, 1)]
            }
            1 => vec![announce_reply(tid, &[])],
            _ => vec![],
        }
    })
    .await;

    let mut tracker = UdpTracker::bind(&udp_url(addr), &fast_config(3), seeded())
        .await
        .unwrap();
    tracker.announce(&sample_request()).await.unwrap();
    tracker.announce(&sample_request()).await.unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_error_reply_fails_announce() {
    let addr = fake_tracker(|packet| {
        let (action, tid) = request_ids(packet);
        match action {
            0 => vec![connect_reply(tid, 1)],
            _ => vec![error_reply(tid, "unregistered torrent")],
        }
    })
    .await;

    let mut tracker = UdpTracker::bind(&udp_url(addr), &fast_config(3), seeded())
        .await
        .unwrap();
    let result = tracker.announce(&sample_request()).await;
    match result {
        Err(TrackerError::Failure(message)) => assert_eq!(message, "unregistered torrent"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(tracker.state(), TrackerState::Error);
}

#[tokio::test]
async fn test_scrape() {
    let addr = fake_tracker(|packet| {
        let (action, tid) = request_ids(packet);
        match action {
            0 => vec![connect_reply(tid, 1)],
            2 => {
                let mut reply = header(2, tid);
                for value in [4u32, 5, 6] {
                    reply.extend_from_slice(&value.to_be_bytes());
                }
                vec![reply]
            }
            _ => vec![],
        }
    })
    .await;

    let mut tracker = UdpTracker::bind(&udp_url(addr), &fast_config(3), seeded())
        .await
        .unwrap();
    let response = tracker.scrape([0xAB; 20]).await.unwrap();
    assert_eq!(response.files.len(), 1);
    assert_eq!(response.files[0].complete, 4);
    assert_eq!(response.files[0].incomplete, 6);
    assert_eq!(tracker.state(), TrackerState::Scrape);
}

#[tokio::test]
async fn test_client_skips_non_udp_and_falls_back() {
    let silent = fake_tracker(|_| vec![]).await;
    let live = fake_tracker(|packet| {
        let (action, tid) = request_ids(packet);
        match action {
            0 => vec![connect_reply(tid, 1)],
            1 => vec![announce_reply(tid, &[10, 0, 0, 9, 0, 80])],
            _ => vec![],
        }
    })
    .await;

    let urls = vec![
        "http://tracker.example.com/announce".to_string(),
        udp_url(silent),
        udp_url(live),
    ];
    let mut client = TrackerClient::new(urls, fast_config(1), seeded());
    let round = client.announce(&sample_request()).await;

    let (url, response) = round.response.unwrap();
    assert_eq!(url, udp_url(live));
    assert_eq!(response.peers, vec!["10.0.0.9:80".parse().unwrap()]);

    assert_eq!(round.failures.len(), 2);
    assert!(matches!(
        round.failures[0].1,
        TrackerError::UnsupportedProtocol(_)
    ));
    assert!(matches!(round.failures[1].1, TrackerError::Timeout));
}

#[tokio::test]
async fn test_client_without_trackers() {
    let mut client = TrackerClient::new(Vec::new(), fast_config(1), seeded());
    let round = client.announce(&sample_request()).await;
    assert!(round.response.is_none());
    assert!(matches!(round.failures[0].1, TrackerError::NoTrackers));
}
