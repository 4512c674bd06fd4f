use super::*;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const LIMITS: SessionLimits = SessionLimits {
    fault_threshold: 2,
    max_requests: 4,
};

fn addr() -> SocketAddr {
    "10.0.0.1:6881".parse().unwrap()
}

fn handshake(fast: bool, extensions: bool) -> Handshake {
    let mut hs = Handshake::new([1u8; 20], [2u8; 20]);
    if !fast {
        hs.reserved[7] = 0;
    }
    if !extensions {
        hs.reserved[5] = 0;
    }
    hs
}

fn active_session(piece_count: usize, fast: bool) -> PeerSession {
    let mut session = PeerSession::new(ConnectionId(7), addr(), Some(piece_count), LIMITS);
    session.mark_handshaking();
    session.on_handshake(&handshake(fast, true));
    session
}

fn piece(index: u32, begin: u32, len: usize) -> Message {
    Message::Piece {
        index,
        begin,
        data: Bytes::from(vec![0xAB; len]),
    }
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("SB0001"));
    assert!(id1.to_string().starts_with("-SB0001-"));
}

#[test]
fn test_bitfield_from_wire() {
    let bf = Bitfield::from_wire(&[0b1010_0000, 0b1000_0000], 9).unwrap();
    assert!(bf.has_piece(0));
    assert!(!bf.has_piece(1));
    assert!(bf.has_piece(2));
    assert!(bf.has_piece(8));
    assert_eq!(bf.count(), 3);

    assert!(Bitfield::from_wire(&[0xFF], 9).is_err());
    assert!(Bitfield::from_wire(&[0xFF, 0xC0], 9).is_err());
    assert!(Bitfield::from_wire(&[0xFF, 0x80, 0x00], 9).is_err());
}

#[test]
fn test_bitfield_full_and_missing() {
    let full = Bitfield::full(10);
    assert_eq!(full.as_bytes(), &[0xFF, 0xC0]);
    assert!(full.is_complete());

    let mut ours = Bitfield::new(10);
    assert!(full.has_any_missing_from(&ours));
    for i in 0..10 {
        ours.set_piece(i);
    }
    assert!(!full.has_any_missing_from(&ours));
    ours.clear_piece(3);
    assert_eq!(ours.count(), 9);
}

#[test]
fn test_handshake_encode_decode() {
    let handshake = Handshake::new([1u8; 20], [2u8; 20]);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);
    assert_eq!(&encoded[1..20], b"BitTorrent protocol");

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded, handshake);
    assert!(decoded.supports_extension_protocol());
    assert!(decoded.supports_fast_extension());
}

#[test]
fn test_handshake_rejects_wrong_tag() {
    let mut encoded = Handshake::new([1u8; 20], [2u8; 20]).encode().to_vec();
    encoded[5] = b'X';
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(PeerError::InvalidHandshake)
    ));
    assert!(Handshake::decode(&encoded[..67]).is_err());
}

#[test]
fn test_message_payload_lengths_are_exact() {
    let have = Message::Have { piece: 42 }.encode();
    assert_eq!(&have[..], &[0, 0, 0, 5, 4, 0, 0, 0, 42]);
    assert_eq!(Message::decode(have).unwrap(), Message::Have { piece: 42 });

    let short_have = Bytes::from_static(&[4, 0, 0, 42]);
    assert!(Message::decode_body(short_have).is_err());

    let long_choke = Bytes::from_static(&[0, 1]);
    assert!(Message::decode_body(long_choke).is_err());

    let request = Bytes::from_static(&[6, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0x40]);
    assert!(Message::decode_body(request).is_err());

    assert!(matches!(
        Message::decode_body(Bytes::from_static(&[99])),
        Err(PeerError::InvalidMessageId(99))
    ));
    assert_eq!(
        Message::decode_body(Bytes::new()).unwrap(),
        Message::KeepAlive
    );
}

#[test]
fn test_message_decode_checks_prefix() {
    let mut framed = Message::Interested.encode().to_vec();
    framed.push(0);
    assert!(Message::decode(Bytes::from(framed)).is_err());
}

#[test]
fn test_piece_and_extended_messages() {
    let msg = Message::Piece {
        index: 3,
        begin: 16384,
        data: Bytes::from_static(b"hello world"),
    };
    assert_eq!(Message::decode(msg.encode()).unwrap(), msg);

    let ext = Message::Extended {
        id: 0,
        payload: Bytes::from_static(b"de"),
    };
    assert_eq!(&ext.encode()[..], &[0, 0, 0, 4, 20, 0, b'd', b'e']);
}

#[test]
fn test_allowed_fast_set_matches_reference() {
    let ip = IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200));
    let info_hash = [0xAA; 20];

    assert_eq!(
        generate_allowed_fast_set(&info_hash, ip, 1313, 7),
        vec![1059, 431, 808, 1217, 287, 376, 1188]
    );
    assert_eq!(
        generate_allowed_fast_set(&info_hash, ip, 1313, 9),
        vec![1059, 431, 808, 1217, 287, 376, 1188, 353, 508]
    );
    assert_eq!(generate_allowed_fast_set(&info_hash, ip, 3, 10).len(), 3);
    assert!(generate_allowed_fast_set(&info_hash, ip, 0, 10).is_empty());
}

#[test]
fn test_extension_handshake() {
    let hs = ExtensionHandshake::local("swarmbit 0.1.0", 250, Some(31235));
    let encoded = hs.encode().unwrap();
    assert_eq!(
        &encoded[..],
        b"d1:md11:ut_metadatai1ee13:metadata_sizei31235e4:reqqi250e1:v14:swarmbit 0.1.0e"
    );

    let decoded = ExtensionHandshake::decode(&encoded).unwrap();
    assert_eq!(decoded, hs);
    assert_eq!(decoded.ut_metadata_id(), Some(UT_METADATA_ID));
}

#[test]
fn test_extension_handshake_drops_disabled() {
    let decoded =
        ExtensionHandshake::decode(b"d1:md6:ut_pexi0e11:ut_metadatai3eee").unwrap();
    assert_eq!(decoded.get_extension_id("ut_pex"), None);
    assert_eq!(decoded.ut_metadata_id(), Some(3));
    assert_eq!(decoded.metadata_size, None);
}

#[test]
fn test_unknown_extension_is_ignored() {
    let mut session = active_session(4, true);
    let inbound = session
        .handle(Message::Extended {
            id: 9,
            payload: Bytes::from_static(b"whatever"),
        })
        .unwrap();
    assert_eq!(inbound, Inbound::Nothing);
}

#[test]
fn test_choking_state_default() {
    let state = ChokingState::default();
    assert!(state.am_choking);
    assert!(!state.am_interested);
    assert!(state.peer_choking);
    assert!(!state.peer_interested);
}

#[test]
fn test_select_unchoked_prefers_contributors() {
    let candidates = [
        UnchokeCandidate { id: ConnectionId(1), interested: true, downloaded: 10, uploaded: 500 },
        UnchokeCandidate { id: ConnectionId(2), interested: false, downloaded: 900, uploaded: 0 },
        UnchokeCandidate { id: ConnectionId(3), interested: true, downloaded: 300, uploaded: 0 },
        UnchokeCandidate { id: ConnectionId(4), interested: true, downloaded: 300, uploaded: 10 },
    ];

    let leeching = select_unchoked(&candidates, 2, false);
    assert!(leeching.contains(&ConnectionId(3)) && leeching.contains(&ConnectionId(4)));
    assert_eq!(leeching.len(), 2);

    let seeding = select_unchoked(&candidates, 1, true);
    assert!(seeding.contains(&ConnectionId(1)));
}

#[test]
fn test_session_rejects_messages_before_handshake() {
    let mut session = PeerSession::new(ConnectionId(1), addr(), Some(4), LIMITS);
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(session.handle(Message::Unchoke).is_err());
}

#[test]
fn test_bitfield_only_as_first_message() {
    let mut session = active_session(9, true);
    let bits = Bytes::from_static(&[0xFF, 0x80]);
    assert_eq!(
        session.handle(Message::Bitfield(bits.clone())).unwrap(),
        Inbound::Availability
    );
    assert!(session.bitfield().is_complete());

    assert!(session.handle(Message::Bitfield(bits)).unwrap_err().is_violation());
    assert!(session.handle(Message::HaveAll).is_err());
}

#[test]
fn test_fast_messages_require_negotiation() {
    let mut session = active_session(4, false);
    assert!(session.handle(Message::HaveAll).is_err());

    let mut session = active_session(4, false);
    assert!(session.handle(Message::AllowedFast { piece: 1 }).is_err());
}

#[test]
fn test_have_checks_index() {
    let mut session = active_session(4, true);
    assert_eq!(session.handle(Message::Have { piece: 3 }).unwrap(), Inbound::Have(3));
    assert_eq!(session.handle(Message::Have { piece: 3 }).unwrap(), Inbound::Nothing);
    assert!(session.handle(Message::Have { piece: 4 }).is_err());
}

#[test]
fn test_request_rules() {
    let mut session = active_session(4, true);
    let too_long = Message::Request {
        index: 0,
        begin: 0,
        length: 131073,
    };
    assert!(session.handle(too_long).is_err());

    // Choked without allowed-fast: rejected, not queued.
    let request = Message::Request {
        index: 1,
        begin: 0,
        length: 16384,
    };
    assert_eq!(session.handle(request.clone()).unwrap(), Inbound::Nothing);
    assert_eq!(
        session.drain_outbox(),
        vec![Message::Reject {
            index: 1,
            begin: 0,
            length: 16384
        }]
    );

    session.set_choking(false);
    assert_eq!(
        session.handle(request).unwrap(),
        Inbound::Request(BlockRequest::new(1, 0, 16384))
    );
    assert_eq!(session.queued_uploads(), 1);

    let cancel = Message::Cancel {
        index: 1,
        begin: 0,
        length: 16384,
    };
    assert_eq!(
        session.handle(cancel).unwrap(),
        Inbound::Cancel(BlockRequest::new(1, 0, 16384))
    );
    assert_eq!(session.next_upload(), None);
}

#[test]
fn test_allowed_fast_request_served_while_choked() {
    let mut session = active_session(20, true);
    session.grant_allowed_fast(&[5]);
    assert_eq!(
        session.drain_outbox(),
        vec![Message::AllowedFast { piece: 5 }]
    );

    let inbound = session
        .handle(Message::Request {
            index: 5,
            begin: 0,
            length: 16384,
        })
        .unwrap();
    assert_eq!(inbound, Inbound::Request(BlockRequest::new(5, 0, 16384)));
}

#[test]
fn test_piece_must_match_pending_request() {
    let mut session = active_session(4, false);
    session.handle(Message::Bitfield(Bytes::from_static(&[0xF0]))).unwrap();
    assert!(session.handle(piece(0, 0, 16384)).is_err());

    session.set_interested(true);
    session.handle(Message::Unchoke).unwrap();
    assert!(session.can_request(0));

    let request = BlockRequest::new(0, 0, 16384);
    session.request(request);
    assert_eq!(
        session.drain_outbox(),
        vec![
            Message::Interested,
            Message::Request {
                index: 0,
                begin: 0,
                length: 16384
            }
        ]
    );

    match session.handle(piece(0, 0, 16384)).unwrap() {
        Inbound::Block { request: got, data } => {
            assert_eq!(got, request);
            assert_eq!(data.len(), 16384);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(session.downloaded(), 16384);
    assert!(session.pending().is_empty());
}

#[test]
fn test_late_block_after_cancel_is_not_a_fault() {
    let mut session = active_session(4, false);
    let request = BlockRequest::new(2, 0, 100);
    session.request(request);
    session.cancel(request);
    assert!(!session.has_pending(&request));
    assert_eq!(session.handle(piece(2, 0, 100)).unwrap(), Inbound::Nothing);
    assert!(session.handle(piece(2, 0, 100)).is_err());
}

#[test]
fn test_choke_releases_requests_without_fast() {
    let mut session = active_session(4, false);
    session.request(BlockRequest::new(0, 0, 16384));
    session.request(BlockRequest::new(1, 0, 16384));

    match session.handle(Message::Choke).unwrap() {
        Inbound::Choked { mut released } => {
            released.sort();
            assert_eq!(
                released,
                vec![BlockRequest::new(0, 0, 16384), BlockRequest::new(1, 0, 16384)]
            );
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.pending().is_empty());
}

#[test]
fn test_choke_keeps_requests_with_fast() {
    let mut session = active_session(4, true);
    let request = BlockRequest::new(0, 0, 16384);
    session.request(request);

    assert_eq!(
        session.handle(Message::Choke).unwrap(),
        Inbound::Choked { released: vec![] }
    );
    assert!(session.has_pending(&request));
    assert_eq!(
        session
            .handle(Message::Reject {
                index: 0,
                begin: 0,
                length: 16384
            })
            .unwrap(),
        Inbound::Rejected(request)
    );
    assert!(session
        .handle(Message::Reject {
            index: 0,
            begin: 0,
            length: 16384
        })
        .is_err());
}

#[test]
fn test_fault_threshold() {
    let mut session = active_session(4, true);
    assert!(!session.record_fault());
    assert!(!session.record_fault());
    assert!(session.record_fault());
    assert_eq!(session.faults(), 3);
}

#[test]
fn test_fairness_ratio() {
    let mut session = active_session(4, true);
    assert!(session.may_upload(1000));

    session.send(piece(0, 0, 1500));
    assert_eq!(session.uploaded(), 1500);
    assert!(!session.may_upload(1000));
    assert!(session.may_upload(2000));

    session.request(BlockRequest::new(1, 0, 1500));
    session.handle(piece(1, 0, 1500)).unwrap();
    assert!(session.may_upload(1000));
}

#[test]
fn test_availability_deferred_until_piece_count() {
    let mut session = PeerSession::new(ConnectionId(3), addr(), None, LIMITS);
    session.on_handshake(&handshake(true, true));
    session.handle(Message::Bitfield(Bytes::from_static(&[0b0100_0000]))).unwrap();
    session.handle(Message::Have { piece: 2 }).unwrap();

    session.set_piece_count(3).unwrap();
    assert_eq!(session.bitfield().available_pieces(), vec![1, 2]);

    let mut bad = PeerSession::new(ConnectionId(4), addr(), None, LIMITS);
    bad.on_handshake(&handshake(true, true));
    bad.handle(Message::Have { piece: 9 }).unwrap();
    assert!(bad.set_piece_count(3).is_err());
}

async fn loopback() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), server.unwrap().0)
}

#[tokio::test]
async fn test_outbound_handshake_mismatch_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await.unwrap();
        let reply = Handshake::new([9u8; 20], [8u8; 20]);
        stream.write_all(&reply.encode()).await.unwrap();
    });

    let result = connect_outbound(
        addr,
        [1u8; 20],
        PeerId::generate(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .await;
    assert!(matches!(result, Err(PeerError::InfoHashMismatch)));
    server.await.unwrap();
}

#[tokio::test]
async fn test_inbound_wrong_info_hash_gets_no_reply() {
    let (mut client, server) = loopback().await;

    let accept = tokio::spawn(accept_inbound(
        server,
        [1u8; 20],
        PeerId::generate(),
        Duration::from_secs(5),
    ));
    client
        .write_all(&Handshake::new([3u8; 20], [4u8; 20]).encode())
        .await
        .unwrap();

    assert!(matches!(
        accept.await.unwrap(),
        Err(PeerError::InfoHashMismatch)
    ));
    let mut buf = Vec::new();
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

#[tokio::test]
async fn test_handshake_then_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let info_hash = [5u8; 20];

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let conn = accept_inbound(stream, info_hash, PeerId::generate(), Duration::from_secs(5))
            .await
            .unwrap();
        let (_reader, mut writer) = conn.transport.into_split();
        writer
            .send_all(
                &[Message::KeepAlive, Message::KeepAlive, Message::Have { piece: 7 }],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
    });

    let conn = connect_outbound(
        addr,
        info_hash,
        PeerId::generate(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(conn.supports_fast());
    assert!(conn.supports_extensions());

    let (mut reader, _writer) = conn.transport.into_split();
    let message = reader.next_message(Duration::from_secs(5)).await.unwrap();
    assert_eq!(message, Message::Have { piece: 7 });
    server.await.unwrap();

    assert!(matches!(
        reader.next_message(Duration::from_secs(5)).await,
        Err(PeerError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_oversized_frame_is_a_violation() {
    let (mut client, server) = loopback().await;
    let transport = PeerTransport::new(server).with_max_frame(1024);
    let (mut reader, _writer) = transport.into_split();

    client.write_all(&[0, 0, 0x10, 0]).await.unwrap();
    let err = reader.next_message(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, PeerError::MessageTooLarge(4096)));
    assert!(err.is_violation());
    assert!(!err.keeps_framing());
}

#[tokio::test]
async fn test_undecodable_frames_keep_stream_in_sync() {
    let (mut client, server) = loopback().await;
    let (mut reader, _writer) = PeerTransport::new(server).into_split();

    // A have with a 3-byte index, then an unassigned message id.
    client.write_all(&[0, 0, 0, 4, 4, 0, 0, 7]).await.unwrap();
    client.write_all(&[0, 0, 0, 1, 10]).await.unwrap();
    client
        .write_all(&Message::Have { piece: 7 }.encode())
        .await
        .unwrap();

    let idle = Duration::from_secs(5);
    let err = reader.next_message(idle).await.unwrap_err();
    assert!(matches!(err, PeerError::InvalidMessage(_)));
    assert!(err.keeps_framing());
    let err = reader.next_message(idle).await.unwrap_err();
    assert!(matches!(err, PeerError::InvalidMessageId(10)));
    assert!(err.keeps_framing());
    assert_eq!(
        reader.next_message(idle).await.unwrap(),
        Message::Have { piece: 7 }
    );
}

#[tokio::test]
async fn test_idle_timeout() {
    let (_client, server) = loopback().await;
    let (mut reader, _writer) = PeerTransport::new(server).into_split();
    let err = reader
        .next_message(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, PeerError::Timeout));
    assert!(!err.is_violation());
}
