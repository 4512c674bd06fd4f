use super::error::PeerError;
use super::message::Handshake;
use super::peer_id::PeerId;
use super::transport::PeerTransport;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// A connection that completed the handshake and may carry messages.
pub struct Established {
    pub addr: SocketAddr,
    /// The remote side's handshake.
    pub handshake: Handshake,
    pub transport: PeerTransport,
}

impl Established {
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.handshake.peer_id)
    }

    pub fn supports_fast(&self) -> bool {
        self.handshake.supports_fast_extension()
    }

    pub fn supports_extensions(&self) -> bool {
        self.handshake.supports_extension_protocol()
    }
}

/// Dials `addr` and exchanges handshakes.
///
/// A wrong protocol tag or info hash aborts the connection before any
/// message is read from it.
///
/// # Examples
///
/// ```no_run
/// use swarmbit::peer::{connect_outbound, PeerId};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr = "192.168.1.100:6881".parse()?;
/// let conn = connect_outbound(
///     addr,
///     [0u8; 20],
///     PeerId::generate(),
///     Duration::from_secs(5),
///     Duration::from_secs(10),
/// )
/// .await?;
/// println!("peer {:?} fast={}", conn.peer_id(), conn.supports_fast());
/// # Ok(())
/// # }
/// ```
pub async fn connect_outbound(
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_id: PeerId,
    connect_timeout: Duration,
    handshake_timeout: Duration,
) -> Result<Established, PeerError> {
    let transport = dial(addr, connect_timeout).await?;
    handshake_outbound(addr, transport, info_hash, our_id, handshake_timeout).await
}

/// Opens the TCP connection to `addr` without handshaking.
pub async fn dial(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<PeerTransport, PeerError> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout)??;
    stream.set_nodelay(true)?;
    Ok(PeerTransport::new(stream))
}

/// Sends our handshake on a dialed connection and checks the answer.
pub async fn handshake_outbound(
    addr: SocketAddr,
    mut transport: PeerTransport,
    info_hash: [u8; 20],
    our_id: PeerId,
    handshake_timeout: Duration,
) -> Result<Established, PeerError> {
    let ours = Handshake::new(info_hash, *our_id.as_bytes());
    transport.send_handshake(&ours, handshake_timeout).await?;

    let theirs = transport.receive_handshake(handshake_timeout).await?;
    check_handshake(&theirs, &info_hash, &our_id)?;

    debug!(peer = %addr, "outbound handshake complete");
    Ok(Established {
        addr,
        handshake: theirs,
        transport,
    })
}

/// Reads the handshake of an accepted socket and answers it only if the
/// info hash is ours.
pub async fn accept_inbound(
    stream: TcpStream,
    info_hash: [u8; 20],
    our_id: PeerId,
    handshake_timeout: Duration,
) -> Result<Established, PeerError> {
    let addr = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let mut transport = PeerTransport::new(stream);

    let theirs = transport.receive_handshake(handshake_timeout).await?;
    check_handshake(&theirs, &info_hash, &our_id)?;

    let ours = Handshake::new(info_hash, *our_id.as_bytes());
    transport.send_handshake(&ours, handshake_timeout).await?;

    debug!(peer = %addr, "inbound handshake complete");
    Ok(Established {
        addr,
        handshake: theirs,
        transport,
    })
}

fn check_handshake(theirs: &Handshake, info_hash: &[u8; 20], our_id: &PeerId) -> Result<(), PeerError> {
    if theirs.info_hash != *info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    if theirs.peer_id == *our_id.as_bytes() {
        return Err(PeerError::Protocol("connected to ourselves".into()));
    }
    Ok(())
}
