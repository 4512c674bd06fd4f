use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::constants::MAX_MESSAGE_SIZE;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

/// A TCP stream to one peer, before it is split for the session.
pub struct PeerTransport {
    stream: TcpStream,
    read_buf: BytesMut,
    max_frame: usize,
}

impl PeerTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            max_frame: MAX_MESSAGE_SIZE,
        }
    }

    /// Caps the length a frame may declare; longer frames are a violation.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub async fn send_handshake(
        &mut self,
        handshake: &Handshake,
        limit: Duration,
    ) -> Result<(), PeerError> {
        let data = handshake.encode();
        timeout(limit, self.stream.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn receive_handshake(&mut self, limit: Duration) -> Result<Handshake, PeerError> {
        timeout(
            limit,
            fill_to(&mut self.stream, &mut self.read_buf, HANDSHAKE_LEN),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Splits into independent reader and writer halves. Bytes the peer sent
    /// right behind its handshake stay with the reader.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();
        (
            FrameReader {
                half: read,
                buf: self.read_buf,
                max_frame: self.max_frame,
            },
            FrameWriter {
                half: write,
                buf: BytesMut::with_capacity(32 * 1024),
            },
        )
    }
}

/// Reads length-prefixed frames from a peer.
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    max_frame: usize,
}

impl FrameReader {
    /// Returns the next message other than a keep-alive.
    ///
    /// `idle` bounds the wait for each frame; a keep-alive restarts it
    /// without being returned.
    pub async fn next_message(&mut self, idle: Duration) -> Result<Message, PeerError> {
        loop {
            let frame = timeout(idle, self.read_frame())
                .await
                .map_err(|_| PeerError::Timeout)??;

            match Message::decode_body(frame)? {
                Message::KeepAlive => trace!("keep-alive"),
                message => return Ok(message),
            }
        }
    }

    /// Reads one frame body (id and payload, prefix stripped).
    async fn read_frame(&mut self) -> Result<bytes::Bytes, PeerError> {
        fill_to(&mut self.half, &mut self.buf, 4).await?;

        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > self.max_frame {
            return Err(PeerError::MessageTooLarge(length));
        }

        fill_to(&mut self.half, &mut self.buf, 4 + length).await?;
        self.buf.advance(4);
        Ok(self.buf.split_to(length).freeze())
    }
}

/// Writes messages to a peer.
pub struct FrameWriter {
    half: OwnedWriteHalf,
    buf: BytesMut,
}

impl FrameWriter {
    pub async fn send(&mut self, message: &Message, limit: Duration) -> Result<(), PeerError> {
        self.send_all(std::slice::from_ref(message), limit).await
    }

    /// Encodes a batch into one buffer and writes it with a single call.
    pub async fn send_all(&mut self, messages: &[Message], limit: Duration) -> Result<(), PeerError> {
        self.buf.clear();
        for message in messages {
            message.encode_into(&mut self.buf);
        }
        timeout(limit, self.half.write_all(&self.buf))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), PeerError> {
        self.half.shutdown().await?;
        Ok(())
    }
}

async fn fill_to<R>(reader: &mut R, buf: &mut BytesMut, len: usize) -> Result<(), PeerError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < len {
        buf.reserve(len - buf.len());
        if reader.read_buf(buf).await? == 0 {
            return Err(PeerError::ConnectionClosed);
        }
    }
    Ok(())
}
