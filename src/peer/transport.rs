use super::crypto::StreamCipher;
use super::error::PeerError;
use super::message::{Handshake, Message};
use crate::config::SessionConfig;
use crate::constants::HANDSHAKE_LEN;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Framed message I/O over one connection.
///
/// Inbound bytes accumulate in a buffer owned by the transport, so a
/// `receive_message` future dropped mid-frame loses nothing. Once
/// encryption is enabled, inbound bytes are decrypted as they arrive and
/// every outbound frame is encrypted as a whole.
pub struct PeerTransport<S = TcpStream> {
    stream: S,
    read_buf: BytesMut,
    cipher: Option<StreamCipher>,
    max_message_size: usize,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S> PeerTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: &SessionConfig) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(32 * 1024),
            cipher: None,
            max_message_size: config.max_message_size,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }

    pub async fn send_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        let data = handshake.encode();
        self.write_frame(data.to_vec()).await
    }

    pub async fn receive_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.read_buf.len() < HANDSHAKE_LEN {
            self.fill_buf().await?;
        }

        let data = self.read_buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Writes and flushes one frame.
    pub async fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        self.write_frame(message.encode().to_vec()).await
    }

    /// Reads the next frame.
    ///
    /// A frame that fails to decode is consumed and reported as
    /// [`PeerError::MalformedMessage`]; the stream stays usable.
    pub async fn receive_message(&mut self) -> Result<Message, PeerError> {
        loop {
            if let Some(message) = self.take_frame()? {
                return message;
            }
            self.fill_buf().await?;
        }
    }

    /// Switches both directions to the stream cipher keyed by `key`.
    ///
    /// Bytes already buffered arrived after the peer switched and are
    /// decrypted now.
    pub fn enable_encryption(&mut self, key: &[u8]) {
        let mut cipher = StreamCipher::new(key);
        cipher.decrypt.process(&mut self.read_buf[..]);
        self.cipher = Some(cipher);
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Splits a complete frame off the buffer.
    ///
    /// The outer result fails only for fatal framing errors.
    #[allow(clippy::type_complexity)]
    fn take_frame(&mut self) -> Result<Option<Result<Message, PeerError>>, PeerError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]) as usize;

        if length > self.max_message_size {
            return Err(PeerError::MessageTooLarge(length));
        }

        let total_len = 4 + length;
        if self.read_buf.len() < total_len {
            self.read_buf.reserve(total_len - self.read_buf.len());
            return Ok(None);
        }

        let mut frame = self.read_buf.split_to(total_len).freeze();
        if length == 0 {
            return Ok(Some(Ok(Message::KeepAlive)));
        }
        frame.advance(4);
        let id = frame.get_u8();
        Ok(Some(Message::decode_payload(id, frame)))
    }

    async fn fill_buf(&mut self) -> Result<(), PeerError> {
        let filled = self.read_buf.len();
        let n = timeout(self.read_timeout, self.stream.read_buf(&mut self.read_buf))
            .await
            .map_err(|_| PeerError::Timeout)??;

        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.decrypt.process(&mut self.read_buf[filled..]);
        }
        Ok(())
    }

    async fn write_frame(&mut self, mut data: Vec<u8>) -> Result<(), PeerError> {
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.encrypt.process(&mut data);
        }
        let stream = &mut self.stream;
        timeout(self.write_timeout, async move {
            stream.write_all(&data).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}

impl PeerTransport<TcpStream> {
    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }
}
