use super::crypto::{random_symmetric_key, RsaKeyPair, RsaPublicKey};
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::transport::PeerTransport;
use crate::bitfield::Bitfield;
use crate::config::{EncryptionPolicy, SessionConfig};
use crate::piece::{BlockRequest, PieceTracker, PutBlock};
use crate::torrent::Torrent;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

/// Lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected yet.
    Connecting,
    /// Transport open, preamble not exchanged.
    Handshaking,
    /// Exchanging framed messages.
    Active,
    /// Terminal; the transport has been dropped.
    Closed,
}

#[derive(Debug)]
struct CloseSignal {
    valid: AtomicBool,
    notify: Notify,
}

/// Handle that stops a running session from another task.
#[derive(Debug, Clone)]
pub struct SessionCloser {
    signal: Arc<CloseSignal>,
}

impl SessionCloser {
    /// Marks the session invalid and wakes its loop, which then drops the
    /// transport.
    pub fn invalidate(&self) {
        self.signal.valid.store(false, Ordering::SeqCst);
        self.signal.notify.notify_one();
    }

    pub fn is_valid(&self) -> bool {
        self.signal.valid.load(Ordering::SeqCst)
    }
}

enum Event {
    Closed,
    Idle,
    Received(Result<Message, PeerError>),
}

/// One connection to a remote peer.
///
/// A session owns its transport and drives the wire protocol for one
/// torrent: handshake, optional encrypted-stream upgrade, choke and interest
/// state, block requests in both directions and keep-alives. The only state
/// shared with other sessions is the torrent's [`PieceTracker`].
///
/// Every failure ends in [`SessionState::Closed`]; no error escapes into the
/// shared piece state.
///
/// # Examples
///
/// ```no_run
/// use rpiece::peer::{PeerId, PeerSession};
/// use rpiece::{SessionConfig, Torrent};
/// use std::sync::Arc;
///
/// # async fn example(torrent: Arc<Torrent>) -> Result<(), Box<dyn std::error::Error>> {
/// let addr = "192.168.1.100:6881".parse()?;
/// let mut session = PeerSession::new(addr, torrent, PeerId::generate(), SessionConfig::default());
///
/// session.connect().await?;
/// session.handshake().await?;
/// session.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct PeerSession<S = TcpStream> {
    addr: Option<SocketAddr>,
    torrent: Arc<Torrent>,
    peer_id: PeerId,
    config: SessionConfig,
    transport: Option<PeerTransport<S>>,
    state: SessionState,
    initiator: bool,
    remote_id: Option<PeerId>,
    remote_bitfield: Bitfield,
    choked_by_us: bool,
    choking_us: bool,
    interesting_to_us: bool,
    interested_in_us: bool,
    downloaded: u64,
    uploaded: u64,
    last_sent: Instant,
    announced: Bitfield,
    in_flight: Vec<(BlockRequest, Instant)>,
    peer_requests: VecDeque<BlockRequest>,
    signal: Arc<CloseSignal>,
}

impl PeerSession<TcpStream> {
    /// Creates an outbound session; call [`PeerSession::connect`] next.
    pub fn new(
        addr: SocketAddr,
        torrent: Arc<Torrent>,
        peer_id: PeerId,
        config: SessionConfig,
    ) -> Self {
        let mut session = Self::build(None, torrent, peer_id, config, true);
        session.addr = Some(addr);
        session.state = SessionState::Connecting;
        session
    }

    /// Opens the TCP connection with the configured buffer sizes and
    /// connect timeout.
    pub async fn connect(&mut self) -> Result<(), PeerError> {
        if self.state != SessionState::Connecting {
            return Err(PeerError::ConnectionClosed);
        }
        let addr = self.addr.ok_or(PeerError::ConnectionClosed)?;

        match self.open_stream(addr).await {
            Ok(stream) => {
                tracing::debug!(%addr, "connected");
                self.transport = Some(PeerTransport::new(stream, &self.config));
                self.state = SessionState::Handshaking;
                Ok(())
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                self.close();
                Err(e)
            }
        }
    }

    /// Answers an inbound connection: reads the peer's preamble first,
    /// then replies with ours.
    pub async fn accept(
        stream: TcpStream,
        torrent: Arc<Torrent>,
        peer_id: PeerId,
        config: SessionConfig,
    ) -> Result<Self, PeerError> {
        let addr = stream.peer_addr().ok();
        let mut session = Self::with_stream(stream, torrent, peer_id, config, false);
        session.addr = addr;
        session.handshake().await?;
        Ok(session)
    }

    async fn open_stream(&self, addr: SocketAddr) -> Result<TcpStream, PeerError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(self.config.send_buffer_size)?;
        socket.set_recv_buffer_size(self.config.recv_buffer_size)?;

        let stream = timeout(self.config.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already open stream. `initiator` decides who speaks first
    /// in the handshake and who publishes the RSA key.
    pub fn with_stream(
        stream: S,
        torrent: Arc<Torrent>,
        peer_id: PeerId,
        config: SessionConfig,
        initiator: bool,
    ) -> Self {
        let transport = PeerTransport::new(stream, &config);
        let mut session = Self::build(Some(transport), torrent, peer_id, config, initiator);
        session.state = SessionState::Handshaking;
        session
    }

    fn build(
        transport: Option<PeerTransport<S>>,
        torrent: Arc<Torrent>,
        peer_id: PeerId,
        config: SessionConfig,
        initiator: bool,
    ) -> Self {
        let piece_count = torrent.pieces().piece_count() as usize;
        Self {
            addr: None,
            torrent,
            peer_id,
            config,
            transport,
            state: SessionState::Connecting,
            initiator,
            remote_id: None,
            remote_bitfield: Bitfield::new(piece_count),
            choked_by_us: true,
            choking_us: true,
            interesting_to_us: false,
            interested_in_us: false,
            downloaded: 0,
            uploaded: 0,
            last_sent: Instant::now(),
            announced: Bitfield::new(piece_count),
            in_flight: Vec::new(),
            peer_requests: VecDeque::new(),
            signal: Arc::new(CloseSignal {
                valid: AtomicBool::new(true),
                notify: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    /// Pieces the remote peer has announced.
    pub fn remote_bitfield(&self) -> &Bitfield {
        &self.remote_bitfield
    }

    /// True while we refuse to serve this peer.
    pub fn is_choked(&self) -> bool {
        self.choked_by_us
    }

    pub fn is_choking_us(&self) -> bool {
        self.choking_us
    }

    /// True while we want pieces from this peer.
    pub fn is_interesting(&self) -> bool {
        self.interesting_to_us
    }

    pub fn is_interested_in_us(&self) -> bool {
        self.interested_in_us
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.as_ref().is_some_and(PeerTransport::is_encrypted)
    }

    pub fn is_valid(&self) -> bool {
        self.state != SessionState::Closed && self.signal.valid.load(Ordering::SeqCst)
    }

    /// Requests sent to the peer and not answered yet.
    pub fn outstanding_requests(&self) -> usize {
        self.in_flight.len()
    }

    /// Requests from the peer waiting to be served.
    pub fn queued_requests(&self) -> usize {
        self.peer_requests.len()
    }

    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            signal: Arc::clone(&self.signal),
        }
    }

    /// Bytes of block data received since the last call.
    pub fn pop_downloaded(&mut self) -> u64 {
        std::mem::take(&mut self.downloaded)
    }

    /// Bytes of block data sent since the last call.
    pub fn pop_uploaded(&mut self) -> u64 {
        std::mem::take(&mut self.uploaded)
    }

    /// Closes the session and drops the transport.
    pub fn invalidate(&mut self) {
        self.closer().invalidate();
        self.close();
    }

    fn pieces(&self) -> &PieceTracker {
        self.torrent.pieces()
    }

    fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        for (request, _) in self.in_flight.drain(..) {
            self.torrent.pieces().release_lock(request.piece);
        }
        self.peer_requests.clear();
        self.transport = None;
        self.state = SessionState::Closed;
        self.signal.valid.store(false, Ordering::SeqCst);
        tracing::debug!(addr = ?self.addr, peer = ?self.remote_id, "session closed");
    }

    /// Exchanges preambles and, when both sides advertise it, upgrades to
    /// the encrypted stream.
    ///
    /// Any failure closes the session.
    pub async fn handshake(&mut self) -> Result<(), PeerError> {
        match self.exchange_preambles().await {
            Ok(()) => {
                tracing::debug!(
                    addr = ?self.addr,
                    peer = ?self.remote_id,
                    encrypted = self.is_encrypted(),
                    "handshake complete"
                );
                self.state = SessionState::Active;
                self.last_sent = Instant::now();
                if let Err(e) = self.start_exchange().await {
                    self.close();
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => {
                tracing::debug!(addr = ?self.addr, error = %e, "handshake failed");
                self.close();
                Err(e)
            }
        }
    }

    async fn exchange_preambles(&mut self) -> Result<(), PeerError> {
        if self.state != SessionState::Handshaking {
            return Err(PeerError::ConnectionClosed);
        }

        let info_hash = *self.torrent.info_hash();
        let ours = Handshake::new(info_hash, self.peer_id.0, self.config.reserved_bytes());
        let transport = self.transport.as_mut().ok_or(PeerError::ConnectionClosed)?;

        if self.initiator {
            transport.send_handshake(&ours).await?;
        }
        let theirs = transport.receive_handshake().await?;
        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        if theirs.peer_id == ours.peer_id {
            return Err(PeerError::SelfConnection);
        }
        if !self.initiator {
            transport.send_handshake(&ours).await?;
        }

        self.remote_id = PeerId::from_bytes(&theirs.peer_id);
        self.negotiate_encryption(&theirs).await
    }

    async fn negotiate_encryption(&mut self, theirs: &Handshake) -> Result<(), PeerError> {
        let policy = self.config.encryption;
        if !(policy.advertises() && theirs.supports_encryption()) {
            if policy == EncryptionPolicy::Required {
                return Err(PeerError::EncryptionRequired);
            }
            return Ok(());
        }

        let rsa_bits = self.config.rsa_bits;
        let transport = self.transport.as_mut().ok_or(PeerError::ConnectionClosed)?;

        if self.initiator {
            let keys = tokio::task::spawn_blocking(move || RsaKeyPair::generate(rsa_bits))
                .await
                .map_err(|e| PeerError::Encryption(e.to_string()))??;
            let public = keys.public_key();
            transport
                .send_message(&Message::SendKey {
                    chunk_bits: public.chunk_bits(),
                    key: Bytes::from(public.exponent_bytes()),
                    modulus: Bytes::from(public.modulus_bytes()),
                })
                .await?;

            match next_exchange_message(transport).await? {
                Message::SendSymmetricKey(ciphertext) => {
                    let key = keys.decrypt_key(&ciphertext)?;
                    transport.enable_encryption(&key);
                }
                _ => return Err(PeerError::Encryption("expected symmetric key".into())),
            }
        } else {
            match next_exchange_message(transport).await? {
                Message::SendKey { key, modulus, .. } => {
                    let symmetric = random_symmetric_key();
                    let ciphertext = tokio::task::spawn_blocking(move || {
                        RsaPublicKey::from_bytes(&key, &modulus)?.encrypt(&symmetric)
                    })
                    .await
                    .map_err(|e| PeerError::Encryption(e.to_string()))??;
                    transport
                        .send_message(&Message::SendSymmetricKey(Bytes::from(ciphertext)))
                        .await?;
                    transport.enable_encryption(&symmetric);
                }
                _ => return Err(PeerError::Encryption("expected public key".into())),
            }
        }
        Ok(())
    }

    /// First messages after the handshake: our bitfield and, if configured,
    /// an unchoke.
    async fn start_exchange(&mut self) -> Result<(), PeerError> {
        let ours = self.pieces().bitfield();
        if !ours.is_empty() {
            self.send(Message::Bitfield(ours.to_bytes())).await?;
        }
        self.announced = ours;

        if self.config.unchoke_on_connect {
            self.set_choked(false).await?;
        }
        Ok(())
    }

    /// Processes messages until the session closes.
    ///
    /// Each wakeup handles at most one inbound message. When nothing arrives
    /// within the poll interval a keep-alive goes out if we have been silent
    /// for half the keep-alive timeout. Returns `Ok` when the session was
    /// invalidated and the fatal error otherwise.
    pub async fn run(&mut self) -> Result<(), PeerError> {
        if self.state != SessionState::Active {
            return Err(PeerError::ConnectionClosed);
        }
        let signal = Arc::clone(&self.signal);
        let poll_interval = self.config.poll_interval;

        loop {
            if !signal.valid.load(Ordering::SeqCst) {
                self.close();
                return Ok(());
            }

            let event = {
                let transport = self.transport.as_mut().ok_or(PeerError::ConnectionClosed)?;
                tokio::select! {
                    _ = signal.notify.notified() => Event::Closed,
                    received = timeout(poll_interval, transport.receive_message()) => match received {
                        Ok(result) => Event::Received(result),
                        Err(_) => Event::Idle,
                    },
                }
            };

            let outcome = match event {
                Event::Closed => {
                    self.close();
                    return Ok(());
                }
                Event::Idle => self.keep_alive().await,
                Event::Received(Ok(message)) => self.dispatch(message).await,
                Event::Received(Err(e)) => Err(e),
            };

            let outcome = match outcome {
                Ok(()) => self.maintain().await,
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(addr = ?self.addr, error = %e, "skipping message");
                    self.maintain().await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                tracing::debug!(addr = ?self.addr, error = %e, "session failed");
                self.close();
                return Err(e);
            }
        }
    }

    /// Waits for one message outside the run loop.
    pub async fn blocking_receive(&mut self) -> Result<Message, PeerError> {
        let transport = self.transport.as_mut().ok_or(PeerError::ConnectionClosed)?;
        let result = transport.receive_message().await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.close();
            }
        }
        result
    }

    async fn dispatch(&mut self, message: Message) -> Result<(), PeerError> {
        tracing::trace!(addr = ?self.addr, id = ?message.id(), "received message");
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.choking_us = true;
                // the peer discards our pending requests
                self.in_flight.clear();
            }
            Message::Unchoke => self.choking_us = false,
            Message::Interested => self.interested_in_us = true,
            Message::NotInterested => self.interested_in_us = false,
            Message::Have { piece } => {
                if self.remote_bitfield.set(piece as usize) {
                    self.update_interest().await?;
                } else if piece as usize >= self.remote_bitfield.piece_count() {
                    tracing::warn!(addr = ?self.addr, piece, "have for unknown piece");
                }
            }
            Message::Bitfield(bits) => {
                let piece_count = self.remote_bitfield.piece_count();
                if bits.len() != Bitfield::byte_len_for(piece_count) {
                    tracing::warn!(
                        addr = ?self.addr,
                        got = bits.len(),
                        expected = Bitfield::byte_len_for(piece_count),
                        "wrong bitfield length"
                    );
                    return Ok(());
                }
                self.remote_bitfield = Bitfield::from_bytes(&bits, piece_count);
                self.update_interest().await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.queue_request(BlockRequest::new(index, begin, length)),
            Message::Piece { index, begin, data } => {
                self.receive_block(index, begin, data).await?;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let cancelled = BlockRequest::new(index, begin, length);
                self.peer_requests.retain(|r| *r != cancelled);
            }
            Message::Port(port) => {
                if self.config.enable_dht {
                    tracing::debug!(addr = ?self.addr, port, "peer dht port");
                }
            }
            Message::SendKey { .. } | Message::SendSymmetricKey(_) => {
                tracing::debug!(addr = ?self.addr, "ignoring key exchange after handshake");
            }
            Message::Unknown { id, payload } => {
                tracing::debug!(addr = ?self.addr, id, len = payload.len(), "unknown message");
            }
        }
        Ok(())
    }

    fn queue_request(&mut self, request: BlockRequest) {
        if request.length > self.config.max_request_length {
            tracing::debug!(
                addr = ?self.addr,
                len = request.length,
                max = self.config.max_request_length,
                "ignoring oversized request"
            );
        } else if !self
            .pieces()
            .is_valid_block(request.piece, request.offset, request.length)
        {
            tracing::debug!(addr = ?self.addr, ?request, "ignoring request outside torrent");
        } else if self.peer_requests.len() >= self.config.max_queued_requests {
            tracing::debug!(addr = ?self.addr, "ignoring request because queue is full");
        } else {
            self.peer_requests.push_back(request);
        }
    }

    async fn receive_block(&mut self, piece: u32, offset: u32, data: Bytes) -> Result<(), PeerError> {
        let len = data.len() as u64;
        self.downloaded += len;
        self.torrent.add_downloaded(len);
        self.in_flight
            .retain(|(r, _)| !(r.piece == piece && r.offset == offset));

        if !self.pieces().is_valid_block(piece, offset, data.len() as u32) {
            tracing::warn!(addr = ?self.addr, piece, offset, len, "block outside torrent");
            return Ok(());
        }

        let stored = self.pieces().put_block(piece, offset, &data).await?;
        match stored {
            PutBlock::Duplicate => {}
            PutBlock::Stored(status) if status.is_complete() => {
                tracing::debug!(piece, ?status, "piece complete");
            }
            PutBlock::Stored(status) => {
                tracing::trace!(piece, offset, ?status, "stored block");
            }
        }
        Ok(())
    }

    async fn keep_alive(&mut self) -> Result<(), PeerError> {
        if self.last_sent.elapsed() >= self.config.keep_alive_interval() {
            tracing::trace!(addr = ?self.addr, "sending keep-alive");
            self.send(Message::KeepAlive).await?;
        }
        Ok(())
    }

    /// Per-iteration upkeep: announce new pieces, refill the request
    /// pipeline and serve one queued request.
    async fn maintain(&mut self) -> Result<(), PeerError> {
        self.announce_new_pieces().await?;
        self.fill_pipeline().await?;
        self.serve_one_request().await
    }

    async fn announce_new_pieces(&mut self) -> Result<(), PeerError> {
        let current = self.pieces().bitfield();
        let new = current.newly_set(&self.announced);
        if new.is_empty() {
            return Ok(());
        }
        for piece in new {
            self.send(Message::Have {
                piece: piece as u32,
            })
            .await?;
        }
        self.announced = current;
        self.update_interest().await
    }

    async fn fill_pipeline(&mut self) -> Result<(), PeerError> {
        let expiry = self.config.piece_lock_timeout;
        self.in_flight.retain(|(_, sent)| sent.elapsed() < expiry);

        if self.choking_us || !self.interesting_to_us {
            return Ok(());
        }
        let room = self
            .config
            .max_outstanding_requests
            .saturating_sub(self.in_flight.len());
        if room == 0 {
            return Ok(());
        }

        let blocks = self.pieces().get_free_blocks(&self.remote_bitfield, room);
        for block in blocks {
            self.send_request(block.piece, block.offset, block.length)
                .await?;
        }
        Ok(())
    }

    async fn serve_one_request(&mut self) -> Result<(), PeerError> {
        if self.choked_by_us {
            return Ok(());
        }
        let Some(request) = self.peer_requests.pop_front() else {
            return Ok(());
        };

        let block = self
            .pieces()
            .get_read_block(request.piece, request.offset, request.length)
            .await?;
        match block {
            Some(data) => self.send_block(request.piece, request.offset, data).await,
            None => {
                tracing::debug!(addr = ?self.addr, ?request, "requested block not available");
                Ok(())
            }
        }
    }

    async fn update_interest(&mut self) -> Result<(), PeerError> {
        let ours = self.pieces().bitfield();
        let interesting = self.remote_bitfield.has_missing_from(&ours);
        self.set_interesting(interesting).await
    }

    /// Chokes or unchokes the peer, sending a message only on change.
    ///
    /// Choking drops the peer's queued requests.
    pub async fn set_choked(&mut self, choked: bool) -> Result<(), PeerError> {
        if choked == self.choked_by_us {
            return Ok(());
        }
        self.choked_by_us = choked;
        if choked {
            self.peer_requests.clear();
        }
        if self.state == SessionState::Active {
            let message = if choked {
                Message::Choke
            } else {
                Message::Unchoke
            };
            self.send(message).await?;
        }
        Ok(())
    }

    /// Declares or withdraws interest, sending a message only on change.
    pub async fn set_interesting(&mut self, interesting: bool) -> Result<(), PeerError> {
        if interesting == self.interesting_to_us {
            return Ok(());
        }
        self.interesting_to_us = interesting;
        if self.state == SessionState::Active {
            let message = if interesting {
                Message::Interested
            } else {
                Message::NotInterested
            };
            self.send(message).await?;
        }
        Ok(())
    }

    /// Requests a block. Does nothing unless the session is active.
    pub async fn send_request(
        &mut self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<(), PeerError> {
        if self.state != SessionState::Active {
            return Ok(());
        }
        self.send(Message::Request {
            index: piece,
            begin: offset,
            length,
        })
        .await?;
        self.in_flight
            .push((BlockRequest::new(piece, offset, length), Instant::now()));
        Ok(())
    }

    /// Sends block data. Does nothing unless the session is active.
    pub async fn send_block(&mut self, piece: u32, offset: u32, data: Bytes) -> Result<(), PeerError> {
        if self.state != SessionState::Active {
            return Ok(());
        }
        let len = data.len() as u64;
        self.send(Message::Piece {
            index: piece,
            begin: offset,
            data,
        })
        .await?;
        self.uploaded += len;
        self.torrent.add_uploaded(len);
        Ok(())
    }

    /// Announces a piece. Does nothing unless the session is active.
    pub async fn send_have(&mut self, piece: u32) -> Result<(), PeerError> {
        if self.state != SessionState::Active {
            return Ok(());
        }
        self.send(Message::Have { piece }).await
    }

    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        let transport = self.transport.as_mut().ok_or(PeerError::ConnectionClosed)?;
        match transport.send_message(&message).await {
            Ok(()) => {
                self.last_sent = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }
}

/// Next message during the key exchange, skipping keep-alives.
async fn next_exchange_message<S>(transport: &mut PeerTransport<S>) -> Result<Message, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match transport.receive_message().await? {
            Message::KeepAlive => continue,
            message => return Ok(message),
        }
    }
}
