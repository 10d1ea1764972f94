//! A torrent being downloaded and the peers it talks to.
//!
//! [`Torrent`] ties the decoded metadata ([`TorrentLayout`]) to the shared
//! [`PieceTracker`] and keeps the transfer counters reported to trackers.
//! Peer addresses come from a [`PeerSource`], the seam where tracker and DHT
//! clients plug in. Outbound sessions and those accepted by a
//! [`PeerListener`] share one cap of `max_peers` slots.

use crate::config::SessionConfig;
use crate::constants::DIGEST_LEN;
use crate::peer::{PeerError, PeerId, PeerSession};
use crate::piece::PieceTracker;
use crate::storage::{BlockStore, StorageError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// The parts of a torrent's metadata the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentLayout {
    pub info_hash: [u8; 20],
    pub piece_length: u64,
    /// Flat concatenation of the 20-byte digest of every piece.
    pub digests: Vec<u8>,
    /// Files in torrent order, paths relative to the download directory.
    pub files: Vec<(PathBuf, u64)>,
}

impl TorrentLayout {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|(_, length)| length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.digests.len() / DIGEST_LEN
    }
}

/// Upload and download totals as reported to a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

/// Source of peer addresses for an info-hash, such as a tracker or the DHT.
#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn peers(&self, info_hash: &[u8; 20]) -> Vec<SocketAddr>;
}

/// A fixed list of peers.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    addrs: Vec<SocketAddr>,
}

impl StaticPeers {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }
}

#[async_trait]
impl PeerSource for StaticPeers {
    async fn peers(&self, _info_hash: &[u8; 20]) -> Vec<SocketAddr> {
        self.addrs.clone()
    }
}

/// A torrent opened for download and upload.
#[derive(Debug)]
pub struct Torrent {
    info_hash: [u8; 20],
    pieces: PieceTracker,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    max_peers: usize,
    peer_slots: Arc<Semaphore>,
}

impl Torrent {
    /// Creates or opens the torrent's files under `base` and sets up piece
    /// tracking. Existing data is not checked; see [`Torrent::recheck`].
    pub async fn open(
        layout: TorrentLayout,
        base: &Path,
        config: &SessionConfig,
    ) -> Result<Self, StorageError> {
        let store = BlockStore::open_in(base, layout.files, layout.piece_length).await?;
        let pieces = PieceTracker::new(store, layout.digests, config)?;

        tracing::info!(
            info_hash = %hex(&layout.info_hash),
            pieces = pieces.piece_count(),
            size = pieces.total_size(),
            "opened torrent"
        );
        Ok(Self::with_tracker(layout.info_hash, pieces, config.max_peers))
    }

    pub fn with_tracker(info_hash: [u8; 20], pieces: PieceTracker, max_peers: usize) -> Self {
        let max_peers = max_peers.min(Semaphore::MAX_PERMITS);
        Self {
            info_hash,
            pieces,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            max_peers,
            peer_slots: Arc::new(Semaphore::new(max_peers)),
        }
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn pieces(&self) -> &PieceTracker {
        &self.pieces
    }

    pub fn pieces_downloaded(&self) -> usize {
        self.pieces.pieces_downloaded()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.is_complete()
    }

    /// True length of `piece`; shorter than nominal for the last one.
    pub fn piece_length(&self, piece: u32) -> Result<u64, StorageError> {
        self.pieces.piece_size(piece)
    }

    /// Adopts pieces already present on disk.
    pub async fn recheck(&self) -> Result<usize, StorageError> {
        self.pieces.recheck_all().await
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.pieces.bytes_left()
    }

    /// Peer sessions currently holding a slot.
    pub fn active_peers(&self) -> usize {
        self.max_peers - self.peer_slots.available_permits()
    }

    fn reserve_peer_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.peer_slots).try_acquire_owned().ok()
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            downloaded: self.downloaded(),
            uploaded: self.uploaded(),
            left: self.left(),
        }
    }

    /// Connects to the peers `source` knows and runs each session in its
    /// own task, stopping once every peer slot is taken.
    pub async fn connect_peers(
        self: &Arc<Self>,
        source: &dyn PeerSource,
        peer_id: PeerId,
        config: &SessionConfig,
    ) -> Vec<JoinHandle<Result<(), PeerError>>> {
        let addrs = source.peers(&self.info_hash).await;
        tracing::debug!(
            peers = addrs.len(),
            active = self.active_peers(),
            "connecting to peers"
        );

        let mut tasks = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let Some(slot) = self.reserve_peer_slot() else {
                tracing::debug!(max_peers = self.max_peers, "peer limit reached");
                break;
            };
            let mut session = PeerSession::new(addr, Arc::clone(self), peer_id, config.clone());
            tasks.push(tokio::spawn(
                async move {
                    let _slot = slot;
                    session.connect().await?;
                    session.handshake().await?;
                    session.run().await
                }
                .instrument(tracing::debug_span!("peer", %addr)),
            ));
        }
        tasks
    }

    /// Accepts inbound peers on `addr` until the returned listener is
    /// dropped. Connections beyond the peer limit are closed unanswered.
    pub async fn listen(
        self: &Arc<Self>,
        addr: SocketAddr,
        peer_id: PeerId,
        config: &SessionConfig,
    ) -> Result<PeerListener, PeerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "listening for peers");

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(self),
            peer_id,
            config.clone(),
        ));
        Ok(PeerListener { local_addr, task })
    }
}

/// A running accept loop. Dropping it stops accepting; sessions already
/// started keep running.
#[derive(Debug)]
pub struct PeerListener {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl PeerListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    torrent: Arc<Torrent>,
    peer_id: PeerId,
    config: SessionConfig,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let Some(slot) = torrent.reserve_peer_slot() else {
            tracing::debug!(%addr, max_peers = torrent.max_peers, "peer limit reached, refusing");
            continue;
        };

        let torrent = Arc::clone(&torrent);
        let config = config.clone();
        tokio::spawn(
            async move {
                let _slot = slot;
                let mut session = PeerSession::accept(stream, torrent, peer_id, config).await?;
                session.run().await
            }
            .instrument(tracing::debug_span!("peer", %addr)),
        );
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::sha1;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn layout(data: &[u8], piece_length: usize) -> TorrentLayout {
        TorrentLayout {
            info_hash: [7u8; 20],
            piece_length: piece_length as u64,
            digests: data.chunks(piece_length).flat_map(sha1).collect(),
            files: vec![
                (PathBuf::from("a.bin"), 30),
                (PathBuf::from("sub/b.bin"), (data.len() - 30) as u64),
            ],
        }
    }

    #[tokio::test]
    async fn test_open_and_progress() {
        let temp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..77u8).collect();
        let layout = layout(&data, 16);
        assert_eq!(layout.total_length(), 77);
        assert_eq!(layout.piece_count(), 5);

        let torrent = Torrent::open(layout, temp.path(), &SessionConfig::default())
            .await
            .unwrap();
        assert!(temp.path().join("sub/b.bin").exists());
        assert_eq!(torrent.piece_length(4).unwrap(), 13);
        assert_eq!(torrent.left(), 77);

        torrent.pieces().put_block(4, 0, &data[64..]).await.unwrap();
        torrent.add_downloaded(13);
        assert_eq!(torrent.pieces_downloaded(), 1);
        assert_eq!(
            torrent.stats(),
            TransferStats {
                downloaded: 13,
                uploaded: 0,
                left: 64
            }
        );
        assert!(!torrent.is_complete());
    }

    #[tokio::test]
    async fn test_recheck_existing_files() {
        let temp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..77u8).collect();
        std::fs::write(temp.path().join("a.bin"), &data[..30]).unwrap();
        std::fs::create_dir_all(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("sub/b.bin"), &data[30..]).unwrap();

        let torrent = Torrent::open(layout(&data, 16), temp.path(), &SessionConfig::default())
            .await
            .unwrap();
        assert_eq!(torrent.recheck().await.unwrap(), 5);
        assert!(torrent.is_complete());
        assert_eq!(torrent.left(), 0);
    }

    #[tokio::test]
    async fn test_open_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let mut layout = layout(&[0u8; 40], 16);
        layout.files[1].0 = PathBuf::from("../outside.bin");
        let result = Torrent::open(layout, temp.path(), &SessionConfig::default()).await;
        assert!(matches!(result, Err(StorageError::PathTraversal(_))));
    }

    fn peer_config(max_peers: usize) -> SessionConfig {
        SessionConfig {
            block_size: 8,
            poll_interval: Duration::from_millis(10),
            max_peers,
            ..SessionConfig::default()
        }
    }

    async fn seeded_torrent(
        temp: &TempDir,
        data: &[u8],
        config: &SessionConfig,
    ) -> Arc<Torrent> {
        std::fs::write(temp.path().join("a.bin"), &data[..30]).unwrap();
        std::fs::create_dir_all(temp.path().join("sub")).unwrap();
        std::fs::write(temp.path().join("sub/b.bin"), &data[30..]).unwrap();
        let torrent = Torrent::open(layout(data, 16), temp.path(), config).await.unwrap();
        assert_eq!(torrent.recheck().await.unwrap(), 5);
        Arc::new(torrent)
    }

    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_connect_peers_respects_peer_limit() {
        let temp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..77u8).collect();
        let config = peer_config(1);
        let torrent = Arc::new(
            Torrent::open(layout(&data, 16), temp.path(), &config)
                .await
                .unwrap(),
        );

        let source = StaticPeers::new(vec![closed_port().await, closed_port().await]);
        let tasks = torrent
            .connect_peers(&source, PeerId::generate(), &config)
            .await;
        assert_eq!(tasks.len(), 1);

        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }
        assert_eq!(torrent.active_peers(), 0);
    }

    #[tokio::test]
    async fn test_listen_serves_connecting_peer() {
        let data: Vec<u8> = (0..77u8).map(|i| i.wrapping_mul(31)).collect();
        let config = peer_config(4);

        let seed_dir = TempDir::new().unwrap();
        let seeder = seeded_torrent(&seed_dir, &data, &config).await;
        let listener = seeder
            .listen("127.0.0.1:0".parse().unwrap(), PeerId::generate(), &config)
            .await
            .unwrap();

        let leech_dir = TempDir::new().unwrap();
        let leecher = Arc::new(
            Torrent::open(layout(&data, 16), leech_dir.path(), &config)
                .await
                .unwrap(),
        );
        let source = StaticPeers::new(vec![listener.local_addr()]);
        let tasks = leecher
            .connect_peers(&source, PeerId::generate(), &config)
            .await;
        assert_eq!(tasks.len(), 1);

        tokio::time::timeout(Duration::from_secs(10), async {
            while !leecher.is_complete() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(seeder.active_peers(), 1);
        assert_eq!(leecher.active_peers(), 1);
        assert_eq!(seeder.uploaded(), 77);
        assert_eq!(std::fs::read(leech_dir.path().join("a.bin")).unwrap(), &data[..30]);
        assert_eq!(
            std::fs::read(leech_dir.path().join("sub/b.bin")).unwrap(),
            &data[30..]
        );

        for task in tasks {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_listen_refuses_peers_over_limit() {
        let data: Vec<u8> = (0..77u8).collect();
        let config = peer_config(1);
        let temp = TempDir::new().unwrap();
        let torrent = seeded_torrent(&temp, &data, &config).await;
        let listener = torrent
            .listen("127.0.0.1:0".parse().unwrap(), PeerId::generate(), &config)
            .await
            .unwrap();

        // holds the only slot while its handshake is pending
        let _first = tokio::net::TcpStream::connect(listener.local_addr())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while torrent.active_peers() < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut second = tokio::net::TcpStream::connect(listener.local_addr())
            .await
            .unwrap();
        let mut buf = [0u8; 68];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap(), 0);
        assert_eq!(torrent.active_peers(), 1);
    }

    #[tokio::test]
    async fn test_static_peers() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let source = StaticPeers::new(vec![addr]);
        assert_eq!(source.peers(&[0u8; 20]).await, vec![addr]);
    }
}
