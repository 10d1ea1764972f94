//! Peer wire protocol
//!
//! Framing and codec for the wire messages, the 68-byte handshake preamble,
//! the optional RSA/RC4 encrypted-stream upgrade and the per-connection
//! [`PeerSession`] state machine.

mod crypto;
mod error;
mod message;
mod peer_id;
mod session;
mod transport;

pub use crypto::{Rc4Cipher, RsaKeyPair, RsaPublicKey, StreamCipher, MAX_RSA_BITS, MIN_RSA_BITS};
pub use error::PeerError;
pub use message::{Handshake, Message, MessageId};
pub use peer_id::PeerId;
pub use session::{PeerSession, SessionCloser, SessionState};
pub use transport::PeerTransport;
