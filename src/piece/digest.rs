use crate::constants::DIGEST_LEN;
use sha1::{Digest, Sha1};
use std::fmt;

/// Hash function used to verify completed pieces.
///
/// `digest` returns `None` when the algorithm cannot run; the tracker then
/// accepts the piece unverified instead of discarding data it cannot check.
pub trait PieceDigest: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn digest(&self, data: &[u8]) -> Option<[u8; DIGEST_LEN]>;
}

/// SHA-1, as required for wire compatibility.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Digest;

impl PieceDigest for Sha1Digest {
    fn name(&self) -> &'static str {
        "sha1"
    }

    fn digest(&self, data: &[u8]) -> Option<[u8; DIGEST_LEN]> {
        Some(sha1(data))
    }
}

/// A digest that is never available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDigest;

impl PieceDigest for NoDigest {
    fn name(&self) -> &'static str {
        "none"
    }

    fn digest(&self, _data: &[u8]) -> Option<[u8; DIGEST_LEN]> {
        None
    }
}

/// SHA-1 of `data`, for building expected piece digests.
pub fn sha1(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
