//! Key material for the encrypted-stream upgrade.
//!
//! The initiator publishes an RSA public key, the responder answers with a
//! random symmetric key encrypted under it, and both sides then run every
//! byte through RC4 (one keystream per direction, same key).

use super::error::PeerError;
use crate::constants::{RC4_DISCARD, SYMMETRIC_KEY_LEN};
use num_bigint::BigUint;
use rand::Rng;

/// Smallest modulus that can carry a symmetric key.
pub const MIN_RSA_BITS: u32 = 256;

/// Largest modulus accepted from a peer or generated locally.
pub const MAX_RSA_BITS: u32 = 4096;

const PUBLIC_EXPONENT: u32 = 65537;
const MILLER_RABIN_ROUNDS: usize = 24;
const SMALL_PRIMES: [u32; 24] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// RC4 cipher state
#[derive(Clone)]
pub struct Rc4Cipher {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4Cipher {
    /// Key schedule followed by the initial keystream discard.
    pub fn new(key: &[u8]) -> Self {
        let mut cipher = Self::without_discard(key);
        let mut discard = [0u8; RC4_DISCARD];
        cipher.process(&mut discard);
        cipher
    }

    fn without_discard(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, byte) in state.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }

        Self { state, i: 0, j: 0 }
    }

    /// Encrypts or decrypts `data` in place.
    pub fn process(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state
                [(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

impl std::fmt::Debug for Rc4Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rc4Cipher")
    }
}

/// Independent keystreams for the two directions of a connection.
#[derive(Debug, Clone)]
pub struct StreamCipher {
    pub(crate) encrypt: Rc4Cipher,
    pub(crate) decrypt: Rc4Cipher,
}

impl StreamCipher {
    pub fn new(key: &[u8]) -> Self {
        Self {
            encrypt: Rc4Cipher::new(key),
            decrypt: Rc4Cipher::new(key),
        }
    }
}

/// Draws a fresh symmetric stream key.
pub fn random_symmetric_key() -> [u8; SYMMETRIC_KEY_LEN] {
    let mut key = [0u8; SYMMETRIC_KEY_LEN];
    rand::rng().fill(&mut key);
    key
}

/// An RSA public key as carried by a SendKey message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    exponent: BigUint,
    modulus: BigUint,
}

impl RsaPublicKey {
    /// Parses a peer's key. The modulus must lie between [`MIN_RSA_BITS`]
    /// and [`MAX_RSA_BITS`] and the exponent must be smaller than it.
    pub fn from_bytes(exponent: &[u8], modulus: &[u8]) -> Result<Self, PeerError> {
        let exponent = BigUint::from_bytes_be(exponent);
        let modulus = BigUint::from_bytes_be(modulus);
        let bits = modulus.bits();
        if bits < MIN_RSA_BITS as u64 || bits > MAX_RSA_BITS as u64 {
            return Err(PeerError::Encryption(format!(
                "rsa modulus of {bits} bits is outside {MIN_RSA_BITS}..={MAX_RSA_BITS}"
            )));
        }
        if exponent < BigUint::from(3u32) || exponent >= modulus {
            return Err(PeerError::Encryption("unusable public exponent".into()));
        }
        Ok(Self { exponent, modulus })
    }

    pub fn exponent_bytes(&self) -> Vec<u8> {
        self.exponent.to_bytes_be()
    }

    pub fn modulus_bytes(&self) -> Vec<u8> {
        self.modulus.to_bytes_be()
    }

    /// Size in bits of the plaintext chunks this key encrypts.
    pub fn chunk_bits(&self) -> u32 {
        (((self.modulus.bits() - 1) / 8) * 8) as u32
    }

    /// Encrypts `message`, which must be shorter than the modulus.
    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, PeerError> {
        if message.len() as u64 * 8 > self.chunk_bits() as u64 {
            return Err(PeerError::Encryption("message longer than key chunk".into()));
        }
        let m = BigUint::from_bytes_be(message);
        let c = m.modpow(&self.exponent, &self.modulus).to_bytes_be();

        // fixed width, so the payload is never empty
        let width = self.modulus.bits().div_ceil(8) as usize;
        let mut out = vec![0u8; width - c.len()];
        out.extend_from_slice(&c);
        Ok(out)
    }
}

/// An RSA key pair generated for one connection.
#[derive(Debug, Clone)]
pub struct RsaKeyPair {
    public: RsaPublicKey,
    private_exponent: BigUint,
}

impl RsaKeyPair {
    /// Generates a key pair with a modulus of about `bits` bits.
    ///
    /// CPU bound; callers on the runtime should use `spawn_blocking`.
    pub fn generate(bits: u32) -> Result<Self, PeerError> {
        if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
            return Err(PeerError::Encryption(format!(
                "rsa modulus of {bits} bits is outside {MIN_RSA_BITS}..={MAX_RSA_BITS}"
            )));
        }

        let exponent = BigUint::from(PUBLIC_EXPONENT);
        let one = BigUint::from(1u32);
        loop {
            let p = generate_prime(bits / 2);
            let q = generate_prime(bits - bits / 2);
            if p == q {
                continue;
            }

            let phi = (&p - &one) * (&q - &one);
            let Some(private_exponent) = exponent.modinv(&phi) else {
                continue;
            };

            return Ok(Self {
                public: RsaPublicKey {
                    exponent,
                    modulus: p * q,
                },
                private_exponent,
            });
        }
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Decrypts a symmetric key, restoring leading zero bytes lost in transit.
    pub fn decrypt_key(&self, ciphertext: &[u8]) -> Result<[u8; SYMMETRIC_KEY_LEN], PeerError> {
        let c = BigUint::from_bytes_be(ciphertext);
        if c >= self.public.modulus {
            return Err(PeerError::Encryption("ciphertext exceeds modulus".into()));
        }

        let plain = c
            .modpow(&self.private_exponent, &self.public.modulus)
            .to_bytes_be();
        if plain.len() > SYMMETRIC_KEY_LEN {
            return Err(PeerError::Encryption("symmetric key has wrong length".into()));
        }

        let mut key = [0u8; SYMMETRIC_KEY_LEN];
        key[SYMMETRIC_KEY_LEN - plain.len()..].copy_from_slice(&plain);
        Ok(key)
    }
}

/// Random prime with exactly `bits` bits.
fn generate_prime(bits: u32) -> BigUint {
    let len = bits.div_ceil(8) as usize;
    let excess = len as u32 * 8 - bits;
    let mut bytes = vec![0u8; len];
    let mut rng = rand::rng();

    loop {
        rng.fill(&mut bytes[..]);
        bytes[0] &= 0xFF >> excess;
        // top two bits set so the product keeps its full width
        bytes[0] |= 0xC0 >> excess;
        bytes[len - 1] |= 1;

        let candidate = BigUint::from_bytes_be(&bytes);
        if is_probable_prime(&candidate, MILLER_RABIN_ROUNDS) {
            return candidate;
        }
    }
}

pub(crate) fn is_probable_prime(n: &BigUint, rounds: usize) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    for &p in SMALL_PRIMES.iter() {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).bits() == 0 {
            return false;
        }
    }
    if (n % &two).bits() == 0 {
        return *n == two;
    }

    let one = BigUint::from(1u32);
    let n_minus_one = n - &one;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    let len = n.to_bytes_be().len();
    let span = n - BigUint::from(3u32);
    let mut bytes = vec![0u8; len];
    let mut rng = rand::rng();

    'witness: for _ in 0..rounds {
        rng.fill(&mut bytes[..]);
        let a = BigUint::from_bytes_be(&bytes) % &span + &two;

        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}
