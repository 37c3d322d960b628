//! Tor Protocol Cryptography
//!
//! Per-hop relay crypto for one circuit:
//! - AES-128-CTR keystreams (IV zero), one per direction, never reset
//! - SHA-1 running digests seeded with Df/Db, one per direction
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use super::cell::Cell;
use super::kdf::KeyMaterial;
use super::relay_cell::{RelayCell, DIGEST_RANGE, RECOGNIZED_RANGE};
use crate::error::{Result, TorError};
use aes::Aes128;
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use rand::{CryptoRng, RngCore};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// Circuit keys for one hop
///
/// Each hop in the circuit has separate keys for:
/// - Forward encryption (client → relay)
/// - Backward encryption (relay → client)
/// - Forward digest (integrity)
/// - Backward digest (integrity)
///
/// SECURITY: Keys are automatically zeroized when dropped to prevent
/// memory leakage of sensitive cryptographic material.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward encryption key (client → relay)
    pub forward_key: [u8; 16],

    /// Backward encryption key (relay → client)
    pub backward_key: [u8; 16],

    /// Forward digest seed
    pub forward_digest: [u8; 20],

    /// Backward digest seed
    pub backward_digest: [u8; 20],
}

impl CircuitKeys {
    /// Take the cipher keys and digest seeds out of KDF-TOR output
    pub fn from_material(m: &KeyMaterial) -> Self {
        Self {
            forward_key: m.kf,
            backward_key: m.kb,
            forward_digest: m.df,
            backward_digest: m.db,
        }
    }
}

impl std::fmt::Debug for CircuitKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CircuitKeys { .. }")
    }
}

/// One direction of relay crypto: a keystream and a running digest
struct CryptoLayer {
    cipher: Aes128Ctr,
    digest: Sha1,
}

impl CryptoLayer {
    fn new(key: &[u8; 16], digest_seed: &[u8; 20]) -> Self {
        let iv = [0u8; 16];
        let mut digest = Sha1::new();
        digest.update(digest_seed);
        Self {
            cipher: Aes128Ctr::new(key.into(), (&iv).into()),
            digest,
        }
    }

    /// Current running digest, without disturbing the state
    fn snapshot(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.digest.clone().finalize());
        out
    }
}

/// Relay cell codec for one hop
///
/// Owns the outbound and inbound keystreams and running digests. Every
/// cell must go through here exactly once, in wire order; a cell that fails
/// to unmarshal leaves the state unusable.
pub struct RelayCrypto {
    outbound: CryptoLayer,
    inbound: CryptoLayer,
}

impl RelayCrypto {
    /// Crypto state for the client end of a hop
    pub fn client(keys: &CircuitKeys) -> Self {
        Self {
            outbound: CryptoLayer::new(&keys.forward_key, &keys.forward_digest),
            inbound: CryptoLayer::new(&keys.backward_key, &keys.backward_digest),
        }
    }

    /// Crypto state for the relay end of a hop
    pub fn relay(keys: &CircuitKeys) -> Self {
        Self {
            outbound: CryptoLayer::new(&keys.backward_key, &keys.backward_digest),
            inbound: CryptoLayer::new(&keys.forward_key, &keys.forward_digest),
        }
    }

    /// Marshal a relay cell into an encrypted 509-byte body
    ///
    /// Also returns the full outbound digest after this cell, which is what
    /// the peer will echo in an authenticated SENDME.
    pub fn marshal<R: RngCore + CryptoRng>(
        &mut self,
        cell: &RelayCell,
        rng: &mut R,
    ) -> Result<(Vec<u8>, [u8; 20])> {
        let mut body = cell.encode_plain(rng)?;

        self.outbound.digest.update(&body[..]);
        let digest = self.outbound.snapshot();
        body[DIGEST_RANGE].copy_from_slice(&digest[..4]);

        self.outbound.cipher.apply_keystream(&mut body);
        Ok((body.to_vec(), digest))
    }

    /// Decrypt, verify and decode a 509-byte relay body in place
    pub fn unmarshal(&mut self, body: &mut [u8]) -> Result<RelayCell> {
        if body.len() != Cell::PAYLOAD_SIZE {
            return Err(TorError::Protocol(format!(
                "relay body is {} bytes",
                body.len()
            )));
        }

        self.inbound.cipher.apply_keystream(body);

        if body[RECOGNIZED_RANGE] != [0, 0] {
            return Err(TorError::Unrecognized);
        }

        let mut received = [0u8; 4];
        received.copy_from_slice(&body[DIGEST_RANGE]);
        body[DIGEST_RANGE].fill(0);

        self.inbound.digest.update(&*body);
        let expected = self.inbound.snapshot();
        if !bool::from(expected[..4].ct_eq(&received)) {
            return Err(TorError::DigestMismatch);
        }

        RelayCell::decode_plain(body)
    }

    /// Current inbound running digest
    pub fn inbound_digest(&self) -> [u8; 20] {
        self.inbound.snapshot()
    }
}
