//! CREATE_FAST handshake
//!
//! The client sends a random X, the relay answers with a random Y and
//! KH, and both sides run KDF-TOR over `X | Y`. There is no public-key
//! step: the link's TLS session is what authenticates the relay.

use super::cell::ChanMsg;
use super::crypto::CircuitKeys;
use super::kdf::{kdf_tor, SECRET_LEN};
use crate::error::{Result, TorError};
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Client side of a CREATE_FAST handshake
pub struct CreateFastClient {
    x: Zeroizing<[u8; SECRET_LEN]>,
}

impl CreateFastClient {
    /// Start a handshake with a fresh random X
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut x = Zeroizing::new([0u8; SECRET_LEN]);
        rng.fill_bytes(&mut x[..]);
        Self { x }
    }

    /// Start a handshake with a caller-chosen X
    pub fn with_nonce(x: [u8; SECRET_LEN]) -> Self {
        Self {
            x: Zeroizing::new(x),
        }
    }

    /// The CREATE_FAST message to send
    pub fn message(&self) -> ChanMsg {
        ChanMsg::CreateFast { x: *self.x }
    }

    /// Finish the handshake with the relay's CREATED_FAST reply
    ///
    /// Fails with [`TorError::KeyConfirmation`] if KH does not match; the
    /// derived material is dropped (and zeroized) in that case.
    pub fn complete(self, y: &[u8; SECRET_LEN], kh: &[u8; SECRET_LEN]) -> Result<CircuitKeys> {
        let material = kdf_tor(&self.x, y)?;

        if !bool::from(material.kh[..].ct_eq(&kh[..])) {
            return Err(TorError::KeyConfirmation);
        }

        Ok(CircuitKeys::from_material(&material))
    }
}

/// Relay side of a CREATE_FAST handshake
pub struct CreateFastServer;

impl CreateFastServer {
    /// Answer a client's X with a fresh random Y
    pub fn respond<R: RngCore + CryptoRng>(
        rng: &mut R,
        x: &[u8; SECRET_LEN],
    ) -> Result<(CircuitKeys, ChanMsg)> {
        let mut y = [0u8; SECRET_LEN];
        rng.fill_bytes(&mut y);
        Self::respond_with(x, &y)
    }

    /// Answer a client's X with the given Y
    pub fn respond_with(
        x: &[u8; SECRET_LEN],
        y: &[u8; SECRET_LEN],
    ) -> Result<(CircuitKeys, ChanMsg)> {
        let material = kdf_tor(x, y)?;
        let reply = ChanMsg::CreatedFast {
            y: *y,
            kh: material.kh,
        };
        Ok((CircuitKeys::from_material(&material), reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut rng = rand::thread_rng();
        let client = CreateFastClient::new(&mut rng);
        let x = match client.message() {
            ChanMsg::CreateFast { x } => x,
            other => panic!("unexpected {:?}", other),
        };

        let (relay_keys, reply) = CreateFastServer::respond(&mut rng, &x).unwrap();
        let (y, kh) = match reply {
            ChanMsg::CreatedFast { y, kh } => (y, kh),
            other => panic!("unexpected {:?}", other),
        };

        let client_keys = client.complete(&y, &kh).unwrap();
        assert_eq!(client_keys.forward_key, relay_keys.forward_key);
        assert_eq!(client_keys.backward_digest, relay_keys.backward_digest);
    }

    #[test]
    fn test_bad_kh() {
        let mut rng = rand::thread_rng();
        let client = CreateFastClient::new(&mut rng);
        let y = [0x11; 20];
        let mut kh = [0x22; 20];
        kh[0] ^= 1;
        assert!(matches!(
            client.complete(&y, &kh),
            Err(TorError::KeyConfirmation)
        ));
    }

    #[test]
    fn test_fixed_vector() {
        let x = hex::decode("080E247DF7C252FCD2DC10F459703480C223E3A6").unwrap();
        let reply = hex::decode(
            "BA95C0D092335428BF80093BBED0B7A26C49E1E8696FBF9C8D6BE26504219C000D26AFE370FCEF04",
        )
        .unwrap();

        let mut xa = [0u8; 20];
        xa.copy_from_slice(&x);
        let mut y = [0u8; 20];
        y.copy_from_slice(&reply[..20]);
        let mut kh = [0u8; 20];
        kh.copy_from_slice(&reply[20..]);

        assert!(CreateFastClient::with_nonce(xa).complete(&y, &kh).is_ok());
        assert_eq!(
            CreateFastServer::respond_with(&xa, &y).unwrap().1,
            ChanMsg::CreatedFast { y, kh }
        );
    }
}
