//! KDF-TOR key derivation
//!
//! ```text
//! K0 = X | Y
//! K  = H(K0 | [00]) | H(K0 | [01]) | H(K0 | [02]) | ...
//!
//! KH (20) | Df (20) | Db (20) | Kf (16) | Kb (16)
//! ```
//!
//! H is SHA-1. Only the first 92 bytes of K are used.

use crate::error::{Result, TorError};
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of each half of the shared secret (X and Y)
pub const SECRET_LEN: usize = 20;

/// Bytes of keystream produced for one hop
pub const KEY_MATERIAL_LEN: usize = 92;

/// Offset of the key-confirmation hash
pub const KH_OFFSET: usize = 0;
/// Offset of the forward digest seed
pub const DF_OFFSET: usize = 20;
/// Offset of the backward digest seed
pub const DB_OFFSET: usize = 40;
/// Offset of the forward cipher key
pub const KF_OFFSET: usize = 60;
/// Offset of the backward cipher key
pub const KB_OFFSET: usize = 76;

const SHA1_LEN: usize = 20;

/// Expand `seed` into `n_bytes` of keystream, counter starting at zero
///
/// The counter is a single byte, so at most 256 blocks can be produced.
pub fn expand(seed: &[u8], n_bytes: usize) -> Result<Zeroizing<Vec<u8>>> {
    if n_bytes > SHA1_LEN * 256 {
        return Err(TorError::HandshakeFailed(format!(
            "cannot derive {} bytes with KDF-TOR",
            n_bytes
        )));
    }

    let mut out = Zeroizing::new(Vec::with_capacity(n_bytes + SHA1_LEN));
    let mut counter = 0u8;
    while out.len() < n_bytes {
        let mut h = Sha1::new();
        h.update(seed);
        h.update([counter]);
        out.extend_from_slice(&h.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(n_bytes);
    Ok(out)
}

/// The five fields sliced out of KDF-TOR output
///
/// Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Key-confirmation hash
    pub kh: [u8; 20],
    /// Forward digest seed (client to relay)
    pub df: [u8; 20],
    /// Backward digest seed (relay to client)
    pub db: [u8; 20],
    /// Forward AES-128 key
    pub kf: [u8; 16],
    /// Backward AES-128 key
    pub kb: [u8; 16],
}

impl KeyMaterial {
    /// Slice 92 bytes of keystream at the fixed offsets
    pub fn from_keystream(k: &[u8]) -> Result<Self> {
        if k.len() < KEY_MATERIAL_LEN {
            return Err(TorError::HandshakeFailed(format!(
                "need {} bytes of key material, got {}",
                KEY_MATERIAL_LEN,
                k.len()
            )));
        }

        let mut m = KeyMaterial {
            kh: [0; 20],
            df: [0; 20],
            db: [0; 20],
            kf: [0; 16],
            kb: [0; 16],
        };
        m.kh.copy_from_slice(&k[KH_OFFSET..DF_OFFSET]);
        m.df.copy_from_slice(&k[DF_OFFSET..DB_OFFSET]);
        m.db.copy_from_slice(&k[DB_OFFSET..KF_OFFSET]);
        m.kf.copy_from_slice(&k[KF_OFFSET..KB_OFFSET]);
        m.kb.copy_from_slice(&k[KB_OFFSET..KEY_MATERIAL_LEN]);
        Ok(m)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial { .. }")
    }
}

/// Run KDF-TOR over `x | y` and slice the result
pub fn kdf_tor(x: &[u8; SECRET_LEN], y: &[u8; SECRET_LEN]) -> Result<KeyMaterial> {
    let mut k0 = Zeroizing::new([0u8; SECRET_LEN * 2]);
    k0[..SECRET_LEN].copy_from_slice(x);
    k0[SECRET_LEN..].copy_from_slice(y);

    let k = expand(&k0[..], KEY_MATERIAL_LEN)?;
    KeyMaterial::from_keystream(&k)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr20(s: &str) -> [u8; 20] {
        let v = hex::decode(s).unwrap();
        let mut a = [0u8; 20];
        a.copy_from_slice(&v);
        a
    }

    #[test]
    fn test_expand_blocks() {
        let seed = b"kdf seed";
        let k = expand(seed, 45).unwrap();
        assert_eq!(k.len(), 45);

        let mut h = Sha1::new();
        h.update(seed);
        h.update([0u8]);
        assert_eq!(&k[..20], &h.finalize()[..]);

        let mut h = Sha1::new();
        h.update(seed);
        h.update([2u8]);
        assert_eq!(&k[40..45], &h.finalize()[..5]);
    }

    #[test]
    fn test_expand_too_long() {
        assert!(expand(b"x", 20 * 256).is_ok());
        assert!(expand(b"x", 20 * 256 + 1).is_err());
    }

    #[test]
    fn test_offsets() {
        let x = [7u8; 20];
        let y = [9u8; 20];
        let m = kdf_tor(&x, &y).unwrap();

        let mut seed = Vec::new();
        seed.extend_from_slice(&x);
        seed.extend_from_slice(&y);
        let k = expand(&seed, KEY_MATERIAL_LEN).unwrap();

        assert_eq!(&m.kh[..], &k[0..20]);
        assert_eq!(&m.df[..], &k[20..40]);
        assert_eq!(&m.db[..], &k[40..60]);
        assert_eq!(&m.kf[..], &k[60..76]);
        assert_eq!(&m.kb[..], &k[76..92]);
    }

    #[test]
    fn test_deterministic() {
        let x = [1u8; 20];
        let y = [2u8; 20];
        let a = kdf_tor(&x, &y).unwrap();
        let b = kdf_tor(&x, &y).unwrap();
        assert_eq!(a.kh, b.kh);
        assert_eq!(a.kb, b.kb);

        let c = kdf_tor(&y, &x).unwrap();
        assert_ne!(a.kh, c.kh);
    }

    // Vectors from a CREATE_FAST exchange with a real relay: X, then Y | KH,
    // then the key stream that follows KH.
    #[test]
    fn test_create_fast_vectors() {
        let vectors = [
            (
                "080E247DF7C252FCD2DC10F459703480C223E3A6",
                "BA95C0D092335428BF80093BBED0B7A26C49E1E8696FBF9C8D6BE26504219C000D26AFE370FCEF04",
                "AFA89B4FC8CF882335A582C52478B5FCB1E08DAF707E2C2D23B8C27D30BD461F3DF98A3AF82221CB658AD0AA8680B99067E4F7DBC546970EA9A56B26433C71DA867BDD09C14A1308BC327D6A448D71D2382B3AB6AF0BB4E19649A8DFF607DB9C57A04AC3",
            ),
            (
                "5F786C724C2F5978474A04FA63772057AD896A03",
                "6210B037001405742FE78B6F5B34E6DB3C9F2F7E24239498613E0ED872E110A00774A3FCB37A7507",
                "D41B65D83FB4B34A322B658BE4D706EDCD8B62813757E719118C394E1F22E1C8EA8959BAB30E856A914C3054946F547397094DE031F5BCA384C65C8880BF7AAB9CE7BEE33971F9DE8C22A23366F46BF8B5E5112321E216B0E02C62EEA3ABB72A0E062592",
            ),
        ];

        for (x, reply, keys) in vectors {
            let x = arr20(x);
            let reply = hex::decode(reply).unwrap();
            let keys = hex::decode(keys).unwrap();
            let y = arr20(&hex::encode(&reply[..20]));

            let m = kdf_tor(&x, &y).unwrap();
            assert_eq!(&m.kh[..], &reply[20..40]);
            assert_eq!(&m.df[..], &keys[0..20]);
            assert_eq!(&m.db[..], &keys[20..40]);
            assert_eq!(&m.kf[..], &keys[40..56]);
            assert_eq!(&m.kb[..], &keys[56..72]);
        }
    }
}
