//! Chunked RSA envelope.
//!
//! RSA can only encrypt a few hundred bytes per operation, so the payload is
//! cut into chunks of at most [`max_chunk_len`] bytes and each ciphertext is
//! written as a `u32` big-endian length followed by the block itself:
//!
//! ```text
//! +---------+-----------------+---------+-----------------+----
//! | len: 4B | ciphertext[len] | len: 4B | ciphertext[len] | ...
//! +---------+-----------------+---------+-----------------+----
//! ```
//!
//! There is no header and no sequence number, the position of a block in
//! the stream is its order. The codec knows nothing about what it carries.

use std::path::Path;

use rsa::{
    Oaep, RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    rand_core::OsRng,
    traits::PublicKeyParts,
};
use sha2::Sha256;

const LEN_PREFIX: usize = 4;
/// OAEP overhead for SHA-256: two digests plus two bytes.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("corrupt envelope: {0}")]
    CorruptEnvelope(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(rsa::Error),
    #[error("encryption failed: {0}")]
    EncryptionFailed(rsa::Error),
    #[error("key of {0} bytes is too small for OAEP-SHA256")]
    KeyTooSmall(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to read key file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse key file {path}: {reason}")]
    Parse { path: String, reason: String },
}

fn padding() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Largest plaintext a single block may carry under `key`.
pub fn max_chunk_len(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(OAEP_OVERHEAD)
}

/// Encrypts `plaintext` block by block, returns it unchanged without a key.
pub fn encrypt(plaintext: &[u8], key: Option<&RsaPublicKey>) -> Result<Vec<u8>, EnvelopeError> {
    let Some(key) = key else {
        return Ok(plaintext.to_vec());
    };

    let chunk_len = max_chunk_len(key);
    if chunk_len == 0 {
        return Err(EnvelopeError::KeyTooSmall(key.size()));
    }

    let blocks = plaintext.len().div_ceil(chunk_len);
    let mut out = Vec::with_capacity(blocks * (LEN_PREFIX + key.size()));
    let mut rng = OsRng;
    for chunk in plaintext.chunks(chunk_len) {
        let block = key
            .encrypt(&mut rng, padding(), chunk)
            .map_err(EnvelopeError::EncryptionFailed)?;
        out.extend_from_slice(&(block.len() as u32).to_be_bytes());
        out.extend_from_slice(&block);
    }

    Ok(out)
}

/// Walks the length-prefixed blocks and decrypts them in order, returns the
/// input unchanged without a key.
pub fn decrypt(envelope: &[u8], key: Option<&RsaPrivateKey>) -> Result<Vec<u8>, EnvelopeError> {
    let Some(key) = key else {
        return Ok(envelope.to_vec());
    };

    let mut out = Vec::with_capacity(envelope.len());
    let mut rest = envelope;
    while !rest.is_empty() {
        let Some((prefix, tail)) = rest.split_first_chunk::<LEN_PREFIX>() else {
            return Err(EnvelopeError::CorruptEnvelope(format!(
                "{} trailing bytes cannot hold a length prefix",
                rest.len()
            )));
        };
        let len = u32::from_be_bytes(*prefix) as usize;
        if len > tail.len() {
            return Err(EnvelopeError::CorruptEnvelope(format!(
                "block declares {len} bytes but only {} remain",
                tail.len()
            )));
        }

        let (block, tail) = tail.split_at(len);
        let plain = key
            .decrypt(padding(), block)
            .map_err(EnvelopeError::DecryptionFailed)?;
        out.extend_from_slice(&plain);
        rest = tail;
    }

    Ok(out)
}

pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, String> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| e.to_string())
}

pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, String> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| e.to_string())
}

/// Reads a PEM public key, SPKI or PKCS#1.
pub fn load_public_key(path: impl AsRef<Path>) -> Result<RsaPublicKey, KeyError> {
    let path = path.as_ref();
    let pem = read_pem(path)?;
    parse_public_key(&pem).map_err(|reason| KeyError::Parse {
        path: path.display().to_string(),
        reason,
    })
}

/// Reads a PEM private key, PKCS#8 or PKCS#1.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<RsaPrivateKey, KeyError> {
    let path = path.as_ref();
    let pem = read_pem(path)?;
    parse_private_key(&pem).map_err(|reason| KeyError::Parse {
        path: path.display().to_string(),
        reason,
    })
}

fn read_pem(path: &Path) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::OnceLock;

    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    use super::*;

    /// Key generation dominates test time, share one pair across tests.
    pub(crate) fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 1024).expect("generate key"))
    }

    fn pair() -> (RsaPublicKey, &'static RsaPrivateKey) {
        let private = test_key();
        (RsaPublicKey::from(private), private)
    }

    #[test]
    fn round_trip_multiple_blocks() {
        let (public, private) = pair();
        let chunk = max_chunk_len(&public);
        assert_eq!(chunk, 128 - 66);

        let plaintext: Vec<u8> = (0..chunk * 3 + 7).map(|i| i as u8).collect();
        let envelope = encrypt(&plaintext, Some(&public)).unwrap();

        // four blocks, each a full modulus plus its prefix
        assert_eq!(envelope.len(), 4 * (LEN_PREFIX + 128));
        assert_eq!(&envelope[..4], &128u32.to_be_bytes());
        assert_eq!(decrypt(&envelope, Some(private)).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_exact_chunk_boundary() {
        let (public, private) = pair();
        let plaintext = vec![0xab; max_chunk_len(&public) * 2];

        let envelope = encrypt(&plaintext, Some(&public)).unwrap();
        assert_eq!(envelope.len(), 2 * (LEN_PREFIX + 128));
        assert_eq!(decrypt(&envelope, Some(private)).unwrap(), plaintext);
    }

    #[test]
    fn round_trip_empty() {
        let (public, private) = pair();

        let envelope = encrypt(&[], Some(&public)).unwrap();
        assert!(envelope.is_empty());
        assert!(decrypt(&envelope, Some(private)).unwrap().is_empty());
    }

    #[test]
    fn pass_through_without_key() {
        let payload = b"plain payload".to_vec();

        assert_eq!(encrypt(&payload, None).unwrap(), payload);
        assert_eq!(decrypt(&payload, None).unwrap(), payload);
    }

    #[test]
    fn truncated_block_is_corrupt() {
        let (public, private) = pair();
        let mut envelope = encrypt(b"some metrics", Some(&public)).unwrap();
        envelope.truncate(envelope.len() - 1);

        assert!(matches!(
            decrypt(&envelope, Some(private)),
            Err(EnvelopeError::CorruptEnvelope(_))
        ));
    }

    #[test]
    fn dangling_prefix_is_corrupt() {
        let (public, private) = pair();
        let mut envelope = encrypt(b"some metrics", Some(&public)).unwrap();
        envelope.extend_from_slice(&[0, 0]);

        assert!(matches!(
            decrypt(&envelope, Some(private)),
            Err(EnvelopeError::CorruptEnvelope(_))
        ));
    }

    #[test]
    fn tampered_block_fails_decryption() {
        let (public, private) = pair();
        let mut envelope = encrypt(b"some metrics", Some(&public)).unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;

        assert!(matches!(
            decrypt(&envelope, Some(private)),
            Err(EnvelopeError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn wrong_key_fails_decryption() {
        let (public, _) = pair();
        let other = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let envelope = encrypt(b"some metrics", Some(&public)).unwrap();

        assert!(matches!(
            decrypt(&envelope, Some(&other)),
            Err(EnvelopeError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn blocks_are_not_reordered() {
        let (public, private) = pair();
        let chunk = max_chunk_len(&public);
        let plaintext: Vec<u8> = [vec![1; chunk], vec![2; chunk]].concat();
        let envelope = encrypt(&plaintext, Some(&public)).unwrap();

        let (first, second) = envelope.split_at(LEN_PREFIX + 128);
        let swapped = [second, first].concat();
        let decrypted = decrypt(&swapped, Some(private)).unwrap();

        assert_eq!(&decrypted[..chunk], &plaintext[chunk..]);
        assert_eq!(&decrypted[chunk..], &plaintext[..chunk]);
    }

    #[test]
    fn parses_pem_encodings() {
        let (public, private) = pair();

        let spki = public.to_public_key_pem(LineEnding::LF).unwrap();
        assert_eq!(parse_public_key(&spki).unwrap(), public);

        let pkcs8 = private.to_pkcs8_pem(LineEnding::LF).unwrap();
        assert_eq!(&parse_private_key(&pkcs8).unwrap(), private);

        assert!(parse_public_key("not a key").is_err());
    }

    #[test]
    fn missing_key_file() {
        let err = load_public_key("/nonexistent/metrix/public.pem").unwrap_err();
        assert!(matches!(err, KeyError::Io { .. }));
    }
}
