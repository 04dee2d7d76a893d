//! HMAC-SHA-256 integrity tags over the plaintext payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Shared secret known to both agent and collector.
#[derive(Clone)]
pub struct IntegrityKey(Vec<u8>);

impl std::fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IntegrityKey(<{} bytes>)", self.0.len())
    }
}

impl IntegrityKey {
    /// `None` for an empty secret, integrity checking is then disabled.
    pub fn from_secret(secret: &str) -> Option<Self> {
        if secret.is_empty() {
            None
        } else {
            Some(IntegrityKey(secret.as_bytes().to_vec()))
        }
    }

    fn mac(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC can take key of any size");
        mac.update(payload);
        mac
    }

    /// Lowercase hex digest of `payload`.
    pub fn sign(&self, payload: &[u8]) -> String {
        hex::encode(self.mac(payload).finalize().into_bytes())
    }

    /// Exact, case-sensitive match against a freshly computed tag.
    ///
    /// The digest itself is compared in constant time; only the tag's shape
    /// (length, lowercase hex) is checked up front.
    pub fn verify(&self, payload: &[u8], tag: &str) -> bool {
        let lowercase_hex = tag.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !lowercase_hex {
            return false;
        }
        let Ok(digest) = hex::decode(tag) else {
            return false;
        };
        self.mac(payload).verify_slice(&digest).is_ok()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("integrity tag missing")]
    MissingTag,
    #[error("integrity tag mismatch")]
    Mismatch,
}

/// Passes when no key is configured, otherwise demands a matching tag.
pub fn check(
    key: Option<&IntegrityKey>,
    payload: &[u8],
    tag: Option<&str>,
) -> Result<(), IntegrityError> {
    let Some(key) = key else {
        return Ok(());
    };
    let tag = tag.ok_or(IntegrityError::MissingTag)?;
    if key.verify(payload, tag) {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(secret: &str) -> IntegrityKey {
        IntegrityKey::from_secret(secret).unwrap()
    }

    #[test]
    fn known_digest() {
        // RFC 4231 test case 2
        let tag = key("Jefe").sign(b"what do ya want for nothing?");
        assert_eq!(
            tag,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn sign_then_verify() {
        let key = key("k");
        let payload = b"CPUutilization0=12.5";

        assert!(key.verify(payload, &key.sign(payload)));
        assert!(key.verify(b"", &key.sign(b"")));
    }

    #[test]
    fn payload_mutation_is_detected() {
        let key = key("k");
        let payload = b"CPUutilization0=12.5".to_vec();
        let tag = key.sign(&payload);

        for i in 0..payload.len() {
            let mut mutated = payload.clone();
            mutated[i] ^= 0x01;
            assert!(!key.verify(&mutated, &tag), "mutation at {i} accepted");
        }
    }

    #[test]
    fn key_mutation_is_detected() {
        let payload = b"CPUutilization0=12.5";
        let tag = key("secret").sign(payload);

        for other in ["secreu", "Secret", "secret ", "secre"] {
            assert!(!key(other).verify(payload, &tag), "key {other:?} accepted");
        }
    }

    #[test]
    fn comparison_is_case_sensitive() {
        let key = key("k");
        let tag = key.sign(b"payload").to_uppercase();

        assert!(!key.verify(b"payload", &tag));
    }

    #[test]
    fn malformed_tags_are_rejected() {
        let key = key("k");
        let tag = key.sign(b"payload");

        for bad in [
            &tag[..62],
            &tag[..63],
            &format!("{tag}00")[..],
            &format!("{}g", &tag[..63])[..],
            "",
        ] {
            assert!(!key.verify(b"payload", bad), "tag {bad:?} accepted");
        }
        assert!(key.verify(b"payload", &tag));
    }

    #[test]
    fn empty_secret_disables_checking() {
        assert!(IntegrityKey::from_secret("").is_none());
        assert_eq!(check(None, b"payload", None), Ok(()));
        assert_eq!(check(None, b"payload", Some("garbage")), Ok(()));
    }

    #[test]
    fn configured_key_fails_closed() {
        let key = key("k");

        assert_eq!(
            check(Some(&key), b"payload", None),
            Err(IntegrityError::MissingTag)
        );
        assert_eq!(
            check(Some(&key), b"payload", Some("00")),
            Err(IntegrityError::Mismatch)
        );
        assert_eq!(
            check(Some(&key), b"payload", Some(&key.sign(b"payload"))),
            Ok(())
        );
    }
}
