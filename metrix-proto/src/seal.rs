use rsa::RsaPublicKey;

use crate::{
    envelope::{self, EnvelopeError},
    integrity::IntegrityKey,
};

/// Payload ready for the wire: `body` goes in the request, `tag` out-of-band.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub body: Vec<u8>,
    pub tag: Option<String>,
}

/// Agent-side envelope configuration.
#[derive(Debug, Clone, Default)]
pub struct Sealer {
    public_key: Option<RsaPublicKey>,
    integrity: Option<IntegrityKey>,
}

impl Sealer {
    pub fn new(public_key: Option<RsaPublicKey>, integrity: Option<IntegrityKey>) -> Self {
        Sealer {
            public_key,
            integrity,
        }
    }

    pub fn is_encrypting(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn is_signing(&self) -> bool {
        self.integrity.is_some()
    }

    /// Signs the plaintext, then encrypts it. The tag never covers ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, EnvelopeError> {
        let tag = self.integrity.as_ref().map(|key| key.sign(plaintext));
        let body = envelope::encrypt(plaintext, self.public_key.as_ref())?;
        Ok(Sealed { body, tag })
    }
}
