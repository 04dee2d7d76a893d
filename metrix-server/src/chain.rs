//! Validation applied to every inbound delivery before it reaches storage.
//!
//! The stages always run in this order:
//!
//! 1. trusted origin, before any decode work is spent on the caller
//! 2. decryption with the collector's private key
//! 3. integrity verification over the decrypted plaintext
//!
//! Both entry points (HTTP `POST /updates` and the RPC socket) funnel into
//! [`ValidationChain::admit`].

use std::{fmt, net::IpAddr};

use ipnet::IpNet;
use metrix_proto::{
    envelope,
    integrity::{self, IntegrityKey},
};
use rsa::RsaPrivateKey;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    PermissionDenied,
    InvalidArgument,
    Internal,
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectKind::PermissionDenied => write!(f, "permission denied"),
            RejectKind::InvalidArgument => write!(f, "invalid argument"),
            RejectKind::Internal => write!(f, "internal error"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Rejection {
    pub kind: RejectKind,
    pub message: String,
}

impl Rejection {
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Rejection {
            kind: RejectKind::PermissionDenied,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Rejection {
            kind: RejectKind::InvalidArgument,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Rejection {
            kind: RejectKind::Internal,
            message: message.into(),
        }
    }
}

/// What a transport hands to the chain.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    /// Value of the `x-real-ip` field, if the caller sent one.
    pub forwarded: Option<&'a str>,
    /// Transport-level peer address.
    pub peer: Option<IpAddr>,
    /// Value of the `hashsha256` field.
    pub tag: Option<&'a str>,
    pub body: &'a [u8],
}

/// Allow-list of a single CIDR block. Without one every caller is trusted.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    subnet: Option<IpNet>,
}

impl TrustPolicy {
    pub fn parse(cidr: &str) -> Result<Self, ipnet::AddrParseError> {
        let cidr = cidr.trim();
        if cidr.is_empty() {
            return Ok(TrustPolicy::default());
        }
        Ok(TrustPolicy {
            subnet: Some(cidr.parse()?),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.subnet.is_some()
    }

    pub fn allows(&self, addr: IpAddr) -> bool {
        match &self.subnet {
            Some(subnet) => subnet.contains(&addr.to_canonical()),
            None => true,
        }
    }

    fn check(&self, forwarded: Option<&str>, peer: Option<IpAddr>) -> Result<(), Rejection> {
        if !self.is_enabled() {
            return Ok(());
        }

        let addr = match forwarded {
            Some(value) => value.trim().parse::<IpAddr>().map_err(|_| {
                Rejection::permission_denied(format!("unparsable caller address {value:?}"))
            })?,
            None => peer.ok_or_else(|| Rejection::permission_denied("caller address unknown"))?,
        };

        if self.allows(addr) {
            Ok(())
        } else {
            Err(Rejection::permission_denied(format!(
                "{addr} is outside the trusted subnet"
            )))
        }
    }
}

#[derive(Debug, Default)]
pub struct ValidationChain {
    trust: TrustPolicy,
    private_key: Option<RsaPrivateKey>,
    integrity: Option<IntegrityKey>,
}

impl ValidationChain {
    pub fn new(
        trust: TrustPolicy,
        private_key: Option<RsaPrivateKey>,
        integrity: Option<IntegrityKey>,
    ) -> Self {
        ValidationChain {
            trust,
            private_key,
            integrity,
        }
    }

    /// Runs every stage and returns the verified plaintext.
    pub fn admit(&self, delivery: &Delivery<'_>) -> Result<Vec<u8>, Rejection> {
        self.trust
            .check(delivery.forwarded, delivery.peer)
            .inspect_err(|e| warn!(peer = ?delivery.peer, "delivery rejected: {e}"))?;

        let plaintext = envelope::decrypt(delivery.body, self.private_key.as_ref())
            .map_err(|e| Rejection::invalid_argument(e.to_string()))
            .inspect_err(|e| warn!(peer = ?delivery.peer, "delivery rejected: {e}"))?;

        integrity::check(self.integrity.as_ref(), &plaintext, delivery.tag)
            .map_err(|e| Rejection::invalid_argument(e.to_string()))
            .inspect_err(|e| warn!(peer = ?delivery.peer, "delivery rejected: {e}"))?;

        Ok(plaintext)
    }
}
