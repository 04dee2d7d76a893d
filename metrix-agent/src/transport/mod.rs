//! Delivery of sealed snapshots to the collector.
//!
//! Both transports seal the serialized snapshot with the [`Sealer`] they were
//! built with and carry the integrity tag and the agent's own address
//! out-of-band: as HTTP headers for [`HttpTransport`], as RPC metadata for
//! [`RpcTransport`].
//!
//! [`Sealer`]: metrix_proto::seal::Sealer

use std::future::Future;

use metrix_proto::{Snapshot, envelope::EnvelopeError, msg::RpcCode};

mod net;
mod post;
mod rpc;

pub use post::HttpTransport;
pub use rpc::RpcTransport;

pub trait Transport: Send + Sync + 'static {
    fn send_metrics(
        &self,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] postcard::Error),
    #[error("failed to seal snapshot: {0}")]
    Seal(#[from] EnvelopeError),
    #[error("{0:#}")]
    Network(#[from] anyhow::Error),
    #[error("collector rejected delivery ({code}): {message}")]
    Rejected { code: RpcCode, message: String },
}

impl TransportError {
    /// Whether sending the same snapshot again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Encode(_) | TransportError::Seal(_) => false,
            TransportError::Network(_) => true,
            TransportError::Rejected { code, .. } => *code == RpcCode::Internal,
        }
    }
}

/// Transport selected at startup.
pub enum AnyTransport {
    Http(HttpTransport),
    Rpc(RpcTransport),
}

impl Transport for AnyTransport {
    async fn send_metrics(&self, snapshot: &Snapshot) -> Result<(), TransportError> {
        match self {
            AnyTransport::Http(t) => t.send_metrics(snapshot).await,
            AnyTransport::Rpc(t) => t.send_metrics(snapshot).await,
        }
    }
}
