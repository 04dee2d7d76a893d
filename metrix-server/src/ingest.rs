use std::sync::Arc;

use metrix_proto::Snapshot;
use tracing::{debug, warn};

use crate::{
    chain::{Delivery, Rejection, ValidationChain},
    storage::Storager,
};

/// Validation chain plus the business logic that lands metrics in storage.
pub struct Ingest {
    chain: ValidationChain,
    storage: Arc<dyn Storager>,
}

impl Ingest {
    pub fn new(chain: ValidationChain, storage: Arc<dyn Storager>) -> Self {
        Ingest { chain, storage }
    }

    /// Returns the number of metrics written.
    pub fn handle(&self, delivery: &Delivery<'_>) -> Result<usize, Rejection> {
        let plaintext = self.chain.admit(delivery)?;

        let snapshot = Snapshot::from_bytes(&plaintext).map_err(|e| {
            warn!("undecodable snapshot: {e}");
            Rejection::invalid_argument(format!("failed to decode snapshot: {e}"))
        })?;

        // reject the whole payload rather than storing part of it
        if let Some(metric) = snapshot.find_unnamed() {
            warn!(?metric, "snapshot contains a metric without id");
            return Err(Rejection::invalid_argument("metric id must not be empty"));
        }

        self.storage.apply(&snapshot.metrics).map_err(|e| {
            warn!(seq = snapshot.seq, "snapshot not stored: {e}");
            Rejection::internal(e.to_string())
        })?;

        debug!(seq = snapshot.seq, count = snapshot.metrics.len(), "snapshot stored");
        Ok(snapshot.metrics.len())
    }
}
