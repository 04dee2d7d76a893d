use std::{sync::Arc, time::Duration};

use metrix_proto::Snapshot;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, warn};

use crate::{
    config::AgentConfig,
    transport::{Transport, TransportError},
};

/// Fans one snapshot out to `rate_limit` delivery tasks, each retrying on
/// its own.
pub struct Sender<T> {
    transport: Arc<T>,
    rate_limit: usize,
    retry_delays: Arc<[Duration]>,
    tracker: TaskTracker,
    span: Span,
}

impl<T: Transport> Sender<T> {
    pub fn new(config: &AgentConfig, transport: T, span: Span) -> Self {
        Sender {
            transport: Arc::new(transport),
            rate_limit: config.rate_limit,
            retry_delays: config.retry_delays.clone().into(),
            tracker: TaskTracker::new(),
            span,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of delivery tasks still running.
    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    pub fn dispatch(&self, snapshot: Arc<Snapshot>) {
        for worker in 0..self.rate_limit {
            let transport = self.transport.clone();
            let delays = self.retry_delays.clone();
            let snapshot = snapshot.clone();
            self.tracker.spawn(
                async move {
                    let _ = deliver(transport.as_ref(), &snapshot, &delays, worker).await;
                }
                .instrument(self.span.clone()),
            );
        }
    }

    /// Stops accepting deliveries and waits for the running ones.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// One attempt, then one more after each delay in `delays`.
async fn deliver<T: Transport>(
    transport: &T,
    snapshot: &Snapshot,
    delays: &[Duration],
    worker: usize,
) -> Result<(), TransportError> {
    let mut delays = delays.iter();
    let mut attempt = 0usize;
    loop {
        let err = match transport.send_metrics(snapshot).await {
            Ok(()) => {
                debug!(worker, attempt, seq = snapshot.seq, "snapshot delivered");
                return Ok(());
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            error!(worker, attempt, seq = snapshot.seq, "delivery failed permanently: {err}");
            return Err(err);
        }

        match delays.next() {
            Some(delay) => {
                warn!(worker, attempt, ?delay, "delivery failed, retrying: {err}");
                tokio::time::sleep(*delay).await;
            }
            None => {
                error!(
                    worker,
                    attempts = attempt + 1,
                    seq = snapshot.seq,
                    "giving up on snapshot: {err}"
                );
                return Err(err);
            }
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use metrix_proto::{Metric, envelope::EnvelopeError, msg::RpcCode};
    use tokio::time::Instant;

    use super::*;

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
        error: fn() -> TransportError,
    }

    impl Flaky {
        fn new(failures: usize, error: fn() -> TransportError) -> Self {
            Flaky {
                calls: AtomicUsize::new(0),
                failures,
                error,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for Flaky {
        async fn send_metrics(&self, _snapshot: &Snapshot) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok(())
            }
        }
    }

    fn network_error() -> TransportError {
        TransportError::Network(anyhow::anyhow!("connection refused"))
    }

    fn config(rate_limit: usize, delays: &[u64]) -> AgentConfig {
        AgentConfig {
            rate_limit,
            retry_delays: delays.iter().copied().map(Duration::from_secs).collect(),
            ..Default::default()
        }
    }

    fn snapshot() -> Arc<Snapshot> {
        Arc::new(Snapshot::new(1, vec![Metric::gauge("Alloc", 1.0)]))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded_by_delay_sequence() {
        let sender = Sender::new(
            &config(1, &[1, 3, 5]),
            Flaky::new(usize::MAX, network_error),
            Span::none(),
        );
        let start = Instant::now();

        sender.dispatch(snapshot());
        sender.shutdown().await;

        assert_eq!(sender.transport().calls(), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn every_worker_retries_independently() {
        let sender = Sender::new(
            &config(3, &[1, 3]),
            Flaky::new(usize::MAX, network_error),
            Span::none(),
        );

        sender.dispatch(snapshot());
        assert_eq!(sender.outstanding(), 3);
        sender.shutdown().await;

        assert_eq!(sender.transport().calls(), 9);
        assert_eq!(sender.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_after_success() {
        let sender = Sender::new(
            &config(1, &[1, 3, 5]),
            Flaky::new(2, network_error),
            Span::none(),
        );

        sender.dispatch(snapshot());
        sender.shutdown().await;

        assert_eq!(sender.transport().calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let errors: [fn() -> TransportError; 2] = [
            || TransportError::Seal(EnvelopeError::CorruptEnvelope("truncated".into())),
            || TransportError::Rejected {
                code: RpcCode::InvalidArgument,
                message: "integrity tag mismatch".into(),
            },
        ];

        for error in errors {
            let sender = Sender::new(
                &config(1, &[1, 3, 5]),
                Flaky::new(usize::MAX, error),
                Span::none(),
            );
            sender.dispatch(snapshot());
            sender.shutdown().await;

            assert_eq!(sender.transport().calls(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_delays_means_single_attempt() {
        let sender = Sender::new(
            &config(1, &[]),
            Flaky::new(usize::MAX, network_error),
            Span::none(),
        );

        sender.dispatch(snapshot());
        sender.shutdown().await;

        assert_eq!(sender.transport().calls(), 1);
    }
}
