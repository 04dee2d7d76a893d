use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use metrix_proto::{Metric, Snapshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, trace};

use crate::{
    config::AgentConfig, handoff::HandoffSlot, sampler::Sample, sender::Sender,
    transport::Transport,
};

/// Sample counter and pending snapshot, shared by both loops.
///
/// The counter lock is held while the slot is touched so that a drained
/// snapshot's `seq` always equals the count being reset.
#[derive(Debug, Default)]
struct Cadence {
    samples: Mutex<u64>,
    slot: HandoffSlot<Arc<Snapshot>>,
}

impl Cadence {
    fn record(&self, metrics: Vec<Metric>) -> Option<Arc<Snapshot>> {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        *samples += 1;
        self.slot.publish(Arc::new(Snapshot::new(*samples, metrics)))
    }

    fn drain(&self) -> Option<Arc<Snapshot>> {
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.slot.take()?;
        *samples = 0;
        Some(snapshot)
    }
}

/// Runs the sample and report triggers as two independent tasks.
pub struct Scheduler<S, T> {
    sampler: S,
    sender: Arc<Sender<T>>,
    sample_interval: Duration,
    report_interval: Duration,
    span: Span,
}

impl<S: Sample, T: Transport> Scheduler<S, T> {
    pub fn new(config: &AgentConfig, sampler: S, sender: Arc<Sender<T>>, span: Span) -> Self {
        Scheduler {
            sampler,
            sender,
            sample_interval: config.sample_interval,
            report_interval: config.report_interval,
            span,
        }
    }

    /// Returns once `cancel` fired and both loops exited. Deliveries already
    /// dispatched keep running on the sender.
    pub async fn run(self, cancel: CancellationToken) {
        let Scheduler {
            mut sampler,
            sender,
            sample_interval,
            report_interval,
            span,
        } = self;
        let cadence = Arc::new(Cadence::default());

        let sample_loop = tokio::spawn({
            let cadence = cadence.clone();
            let cancel = cancel.clone();
            async move {
                let mut ticker = interval_at(Instant::now() + sample_interval, sample_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let metrics = sampler.sample();
                            trace!(count = metrics.len(), "sampled");
                            if let Some(stale) = cadence.record(metrics) {
                                debug!(seq = stale.seq, "unsent snapshot replaced");
                            }
                        }
                    }
                }
                debug!("sample loop stopped");
            }
            .instrument(span.clone())
        });

        let report_loop = tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + report_interval, report_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            match cadence.drain() {
                                Some(snapshot) => {
                                    debug!(seq = snapshot.seq, "dispatching snapshot");
                                    sender.dispatch(snapshot);
                                }
                                None => trace!("nothing sampled since last report"),
                            }
                        }
                    }
                }
                debug!("report loop stopped");
            }
            .instrument(span),
        );

        let _ = tokio::join!(sample_loop, report_loop);
    }
}
