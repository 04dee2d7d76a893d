use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod integrity;
pub mod msg;
pub mod seal;

/// Name of the counter the agent attaches to every snapshot.
pub const POLL_COUNT: &str = "PollCount";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Metric {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Metric {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}

/// Gauges carry an absolute reading, counters a delta since the last report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
        }
    }
}

impl FromStr for MetricKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(UnknownKind(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown metric kind: {0:?}")]
pub struct UnknownKind(pub String);

/// One atomic batch of sampled metrics.
///
/// `seq` is the number of samples taken since the previous report, the agent
/// mirrors it into the [`POLL_COUNT`] counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub seq: u64,
    pub metrics: Vec<Metric>,
}

impl Snapshot {
    pub fn new(seq: u64, mut metrics: Vec<Metric>) -> Self {
        metrics.push(Metric::counter(POLL_COUNT, seq as i64));
        Snapshot { seq, metrics }
    }

    pub fn to_bytes(&self) -> postcard::Result<Vec<u8>> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> postcard::Result<Self> {
        postcard::from_bytes(bytes)
    }

    /// First metric with an empty id, if any.
    pub fn find_unnamed(&self) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.id.is_empty())
    }
}
