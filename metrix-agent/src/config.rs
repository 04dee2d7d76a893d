use std::{path::PathBuf, str::FromStr, time::Duration};

use metrix_proto::{
    envelope::{self, KeyError},
    integrity::IntegrityKey,
    seal::Sealer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Rpc,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TransportKind::Http),
            "rpc" => Ok(TransportKind::Rpc),
            other => Err(format!("unknown transport {other:?}, expected http or rpc")),
        }
    }
}

/// Comma separated list of whole seconds, e.g. `1,3,5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDelays(pub Vec<Duration>);

impl Default for RetryDelays {
    fn default() -> Self {
        RetryDelays([1, 3, 5].map(Duration::from_secs).to_vec())
    }
}

impl FromStr for RetryDelays {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(RetryDelays(Vec::new()));
        }
        s.split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| format!("invalid retry delay {part:?}: {e}"))
            })
            .collect::<Result<_, _>>()
            .map(RetryDelays)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} interval must be a positive number of seconds")]
    ZeroInterval(&'static str),
    #[error("rate limit must be positive")]
    ZeroRateLimit,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Everything the agent needs, validated once at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_addr: String,
    pub transport: TransportKind,
    pub tls: bool,
    pub prefer_ipv6: bool,
    pub sample_interval: Duration,
    pub report_interval: Duration,
    pub rate_limit: usize,
    pub retry_delays: Vec<Duration>,
    pub secret: String,
    pub public_key_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            server_addr: "127.0.0.1:8080".to_owned(),
            transport: TransportKind::Http,
            tls: false,
            prefer_ipv6: false,
            sample_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            rate_limit: 1,
            retry_delays: RetryDelays::default().0,
            secret: String::new(),
            public_key_path: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.sample_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("sample"));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("report"));
        }
        if self.rate_limit == 0 {
            return Err(ConfigError::ZeroRateLimit);
        }
        Ok(self)
    }

    /// Loads the public key, if any, and builds the envelope configuration.
    pub fn sealer(&self) -> Result<Sealer, ConfigError> {
        let public_key = self
            .public_key_path
            .as_ref()
            .map(envelope::load_public_key)
            .transpose()?;
        Ok(Sealer::new(public_key, IntegrityKey::from_secret(&self.secret)))
    }
}
