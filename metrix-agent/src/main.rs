#![forbid(unsafe_code)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use argh::FromArgs;
use tokio_util::sync::CancellationToken;
use tracing::info_span;
use tracing_subscriber::EnvFilter;

use metrix_agent::{
    config::{AgentConfig, RetryDelays, TransportKind},
    sampler::HostSampler,
    scheduler::Scheduler,
    sender::Sender,
    transport::{AnyTransport, HttpTransport, RpcTransport},
};

#[derive(FromArgs, Debug)]
#[argh(description = "A push-based host metrics agent.")]
struct Args {
    #[argh(
        option,
        short = 'a',
        default = "\"127.0.0.1:8080\".to_string()",
        description = "collector address to report to"
    )]
    pub server_addr: String,
    #[argh(
        option,
        default = "TransportKind::Http",
        description = "delivery transport, http or rpc"
    )]
    pub transport: TransportKind,
    #[argh(
        switch,
        short = 't',
        description = "use TLS to connect to the collector (https/wss instead of http/ws)"
    )]
    pub tls: bool,
    #[argh(
        switch,
        short = '6',
        description = "prefer IPv6 when resolving the collector address"
    )]
    pub prefer_ipv6: bool,
    #[argh(
        option,
        short = 'p',
        default = "2",
        description = "seconds between two samples"
    )]
    pub poll_interval: u64,
    #[argh(
        option,
        short = 'r',
        default = "10",
        description = "seconds between two reports"
    )]
    pub report_interval: u64,
    #[argh(
        option,
        short = 'l',
        default = "1",
        description = "concurrent deliveries per report"
    )]
    pub rate_limit: usize,
    #[argh(
        option,
        default = "RetryDelays::default()",
        description = "comma separated retry delays in seconds"
    )]
    pub retry_delays: RetryDelays,
    #[argh(
        option,
        short = 'k',
        default = "String::new()",
        description = "shared secret for the integrity tag, empty disables signing"
    )]
    pub key: String,
    #[argh(option, description = "PEM public key of the collector, enables encryption")]
    pub crypto_key: Option<PathBuf>,
    #[argh(option, short = 'i', description = "network interface for traffic gauges")]
    pub interface: Option<String>,
}

impl Args {
    fn into_config(self) -> AgentConfig {
        AgentConfig {
            server_addr: self.server_addr,
            transport: self.transport,
            tls: self.tls,
            prefer_ipv6: self.prefer_ipv6,
            sample_interval: Duration::from_secs(self.poll_interval),
            report_interval: Duration::from_secs(self.report_interval),
            rate_limit: self.rate_limit,
            retry_delays: self.retry_delays.0,
            secret: self.key,
            public_key_path: self.crypto_key,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "metrix_agent=info".into()),
        )
        .init();

    let args: Args = argh::from_env();
    let interface = args.interface.clone();
    let config = args.into_config().validate()?;
    tracing::debug!("agent config: {config:#?}");

    let sealer = config.sealer()?;
    let transport = match config.transport {
        TransportKind::Http => AnyTransport::Http(HttpTransport::new(&config, sealer)?),
        TransportKind::Rpc => AnyTransport::Rpc(RpcTransport::new(&config, sealer)?),
    };
    let sampler = HostSampler::try_new(interface.as_deref())?;

    let sender = Arc::new(Sender::new(&config, transport, info_span!("sender")));
    let scheduler = Scheduler::new(&config, sampler, sender.clone(), info_span!("scheduler"));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {e}");
                return;
            }
            tracing::info!("interrupt received, stopping");
            cancel.cancel();
        }
    });

    tracing::info!(
        server = %config.server_addr,
        transport = ?config.transport,
        "agent started"
    );
    scheduler.run(cancel).await;

    tracing::info!(outstanding = sender.outstanding(), "waiting for deliveries");
    sender.shutdown().await;
    Ok(())
}
