use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    Router,
    http::StatusCode,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use confique::Config;
use metrix_proto::{
    envelope,
    integrity::IntegrityKey,
    msg::{RPC_PATH, UPDATES_PATH},
};
use tokio::{net::TcpListener, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    chain::{TrustPolicy, ValidationChain},
    ingest::Ingest,
    storage::{MemStorage, Storager},
};

mod chain;
mod ingest;
mod keygen;
mod route;
mod storage;


#[derive(Debug, Parser)]
#[command(name = "metrix-server")]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Path to config file")]
    config_path: Option<String>,
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the collector
    Serve,

    /// Generate an RSA key pair for the envelope
    Keygen(keygen::KeygenArgs),
}

#[derive(Config, Debug)]
struct Conf {
    /// Port to listen on
    #[config(env = "METRIX_PORT", default = 8080)]
    port: u16,

    /// Bind address
    #[config(env = "METRIX_ADDRESS", default = "127.0.0.1")]
    address: IpAddr,

    /// Shared HMAC secret, empty disables integrity checks
    #[config(env = "METRIX_KEY", default = "")]
    key: String,

    /// PEM private key used to open envelopes
    #[config(env = "METRIX_CRYPTO_KEY")]
    crypto_key: Option<PathBuf>,

    /// CIDR block agents must report from, unset trusts everyone
    #[config(env = "METRIX_TRUSTED_SUBNET")]
    trusted_subnet: Option<String>,
}

fn config(path: &str) -> anyhow::Result<Conf> {
    Conf::builder()
        .env()
        .file(path)
        .load()
        .map_err(|e| e.into())
}

impl Conf {
    fn validation_chain(&self) -> anyhow::Result<ValidationChain> {
        let trust = TrustPolicy::parse(self.trusted_subnet.as_deref().unwrap_or_default())
            .context("invalid trusted_subnet")?;
        let private_key = self
            .crypto_key
            .as_ref()
            .map(envelope::load_private_key)
            .transpose()?;
        let integrity = IntegrityKey::from_secret(&self.key);

        info!(
            trusted_subnet = trust.is_enabled(),
            encryption = private_key.is_some(),
            integrity = integrity.is_some(),
            "validation chain configured"
        );
        Ok(ValidationChain::new(trust, private_key, integrity))
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub ingest: Arc<Ingest>,
    pub storage: Arc<dyn Storager>,
    pub ws_graceful_shutdown: WebsocketGraceful,
}

impl AppState {
    fn new(chain: ValidationChain, storage: Arc<dyn Storager>) -> Self {
        AppState {
            ingest: Arc::new(Ingest::new(chain, storage.clone())),
            storage,
            ws_graceful_shutdown: WebsocketGraceful {
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct WebsocketGraceful {
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(route::health))
        .route(UPDATES_PATH, post(route::updates))
        .route("/value/{kind}/{id}", get(route::get_value))
        .nest(
            "/api/v1",
            Router::new().route("/metrics", get(route::list_metrics)),
        )
        .route(RPC_PATH, get(route::metric_rpc_ws))
        .layer((
            TraceLayer::new_for_http(),
            // Prevent requests to hang forever
            TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(60)),
        ))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    trace!("using command line arguments {:?}", cli);

    match cli.commands {
        Commands::Serve => {
            let config = config(&cli.config_path.unwrap_or("config.toml".to_owned()))?;
            trace!("using config {:?}", config);

            let state = AppState::new(config.validation_chain()?, Arc::new(MemStorage::new()));

            let addr = SocketAddr::from((config.address, config.port));
            info!("listening on {addr}");
            let listener = TcpListener::bind(addr).await?;

            axum::serve(
                listener,
                app(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal(state.ws_graceful_shutdown.token.clone()))
            .await?;

            let ws_tracker = state.ws_graceful_shutdown.tracker.clone();
            ws_tracker.close();

            trace!("waiting {} rpc socket shutdown", ws_tracker.len());
            ws_tracker.wait().await;
        }
        Commands::Keygen(args) => keygen::keygen(args)?,
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                #[cfg(debug_assertions)]
                let default_log_level = format!(
                    "{}=debug,tower_http=debug,axum=trace",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                #[cfg(not(debug_assertions))]
                let default_log_level = format!(
                    "{}=info,tower_http=info,axum=info",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                default_log_level
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

async fn shutdown_signal(ws_token: CancellationToken) {
    let _ws_shutdown_guard = ws_token.drop_guard();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
