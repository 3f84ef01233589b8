mod config;

use clap::Parser;
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use formation_engine::api::{self, ApiError};
use formation_engine::fixtures::{FixtureError, Fixtures};
use formation_engine::providers::{RecordingDestinations, StaticParticipants, StaticTenants};
use formation_engine::transport::HttpTransport;
use formation_engine::{Collaborators, FormationEngine, FormationError};
use metrics_exporter_statsd::StatsdBuilder;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(about = "Formation engine service")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, short, default_value = "formations.yaml")]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fixtures(#[from] FixtureError),
    #[error("could not apply fixtures: {0}")]
    Registration(#[from] FormationError),
    #[error("could not install metrics recorder: {0}")]
    Metrics(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let default_level = logging.level.as_deref().unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();
    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), ServiceError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some(&metrics.prefix))
        .map_err(|e| ServiceError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| ServiceError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(formation_engine::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "metrics exporter installed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    let _sentry = init_logging(&config.logging);
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    let participants = Arc::new(StaticParticipants::new());
    let tenants = Arc::new(StaticTenants::new());
    let engine = FormationEngine::new(
        config.engine.clone(),
        Collaborators {
            participants: participants.clone(),
            tenants: tenants.clone(),
            destinations: Arc::new(RecordingDestinations::new()),
            transport: Arc::new(HttpTransport::new(config.engine.notifications.timeout())),
        },
    );

    let ready = Arc::new(AtomicBool::new(false));
    if let Some(path) = &config.engine.fixtures {
        Fixtures::from_file(path)?.apply(&engine, &participants, &tenants)?;
    }
    ready.store(true, Ordering::Relaxed);
    tracing::info!(config = %cli.config.display(), "formation service starting");

    let admin_ready = ready.clone();
    let admin = AdminService::<_, ServiceError>::new(move || admin_ready.load(Ordering::Relaxed));
    let admin_task = run_http_service(
        &config.engine.admin_listener.host,
        config.engine.admin_listener.port,
        admin,
    );
    let api_task = async {
        api::serve(config.engine.listener.clone(), engine).await?;
        Ok::<(), ServiceError>(())
    };

    tokio::try_join!(api_task, admin_task)?;
    Ok(())
}
