//! prompt-gateway binary
//!
//! Loads the gateway document, wires providers, health probing, hot reload
//! and sessions, then either dispatches a single prompt or serves HTTP.
//!
//! ## Usage
//!
//! ```text
//! prompt-gateway [--config PATH] [--prompt TEXT]
//! ```
//!
//! ## Environment Variables
//!
//! - `GATEWAY_CONFIG` — document path when `--config` is absent
//! - `ENV` — selects `.env.{ENV}` and the deployment environment
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter (default: info)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use prompt_gateway::config::env_health::{
    collect_env_report_with, ensure_env, log_env_report, required_credentials,
};
use prompt_gateway::config::loader::{load_from_file_with_env, process_env};
use prompt_gateway::config::watcher::ConfigWatcher;
use prompt_gateway::config::GatewayConfig;
use prompt_gateway::dispatch::DispatchOptions;
use prompt_gateway::health::{probe_all, spawn_prober, HealthRegistry};
use prompt_gateway::provider::{Credentials, DuckDuckGoSearch, ProviderRegistry};
use prompt_gateway::store::{build_store, SessionStore};
use prompt_gateway::web_api::{start_server, AppState};
use prompt_gateway::{
    init_tracing, metrics, DispatchFacade, GatewayError, Prompt, RuleTable, RuleTableHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

const DEFAULT_CONFIG: &str = "gateway.toml";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    prompt: Option<String>,
}

impl Args {
    /// Long-running HTTP mode; one-shot mode needs no hot reload.
    fn serves(&self) -> bool {
        self.prompt.is_none()
    }
}

fn parse_args<I>(argv: I) -> Result<Args, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = Args::default();
    let mut iter = argv.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                args.config = Some(iter.next().ok_or("--config needs a path")?.into());
            }
            "--prompt" | "-p" => {
                args.prompt = Some(iter.next().ok_or("--prompt needs text")?);
            }
            "--help" | "-h" => {
                return Err("usage: prompt-gateway [--config PATH] [--prompt TEXT]".into());
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    // `.env.{ENV}` must be loaded before anything reads the environment.
    let env_name = std::env::var("ENV").unwrap_or_else(|_| "development".to_string());
    let _ = dotenvy::from_filename(format!(".env.{env_name}"));

    // Initialize structured tracing (JSON or pretty, based on LOG_FORMAT env)
    let _ = init_tracing();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "prompt-gateway failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), GatewayError> {
    // Initialize Prometheus metrics registry before any dispatch runs.
    metrics::init_metrics()?;

    let path = args
        .config
        .clone()
        .or_else(|| std::env::var("GATEWAY_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = load_from_file_with_env(&path, process_env)?;
    info!(
        path = %path.display(),
        environment = config.environment.as_str(),
        rules = config.routing.rules.len(),
        "gateway config loaded"
    );

    let report = collect_env_report_with(process_env, &required_credentials(&config));
    log_env_report(&report, Level::INFO);
    if !report.is_ok() && !config.environment.is_production() {
        warn!(
            problems = ?report.problems(),
            "environment has problems; continuing outside production"
        );
    }
    ensure_env(&report, config.environment.is_production())?;

    let shutdown = CancellationToken::new();
    let facade = build_facade(&config, shutdown.clone()).await?;

    // The watcher stops when its handle drops.
    let _watcher = if args.serves() {
        start_watcher(path, &facade, shutdown.clone())
    } else {
        None
    };

    let result = match args.prompt {
        Some(text) => one_shot(&facade, text).await,
        None => serve(&config, facade, shutdown.clone()).await,
    };
    shutdown.cancel();
    result
}

fn start_watcher(
    path: PathBuf,
    facade: &DispatchFacade,
    shutdown: CancellationToken,
) -> Option<ConfigWatcher> {
    match ConfigWatcher::new(path, Arc::clone(facade.rules()), shutdown) {
        Ok((watcher, _rx)) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "config hot reload disabled");
            None
        }
    }
}

async fn build_facade(
    config: &GatewayConfig,
    shutdown: CancellationToken,
) -> Result<Arc<DispatchFacade>, GatewayError> {
    let rules = Arc::new(RuleTableHandle::new(RuleTable::load(&config.routing)?));

    let credentials = Credentials::from_lookup(process_env);
    let providers = Arc::new(ProviderRegistry::from_config(config, &credentials));
    info!(providers = ?providers.ids(), "providers registered");

    let health = Arc::new(HealthRegistry::new());
    probe_all(&health, &providers).await;
    spawn_prober(
        Arc::clone(&health),
        Arc::clone(&providers),
        Duration::from_secs(config.health.probe_interval_s),
        shutdown,
    );

    let search = DuckDuckGoSearch::new()
        .with_base_url(config.search.base_url.clone())
        .with_timeout(Duration::from_secs(config.search.timeout_s));

    let mut facade = DispatchFacade::new(rules, health, providers)
        .with_search(Arc::new(search))
        .with_options(DispatchOptions::from(&config.dispatch));

    if let Some(kv) = build_store(&config.store).await? {
        let ttl = config.store.session_ttl_s.map(Duration::from_secs);
        facade = facade.with_sessions(SessionStore::new(kv, ttl));
    }

    Ok(Arc::new(facade))
}

async fn one_shot(facade: &DispatchFacade, text: String) -> Result<(), GatewayError> {
    let result = facade.dispatch(&Prompt::new(text)).await?;
    let json = serde_json::to_string_pretty(&result)
        .map_err(|e| GatewayError::Other(format!("result encoding failed: {e}")))?;
    println!("{json}");
    Ok(())
}

async fn serve(
    config: &GatewayConfig,
    facade: Arc<DispatchFacade>,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let state = Arc::new(AppState::new(facade, config.server.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
        }
        signal.cancel();
    });

    start_server(state, shutdown).await
}
