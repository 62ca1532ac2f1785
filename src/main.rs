mod collectors;
mod command;
mod config;
mod cycle;
mod http;
mod metrics;
mod state;
mod store;

use axum::serve;
use clap::Parser;
use collectors::salt::SaltApi;
use config::Config;
use cycle::Scheduler;
use metrics::Metrics;
use state::{now_unix, State};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::PgDeviceStore;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(version)]
struct Cli {
    /// YAML config; without it only ./config.yaml (if present) and the
    /// environment are used.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    info!(
        interval_secs = cfg.interval_secs,
        target = %cfg.salt.target,
        wired = cfg.interfaces.wired.len(),
        wireless = cfg.interfaces.wireless.len(),
        transactional = cfg.database.transactional,
        "запуск fleetd"
    );

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = cfg.listen.clone().map(|listen| {
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };
            info!(listen = %addr, "HTTP-сервер статуса запущен");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    });

    let collector_task = {
        let command = command::build_command(&cfg.interfaces);
        let salt = SaltApi::new(cfg.salt.clone(), cfg.interfaces.clone(), command);
        debug!(command = %salt.command(), "команда для миньонов");
        let store = PgDeviceStore::connect_lazy(&cfg.database);
        let scheduler = Scheduler::new(
            salt,
            store,
            Duration::from_secs(cfg.interval_secs),
            cfg.database.transactional,
            shared_state.clone(),
            metrics.clone(),
        );
        tokio::spawn(async move { scheduler.run(shutdown_rx).await })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = collector_task.await;
    if let Some(task) = http_task {
        let _ = task.await;
    }
}

fn load_config(cli: &Cli) -> Result<Config, config::ConfigError> {
    let (path, required) = match &cli.config {
        Some(path) => (path.as_str(), true),
        None => (DEFAULT_CONFIG_PATH, false),
    };
    let mut cfg = Config::load(path, required)?;
    cfg.apply_env(|name| std::env::var(name).ok())?;
    cfg.validate()?;
    Ok(cfg)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
