// src/main.rs
use clap::Parser;
use log::info;
use retube::api::{self, AppState, CookieHintState, LoginGate};
use retube::config::{AppPaths, ConfigService, ProductionConfigService};
use retube::core::engine::{PipelineEngine, PipelineEngineHandle};
use retube::core::housekeeping::Housekeeper;
use retube::services::monitor::DiscoveryScheduler;
use retube::store::{self, MonitorStore, TaskStore};
use std::sync::Arc;

/// Video republishing pipeline service.
#[derive(Parser, Debug)]
#[command(name = "retube", version, about)]
struct Args {
    /// Application root directory (databases, downloads, logs, config).
    #[arg(long, default_value = ".")]
    root: String,

    /// HTTP bind address for the submission API.
    #[arg(long, default_value = "127.0.0.1:5000")]
    bind: String,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("retube failed to start: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> retube::Result<()> {
    let paths = AppPaths::new(args.root.as_str());
    let config_service: Arc<dyn ConfigService> =
        Arc::new(ProductionConfigService::new(&paths)?);
    let config = config_service.get_config()?;

    let task_pool = store::open_pool(&paths.tasks_db()).await?;
    let task_store = TaskStore::open(task_pool, paths.clone()).await?;
    let monitor_pool = store::open_pool(&paths.monitor_db()).await?;
    let monitor_store = MonitorStore::open(monitor_pool).await?;

    let cookie_hints = Arc::new(CookieHintState::default());
    let engine = PipelineEngine::new(
        task_store.clone(),
        Arc::clone(&config_service),
        paths.clone(),
        Arc::clone(&cookie_hints),
    );
    engine.spawn_scanner();

    let housekeeper = Arc::new(Housekeeper::new(
        paths.clone(),
        task_store.clone(),
        Arc::clone(&config_service),
    ));
    Arc::clone(&housekeeper).spawn();

    let submitter = Arc::new(PipelineEngineHandle {
        engine: Arc::clone(&engine),
    });
    let discovery = Arc::new(DiscoveryScheduler::new(
        monitor_store.clone(),
        submitter,
        config.monitor.clone(),
    ));
    Arc::clone(&discovery).spawn();

    let login_gate = Arc::new(LoginGate::load(
        paths.security_state(),
        config.security.max_failed_attempts,
        config.security.lockout_minutes,
    ));

    let state = AppState {
        engine,
        housekeeper,
        config_service,
        paths,
        cookie_hints,
        login_gate,
        monitor_store,
        discovery,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .map_err(retube::error::RetubeError::Io)?;
    info!("retube {} listening on {}", retube::VERSION, args.bind);
    axum::serve(listener, app)
        .await
        .map_err(retube::error::RetubeError::Io)?;
    Ok(())
}
