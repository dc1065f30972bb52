use std::sync::Arc;
use tokio::sync::Notify;

use swabbot::apis::{ChainApi, HttpChainApi, HttpMarketDataApi};
use swabbot::arguments::get_arg_value;
use swabbot::logger::{self, log, LogTag};
use swabbot::oracle::PriceOracle;
use swabbot::webserver::AppState;
use swabbot::{budget, configs, db, gate, poller, positions, settings, webserver};

#[tokio::main]
async fn main() {
    logger::init();
    log(LogTag::System, "STARTUP", "SwabBot starting");

    if let Err(e) = run().await {
        log(LogTag::System, "ERROR", &format!("Fatal: {}", e));
        logger::flush();
        std::process::exit(1);
    }

    logger::flush();
}

async fn run() -> Result<(), String> {
    // Configuration
    let config_path = get_arg_value("--config").unwrap_or_else(|| "configs.json".to_string());
    let loaded = configs::read_configs(&config_path)?;
    if loaded.api_key.is_empty() {
        return Err("api_key missing from configs.json (or SWAB_API_KEY)".to_string());
    }
    configs::set_configs(loaded.clone());

    // Storage and cached state
    db::init_database(&loaded.database_path)?;
    settings::init_settings()?;
    budget::init_budget()?;
    gate::initialize_gate()?;
    positions::initialize_positions_system().await?;

    // External clients behind their trait seams
    let market = Arc::new(HttpMarketDataApi::new(&loaded.market_base_url));
    let oracle = Arc::new(PriceOracle::new(market));
    let chain: Arc<dyn ChainApi> = Arc::new(HttpChainApi::new(
        &loaded.rpc_url,
        &loaded.chain_base_url,
        &loaded.api_key,
    ));

    let shutdown = Arc::new(Notify::new());

    // Background services
    let poller_handle = tokio::spawn(poller::start_poller_service(
        shutdown.clone(),
        oracle.clone(),
        chain.clone(),
    ));

    let state = Arc::new(AppState::new(oracle, chain));
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = webserver::start_server(state, shutdown).await {
                log(LogTag::Webserver, "ERROR", &e);
            }
        }
    });

    // Ctrl-C triggers a coordinated shutdown of all services
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for shutdown signal: {}", e))?;
    log(LogTag::System, "SHUTDOWN", "Shutdown signal received");
    shutdown.notify_waiters();

    let _ = poller_handle.await;
    let _ = server_handle.await;

    log(LogTag::System, "SHUTDOWN", "All services stopped");
    Ok(())
}
