use std::sync::Arc;

use tracing::{error, info};

use peeklock::broker::{BrokerOptions, InMemoryBroker};
use peeklock::client::{BusClient, ClientOptions};
use peeklock::config::load_config;
use peeklock::persistence::DeferredLedger;
use peeklock::transport::{AppState, start_websocket_server};
use peeklock::utils::{Result, logging};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("peeklock stopped: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = load_config()?;
    logging::init(&config.log.level);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Arc::new(InMemoryBroker::new(BrokerOptions::from(&config)));
    let client = BusClient::new(broker, ClientOptions::from(&config.bus));
    let ledger = DeferredLedger::open(&config.persistence.path)?;
    // The embedded broker starts empty, so numbers from an earlier run point nowhere.
    let stale = ledger.clear()?;
    if stale > 0 {
        info!("Dropped {} deferred sequence number(s) from a previous run", stale);
    }

    info!(
        "Serving queue {} (lock {}s, auto-renew ceiling {}s)",
        config.bus.queue, config.bus.lock_duration_secs, config.bus.max_auto_lock_renewal_secs
    );
    let state = Arc::new(AppState::new(client, config.bus.clone(), ledger.clone()).await?);

    let served = tokio::select! {
        result = start_websocket_server(&addr, state.clone()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    state.client.close().await?;
    ledger.flush()?;
    served
}
