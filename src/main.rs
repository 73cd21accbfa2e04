//! `dicevaultd` — the settlement service binary.
//!
//! Wires the process-wide singletons (store, key vault, explorer client,
//! event bus) and spawns the long-lived tasks: WebSocket reader,
//! ingester, bet materializer, payout worker pool, and the periodic
//! sweepers. Shutdown cancels everything and waits a bounded grace
//! period for the pool to drain; whatever is left is picked up by the
//! sweepers on next start.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dicevault::{
    bets::{BetMaterializer, PayoutQueue},
    config::Config,
    error::Error,
    events::EventBus,
    explorer::{Broadcaster, ChainReader, ExplorerClient, MonitoredAddresses, WsClient},
    ingest::Ingester,
    keyvault::KeyVault,
    seeds::SeedRegistry,
    store::Store,
    wallets::WalletVault,
};

/// Channel capacities between pipeline stages.
const FRAME_BUFFER: usize = 256;
const DEPOSIT_BUFFER: usize = 256;
const PAYOUT_BUFFER: usize = 256;
const TRACK_BUFFER: usize = 64;

/// Recently-seen txid window in the ingester.
const SEEN_TXID_CAPACITY: usize = 4096;

/// How long shutdown waits for in-flight work.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Quiet time on the live feed before the REST polling fallback kicks in.
const FALLBACK_POLL_AFTER: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> dicevault::Result<()> {
    let config = Config::from_env()?;
    info!(
        profile = ?config.profile,
        network = %config.network,
        db = %config.db_path.display(),
        "starting dicevaultd"
    );

    let store = Arc::new(Store::open(&config.db_path)?);
    let keyvault = Arc::new(KeyVault::from_base64_key(&config.master_encryption_key)?);
    let explorer = ExplorerClient::new(&config).map_err(Error::from)?;
    // Refuses to run a production signer against the wrong chain.
    explorer.assert_network().await?;

    let bus = Arc::new(EventBus::new());
    let wallets = Arc::new(WalletVault::new(store.clone(), keyvault.clone(), &config));
    let seeds = Arc::new(SeedRegistry::new(store.clone()));

    // Commit today's seed before the first deposit needs it.
    let seed = seeds.get_or_create_today()?.into_inner();
    info!(date = %seed.seed_date, hash = %seed.server_seed_hash, "daily seed ready");

    let monitored: MonitoredAddresses = Arc::new(RwLock::new(HashSet::new()));
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
    let (track_tx, track_rx) = mpsc::channel(TRACK_BUFFER);
    let (deposit_tx, deposit_rx) = mpsc::channel(DEPOSIT_BUFFER);
    let (payout_tx, payout_rx) = mpsc::channel(PAYOUT_BUFFER);

    let ingester = Ingester::new(
        explorer.clone(),
        monitored.clone(),
        deposit_tx,
        track_tx,
        SEEN_TXID_CAPACITY,
    );
    let active = wallets.list_active()?;
    if active.is_empty() {
        warn!("no active vault wallets; create one via the admin surface");
    }
    for wallet in &active {
        ingester.monitor_address(&wallet.address);
    }

    let materializer = Arc::new(BetMaterializer::new(
        store.clone(),
        wallets.clone(),
        seeds.clone(),
        bus.clone(),
        explorer.clone(),
        payout_tx,
        &config,
    ));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // WebSocket reader: the only producer of raw frames.
    let ws = WsClient::new(&config);
    tasks.push(tokio::spawn({
        let monitored = monitored.clone();
        let cancel = cancel.clone();
        async move { ws.run(monitored, track_rx, frame_tx, cancel).await }
    }));

    // Ingester: frames in, deposit events out, REST polling as fallback
    // when the feed goes quiet.
    tasks.push(tokio::spawn(ingester.run(
        frame_rx,
        FALLBACK_POLL_AFTER,
        cancel.clone(),
    )));

    // Materializer: the single consumer of deposit events.
    tasks.push(tokio::spawn(
        materializer.clone().run(deposit_rx, cancel.clone()),
    ));

    // Payout worker pool over a shared queue.
    let queue: PayoutQueue = Arc::new(Mutex::new(payout_rx));
    for _ in 0..config.payout_workers {
        tasks.push(tokio::spawn(
            materializer
                .clone()
                .run_payout_worker(queue.clone(), cancel.clone()),
        ));
    }

    // Periodic sweepers: pending bets, payout retries, confirmations.
    tasks.push(tokio::spawn(sweep_loop(
        materializer.clone(),
        config.sweep_interval,
        cancel.clone(),
    )));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;
    info!("shutdown signal received");
    cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE, futures_util::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!("shutdown grace period elapsed with tasks still running");
    }
    store.flush()?;
    info!("shutdown complete");
    Ok(())
}

async fn sweep_loop<C>(
    materializer: Arc<BetMaterializer<C>>,
    interval: Duration,
    cancel: CancellationToken,
) where
    C: ChainReader + Broadcaster + Clone + Send + Sync,
{
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        match materializer.sweep_pending().await {
            Ok(settled) if settled > 0 => info!(settled, "pending sweep settled bets"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "pending sweep failed"),
        }
        match materializer.payout_engine().retry_failed().await {
            Ok(recovered) if recovered > 0 => info!(recovered, "payout retries recovered"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "payout retry sweep failed"),
        }
        match materializer.payout_engine().check_confirmations().await {
            Ok(confirmed) if confirmed > 0 => info!(confirmed, "payouts confirmed"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "confirmation sweep failed"),
        }
    }
}
