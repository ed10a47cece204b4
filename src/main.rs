use anyhow::{Result, bail};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use object_transfer::{
    ListingCache, ListingConsumer, ListingService, LocalObjectStore, NewTransfer, ObjectPatch,
    ObjectStore, SqliteTransferStore, StorageObject, TransferEngine, TransferEvent,
    TransferRepository, TransferStatus,
    config::{AppConfig, CacheConfig, Command},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate, command) = AppConfig::from_env_and_args()?;
    tracing::debug!("Starting object-transfer with config: {:?}", cfg);

    // --- Open transfer database and bucket ---
    let repo = SqliteTransferStore::open(&cfg.database_url).await?;
    let store = LocalObjectStore::open(cfg.bucket_dir()).await?;

    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }
    let Some(command) = command else {
        bail!("no command given, see --help");
    };

    let store: Arc<dyn ObjectStore> = Arc::new(store);
    let repo: Arc<dyn TransferRepository> = Arc::new(repo);

    match command {
        Command::Upload { local, key } => {
            let engine = TransferEngine::start(store, repo, cfg.engine_config());
            let transfer = engine.submit(NewTransfer::upload(local, key)).await?;
            drain(&engine).await?;
            finish(&engine, &[transfer.id]).await
        }
        Command::Download { key, local } => {
            let engine = TransferEngine::start(store, repo, cfg.engine_config());
            let transfer = engine.submit(NewTransfer::download(key, local)).await?;
            drain(&engine).await?;
            finish(&engine, &[transfer.id]).await
        }
        Command::Resume => {
            let engine = TransferEngine::start(store, repo, cfg.engine_config());
            let report = engine.restore_pending().await?;
            drain(&engine).await?;
            let aborted = engine.finish_orphan_sweep().await;
            let pruned = engine.prune_finished().await?;
            tracing::info!(
                requeued = report.requeued.len(),
                paused = report.paused.len(),
                failed = report.failed.len(),
                aborted,
                pruned,
                "resume finished"
            );
            finish(&engine, &report.requeued).await
        }
        Command::Status { json } => {
            let transfers = repo.list_all().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&transfers)?);
            } else {
                for t in transfers {
                    let total = t
                        .total_bytes
                        .map(|total| total.to_string())
                        .unwrap_or_else(|| "?".into());
                    println!(
                        "{:>5}  {:<8} {:<9} {:>12}/{:<12} {}  {}",
                        t.id,
                        format!("{:?}", t.direction).to_lowercase(),
                        t.status,
                        t.transferred,
                        total,
                        t.object_key,
                        t.local_path
                    );
                }
            }
            Ok(())
        }
        Command::Ls { prefix } => {
            let listing = ListingService::new(
                store,
                Arc::new(ListingCache::new(CacheConfig::default())),
                Box::new(PrintConsumer),
            );
            listing.navigate(&prefix).await?;
            Ok(())
        }
    }
}

/// Log engine events and pause everything on Ctrl-C until the queue drains.
async fn drain(engine: &TransferEngine) -> Result<()> {
    let mut events = engine.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransferEvent::Progress {
                    id,
                    bytes_done,
                    total_bytes,
                }) => tracing::debug!(transfer_id = id, bytes_done, total_bytes, "progress"),
                Ok(TransferEvent::Speed { id, bytes_per_sec }) => {
                    tracing::info!(transfer_id = id, "{:.1} KiB/s", bytes_per_sec / 1024.0)
                }
                Ok(TransferEvent::Error {
                    id, user_message, ..
                }) => tracing::error!(transfer_id = id, "{}", user_message),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = engine.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, pausing transfers");
            engine.pause_all().await?;
            engine.wait_idle().await;
        }
    }
    reporter.abort();
    Ok(())
}

async fn finish(engine: &TransferEngine, ids: &[i64]) -> Result<()> {
    let mut failed = 0;
    for id in ids {
        let transfer = engine.transfer(*id).await?;
        tracing::info!(transfer_id = id, status = %transfer.status, key = %transfer.object_key, "done");
        if transfer.status == TransferStatus::Failed {
            failed += 1;
        }
    }
    engine.shutdown();
    if failed > 0 {
        bail!("{} transfer(s) failed", failed);
    }
    Ok(())
}

/// Prints a listing the way `ls` would.
struct PrintConsumer;

impl ListingConsumer for PrintConsumer {
    fn on_insert(&mut self, item: &StorageObject, _position: usize) {
        print_entry(item);
    }

    fn on_remove(&mut self, _key: &str) {}

    fn on_update(&mut self, _key: &str, _patch: &ObjectPatch) {}

    fn on_batch_append(&mut self, items: &[StorageObject]) {
        items.iter().for_each(print_entry);
    }
}

fn print_entry(item: &StorageObject) {
    match item.meta() {
        None => println!("{:>30} PRE {}", "", item.key),
        Some(meta) => println!(
            "{} {:>10} {}",
            meta.last_modified.format("%Y-%m-%d %H:%M:%S"),
            meta.size,
            item.key
        ),
    }
}
