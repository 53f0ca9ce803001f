//! vehicle-harvest binary entrypoint.
//! Loads config, opens the stores, registers fixture adapters and runs one
//! harvest, printing the run summary as JSON.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vehicle_harvest::adapters::load_fixtures;
use vehicle_harvest::config::load_config_default;
use vehicle_harvest::{GeoIndex, MergeStore, Orchestrator, OutcomeStore, RunRequest, TargetId};

/// Compact logs by default; `HARVEST_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("harvest=info,scheduler=info,merge=info,outcomes=info,warn")
    });

    let json = std::env::var("HARVEST_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

fn load_recent(path: &Path) -> Result<HashSet<TargetId>> {
    match std::fs::read_to_string(path) {
        Ok(s) => {
            let ids: Vec<TargetId> = serde_json::from_str(&s)
                .with_context(|| format!("parsing recent targets {}", path.display()))?;
            Ok(ids.into_iter().map(|t| TargetId::new(t.as_str())).collect())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e).with_context(|| format!("reading recent targets {}", path.display())),
    }
}

fn save_recent(path: &Path, recent: &HashSet<TargetId>) -> Result<()> {
    let mut ids: Vec<&TargetId> = recent.iter().collect();
    ids.sort();
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(&ids)?)
        .with_context(|| format!("writing recent targets {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; harmless when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = load_config_default().context("loading harvest config")?;

    let outcomes = OutcomeStore::open(&cfg.storage.outcomes_path, cfg.storage.history_path.clone())
        .context("opening outcome store")?;
    let merge = MergeStore::open(&cfg.storage.dataset_path).context("opening dataset")?;

    let mut orchestrator = Orchestrator::new(
        Arc::new(GeoIndex::builtin()),
        Arc::new(outcomes),
        Arc::new(merge),
        cfg.scheduler_config(),
    )
    .with_checkpoint_every(cfg.checkpoint_every);

    for adapter in load_fixtures(&cfg.fixtures) {
        orchestrator.register(Arc::new(adapter));
    }

    let mut request = RunRequest::from_config(&cfg);
    if let Some(p) = &cfg.storage.recent_path {
        request.recently_used = load_recent(p)?;
    }

    let cancel = CancellationToken::new();
    request.cancel = Some(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(target: "harvest", "interrupt received, finishing in-flight tasks");
            cancel.cancel();
        }
    });

    let summary = orchestrator.run(request).await?;

    if let Some(p) = &cfg.storage.recent_path {
        save_recent(p, &summary.recently_used)?;
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!(
        "{}",
        serde_json::to_string_pretty(&orchestrator.merge_store().stats())?
    );
    Ok(())
}
