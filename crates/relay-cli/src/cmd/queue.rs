use crate::cmd::Paths;
use crate::output::{print_json, print_table};
use crate::sink::FileSender;
use anyhow::Context;
use chrono::SecondsFormat;
use clap::Subcommand;
use relay_core::config::Config;
use relay_core::event::Event;
use relay_core::queue::{EventLog, EventQueue, FlushOutcome};
use relay_core::storage::{KeyValueStore, RedbStore};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List pending events in delivery order
    List,

    /// Print the number of pending events
    Count,

    /// Discard every pending event
    Clear,

    /// Deliver every pending event to a JSON-lines file, then purge it
    Drain {
        /// File to append events to
        #[arg(long)]
        out: PathBuf,

        /// Events per batch (default: queue.max_batch_size)
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(paths: &Paths, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    let config = paths.load_config()?;
    let db = paths.db_path(&config);
    match subcmd {
        QueueSubcommand::List => list(&db, json),
        QueueSubcommand::Count => count(&db, json),
        QueueSubcommand::Clear => clear(&db, json),
        QueueSubcommand::Drain { out, batch_size } => drain(&config, &db, &out, batch_size, json),
    }
}

fn open_store(db: &Path) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    let store = RedbStore::open(db)
        .with_context(|| format!("failed to open queue database {}", db.display()))?;
    Ok(Arc::new(store))
}

fn pending(db: &Path) -> anyhow::Result<(EventLog, Vec<(u64, Event)>)> {
    let mut log = EventLog::new(open_store(db)?);
    let entries = log.replay().context("failed to read event log")?;
    Ok((log, entries))
}

// ---------------------------------------------------------------------------
// list / count / clear
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ListedEvent<'a> {
    seq: u64,
    #[serde(flatten)]
    event: &'a Event,
}

fn list(db: &Path, json: bool) -> anyhow::Result<()> {
    let (_, entries) = pending(db)?;

    if json {
        let listed: Vec<ListedEvent> = entries
            .iter()
            .map(|(seq, event)| ListedEvent { seq: *seq, event })
            .collect();
        print_json(&listed)?;
        return Ok(());
    }

    if entries.is_empty() {
        println!("No pending events.");
        return Ok(());
    }

    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|(seq, event)| {
            vec![
                seq.to_string(),
                event.id.to_string(),
                event.name.clone(),
                event.namespace.clone(),
                event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            ]
        })
        .collect();
    print_table(&["SEQ", "ID", "NAME", "NAMESPACE", "TIMESTAMP"], rows);
    Ok(())
}

fn count(db: &Path, json: bool) -> anyhow::Result<()> {
    let (_, entries) = pending(db)?;
    if json {
        print_json(&serde_json::json!({ "count": entries.len() }))?;
    } else {
        println!("{}", entries.len());
    }
    Ok(())
}

fn clear(db: &Path, json: bool) -> anyhow::Result<()> {
    let (mut log, entries) = pending(db)?;
    log.clear().context("failed to clear event log")?;
    if json {
        print_json(&serde_json::json!({ "cleared": entries.len() }))?;
    } else {
        println!("Cleared {} event(s).", entries.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// drain
// ---------------------------------------------------------------------------

fn drain(
    config: &Config,
    db: &Path,
    out: &Path,
    batch_size: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let mut queue_config = config.queue.clone();
    if let Some(size) = batch_size {
        if size == 0 {
            anyhow::bail!("--batch-size must be at least 1");
        }
        queue_config.max_batch_size = size;
    }
    // draining an existing log must never evict
    queue_config.max_queue_size = None;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let queue = EventQueue::new(
        queue_config,
        open_store(db)?,
        Arc::new(FileSender::new(out.to_path_buf())),
    );
    let restored = queue.restore();
    let outcome = runtime.block_on(queue.flush());
    let remaining = queue.len();

    let (delivered, discarded) = match outcome {
        FlushOutcome::Completed {
            delivered,
            discarded,
        } => (delivered, discarded),
        FlushOutcome::Failed { delivered } => {
            anyhow::bail!(
                "drain stopped after {delivered} event(s); {remaining} still queued in {}",
                db.display()
            );
        }
        FlushOutcome::Skipped | FlushOutcome::Deferred | FlushOutcome::BackingOff => (0, 0),
    };
    tracing::info!(restored, delivered, discarded, out = %out.display(), "Drain complete");

    if json {
        print_json(&serde_json::json!({
            "restored": restored,
            "delivered": delivered,
            "discarded": discarded,
            "remaining": remaining,
            "out": out,
        }))?;
    } else {
        println!("Drained {delivered} event(s) to {}.", out.display());
        if discarded > 0 {
            println!("Discarded {discarded} event(s) that could not be encoded.");
        }
    }
    Ok(())
}
