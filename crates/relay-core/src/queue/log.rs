//! Durable, append-only event log over a [`KeyValueStore`].
//!
//! # Key design
//!
//! ```text
//! events/meta                       -> {"next_seq": u64, "first_unpurged": u64}
//! events/entry/<seq, 20-digit pad>  -> JSON-encoded Event
//! ```
//!
//! Entries are appended under a monotonically increasing sequence number.
//! `first_unpurged` is the confirmed-purged watermark: everything below it has
//! been delivered (or deliberately discarded) and is never replayed. Replay is
//! therefore a pure scan of `first_unpurged..next_seq`. The watermark is
//! written before stale entries are removed, so a failed removal only leaves
//! garbage below the watermark.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::event::Event;
use crate::storage::{get_json, set_json, KeyValueStore};

const META_KEY: &str = "events/meta";

fn entry_key(seq: u64) -> String {
    format!("events/entry/{seq:020}")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LogMeta {
    next_seq: u64,
    first_unpurged: u64,
}

pub struct EventLog {
    store: Arc<dyn KeyValueStore>,
    /// Loaded lazily so a store that is briefly unavailable at startup does
    /// not clobber existing entries with a zeroed meta record.
    meta: Option<LogMeta>,
}

impl EventLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store, meta: None }
    }

    fn meta(&mut self) -> Result<LogMeta> {
        if let Some(meta) = self.meta {
            return Ok(meta);
        }
        let meta = get_json::<LogMeta>(self.store.as_ref(), META_KEY)?.unwrap_or_default();
        self.meta = Some(meta);
        Ok(meta)
    }

    fn write_meta(&mut self, meta: LogMeta) -> Result<()> {
        set_json(self.store.as_ref(), META_KEY, &meta)?;
        self.meta = Some(meta);
        Ok(())
    }

    /// Sequence number the next append will receive.
    pub fn next_seq(&mut self) -> Result<u64> {
        Ok(self.meta()?.next_seq)
    }

    /// Durably append `event`, returning its sequence number.
    ///
    /// The entry is written before the meta record. If the meta write fails,
    /// the next append reuses the same sequence number and overwrites the
    /// orphaned entry.
    pub fn append(&mut self, event: &Event) -> Result<u64> {
        let mut meta = self.meta()?;
        let seq = meta.next_seq;
        set_json(self.store.as_ref(), &entry_key(seq), event)?;
        meta.next_seq = seq + 1;
        self.write_meta(meta)?;
        Ok(seq)
    }

    /// Load every unpurged entry in sequence order.
    ///
    /// Always re-reads meta from the store. Entries that are missing or fail
    /// to decode are skipped with a warning. An entry found at `next_seq` (a
    /// torn append from a crashed process) is adopted.
    pub fn replay(&mut self) -> Result<Vec<(u64, Event)>> {
        self.meta = None;
        let mut meta = self.meta()?;
        let mut entries = Vec::new();

        for seq in meta.first_unpurged..meta.next_seq {
            match get_json::<Event>(self.store.as_ref(), &entry_key(seq)) {
                Ok(Some(event)) => entries.push((seq, event)),
                Ok(None) => warn!(seq, "event log entry missing, skipping"),
                Err(e) => warn!(seq, error = %e, "event log entry unreadable, skipping"),
            }
        }

        let mut adopted = false;
        while let Ok(Some(event)) = get_json::<Event>(self.store.as_ref(), &entry_key(meta.next_seq)) {
            entries.push((meta.next_seq, event));
            meta.next_seq += 1;
            adopted = true;
        }
        if adopted {
            self.write_meta(meta)?;
        }

        Ok(entries)
    }

    /// Move the watermark to `first_unpurged` and delete entries below it.
    ///
    /// Moving the watermark backwards is a no-op.
    pub fn purge_below(&mut self, first_unpurged: u64) -> Result<()> {
        let mut meta = self.meta()?;
        let target = first_unpurged.min(meta.next_seq);
        if target <= meta.first_unpurged {
            return Ok(());
        }
        let old = meta.first_unpurged;
        meta.first_unpurged = target;
        self.write_meta(meta)?;

        for seq in old..target {
            if let Err(e) = self.store.remove(&entry_key(seq)) {
                warn!(seq, error = %e, "failed to remove purged event log entry");
            }
        }
        Ok(())
    }

    /// Purge every entry.
    pub fn clear(&mut self) -> Result<()> {
        let next = self.next_seq()?;
        self.purge_below(next)
    }

    /// Number of unpurged entries according to meta.
    pub fn len(&mut self) -> Result<u64> {
        let meta = self.meta()?;
        Ok(meta.next_seq - meta.first_unpurged)
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
