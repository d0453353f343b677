use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tokio::time;
use tracing::{debug, info, warn};

use super::expiry;
use super::model::PasteRecord;

const PASTES: TableDefinition<&str, &[u8]> = TableDefinition::new("pastes");

/// Leading byte of every stored record, so the layout can evolve without
/// guessing at old rows.
const RECORD_V1_MARKER: u8 = 0x01;

/// Outcome of inserting a new paste.
#[derive(Debug, PartialEq, Eq)]
pub enum PutResult {
    Inserted,
    /// The id is taken. Nothing was written; retry with a fresh id.
    DuplicateId,
}

/// Outcome of committing one view.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsumeResult {
    /// View committed. Carries the record with its updated `view_count`.
    Viewed(PasteRecord),
    /// View committed and it was the last one: the row is gone.
    /// Carries the final snapshot with `destroyed = true`.
    Burned(PasteRecord),
    /// Unknown, expired, or already burned.
    NotFound,
}

/// A view commit that was vetoed because its caller stopped waiting.
/// The transaction was aborted; nothing changed.
#[derive(Debug, thiserror::Error)]
#[error("view commit abandoned by caller")]
pub struct CommitAbandoned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    Committing,
    Abandoned,
}

/// Hand-off between a caller waiting on [`Store::consume_view`] and the
/// blocking thread running it.
///
/// Whichever side takes the gate first wins: once the store has started its
/// commit the caller must wait for the outcome, and once the caller has
/// abandoned the gate the store aborts instead of committing.
#[derive(Debug, Clone)]
pub struct CommitGate(Arc<Mutex<GateState>>);

impl CommitGate {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(GateState::Open)))
    }

    /// Veto the commit. Returns false when the commit is already under way
    /// and its result has to be awaited.
    pub fn abandon(&self) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            GateState::Committing => false,
            _ => {
                *state = GateState::Abandoned;
                true
            }
        }
    }

    fn is_abandoned(&self) -> bool {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) == GateState::Abandoned
    }

    fn enter_commit(&self) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == GateState::Abandoned {
            return false;
        }
        *state = GateState::Committing;
        true
    }
}

impl Default for CommitGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to the redb store.
///
/// redb runs one write transaction at a time, so every mutation below is
/// linearizable per id (and globally).
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(PASTES)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert a new paste. Never overwrites an existing id.
    pub fn put(&self, id: &str, record: &PasteRecord) -> Result<PutResult> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(PASTES)?;
            if table.get(id)?.is_some() {
                PutResult::DuplicateId
            } else {
                table.insert(id, bytes.as_slice())?;
                PutResult::Inserted
            }
        };
        write_txn.commit()?;

        if result == PutResult::Inserted {
            debug!(id = %id, "stored paste");
        }
        Ok(result)
    }

    /// Read a paste without side effects. Liveness is the caller's concern.
    pub fn get(&self, id: &str) -> Result<Option<PasteRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PASTES)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.as_deref().map(decode).transpose()
    }

    /// Commit one view of `id`.
    ///
    /// In a single write transaction: dead rows are removed and reported as
    /// `NotFound`; otherwise `view_count` is incremented, and if that reaches
    /// `max_views` the row is removed in the same commit.
    ///
    /// If `gate` is abandoned before the commit starts, the transaction is
    /// aborted and [`CommitAbandoned`] is returned.
    pub fn consume_view(&self, id: &str, now: i64, gate: &CommitGate) -> Result<ConsumeResult> {
        let write_txn = self.db.begin_write()?;
        if gate.is_abandoned() {
            write_txn.abort()?;
            return Err(CommitAbandoned.into());
        }
        let result = {
            let mut table = write_txn.open_table(PASTES)?;

            // Clone the bytes so the AccessGuard (which borrows `table`) is
            // dropped before any mutation.
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => ConsumeResult::NotFound,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;

                    if expiry::is_dead(&record, now) {
                        table.remove(id)?;
                        debug!(id = %id, "lazy-evicted dead paste");
                        ConsumeResult::NotFound
                    } else {
                        record.view_count += 1;
                        if expiry::is_exhausted(&record) {
                            table.remove(id)?;
                            record.destroyed = true;
                            debug!(id = %id, "burned after final view");
                            ConsumeResult::Burned(record)
                        } else {
                            let updated = encode(&record)?;
                            table.insert(id, updated.as_slice())?;
                            ConsumeResult::Viewed(record)
                        }
                    }
                }
            }
        };
        if !gate.enter_commit() {
            write_txn.abort()?;
            debug!(id = %id, "view commit abandoned");
            return Err(CommitAbandoned.into());
        }
        write_txn.commit()?;
        Ok(result)
    }

    /// Remove `id` if it is dead at `now`. Returns true if a row was removed.
    pub fn purge_if_dead(&self, id: &str, now: i64) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let purged = {
            let mut table = write_txn.open_table(PASTES)?;
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
            match raw_bytes {
                Some(bytes) if expiry::is_dead(&decode(&bytes)?, now) => {
                    table.remove(id)?;
                    true
                }
                _ => false,
            }
        };
        write_txn.commit()?;
        if purged {
            debug!(id = %id, "lazy-evicted dead paste");
        }
        Ok(purged)
    }

    /// Hard delete. Returns true if the paste existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(PASTES)?;
            let existed = table.remove(id)?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Number of stored rows, dead ones included until swept.
    pub fn count(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PASTES)?;
        Ok(table.len()?)
    }

    /// Remove every dead paste. Returns the removed ids.
    pub fn prune(&self, now: i64) -> Result<Vec<String>> {
        // Collect dead ids in a read pass first.
        let dead_ids: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(PASTES)?;
            let mut ids = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                match decode(v.value()) {
                    Ok(record) if expiry::is_dead(&record, now) => ids.push(k.value().to_owned()),
                    Ok(_) => {}
                    Err(e) => warn!(id = %k.value(), error = %e, "skipping undecodable paste"),
                }
            }
            ids
        };

        if dead_ids.is_empty() {
            return Ok(vec![]);
        }

        // Dead rows never come back to life, so the read pass stays valid.
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PASTES)?;
            for id in &dead_ids {
                table.remove(id.as_str())?;
            }
        }
        write_txn.commit()?;

        info!(removed = dead_ids.len(), "pruned dead pastes");
        Ok(dead_ids)
    }

    /// Spawn a background Tokio task that calls `prune()` every `interval`.
    pub fn spawn_sweep(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let store = self.clone();
                match tokio::task::spawn_blocking(move || store.prune(expiry::now())).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "background sweep error"),
                    Err(e) => warn!(error = %e, "background sweep task failed"),
                }
            }
        });
    }
}

#[cfg(test)]
impl Store {
    /// Hold the write lock for `hold`, then abort. Simulates a stalled writer.
    pub(crate) fn hold_writer(&self, hold: Duration) {
        let write_txn = self.db.begin_write().unwrap();
        std::thread::sleep(hold);
        write_txn.abort().unwrap();
    }
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &PasteRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<PasteRecord> {
    match bytes.split_first() {
        None => anyhow::bail!("empty record"),
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format {marker:#04x}"),
    }
}
