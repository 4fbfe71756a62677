// SPDX-License-Identifier: Apache-2.0
//! Crash-resilient checkpointing: a debounced, atomic snapshot of locked
//! slots, live marshal tokens, and promoted snippets, restored once at
//! startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FabricError;
use crate::tokens::TokenRecord;
use crate::util::unix_time_now;

/// Coalescing window: mutators schedule a write after this delay; writes
/// superseded within the window are dropped in favor of the newest snapshot.
pub const COALESCE_SECONDS: f64 = 1.0;

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// A slot held against TTL-driven eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedSlotRecord {
    pub locked_at: f64,
    pub locked_by: String,
    pub reason: String,
}

/// One promoted snippet's durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(clippy::struct_field_names)]
pub struct PromotedSnippetRecord {
    pub staging_id: String,
    pub language: String,
    pub engine_letter: char,
    pub code: String,
    pub label: Option<String>,
    pub address: String,
    pub position: u32,
    pub engine_name: String,
    pub code_hash: String,
    pub origin: String,
    pub submitter: String,
    pub agent_id: String,
    pub token: Option<String>,
    pub ttl_secs: f64,
    pub created_at: f64,
    pub promoted_at: f64,
    pub spec_output: String,
    pub spec_error: String,
    pub spec_execution_secs: f64,
    pub spec_success: bool,
    pub locked: bool,
    pub saved_file_path: Option<String>,
    pub ledger_node_id: Option<String>,
    pub registry_slot_id: Option<String>,
}

/// The full checkpoint document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: f64,
    pub saved_at_iso: String,
    pub locked_slots: BTreeMap<String, LockedSlotRecord>,
    pub marshal_tokens: BTreeMap<String, TokenRecord>,
    pub promoted_snippets: Vec<PromotedSnippetRecord>,
}

/// Table of slot addresses exempted from TTL-driven eviction.
#[derive(Default)]
pub struct LockTable {
    locks: Mutex<BTreeMap<String, LockedSlotRecord>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, address: &str, locked_by: &str, reason: &str) {
        self.locks.lock().expect("lock table mutex poisoned").insert(
            address.to_string(),
            LockedSlotRecord { locked_at: unix_time_now(), locked_by: locked_by.to_string(), reason: reason.to_string() },
        );
    }

    pub fn unlock(&self, address: &str) -> bool {
        self.locks.lock().expect("lock table mutex poisoned").remove(address).is_some()
    }

    pub fn is_locked(&self, address: &str) -> bool {
        self.locks.lock().expect("lock table mutex poisoned").contains_key(address)
    }

    pub fn snapshot(&self) -> BTreeMap<String, LockedSlotRecord> {
        self.locks.lock().expect("lock table mutex poisoned").clone()
    }

    pub fn restore(&self, locks: BTreeMap<String, LockedSlotRecord>) {
        *self.locks.lock().expect("lock table mutex poisoned") = locks;
    }
}

struct PendingWrite {
    due_at: std::time::Instant,
    checkpoint: Checkpoint,
}

/// Debounced, atomic checkpoint writer. Scheduling is cheap and
/// synchronous; the actual write happens on [`StatePersistence::tick`],
/// which the binary calls from a periodic background task.
pub struct StatePersistence {
    path: PathBuf,
    pending: Mutex<Option<PendingWrite>>,
}

impl StatePersistence {
    pub fn new(path: PathBuf) -> Self {
        Self { path, pending: Mutex::new(None) }
    }

    /// Schedule a checkpoint write after the coalescing window. A checkpoint
    /// already pending and not yet due is replaced, not appended to.
    pub fn schedule(&self, checkpoint: Checkpoint) {
        let due_at = std::time::Instant::now() + Duration::from_secs_f64(COALESCE_SECONDS);
        *self.pending.lock().expect("persistence mutex poisoned") = Some(PendingWrite { due_at, checkpoint });
    }

    /// If a scheduled write is now due, perform it. Returns whether a write happened.
    pub fn tick(&self) -> Result<bool, FabricError> {
        let due = {
            let mut guard = self.pending.lock().expect("persistence mutex poisoned");
            match guard.as_ref() {
                Some(pending) if pending.due_at <= std::time::Instant::now() => guard.take(),
                _ => None,
            }
        };
        match due {
            Some(pending) => {
                write_atomic(&self.path, &pending.checkpoint)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write immediately, bypassing the debounce window. Used at shutdown.
    pub fn checkpoint_now(&self, checkpoint: Checkpoint) -> Result<(), FabricError> {
        *self.pending.lock().expect("persistence mutex poisoned") = None;
        write_atomic(&self.path, &checkpoint)
    }

    /// Read back the last checkpoint, if any.
    pub fn restore(&self) -> Result<Option<Checkpoint>, FabricError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(FabricError::Io(err)),
        }
    }
}

fn write_atomic(path: &Path, checkpoint: &Checkpoint) -> Result<(), FabricError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(checkpoint)?;
    fs::write(&tmp_path, data)?;
    fs::rename(&tmp_path, path).map_err(FabricError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_checkpoint() -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            saved_at: unix_time_now(),
            saved_at_iso: String::new(),
            locked_slots: BTreeMap::new(),
            marshal_tokens: BTreeMap::new(),
            promoted_snippets: Vec::new(),
        }
    }

    #[test]
    fn checkpoint_now_is_immediately_readable() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path().join("checkpoint.json"));
        persistence.checkpoint_now(empty_checkpoint()).unwrap();
        let restored = persistence.restore().unwrap().unwrap();
        assert_eq!(restored.version, CHECKPOINT_VERSION);
    }

    #[test]
    fn restore_on_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path().join("missing.json"));
        assert!(persistence.restore().unwrap().is_none());
    }

    #[test]
    fn scheduled_write_is_not_visible_before_it_is_due() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path().join("checkpoint.json"));
        persistence.schedule(empty_checkpoint());
        assert!(!persistence.tick().unwrap(), "write should not fire before the debounce window elapses");
        assert!(persistence.restore().unwrap().is_none());
    }

    #[test]
    fn rescheduling_before_due_replaces_pending_write() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path().join("checkpoint.json"));
        let mut first = empty_checkpoint();
        first.version = 1;
        persistence.schedule(first);
        let mut second = empty_checkpoint();
        second.promoted_snippets.push(PromotedSnippetRecord {
            staging_id: "stg-1".into(),
            language: "python".into(),
            engine_letter: 'a',
            code: "x=1".into(),
            label: None,
            address: "a1".into(),
            position: 1,
            engine_name: "PYTHON".into(),
            code_hash: "deadbeef".into(),
            origin: "cli".into(),
            submitter: "alice".into(),
            agent_id: "agent-1".into(),
            token: None,
            ttl_secs: 60.0,
            created_at: unix_time_now(),
            promoted_at: unix_time_now(),
            spec_output: String::new(),
            spec_error: String::new(),
            spec_execution_secs: 0.0,
            spec_success: true,
            locked: false,
            saved_file_path: None,
            ledger_node_id: None,
            registry_slot_id: None,
        });
        persistence.schedule(second);
        assert_eq!(persistence.pending.lock().unwrap().as_ref().unwrap().checkpoint.promoted_snippets.len(), 1);
    }

    #[test]
    fn lock_table_round_trips() {
        let table = LockTable::new();
        table.lock("a1", "alice", "manual lock");
        assert!(table.is_locked("a1"));
        let snap = table.snapshot();
        let restored = LockTable::new();
        restored.restore(snap);
        assert!(restored.is_locked("a1"));
        assert!(restored.unlock("a1"));
        assert!(!restored.is_locked("a1"));
    }
}
