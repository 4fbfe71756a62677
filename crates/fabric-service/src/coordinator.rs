// SPDX-License-Identifier: Apache-2.0
//! Top-level coordinator: owns every component as process-wide state and
//! orchestrates the cross-component flows (submit, checkpoint, restore)
//! that no single component may perform on its own.
//!
//! Lock acquisition order, when an operation needs more than one component,
//! is fixed: ledger → registry → staging → tokens → persistence → mesh.
//! Holding locks out of this order anywhere in the coordinator is a bug.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::ConfigResolver;
use crate::error::FabricError;
use crate::executor::ExecutorPool;
use crate::ledger::SessionLedger;
use crate::mesh::MeshRelay;
use crate::persistence::{Checkpoint, LockTable, PromotedSnippetRecord, StatePersistence, CHECKPOINT_VERSION};
use crate::registry::NodeRegistry;
use crate::staging::{StagedSnippet, StagingPhase, StagingPipeline, VerdictAction};
use crate::tokens::{MarshalTokenRegistry, TokenRecord, TokenView};
use crate::util::unix_time_now;

/// Everything returned to a caller submitting a new snippet.
#[derive(Debug, Clone)]
pub struct SubmissionResult {
    pub snippet: StagedSnippet,
    pub token: Option<String>,
}

/// Owns the ledger, registry, staging pipeline, token table, lock table,
/// executor pool, persistence writer, and (optionally) the mesh relay.
pub struct Coordinator {
    ledger: StdMutex<SessionLedger>,
    registry: StdMutex<NodeRegistry>,
    staging: StdMutex<StagingPipeline>,
    tokens: StdMutex<MarshalTokenRegistry>,
    locks: LockTable,
    executors: ExecutorPool,
    persistence: StatePersistence,
    mesh: Option<AsyncMutex<MeshRelay>>,
    http_client: reqwest::Client,
    default_ttl: Duration,
}

impl Coordinator {
    pub fn new(config: &ConfigResolver, enable_mesh: bool) -> Self {
        Self {
            ledger: StdMutex::new(SessionLedger::default()),
            registry: StdMutex::new(NodeRegistry::new()),
            staging: StdMutex::new(StagingPipeline::new(config.snippets_dir(), Some(config.audit_log_path()))),
            tokens: StdMutex::new(MarshalTokenRegistry::new()),
            locks: LockTable::new(),
            executors: ExecutorPool::with_defaults(Duration::from_secs(10)),
            persistence: StatePersistence::new(config.checkpoint_path()),
            mesh: if enable_mesh { Some(AsyncMutex::new(MeshRelay::new())) } else { None },
            http_client: reqwest::Client::new(),
            default_ttl: Duration::from_secs_f64(config.default_ttl_secs()),
        }
    }

    /// Run the full staging pipeline for a new snippet and, on success,
    /// mint a marshal token bound to it. Schedules a checkpoint write.
    #[allow(clippy::too_many_arguments)]
    pub fn submit(
        &self,
        engine_letter: &str,
        language: &str,
        code: &str,
        label: Option<&str>,
        origin: &str,
        submitter: &str,
        agent_id: &str,
        ttl: Option<Duration>,
    ) -> Result<SubmissionResult, FabricError> {
        let mut ledger = self.ledger.lock().expect("ledger mutex poisoned");
        let mut registry = self.registry.lock().expect("registry mutex poisoned");
        let mut staging = self.staging.lock().expect("staging mutex poisoned");

        let snippet = staging.run_full_pipeline(
            &mut registry,
            &mut ledger,
            &self.executors,
            engine_letter,
            language,
            code,
            label,
            true,
        )?;

        let token = if snippet.phase == StagingPhase::Promoted {
            let mut tokens = self.tokens.lock().expect("tokens mutex poisoned");
            Some(tokens.mint(&snippet.staging_id, ttl.unwrap_or(self.default_ttl), origin, submitter, agent_id))
        } else {
            None
        };

        drop(staging);
        drop(registry);
        drop(ledger);
        self.schedule_checkpoint();
        Ok(SubmissionResult { snippet, token })
    }

    pub fn resolve_token(&self, token: &str) -> Option<TokenView> {
        self.tokens.lock().expect("tokens mutex poisoned").resolve(token)
    }

    pub fn verdict(&self, staging_id: &str, action: VerdictAction, reason: Option<&str>) -> Result<StagedSnippet, FabricError> {
        let result = self.staging.lock().expect("staging mutex poisoned").verdict(staging_id, action, reason)?;
        self.schedule_checkpoint();
        Ok(result)
    }

    pub fn promote(&self, staging_id: &str) -> Result<StagedSnippet, FabricError> {
        let mut ledger = self.ledger.lock().expect("ledger mutex poisoned");
        let mut registry = self.registry.lock().expect("registry mutex poisoned");
        let result = self.staging.lock().expect("staging mutex poisoned").promote(staging_id, &mut ledger, &mut registry)?;
        drop(registry);
        drop(ledger);
        self.schedule_checkpoint();
        Ok(result)
    }

    pub fn rollback(&self, staging_id: &str, reason: Option<&str>) -> Result<StagedSnippet, FabricError> {
        let mut registry = self.registry.lock().expect("registry mutex poisoned");
        let result = self.staging.lock().expect("staging mutex poisoned").rollback(staging_id, &mut registry, reason)?;
        drop(registry);
        self.schedule_checkpoint();
        Ok(result)
    }

    pub fn lock_slot(&self, address: &str, locked_by: &str, reason: &str) {
        self.locks.lock(address, locked_by, reason);
        self.schedule_checkpoint();
    }

    pub fn unlock_slot(&self, address: &str) -> bool {
        let result = self.locks.unlock(address);
        self.schedule_checkpoint();
        result
    }

    pub fn is_locked(&self, address: &str) -> bool {
        self.locks.is_locked(address)
    }

    pub fn ledger(&self) -> std::sync::MutexGuard<'_, SessionLedger> {
        self.ledger.lock().expect("ledger mutex poisoned")
    }

    pub fn registry(&self) -> std::sync::MutexGuard<'_, NodeRegistry> {
        self.registry.lock().expect("registry mutex poisoned")
    }

    pub fn staging(&self) -> std::sync::MutexGuard<'_, StagingPipeline> {
        self.staging.lock().expect("staging mutex poisoned")
    }

    pub fn mesh(&self) -> Option<&AsyncMutex<MeshRelay>> {
        self.mesh.as_ref()
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Called from a periodic background task; performs the debounced
    /// checkpoint write if one is due.
    pub fn persistence_tick(&self) -> Result<bool, FabricError> {
        self.persistence.tick()
    }

    fn build_checkpoint(&self) -> Checkpoint {
        let tokens = self.tokens.lock().expect("tokens mutex poisoned");
        let staging = self.staging.lock().expect("staging mutex poisoned");
        let promoted_snippets: Vec<PromotedSnippetRecord> = staging
            .get_promoted()
            .into_iter()
            .map(|snippet| {
                let token = tokens.snapshot().iter().find(|(_, r)| r.staging_id == snippet.staging_id).map(|(t, _)| t.clone());
                let locked = self.locks.is_locked(&snippet.address);
                let (origin, submitter, agent_id, ttl_secs, created_at) = token
                    .as_ref()
                    .and_then(|t| tokens.snapshot().get(t).cloned())
                    .map(|r| (r.origin, r.submitter, r.agent_id, r.ttl_secs, r.created_at))
                    .unwrap_or_else(|| (String::new(), String::new(), String::new(), self.default_ttl.as_secs_f64(), snippet.created_at));
                PromotedSnippetRecord {
                    staging_id: snippet.staging_id,
                    language: snippet.language.canonical().to_string(),
                    engine_letter: snippet.language.letter(),
                    code: snippet.code,
                    label: snippet.label,
                    address: snippet.address,
                    position: snippet.position,
                    engine_name: snippet.language.engine_name(),
                    code_hash: snippet.code_hash,
                    origin,
                    submitter,
                    agent_id,
                    token,
                    ttl_secs,
                    created_at,
                    promoted_at: snippet.promoted_at.unwrap_or(created_at),
                    spec_output: snippet.spec_output,
                    spec_error: snippet.spec_error,
                    spec_execution_secs: snippet.spec_execution_secs,
                    spec_success: snippet.spec_success,
                    locked,
                    saved_file_path: snippet.saved_file_path,
                    ledger_node_id: snippet.ledger_node_id,
                    registry_slot_id: snippet.registry_slot_id,
                }
            })
            .collect();
        let now = unix_time_now();
        Checkpoint {
            version: CHECKPOINT_VERSION,
            saved_at: now,
            saved_at_iso: String::new(),
            locked_slots: self.locks.snapshot(),
            marshal_tokens: tokens.snapshot(),
            promoted_snippets,
        }
    }

    fn schedule_checkpoint(&self) {
        self.persistence.schedule(self.build_checkpoint());
    }

    /// Write a checkpoint immediately, bypassing the debounce window. Used at shutdown.
    pub fn checkpoint_now(&self) -> Result<(), FabricError> {
        self.persistence.checkpoint_now(self.build_checkpoint())
    }

    /// Replay the last checkpoint, re-running the full pipeline for every
    /// promoted snippet and re-applying tokens and locks. Best-effort: a
    /// failing snippet is logged and skipped rather than aborting restore.
    pub fn restore(&self) -> Result<usize, FabricError> {
        let Some(checkpoint) = self.persistence.restore()? else { return Ok(0) };
        let mut restored = 0usize;

        for record in &checkpoint.promoted_snippets {
            let mut ledger = self.ledger.lock().expect("ledger mutex poisoned");
            let mut registry = self.registry.lock().expect("registry mutex poisoned");
            let mut staging = self.staging.lock().expect("staging mutex poisoned");
            let outcome = staging.run_full_pipeline(
                &mut registry,
                &mut ledger,
                &self.executors,
                &record.engine_letter.to_string(),
                &record.language,
                &record.code,
                record.label.as_deref(),
                true,
            );
            drop(staging);
            drop(registry);
            drop(ledger);

            match outcome {
                Ok(snippet) if snippet.phase == StagingPhase::Promoted => {
                    self.restore_token_for(record);
                    if record.locked {
                        self.locks.lock(&snippet.address, &record.submitter, "restored-lock");
                    }
                    restored += 1;
                }
                Ok(snippet) => {
                    warn!(staging_id = %record.staging_id, phase = ?snippet.phase, "restored snippet did not reach promoted phase");
                }
                Err(err) => {
                    warn!(staging_id = %record.staging_id, error = %err, "failed to restore snippet, skipping");
                }
            }
        }

        for (address, record) in &checkpoint.locked_slots {
            self.locks.lock(address, &record.locked_by, &record.reason);
        }

        info!(restored, total = checkpoint.promoted_snippets.len(), "restore complete");
        Ok(restored)
    }

    fn restore_token_for(&self, record: &PromotedSnippetRecord) {
        let mut tokens = self.tokens.lock().expect("tokens mutex poisoned");
        if let Some(token) = &record.token {
            let elapsed = unix_time_now() - record.created_at;
            let remaining = record.ttl_secs - elapsed;
            if remaining > 0.0 {
                tokens.restore_token(
                    token,
                    TokenRecord {
                        staging_id: record.staging_id.clone(),
                        created_at: record.created_at,
                        ttl_secs: record.ttl_secs,
                        origin: record.origin.clone(),
                        submitter: record.submitter.clone(),
                        agent_id: record.agent_id.clone(),
                    },
                );
                return;
            }
        }
        if record.locked {
            tokens.remint_with_ttl(&record.staging_id, self.default_ttl, &record.origin, &record.submitter, &record.agent_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver_for(dir: &tempfile::TempDir) -> ConfigResolver {
        ConfigResolver::from_stored(crate::config::StoredSettings {
            snippets_dir: Some(dir.path().join("snippets").to_string_lossy().into_owned()),
            audit_log_path: Some(dir.path().join("audit.jsonl").to_string_lossy().into_owned()),
            checkpoint_path: Some(dir.path().join("checkpoint.json").to_string_lossy().into_owned()),
            default_ttl_secs: None,
        })
    }

    fn coordinator() -> (tempfile::TempDir, ConfigResolver, Coordinator) {
        let dir = tempfile::tempdir().unwrap();
        let config = resolver_for(&dir);
        let coordinator = Coordinator::new(&config, false);
        (dir, config, coordinator)
    }

    #[test]
    fn submit_mints_a_token_on_promotion() {
        let (_dir, _config, coordinator) = coordinator();
        let result = coordinator
            .submit("a", "python", "print(\"OK\")", None, "cli", "alice", "agent-1", None)
            .unwrap();
        assert_eq!(result.snippet.phase, StagingPhase::Promoted);
        let token = result.token.unwrap();
        let view = coordinator.resolve_token(&token).unwrap();
        assert_eq!(view.staging_id, result.snippet.staging_id);
    }

    #[test]
    fn checkpoint_now_then_restore_rebinds_promoted_snippets() {
        let (_dir, config, coordinator) = coordinator();
        coordinator.submit("a", "python", "print(\"OK\")", None, "cli", "alice", "agent-1", None).unwrap();
        coordinator.submit("n", "bash", "echo noop", None, "cli", "bob", "agent-2", None).unwrap();
        coordinator.checkpoint_now().unwrap();

        let fresh = Coordinator::new(&config, false);
        let restored = fresh.restore().unwrap();
        assert_eq!(restored, 2);
        assert_eq!(fresh.registry().get_matrix_summary().bound_count, 2);
    }
}
