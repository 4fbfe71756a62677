// SPDX-License-Identifier: Apache-2.0
//! Staging pipeline: the four-phase admission controller that takes
//! untrusted code through queue → speculate → verdict → promote, reserving
//! matrix positions up front and writing an immutable JSON-lines audit log
//! of every step.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FabricError;
use crate::executor::ExecutorPool;
use crate::lang::LanguageId;
use crate::ledger::SessionLedger;
use crate::registry::{NodeRegistry, Permissions};
use crate::util::unix_time_now;

/// Maximum entries kept in the in-memory recent-history ring.
const HISTORY_CAPACITY: usize = 512;

/// Phase of one staged snippet's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagingPhase {
    Queued,
    Speculating,
    Passed,
    Failed,
    Rejected,
    Promoting,
    Promoted,
    RolledBack,
}

/// The action a verdict call applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictAction {
    Auto,
    Approve,
    Reject,
    Hold,
}

/// One audited pipeline event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventKind {
    SnippetQueued,
    SlotReserved,
    SpecExecStarted,
    SpecExecCompleted,
    SpecExecFailed,
    VerdictPass,
    VerdictFail,
    VerdictManualHold,
    PromotionStarted,
    FileWritten,
    LedgerNodeCreated,
    RegistrySlotCommitted,
    PromotionCompleted,
    Rejection,
    Rollback,
    SlotReleased,
    Error,
}

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: f64,
    pub iso_time: String,
    pub event: AuditEventKind,
    pub staging_id: String,
    pub data: serde_json::Value,
}

fn iso_from_epoch(epoch: f64) -> String {
    let secs = epoch.floor() as i64;
    let millis = ((epoch - epoch.floor()) * 1000.0).round() as i64;
    let days = secs.div_euclid(86_400);
    let time_of_day = secs.rem_euclid(86_400);
    let (h, m, s) = (time_of_day / 3600, (time_of_day % 3600) / 60, time_of_day % 60);
    // Civil-from-days (Howard Hinnant's algorithm) to avoid a chrono dependency
    // for a pure UTC calendar conversion used only in log lines.
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as i64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };
    format!("{year:04}-{month:02}-{day:02}T{h:02}:{m:02}:{s:02}.{millis:03}Z")
}

/// Append-only JSON-lines audit trail. Keeps a bounded in-memory copy for
/// fast queries and best-effort mirrors every entry to disk.
pub struct AuditLogger {
    path: Option<PathBuf>,
    entries: Vec<AuditEntry>,
}

impl AuditLogger {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, entries: Vec::new() }
    }

    fn record(&mut self, event: AuditEventKind, staging_id: &str, data: serde_json::Value) {
        let timestamp = unix_time_now();
        let entry = AuditEntry {
            timestamp,
            iso_time: iso_from_epoch(timestamp),
            event,
            staging_id: staging_id.to_string(),
            data,
        };
        if let Some(path) = &self.path {
            if let Ok(line) = serde_json::to_string(&entry) {
                if let Err(err) = append_line(path, &line) {
                    tracing::warn!(error = %err, "failed to append audit log line");
                }
            }
        }
        self.entries.push(entry);
    }

    /// Read entries back, optionally filtered by staging id, newest first.
    pub fn read(&self, staging_id: Option<&str>, limit: usize) -> Vec<AuditEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| staging_id.map(|id| e.staging_id == id).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// A snippet's full record as it moves through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedSnippet {
    pub staging_id: String,
    pub language: LanguageId,
    pub code: String,
    pub label: Option<String>,
    pub code_hash: String,
    pub phase: StagingPhase,
    pub address: String,
    pub position: u32,
    pub created_at: f64,
    pub promoted_at: Option<f64>,
    pub spec_output: String,
    pub spec_error: String,
    pub spec_execution_secs: f64,
    pub spec_success: bool,
    pub saved_file_path: Option<String>,
    pub ledger_node_id: Option<String>,
    pub registry_slot_id: Option<String>,
    pub failure_reason: Option<String>,
}

/// Truncation bounds applied when rendering a [`SnippetView`] for display.
/// Purely presentational: `StagedSnippet`'s own fields, and anything written
/// to the ledger, always keep the untruncated text.
const MAX_SPEC_OUTPUT_CHARS: usize = 5_000;
const MAX_CODE_EXPORT_CHARS: usize = 10_000;

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push_str("...<truncated>");
        out
    }
}

/// A [`StagedSnippet`] as shown to a caller: `code`, `spec_output`, and
/// `spec_error` are bounded to [`MAX_CODE_EXPORT_CHARS`]/[`MAX_SPEC_OUTPUT_CHARS`]
/// characters. Never written back anywhere — the ledger and `StagedSnippet`
/// itself always keep the full text this is derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnippetView {
    pub staging_id: String,
    pub language: LanguageId,
    pub code: String,
    pub label: Option<String>,
    pub code_hash: String,
    pub phase: StagingPhase,
    pub address: String,
    pub position: u32,
    pub created_at: f64,
    pub promoted_at: Option<f64>,
    pub spec_output: String,
    pub spec_error: String,
    pub spec_execution_secs: f64,
    pub spec_success: bool,
    pub saved_file_path: Option<String>,
    pub ledger_node_id: Option<String>,
    pub registry_slot_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl StagedSnippet {
    /// Build the truncated, presentational view of this snippet.
    pub fn to_view(&self) -> SnippetView {
        SnippetView {
            staging_id: self.staging_id.clone(),
            language: self.language,
            code: truncate_chars(&self.code, MAX_CODE_EXPORT_CHARS),
            label: self.label.clone(),
            code_hash: self.code_hash.clone(),
            phase: self.phase,
            address: self.address.clone(),
            position: self.position,
            created_at: self.created_at,
            promoted_at: self.promoted_at,
            spec_output: truncate_chars(&self.spec_output, MAX_SPEC_OUTPUT_CHARS),
            spec_error: truncate_chars(&self.spec_error, MAX_SPEC_OUTPUT_CHARS),
            spec_execution_secs: self.spec_execution_secs,
            spec_success: self.spec_success,
            saved_file_path: self.saved_file_path.clone(),
            ledger_node_id: self.ledger_node_id.clone(),
            registry_slot_id: self.registry_slot_id.clone(),
            failure_reason: self.failure_reason.clone(),
        }
    }
}

impl From<&StagedSnippet> for SnippetView {
    fn from(snippet: &StagedSnippet) -> Self {
        snippet.to_view()
    }
}

/// The four-phase admission controller.
pub struct StagingPipeline {
    snippets: BTreeMap<String, StagedSnippet>,
    reservations: BTreeMap<char, BTreeSet<u32>>,
    history: VecDeque<String>,
    audit: AuditLogger,
    snippets_dir: PathBuf,
}

impl StagingPipeline {
    pub fn new(snippets_dir: PathBuf, audit_log_path: Option<PathBuf>) -> Self {
        Self {
            snippets: BTreeMap::new(),
            reservations: BTreeMap::new(),
            history: VecDeque::new(),
            audit: AuditLogger::new(audit_log_path),
            snippets_dir,
        }
    }

    fn new_staging_id() -> String {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("stg-{}", hex::encode(bytes))
    }

    fn is_reserved_or_bound(&self, registry: &NodeRegistry, language: LanguageId, position: u32) -> bool {
        let reserved = self
            .reservations
            .get(&language.letter())
            .map(|set| set.contains(&position))
            .unwrap_or(false);
        let bound = registry
            .get_slot_by_address(&format!("{}{}", language.letter(), position))
            .map(|s| s.bound_node.is_some())
            .unwrap_or(true);
        reserved || bound
    }

    fn reserve_position(&mut self, registry: &NodeRegistry, language: LanguageId) -> Option<u32> {
        let capacity = language.capacity();
        for pos in 1..=capacity {
            if !self.is_reserved_or_bound(registry, language, pos) {
                self.reservations.entry(language.letter()).or_default().insert(pos);
                return Some(pos);
            }
        }
        None
    }

    fn release_position(&mut self, language: LanguageId, position: u32) {
        if let Some(set) = self.reservations.get_mut(&language.letter()) {
            set.remove(&position);
        }
    }

    /// Queue a snippet: resolve its engine, reserve a position, compute its
    /// content hash, and append the opening audit events.
    pub fn queue_snippet(
        &mut self,
        registry: &NodeRegistry,
        engine_letter: &str,
        language: &str,
        code: &str,
        label: Option<&str>,
    ) -> Result<StagedSnippet, FabricError> {
        let resolved = crate::lang::resolve_engine(engine_letter, language)
            .ok_or_else(|| FabricError::UnknownEngine(format!("{engine_letter}/{language}")))?;
        let position = self
            .reserve_position(registry, resolved)
            .ok_or_else(|| FabricError::RowFull(resolved.engine_name()))?;

        let staging_id = Self::new_staging_id();
        let mut hasher = Sha256::new();
        hasher.update(code.as_bytes());
        let code_hash = hex::encode(hasher.finalize());
        let address = format!("{}{}", resolved.letter(), position);

        let snippet = StagedSnippet {
            staging_id: staging_id.clone(),
            language: resolved,
            code: code.to_string(),
            label: label.map(str::to_string),
            code_hash,
            phase: StagingPhase::Queued,
            address: address.clone(),
            position,
            created_at: unix_time_now(),
            promoted_at: None,
            spec_output: String::new(),
            spec_error: String::new(),
            spec_execution_secs: 0.0,
            spec_success: false,
            saved_file_path: None,
            ledger_node_id: None,
            registry_slot_id: None,
            failure_reason: None,
        };

        self.audit.record(
            AuditEventKind::SnippetQueued,
            &staging_id,
            serde_json::json!({ "language": resolved.canonical(), "label": label }),
        );
        self.audit.record(
            AuditEventKind::SlotReserved,
            &staging_id,
            serde_json::json!({ "address": address }),
        );

        self.snippets.insert(staging_id.clone(), snippet.clone());
        self.push_history(&staging_id);
        Ok(snippet)
    }

    fn push_history(&mut self, staging_id: &str) {
        self.history.push_back(staging_id.to_string());
        while self.history.len() > HISTORY_CAPACITY {
            self.history.pop_front();
        }
    }

    fn require(&self, staging_id: &str) -> Result<&StagedSnippet, FabricError> {
        self.snippets
            .get(staging_id)
            .ok_or_else(|| FabricError::UnknownStagingId(staging_id.to_string()))
    }

    /// Run the snippet in isolation and record its speculative outcome.
    pub fn speculate(&mut self, staging_id: &str, pool: &ExecutorPool) -> Result<StagedSnippet, FabricError> {
        let snippet = self.require(staging_id)?.clone();
        if !matches!(snippet.phase, StagingPhase::Queued | StagingPhase::Failed) {
            return Err(FabricError::InvalidStagingTransition(staging_id.to_string(), "speculate"));
        }
        self.audit.record(AuditEventKind::SpecExecStarted, staging_id, serde_json::json!({}));

        let outcome = pool.run(snippet.language, &snippet.code);

        let updated = self.snippets.get_mut(staging_id).expect("checked above");
        match outcome {
            Ok(result) => {
                updated.spec_output = result.output;
                updated.spec_error = result.error;
                updated.spec_execution_secs = result.elapsed_secs;
                updated.spec_success = result.success;
                updated.phase = if result.success { StagingPhase::Passed } else { StagingPhase::Failed };
            }
            Err(err) => {
                updated.spec_error = err.to_string();
                updated.spec_success = false;
                updated.phase = StagingPhase::Failed;
            }
        }
        let result_snippet = updated.clone();
        self.audit.record(
            if result_snippet.spec_success { AuditEventKind::SpecExecCompleted } else { AuditEventKind::SpecExecFailed },
            staging_id,
            serde_json::json!({
                "success": result_snippet.spec_success,
                "elapsed_secs": result_snippet.spec_execution_secs,
            }),
        );
        Ok(result_snippet)
    }

    /// Apply a verdict action, transitioning phase per the state table.
    pub fn verdict(&mut self, staging_id: &str, action: VerdictAction, reason: Option<&str>) -> Result<StagedSnippet, FabricError> {
        let snippet = self.require(staging_id)?.clone();

        match action {
            VerdictAction::Hold => {
                self.audit.record(
                    AuditEventKind::VerdictManualHold,
                    staging_id,
                    serde_json::json!({ "reason": reason }),
                );
                return Ok(snippet);
            }
            VerdictAction::Reject => {
                self.release_position(snippet.language, snippet.position);
                let updated = self.snippets.get_mut(staging_id).expect("checked above");
                updated.phase = StagingPhase::Rejected;
                updated.failure_reason = reason.map(str::to_string);
                let result = updated.clone();
                self.audit.record(AuditEventKind::Rejection, staging_id, serde_json::json!({ "reason": reason }));
                return Ok(result);
            }
            VerdictAction::Approve => {
                // Forces passed from any terminal speculative state (passed or failed).
                let updated = self.snippets.get_mut(staging_id).expect("checked above");
                updated.phase = StagingPhase::Passed;
                let result = updated.clone();
                self.audit.record(AuditEventKind::VerdictPass, staging_id, serde_json::json!({ "forced": true }));
                return Ok(result);
            }
            VerdictAction::Auto => match snippet.phase {
                StagingPhase::Passed => {
                    self.audit.record(AuditEventKind::VerdictPass, staging_id, serde_json::json!({}));
                    Ok(snippet)
                }
                StagingPhase::Failed => {
                    self.release_position(snippet.language, snippet.position);
                    let updated = self.snippets.get_mut(staging_id).expect("checked above");
                    updated.phase = StagingPhase::Rejected;
                    let result = updated.clone();
                    self.audit.record(AuditEventKind::VerdictFail, staging_id, serde_json::json!({}));
                    Ok(result)
                }
                _ => Err(FabricError::InvalidStagingTransition(staging_id.to_string(), "verdict(auto)")),
            },
        }
    }

    /// Promote a passed snippet: write its file, create a ledger node,
    /// commit it into the reserved registry position, and release the
    /// reservation. Each step is audited; a mid-way failure marks the
    /// snippet failed without undoing steps already taken.
    pub fn promote(
        &mut self,
        staging_id: &str,
        ledger: &mut SessionLedger,
        registry: &mut NodeRegistry,
    ) -> Result<StagedSnippet, FabricError> {
        let mut snippet = self.require(staging_id)?.clone();
        if snippet.phase != StagingPhase::Passed {
            return Err(FabricError::InvalidStagingTransition(staging_id.to_string(), "promote"));
        }
        snippet.phase = StagingPhase::Promoting;
        self.snippets.insert(staging_id.to_string(), snippet.clone());
        self.audit.record(AuditEventKind::PromotionStarted, staging_id, serde_json::json!({}));

        match self.try_promote_steps(staging_id, &mut snippet, ledger, registry) {
            Ok(()) => {
                snippet.phase = StagingPhase::Promoted;
                snippet.promoted_at = Some(unix_time_now());
                self.release_position(snippet.language, snippet.position);
                self.audit.record(AuditEventKind::PromotionCompleted, staging_id, serde_json::json!({}));
                self.audit.record(AuditEventKind::SlotReleased, staging_id, serde_json::json!({ "address": snippet.address }));
            }
            Err(err) => {
                snippet.phase = StagingPhase::Failed;
                snippet.failure_reason = Some(err.to_string());
                self.audit.record(AuditEventKind::Error, staging_id, serde_json::json!({ "error": err.to_string() }));
            }
        }
        self.snippets.insert(staging_id.to_string(), snippet.clone());
        Ok(snippet)
    }

    fn try_promote_steps(
        &mut self,
        staging_id: &str,
        snippet: &mut StagedSnippet,
        ledger: &mut SessionLedger,
        registry: &mut NodeRegistry,
    ) -> Result<(), FabricError> {
        // 1. Write the snippet file with its metadata header.
        let lang_dir = self.snippets_dir.join(snippet.language.canonical());
        fs::create_dir_all(&lang_dir)?;
        let timestamp = (unix_time_now() as u64).to_string();
        let filename = format!("{}_{}_{}{}", snippet.address, staging_id, timestamp, snippet.language.extension());
        let file_path = lang_dir.join(&filename);
        let header = self.render_header(snippet);
        fs::write(&file_path, format!("{header}\n\n{}", snippet.code))?;
        snippet.saved_file_path = Some(file_path.to_string_lossy().into_owned());
        self.audit.record(
            AuditEventKind::FileWritten,
            staging_id,
            serde_json::json!({ "path": snippet.saved_file_path }),
        );

        // 2. Create a synthetic import session and a node-imported entry.
        let node_id = format!("snippet-{staging_id}");
        let session = ledger.begin_import(
            snippet.saved_file_path.as_deref().unwrap_or_default(),
            snippet.language,
            Some(&snippet.code),
            None,
        );
        ledger.record_node_imported(
            &node_id,
            "snippet",
            snippet.label.as_deref().unwrap_or(staging_id),
            staging_id,
            &snippet.code,
            snippet.language,
            snippet.saved_file_path.as_deref().unwrap_or_default(),
            session,
            serde_json::json!({ "staging_id": staging_id, "code_hash": snippet.code_hash }),
        );
        snippet.ledger_node_id = Some(node_id.clone());
        self.audit.record(AuditEventKind::LedgerNodeCreated, staging_id, serde_json::json!({ "node_id": node_id }));

        // 3. Record the speculative result as the node's first execute entry.
        ledger.record_node_executed(
            &node_id,
            snippet.spec_success,
            &snippet.spec_output,
            &snippet.spec_error,
            snippet.spec_execution_secs,
            serde_json::json!({}),
        )?;

        // 4. Commit into the reserved (engine, position) with read/write-only permissions.
        let slot = registry.commit_node(
            ledger,
            &node_id,
            Some(&snippet.language.engine_name()),
            Some(snippet.position),
            Some(Permissions { get: true, push: true, post: false, del: false }),
        )?;
        snippet.registry_slot_id = Some(slot.slot_id.clone());
        self.audit.record(
            AuditEventKind::RegistrySlotCommitted,
            staging_id,
            serde_json::json!({ "slot_id": slot.slot_id, "address": slot.address }),
        );

        // 5. Record the speculative execution onto the slot's own history.
        registry.record_execution(&slot.slot_id, snippet.spec_success, &snippet.spec_output, &snippet.spec_error, snippet.spec_execution_secs);

        Ok(())
    }

    fn render_header(&self, snippet: &StagedSnippet) -> String {
        let prefix = snippet.language.comment_prefix();
        let created_iso = iso_from_epoch(snippet.created_at);
        let promoted_iso = iso_from_epoch(unix_time_now());
        format!(
            "{prefix} staging_id={}\n{prefix} language={}\n{prefix} engine={}\n{prefix} address={}\n{prefix} label={}\n{prefix} code_hash={}\n{prefix} created_at={}\n{prefix} promoted_at={}\n{prefix} spec_elapsed_secs={}\n{prefix} spec_passed={}",
            snippet.staging_id,
            snippet.language.canonical(),
            snippet.language.engine_name(),
            snippet.address,
            snippet.label.clone().unwrap_or_default(),
            snippet.code_hash,
            created_iso,
            promoted_iso,
            snippet.spec_execution_secs,
            snippet.spec_success,
        )
    }

    /// Roll a promoted snippet back: clear its bound slot, keep its file.
    pub fn rollback(&mut self, staging_id: &str, registry: &mut NodeRegistry, reason: Option<&str>) -> Result<StagedSnippet, FabricError> {
        let snippet = self.require(staging_id)?.clone();
        if snippet.phase != StagingPhase::Promoted {
            return Err(FabricError::InvalidStagingTransition(staging_id.to_string(), "rollback"));
        }
        if let Some(slot_id) = &snippet.registry_slot_id {
            registry.clear_slot(slot_id);
        }
        let updated = self.snippets.get_mut(staging_id).expect("checked above");
        updated.phase = StagingPhase::RolledBack;
        let result = updated.clone();
        self.audit.record(AuditEventKind::Rollback, staging_id, serde_json::json!({ "reason": reason }));
        Ok(result)
    }

    /// Run queue → speculate → verdict(auto) → (promote if passed and `auto_promote`).
    pub fn run_full_pipeline(
        &mut self,
        registry: &mut NodeRegistry,
        ledger: &mut SessionLedger,
        pool: &ExecutorPool,
        engine_letter: &str,
        language: &str,
        code: &str,
        label: Option<&str>,
        auto_promote: bool,
    ) -> Result<StagedSnippet, FabricError> {
        let snippet = self.queue_snippet(registry, engine_letter, language, code, label)?;
        self.speculate(&snippet.staging_id, pool)?;
        let verdicted = self.verdict(&snippet.staging_id, VerdictAction::Auto, None)?;
        if auto_promote && verdicted.phase == StagingPhase::Passed {
            self.promote(&snippet.staging_id, ledger, registry)
        } else {
            Ok(verdicted)
        }
    }

    pub fn get_snippet(&self, staging_id: &str) -> Option<StagedSnippet> {
        self.snippets.get(staging_id).cloned()
    }

    /// The truncated, presentational view of one snippet — what callers
    /// displaying a snippet's code or speculative output should use.
    pub fn get_snippet_view(&self, staging_id: &str) -> Option<SnippetView> {
        self.snippets.get(staging_id).map(StagedSnippet::to_view)
    }

    /// Snippets not yet in a terminal phase.
    pub fn get_active(&self) -> Vec<StagedSnippet> {
        self.snippets
            .values()
            .filter(|s| !matches!(s.phase, StagingPhase::Rejected | StagingPhase::Promoted | StagingPhase::RolledBack))
            .cloned()
            .collect()
    }

    /// All snippets currently sitting in the promoted phase, for checkpointing.
    pub fn get_promoted(&self) -> Vec<StagedSnippet> {
        self.snippets.values().filter(|s| s.phase == StagingPhase::Promoted).cloned().collect()
    }

    /// Most recently queued snippets, newest first.
    pub fn get_history(&self, limit: usize) -> Vec<StagedSnippet> {
        self.history
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| self.snippets.get(id).cloned())
            .collect()
    }

    pub fn get_audit_trail(&self, staging_id: Option<&str>, limit: usize) -> Vec<AuditEntry> {
        self.audit.read(staging_id, limit)
    }

    pub fn get_pipeline_summary(&self) -> PipelineSummary {
        let mut by_phase: BTreeMap<String, u32> = BTreeMap::new();
        for snippet in self.snippets.values() {
            *by_phase.entry(format!("{:?}", snippet.phase)).or_insert(0) += 1;
        }
        PipelineSummary { total: self.snippets.len() as u32, by_phase }
    }
}

/// Coarse counts of staged snippets by phase, for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub total: u32,
    pub by_phase: BTreeMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn pool() -> ExecutorPool {
        ExecutorPool::with_defaults(Duration::from_secs(2))
    }

    #[test]
    fn queue_reserves_first_free_position_and_hashes_code() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NodeRegistry::new();
        let mut pipeline = StagingPipeline::new(dir.path().join("snippets"), None);
        let snippet = pipeline.queue_snippet(&registry, "a", "python", "x = 1", None).unwrap();
        assert_eq!(snippet.address, "a1");
        assert_eq!(snippet.code_hash.len(), 64);
        assert_eq!(snippet.phase, StagingPhase::Queued);
    }

    #[test]
    fn reservation_isolation_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NodeRegistry::new();
        let mut pipeline = StagingPipeline::new(dir.path().join("snippets"), None);
        let first = pipeline.queue_snippet(&registry, "a", "python", "1", None).unwrap();
        let second = pipeline.queue_snippet(&registry, "a", "python", "2", None).unwrap();
        assert_eq!(first.address, "a1");
        assert_eq!(second.address, "a2");

        pipeline.verdict(&first.staging_id, VerdictAction::Reject, Some("test")).unwrap();
        let third = pipeline.queue_snippet(&registry, "a", "python", "3", None).unwrap();
        assert_eq!(third.address, "a1", "released reservation must be reused");
    }

    #[test]
    fn promotion_atomicity_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = SessionLedger::default();
        let mut registry = NodeRegistry::new();
        let pool = pool();
        let mut pipeline = StagingPipeline::new(dir.path().join("snippets"), None);

        let snippet = pipeline
            .run_full_pipeline(&mut registry, &mut ledger, &pool, "a", "python", "print(\"OK\")", None, true)
            .unwrap();

        assert_eq!(snippet.phase, StagingPhase::Promoted);
        assert!(snippet.saved_file_path.is_some());
        let node_id = snippet.ledger_node_id.clone().unwrap();
        assert_eq!(node_id, format!("snippet-{}", snippet.staging_id));
        assert!(ledger.get_node_snapshot(&node_id).is_some());
        let slot = registry.get_slot_by_node(&node_id).unwrap();
        assert!(slot.permissions.get && slot.permissions.push && !slot.permissions.post && !slot.permissions.del);
        let output = registry.read_slot_output(&slot.slot_id, 10).unwrap();
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn rollback_clears_slot_but_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = SessionLedger::default();
        let mut registry = NodeRegistry::new();
        let pool = pool();
        let mut pipeline = StagingPipeline::new(dir.path().join("snippets"), None);
        let snippet = pipeline
            .run_full_pipeline(&mut registry, &mut ledger, &pool, "a", "python", "print(\"OK\")", None, true)
            .unwrap();

        let rolled = pipeline.rollback(&snippet.staging_id, &mut registry, Some("cleanup")).unwrap();
        assert_eq!(rolled.phase, StagingPhase::RolledBack);
        let slot_id = snippet.registry_slot_id.unwrap();
        assert!(registry.get_slot(&slot_id).unwrap().bound_node.is_none());
        assert!(Path::new(&snippet.saved_file_path.unwrap()).exists());
    }

    #[test]
    fn promoting_a_large_snippet_keeps_the_full_source_in_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = SessionLedger::default();
        let mut registry = NodeRegistry::new();
        let pool = pool();
        let mut pipeline = StagingPipeline::new(dir.path().join("snippets"), None);

        let big_code = format!("print(\"{}\")", "x".repeat(MAX_CODE_EXPORT_CHARS + 500));
        let snippet = pipeline
            .run_full_pipeline(&mut registry, &mut ledger, &pool, "a", "python", &big_code, None, true)
            .unwrap();

        assert_eq!(snippet.code.chars().count(), big_code.chars().count(), "StagedSnippet must keep the untruncated source");
        let node_id = snippet.ledger_node_id.clone().unwrap();
        let source_code = ledger.get_node_snapshot(&node_id).unwrap().source_code;
        assert_eq!(source_code, big_code, "ledger's permanent record must hold the full, untruncated source");

        let view = pipeline.get_snippet_view(&snippet.staging_id).unwrap();
        assert!(view.code.chars().count() <= MAX_CODE_EXPORT_CHARS + "...<truncated>".chars().count());
        assert_ne!(view.code, snippet.code, "the presentational view must truncate even though the stored snippet doesn't");
    }

    #[test]
    fn verdict_auto_on_failed_speculation_rejects_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let registry = NodeRegistry::new();
        let pool = ExecutorPool::new(Duration::from_millis(1));
        let mut pipeline = StagingPipeline::new(dir.path().join("snippets"), None);
        // Rust has no registered executor in this bare pool, so speculation errors out.
        let snippet = pipeline.queue_snippet(&registry, "d", "rust", "fn main(){}", None).unwrap();
        pipeline.speculate(&snippet.staging_id, &pool).unwrap();
        let verdicted = pipeline.verdict(&snippet.staging_id, VerdictAction::Auto, None).unwrap();
        assert_eq!(verdicted.phase, StagingPhase::Rejected);

        let requeued = pipeline.queue_snippet(&registry, "d", "rust", "fn main(){}", None).unwrap();
        assert_eq!(requeued.address, snippet.address, "rejected reservation must be reusable");
    }
}
