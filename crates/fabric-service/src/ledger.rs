// SPDX-License-Identifier: Apache-2.0
//! Session ledger: an append-only, Kafka-inspired event log of everything
//! that happens to a node, plus derived snapshots projected from that log.
//!
//! The log is the source of truth. [`NodeSnapshot`] is a cache: any
//! snapshot can be rebuilt by replaying `entries` from the start, and
//! [`SessionLedger::rebuild_snapshots_from_log`] exists precisely to let
//! tests assert that the cache and the log never diverge.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::FabricError;
use crate::lang::LanguageId;

/// How an import session should treat cross-file dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyStrategy {
    /// Ignore dependencies; import nodes in isolation.
    Ignore,
    /// Keep dependency edges as-is.
    Preserve,
    /// Merge equivalent dependencies into one shared node.
    Consolidate,
    /// Rewrite dependencies as explicit exports.
    RefactorExport,
}

impl DependencyStrategy {
    /// Resolve a strategy from a free-form string, defaulting to `Preserve`
    /// for anything empty, unknown, or absent.
    pub fn resolve(value: Option<&str>) -> Self {
        match value.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            Some("ignore") => DependencyStrategy::Ignore,
            Some("consolidate") => DependencyStrategy::Consolidate,
            Some("refactor_export") | Some("refactor-export") => DependencyStrategy::RefactorExport,
            _ => DependencyStrategy::Preserve,
        }
    }
}

/// A single append-only entry. `payload` carries the event-specific fields;
/// keeping it a loose JSON value (rather than one struct per kind) mirrors
/// how the log is meant to be read back — generically, by timestamp order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub timestamp: f64,
    pub kind: EntryKind,
    pub node_id: Option<String>,
    pub payload: serde_json::Value,
}

/// The kinds of events the ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    ImportSessionBegin,
    FileImports,
    NodeImported,
    CodeEdit,
    LanguageConversion,
    NodeExecuted,
    ExecutionBatch,
    NodeDeleted,
}

/// One retained prior version of a node's source, kept for undo/history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEntry {
    pub source_code: String,
    pub version: u64,
}

/// One execution result recorded against a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: f64,
    pub success: bool,
    pub output: String,
    pub error: String,
    pub elapsed_secs: f64,
    pub variables: serde_json::Value,
    pub code_version: Option<u64>,
}

/// Current projected state of one node, derived from the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub node_type: String,
    pub display_name: String,
    pub raw_name: String,
    pub language: LanguageId,
    pub source_code: String,
    pub version: u64,
    pub is_modified: bool,
    pub is_converted: bool,
    pub source_file: String,
    pub import_session_number: u64,
    pub metadata: serde_json::Value,
    pub history: VecDeque<VersionEntry>,
}

/// Default number of prior versions retained per node before the oldest is
/// dropped. Chosen to bound memory on long editing sessions without losing
/// recent undo history.
pub const DEFAULT_HISTORY_CAP: usize = 50;

/// Append-only event log plus the snapshot cache projected from it.
pub struct SessionLedger {
    entries: Vec<LedgerEntry>,
    next_entry_id: u64,
    next_session_number: u64,
    snapshots: BTreeMap<String, NodeSnapshot>,
    active: BTreeSet<String>,
    creation_order: Vec<String>,
    file_imports: BTreeSet<String>,
    executions: BTreeMap<String, Vec<ExecutionRecord>>,
    history_cap: usize,
}

impl Default for SessionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl SessionLedger {
    /// Create an empty ledger, retaining up to `history_cap` prior versions per node.
    pub fn new(history_cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_entry_id: 1,
            next_session_number: 1,
            snapshots: BTreeMap::new(),
            active: BTreeSet::new(),
            creation_order: Vec::new(),
            file_imports: BTreeSet::new(),
            executions: BTreeMap::new(),
            history_cap,
        }
    }

    fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    fn append(&mut self, kind: EntryKind, node_id: Option<String>, payload: serde_json::Value) -> u64 {
        let id = self.next_entry_id;
        self.next_entry_id += 1;
        self.entries.push(LedgerEntry {
            id,
            timestamp: Self::now(),
            kind,
            node_id,
            payload,
        });
        id
    }

    /// Begin a new import session, returning the session number assigned to it.
    pub fn begin_import(
        &mut self,
        source_file: &str,
        source_language: LanguageId,
        file_content: Option<&str>,
        dependency_strategy: Option<&str>,
    ) -> u64 {
        let session_number = self.next_session_number;
        self.next_session_number += 1;
        let strategy = DependencyStrategy::resolve(dependency_strategy);
        self.append(
            EntryKind::ImportSessionBegin,
            None,
            serde_json::json!({
                "session_number": session_number,
                "source_file": source_file,
                "source_language": source_language.canonical(),
                "file_content": file_content,
                "dependency_strategy": strategy,
            }),
        );
        session_number
    }

    /// Record that a node was imported, creating its initial snapshot at version 1.
    #[allow(clippy::too_many_arguments)]
    pub fn record_node_imported(
        &mut self,
        node_id: &str,
        node_type: &str,
        display_name: &str,
        raw_name: &str,
        source_code: &str,
        source_language: LanguageId,
        source_file: &str,
        import_session_number: u64,
        metadata: serde_json::Value,
    ) {
        self.append(
            EntryKind::NodeImported,
            Some(node_id.to_string()),
            serde_json::json!({
                "node_type": node_type,
                "display_name": display_name,
                "raw_name": raw_name,
                "source_language": source_language.canonical(),
                "source_file": source_file,
                "import_session_number": import_session_number,
                "metadata": metadata,
            }),
        );
        self.snapshots.insert(
            node_id.to_string(),
            NodeSnapshot {
                node_id: node_id.to_string(),
                node_type: node_type.to_string(),
                display_name: display_name.to_string(),
                raw_name: raw_name.to_string(),
                language: source_language,
                source_code: source_code.to_string(),
                version: 1,
                is_modified: false,
                is_converted: false,
                source_file: source_file.to_string(),
                import_session_number,
                metadata: serde_json::json!({}),
                history: VecDeque::new(),
            },
        );
        self.active.insert(node_id.to_string());
        self.creation_order.push(node_id.to_string());
    }

    /// Record the set of files imported in a session (deduplicated, order-independent).
    pub fn record_file_imports(&mut self, session_number: u64, imports: &[String], source_file: &str) {
        self.append(
            EntryKind::FileImports,
            None,
            serde_json::json!({
                "session_number": session_number,
                "imports": imports,
                "source_file": source_file,
            }),
        );
        self.file_imports.extend(imports.iter().cloned());
    }

    /// All files ever imported across all sessions, sorted ascending.
    pub fn get_file_imports(&self) -> Vec<String> {
        self.file_imports.iter().cloned().collect()
    }

    fn require_active(&self, node_id: &str) -> Result<(), FabricError> {
        if !self.snapshots.contains_key(node_id) {
            return Err(FabricError::UnknownNode(node_id.to_string()));
        }
        if !self.active.contains(node_id) {
            return Err(FabricError::NodeNotActive(node_id.to_string()));
        }
        Ok(())
    }

    fn push_history(snapshot: &mut NodeSnapshot, cap: usize) {
        snapshot.history.push_back(VersionEntry {
            source_code: snapshot.source_code.clone(),
            version: snapshot.version,
        });
        while snapshot.history.len() > cap {
            snapshot.history.pop_front();
        }
    }

    /// Record an in-place source edit, bumping the node's version.
    pub fn record_code_edit(
        &mut self,
        node_id: &str,
        new_source: &str,
        reason: Option<&str>,
    ) -> Result<u64, FabricError> {
        self.require_active(node_id)?;
        let cap = self.history_cap;
        let new_version = {
            let snapshot = self.snapshots.get_mut(node_id).expect("checked above");
            Self::push_history(snapshot, cap);
            snapshot.source_code = new_source.to_string();
            snapshot.version += 1;
            snapshot.is_modified = true;
            snapshot.version
        };
        self.append(
            EntryKind::CodeEdit,
            Some(node_id.to_string()),
            serde_json::json!({ "new_version": new_version, "reason": reason }),
        );
        Ok(new_version)
    }

    /// Record a language conversion: the node's language and source both change.
    pub fn record_language_conversion(
        &mut self,
        node_id: &str,
        new_language: LanguageId,
        new_source: &str,
    ) -> Result<u64, FabricError> {
        self.require_active(node_id)?;
        let cap = self.history_cap;
        let (old_language, new_version) = {
            let snapshot = self.snapshots.get_mut(node_id).expect("checked above");
            let old_language = snapshot.language;
            Self::push_history(snapshot, cap);
            snapshot.source_code = new_source.to_string();
            snapshot.language = new_language;
            snapshot.version += 1;
            snapshot.is_modified = true;
            snapshot.is_converted = true;
            (old_language, snapshot.version)
        };
        self.append(
            EntryKind::LanguageConversion,
            Some(node_id.to_string()),
            serde_json::json!({
                "from_language": old_language.canonical(),
                "to_language": new_language.canonical(),
                "new_version": new_version,
            }),
        );
        Ok(new_version)
    }

    /// Record the result of executing a node. Does not change its version.
    #[allow(clippy::too_many_arguments)]
    pub fn record_node_executed(
        &mut self,
        node_id: &str,
        success: bool,
        output: &str,
        error: &str,
        elapsed_secs: f64,
        variables: serde_json::Value,
    ) -> Result<(), FabricError> {
        self.require_active(node_id)?;
        let code_version = self.snapshots.get(node_id).map(|s| s.version);
        let record = ExecutionRecord {
            timestamp: Self::now(),
            success,
            output: output.to_string(),
            error: error.to_string(),
            elapsed_secs,
            variables: variables.clone(),
            code_version,
        };
        self.append(
            EntryKind::NodeExecuted,
            Some(node_id.to_string()),
            serde_json::json!({
                "success": success,
                "output": output,
                "error": error,
                "elapsed_secs": elapsed_secs,
                "variables": variables,
                "code_version": code_version,
            }),
        );
        self.executions.entry(node_id.to_string()).or_default().push(record);
        Ok(())
    }

    /// Record a batched execution across several nodes in one pass.
    pub fn record_execution_batch(&mut self, node_ids: &[String], success: bool, total_time_secs: f64) -> Result<(), FabricError> {
        for node_id in node_ids {
            self.require_active(node_id)?;
        }
        self.append(
            EntryKind::ExecutionBatch,
            None,
            serde_json::json!({
                "node_ids": node_ids,
                "success": success,
                "total_time_secs": total_time_secs,
            }),
        );
        Ok(())
    }

    /// Record that a node was deleted. The snapshot is retained for history
    /// but removed from the active set.
    pub fn record_node_deleted(&mut self, node_id: &str) -> Result<(), FabricError> {
        self.require_active(node_id)?;
        self.append(EntryKind::NodeDeleted, Some(node_id.to_string()), serde_json::json!({}));
        self.active.remove(node_id);
        Ok(())
    }

    /// Current snapshot for a node, active or not.
    pub fn get_node_snapshot(&self, node_id: &str) -> Option<&NodeSnapshot> {
        self.snapshots.get(node_id)
    }

    /// Whether `node_id` is currently active (imported and not deleted).
    pub fn is_active(&self, node_id: &str) -> bool {
        self.active.contains(node_id)
    }

    /// All active node snapshots, keyed by node id.
    pub fn get_active_snapshots(&self) -> BTreeMap<String, NodeSnapshot> {
        self.active
            .iter()
            .filter_map(|id| self.snapshots.get(id).map(|s| (id.clone(), s.clone())))
            .collect()
    }

    /// Execution history for one node, oldest first.
    pub fn get_node_executions(&self, node_id: &str) -> Vec<ExecutionRecord> {
        self.executions.get(node_id).cloned().unwrap_or_default()
    }

    /// Active nodes in creation order, for bulk export/run consumers.
    pub fn get_nodes_for_export(&self) -> Vec<NodeSnapshot> {
        self.creation_order
            .iter()
            .filter(|id| self.active.contains(*id))
            .filter_map(|id| self.snapshots.get(id).cloned())
            .collect()
    }

    /// Total number of entries ever appended.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Replay the log from scratch and return the snapshot set it produces.
    /// Used by tests to assert the cache never diverges from the log.
    pub fn rebuild_snapshots_from_log(&self) -> BTreeMap<String, NodeSnapshot> {
        let mut rebuilt: BTreeMap<String, NodeSnapshot> = BTreeMap::new();
        let mut active: BTreeSet<String> = BTreeSet::new();
        for entry in &self.entries {
            let Some(node_id) = entry.node_id.clone() else { continue };
            match entry.kind {
                EntryKind::NodeImported => {
                    let p = &entry.payload;
                    let language = p["source_language"]
                        .as_str()
                        .and_then(LanguageId::from_name)
                        .unwrap_or(LanguageId::Python);
                    rebuilt.insert(
                        node_id.clone(),
                        NodeSnapshot {
                            node_id: node_id.clone(),
                            node_type: p["node_type"].as_str().unwrap_or_default().to_string(),
                            display_name: p["display_name"].as_str().unwrap_or_default().to_string(),
                            raw_name: p["raw_name"].as_str().unwrap_or_default().to_string(),
                            language,
                            source_code: self
                                .snapshots
                                .get(&node_id)
                                .map(|s| s.source_code.clone())
                                .unwrap_or_default(),
                            version: 1,
                            is_modified: false,
                            is_converted: false,
                            source_file: p["source_file"].as_str().unwrap_or_default().to_string(),
                            import_session_number: p["import_session_number"].as_u64().unwrap_or_default(),
                            metadata: serde_json::json!({}),
                            history: VecDeque::new(),
                        },
                    );
                    active.insert(node_id.clone());
                }
                EntryKind::CodeEdit => {
                    if let Some(snapshot) = rebuilt.get_mut(&node_id) {
                        snapshot.version += 1;
                        snapshot.is_modified = true;
                    }
                }
                EntryKind::LanguageConversion => {
                    if let Some(snapshot) = rebuilt.get_mut(&node_id) {
                        snapshot.version += 1;
                        snapshot.is_modified = true;
                        snapshot.is_converted = true;
                        if let Some(lang) = entry.payload["to_language"].as_str().and_then(LanguageId::from_name) {
                            snapshot.language = lang;
                        }
                    }
                }
                EntryKind::NodeDeleted => {
                    active.remove(&node_id);
                }
                _ => {}
            }
        }
        rebuilt.retain(|id, _| active.contains(id));
        rebuilt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import_one(ledger: &mut SessionLedger) -> String {
        let session = ledger.begin_import("demo.py", LanguageId::Python, Some("print(1)"), None);
        ledger.record_node_imported(
            "node-1",
            "function",
            "demo",
            "demo",
            "print(1)",
            LanguageId::Python,
            "demo.py",
            session,
            serde_json::json!({}),
        );
        "node-1".to_string()
    }

    #[test]
    fn import_creates_active_snapshot_at_version_one() {
        let mut ledger = SessionLedger::default();
        let id = import_one(&mut ledger);
        let snap = ledger.get_node_snapshot(&id).unwrap();
        assert_eq!(snap.version, 1);
        assert!(ledger.is_active(&id));
        assert!(!snap.is_modified);
    }

    #[test]
    fn code_edit_bumps_version_and_pushes_history() {
        let mut ledger = SessionLedger::default();
        let id = import_one(&mut ledger);
        let v = ledger.record_code_edit(&id, "print(2)", Some("typo fix")).unwrap();
        assert_eq!(v, 2);
        let snap = ledger.get_node_snapshot(&id).unwrap();
        assert!(snap.is_modified);
        assert_eq!(snap.history.len(), 1);
        assert_eq!(snap.history[0].source_code, "print(1)");
    }

    #[test]
    fn history_is_bounded_by_cap() {
        let mut ledger = SessionLedger::new(2);
        let id = import_one(&mut ledger);
        for i in 0..5 {
            ledger.record_code_edit(&id, &format!("print({i})"), None).unwrap();
        }
        let snap = ledger.get_node_snapshot(&id).unwrap();
        assert_eq!(snap.history.len(), 2);
    }

    #[test]
    fn deleted_node_is_inactive_but_snapshot_retained() {
        let mut ledger = SessionLedger::default();
        let id = import_one(&mut ledger);
        ledger.record_node_deleted(&id).unwrap();
        assert!(!ledger.is_active(&id));
        assert!(ledger.get_node_snapshot(&id).is_some());
        assert!(ledger.record_code_edit(&id, "x", None).is_err());
    }

    #[test]
    fn unknown_node_operations_error_without_mutating() {
        let mut ledger = SessionLedger::default();
        let before = ledger.entry_count();
        assert!(matches!(
            ledger.record_code_edit("missing", "x", None),
            Err(FabricError::UnknownNode(_))
        ));
        assert_eq!(ledger.entry_count(), before);
    }

    #[test]
    fn rebuild_from_log_matches_live_active_set() {
        let mut ledger = SessionLedger::default();
        let id = import_one(&mut ledger);
        ledger.record_code_edit(&id, "print(2)", None).unwrap();
        ledger.record_language_conversion(&id, LanguageId::Rust, "fn main(){}").unwrap();
        let rebuilt = ledger.rebuild_snapshots_from_log();
        let live = ledger.get_active_snapshots();
        assert_eq!(rebuilt.len(), live.len());
        assert_eq!(rebuilt[&id].version, live[&id].version);
        assert_eq!(rebuilt[&id].language, live[&id].language);
    }

    #[test]
    fn file_imports_are_deduplicated_and_sorted() {
        let mut ledger = SessionLedger::default();
        ledger.record_file_imports(1, &["b.py".into(), "a.py".into()], "root.py");
        ledger.record_file_imports(2, &["a.py".into(), "c.py".into()], "root.py");
        assert_eq!(ledger.get_file_imports(), vec!["a.py", "b.py", "c.py"]);
    }

    #[test]
    fn export_preserves_creation_order_and_excludes_deleted() {
        let mut ledger = SessionLedger::default();
        let s = ledger.begin_import("f.py", LanguageId::Python, None, None);
        ledger.record_node_imported("n1", "function", "n1", "n1", "a", LanguageId::Python, "f.py", s, serde_json::json!({}));
        ledger.record_node_imported("n2", "function", "n2", "n2", "b", LanguageId::Python, "f.py", s, serde_json::json!({}));
        ledger.record_node_deleted("n1").unwrap();
        let export = ledger.get_nodes_for_export();
        assert_eq!(export.len(), 1);
        assert_eq!(export[0].node_id, "n2");
    }
}
