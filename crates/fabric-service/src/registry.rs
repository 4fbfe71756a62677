// SPDX-License-Identifier: Apache-2.0
//! Node registry: the 288-slot execution matrix.
//!
//! Each of the fifteen engine rows is a fixed-size array of slots. A slot
//! binds at most one ledger node at a time; binding, permissions, and the
//! bounded input/output buffers live here. The registry never writes back
//! into the ledger — it only reads snapshots handed to it by the caller, so
//! every method that needs ledger data takes `&SessionLedger` explicitly.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::FabricError;
use crate::lang::LanguageId;
use crate::ledger::SessionLedger;

/// Bounded ring buffer capacity for per-slot input and output records.
pub const SLOT_BUFFER_CAPACITY: usize = 256;

/// GET/PUSH/POST/DEL permission bits on a slot or an engine row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub get: bool,
    pub push: bool,
    pub post: bool,
    pub del: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        // Matches the commit-node default: read/write open, delete closed.
        Self { get: true, push: true, post: true, del: false }
    }
}

/// One buffered inbound message queued against a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedInput {
    pub data: serde_json::Value,
    pub source: Option<String>,
    pub received_at: f64,
}

/// One recorded execution outcome against a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub elapsed_secs: f64,
    pub recorded_at: f64,
}

/// One addressable position in an engine row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub slot_id: String,
    pub address: String,
    pub language: LanguageId,
    pub position: u32,
    pub bound_node: Option<String>,
    pub committed_version: u64,
    /// Version of the bound node's source that was last actually executed,
    /// as of the last [`NodeRegistry::record_execution`] call. Always
    /// `<= committed_version`; falls behind it whenever the node is
    /// recommitted or edited without a fresh execution.
    pub executed_version: u64,
    pub permissions: Permissions,
    pub input_buffer: VecDeque<BufferedInput>,
    pub output_buffer: VecDeque<OutputRecord>,
    pub subscribed_to: Vec<String>,
}

impl Slot {
    fn new(language: LanguageId, position: u32) -> Self {
        let address = format!("{}{}", language.letter(), position);
        Self {
            slot_id: format!("slot-{address}"),
            address,
            language,
            position,
            bound_node: None,
            committed_version: 0,
            executed_version: 0,
            permissions: Permissions::default(),
            input_buffer: VecDeque::new(),
            output_buffer: VecDeque::new(),
            subscribed_to: Vec::new(),
        }
    }

    fn is_dirty(&self, ledger: &SessionLedger) -> bool {
        match &self.bound_node {
            Some(node_id) => ledger
                .get_node_snapshot(node_id)
                .map(|s| s.version > self.committed_version)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// One engine's fixed-size row of slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRow {
    pub language: LanguageId,
    pub permissions: Permissions,
    pub slots: Vec<Slot>,
}

/// Summary counters for the whole matrix, used for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSummary {
    pub total_capacity: u32,
    pub bound_count: u32,
    pub free_count: u32,
}

/// The 288-slot execution matrix.
pub struct NodeRegistry {
    rows: BTreeMap<char, EngineRow>,
    slot_by_node: BTreeMap<String, String>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Build a fresh matrix: every row present, every slot unbound.
    pub fn new() -> Self {
        let mut rows = BTreeMap::new();
        for language in LanguageId::ALL {
            let slots = (1..=language.capacity()).map(|pos| Slot::new(language, pos)).collect();
            rows.insert(
                language.letter(),
                EngineRow { language, permissions: Permissions::default(), slots },
            );
        }
        Self { rows, slot_by_node: BTreeMap::new() }
    }

    fn row_for(&self, engine_name: &str) -> Option<&EngineRow> {
        LanguageId::from_name(engine_name)
            .or_else(|| engine_name.chars().next().and_then(LanguageId::from_letter))
            .and_then(|lang| self.rows.get(&lang.letter()))
    }

    fn row_for_mut(&mut self, engine_name: &str) -> Option<&mut EngineRow> {
        let letter = LanguageId::from_name(engine_name)
            .or_else(|| engine_name.chars().next().and_then(LanguageId::from_letter))
            .map(LanguageId::letter)?;
        self.rows.get_mut(&letter)
    }

    fn parse_address(address: &str) -> Option<(char, u32)> {
        let mut chars = address.chars();
        let letter = chars.next()?.to_ascii_lowercase();
        let position: u32 = chars.as_str().parse().ok()?;
        Some((letter, position))
    }

    fn find_slot_mut(&mut self, slot_id: &str) -> Option<&mut Slot> {
        self.rows
            .values_mut()
            .flat_map(|row| row.slots.iter_mut())
            .find(|s| s.slot_id == slot_id)
    }

    fn find_slot(&self, slot_id: &str) -> Option<&Slot> {
        self.rows.values().flat_map(|row| row.slots.iter()).find(|s| s.slot_id == slot_id)
    }

    fn first_free_position(row: &EngineRow) -> Option<u32> {
        row.slots.iter().find(|s| s.bound_node.is_none()).map(|s| s.position)
    }

    /// Bind a node to a slot. Uses `position` if given, otherwise the first
    /// free position in the engine's row; uses `engine_name` if given,
    /// otherwise the node's current language. Permissions default from the
    /// row unless `permissions` overrides them.
    pub fn commit_node(
        &mut self,
        ledger: &SessionLedger,
        node_id: &str,
        engine_name: Option<&str>,
        position: Option<u32>,
        permissions: Option<Permissions>,
    ) -> Result<Slot, FabricError> {
        if !ledger.is_active(node_id) {
            return Err(FabricError::NodeNotActive(node_id.to_string()));
        }
        let snapshot = ledger
            .get_node_snapshot(node_id)
            .ok_or_else(|| FabricError::UnknownNode(node_id.to_string()))?;
        let engine_name = engine_name
            .map(str::to_string)
            .unwrap_or_else(|| snapshot.language.engine_name());
        let engine_name = engine_name.as_str();
        let row = self
            .row_for(engine_name)
            .ok_or_else(|| FabricError::UnknownEngine(engine_name.to_string()))?;
        let row_default_perms = row.permissions;
        let pos = match position {
            Some(p) => p,
            None => Self::first_free_position(row).ok_or_else(|| FabricError::RowFull(engine_name.to_string()))?,
        };
        let version = snapshot.version;
        let node_id_owned = node_id.to_string();

        let row = self.row_for_mut(engine_name).expect("checked above");
        let slot = row
            .slots
            .iter_mut()
            .find(|s| s.position == pos)
            .ok_or_else(|| FabricError::UnknownSlot(format!("{}{}", engine_name, pos)))?;
        if let Some(existing) = &slot.bound_node {
            if existing != node_id {
                return Err(FabricError::Conflict(format!(
                    "slot {} is already occupied by {existing}",
                    slot.address
                )));
            }
            self.slot_by_node.remove(existing);
        }
        slot.bound_node = Some(node_id_owned.clone());
        slot.committed_version = version;
        slot.permissions = permissions.unwrap_or(row_default_perms);
        let result = slot.clone();
        self.slot_by_node.insert(node_id_owned, result.slot_id.clone());
        Ok(result)
    }

    /// Commit every active ledger node that is not yet bound, to the first
    /// free position in its language's row. Nodes whose row is full are
    /// skipped rather than causing the whole batch to fail.
    pub fn commit_all_from_ledger(&mut self, ledger: &SessionLedger) -> Vec<Slot> {
        let mut pending: Vec<(String, String)> = ledger
            .get_active_snapshots()
            .into_iter()
            .filter(|(node_id, _)| !self.slot_by_node.contains_key(node_id))
            .map(|(node_id, snapshot)| (node_id, snapshot.display_name))
            .collect();
        pending.sort_by(|a, b| a.1.cmp(&b.1));

        let mut committed = Vec::new();
        for (node_id, _) in pending {
            if let Ok(slot) = self.commit_node(ledger, &node_id, None, None, None) {
                committed.push(slot);
            }
        }
        committed
    }

    /// Slots whose bound node has a ledger version newer than what was
    /// committed. Purely a read: never mutates `committed_version`.
    pub fn get_dirty_slots(&self, ledger: &SessionLedger) -> Vec<Slot> {
        self.rows
            .values()
            .flat_map(|row| row.slots.iter())
            .filter(|s| s.is_dirty(ledger))
            .cloned()
            .collect()
    }

    /// Count of dirty slots without allocating the slot list. Same
    /// definition as [`NodeRegistry::get_dirty_slots`]; does not mutate state.
    pub fn refresh_all_from_ledger(&self, ledger: &SessionLedger) -> usize {
        self.rows
            .values()
            .flat_map(|row| row.slots.iter())
            .filter(|s| s.is_dirty(ledger))
            .count()
    }

    pub fn get_slot(&self, slot_id: &str) -> Option<Slot> {
        self.find_slot(slot_id).cloned()
    }

    pub fn get_slot_by_address(&self, address: &str) -> Option<Slot> {
        let (letter, pos) = Self::parse_address(address)?;
        self.rows.get(&letter)?.slots.iter().find(|s| s.position == pos).cloned()
    }

    pub fn get_slot_by_node(&self, node_id: &str) -> Option<Slot> {
        let slot_id = self.slot_by_node.get(node_id)?;
        self.find_slot(slot_id).cloned()
    }

    pub fn get_engine_row(&self, engine_name: &str) -> Option<EngineRow> {
        self.row_for(engine_name).cloned()
    }

    pub fn get_matrix_summary(&self) -> MatrixSummary {
        let mut bound = 0u32;
        let mut total = 0u32;
        for row in self.rows.values() {
            total += row.slots.len() as u32;
            bound += row.slots.iter().filter(|s| s.bound_node.is_some()).count() as u32;
        }
        MatrixSummary { total_capacity: total, bound_count: bound, free_count: total - bound }
    }

    /// Unbind a slot, releasing it for reuse. Returns `false` if unknown.
    pub fn clear_slot(&mut self, slot_id: &str) -> bool {
        let Some(slot) = self.find_slot_mut(slot_id) else { return false };
        if let Some(node_id) = slot.bound_node.take() {
            self.slot_by_node.remove(&node_id);
        }
        slot.committed_version = 0;
        slot.executed_version = 0;
        slot.input_buffer.clear();
        slot.output_buffer.clear();
        slot.subscribed_to.clear();
        true
    }

    pub fn set_slot_permissions(&mut self, slot_id: &str, permissions: Permissions) -> bool {
        let Some(slot) = self.find_slot_mut(slot_id) else { return false };
        slot.permissions = permissions;
        true
    }

    pub fn set_engine_permissions(&mut self, engine_name: &str, permissions: Permissions) -> bool {
        let Some(row) = self.row_for_mut(engine_name) else { return false };
        row.permissions = permissions;
        true
    }

    /// Queue an inbound message on a slot. Requires `push` permission.
    pub fn push_to_slot(&mut self, slot_id: &str, data: serde_json::Value, source: Option<&str>) -> bool {
        let Some(slot) = self.find_slot_mut(slot_id) else { return false };
        if !slot.permissions.push {
            return false;
        }
        slot.input_buffer.push_back(BufferedInput {
            data,
            source: source.map(str::to_string),
            received_at: crate::util::unix_time_now(),
        });
        while slot.input_buffer.len() > SLOT_BUFFER_CAPACITY {
            slot.input_buffer.pop_front();
        }
        true
    }

    /// Drain (and return) all queued inbound messages for a slot.
    pub fn drain_input_buffer(&mut self, slot_id: &str) -> Vec<BufferedInput> {
        let Some(slot) = self.find_slot_mut(slot_id) else { return Vec::new() };
        slot.input_buffer.drain(..).collect()
    }

    /// Most recent `last_n` output records for a slot. Requires `get`
    /// permission; returns `None` for an unknown slot or denial.
    pub fn read_slot_output(&self, slot_id: &str, last_n: usize) -> Option<Vec<OutputRecord>> {
        let slot = self.find_slot(slot_id)?;
        if !slot.permissions.get {
            return None;
        }
        let skip = slot.output_buffer.len().saturating_sub(last_n);
        Some(slot.output_buffer.iter().skip(skip).cloned().collect())
    }

    /// Record an execution outcome on a slot: always allowed, since this
    /// records a result the caller already obtained, rather than triggering
    /// a new one. `post` permission instead gates out-of-band execution
    /// triggers, which this registry has no code path for today. Sets the
    /// slot's last-executed version to its currently committed version.
    pub fn record_execution(&mut self, slot_id: &str, success: bool, output: &str, error: &str, elapsed_secs: f64) -> bool {
        let Some(slot) = self.find_slot_mut(slot_id) else { return false };
        slot.executed_version = slot.committed_version;
        slot.output_buffer.push_back(OutputRecord {
            success,
            output: output.to_string(),
            error: error.to_string(),
            elapsed_secs,
            recorded_at: crate::util::unix_time_now(),
        });
        while slot.output_buffer.len() > SLOT_BUFFER_CAPACITY {
            slot.output_buffer.pop_front();
        }
        true
    }

    /// Roll a bound slot's view of the node back to an older history
    /// version's recorded `committed_version`. Requires `del` permission
    /// since it discards the slot's current execution state.
    pub fn rollback_slot(&mut self, slot_id: &str, target_version: u64) -> bool {
        let Some(slot) = self.find_slot_mut(slot_id) else { return false };
        if !slot.permissions.del || slot.bound_node.is_none() {
            return false;
        }
        slot.committed_version = target_version;
        slot.executed_version = slot.executed_version.min(target_version);
        slot.output_buffer.clear();
        true
    }

    /// Register that `subscriber`'s input should receive `publisher`'s output.
    pub fn subscribe(&mut self, subscriber_slot_id: &str, publisher_slot_id: &str) -> bool {
        if self.find_slot(publisher_slot_id).is_none() {
            return false;
        }
        let Some(subscriber) = self.find_slot_mut(subscriber_slot_id) else { return false };
        if !subscriber.subscribed_to.iter().any(|p| p == publisher_slot_id) {
            subscriber.subscribed_to.push(publisher_slot_id.to_string());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_node() -> (SessionLedger, String) {
        let mut ledger = SessionLedger::default();
        let s = ledger.begin_import("f.py", LanguageId::Python, None, None);
        ledger.record_node_imported("n1", "function", "n1", "n1", "print(1)", LanguageId::Python, "f.py", s, serde_json::json!({}));
        (ledger, "n1".to_string())
    }

    #[test]
    fn new_matrix_has_288_free_slots() {
        let reg = NodeRegistry::new();
        let summary = reg.get_matrix_summary();
        assert_eq!(summary.total_capacity, 288);
        assert_eq!(summary.free_count, 288);
        assert_eq!(summary.bound_count, 0);
    }

    #[test]
    fn commit_node_binds_first_free_position() {
        let (ledger, node) = ledger_with_node();
        let mut reg = NodeRegistry::new();
        let slot = reg.commit_node(&ledger, &node, Some("PYTHON"), None, None).unwrap();
        assert_eq!(slot.address, "a1");
        assert_eq!(slot.committed_version, 1);
        assert_eq!(reg.get_slot_by_node(&node).unwrap().slot_id, slot.slot_id);
    }

    #[test]
    fn commit_node_unknown_engine_errors() {
        let (ledger, node) = ledger_with_node();
        let mut reg = NodeRegistry::new();
        assert!(matches!(
            reg.commit_node(&ledger, &node, Some("cobol"), None, None),
            Err(FabricError::UnknownEngine(_))
        ));
    }

    #[test]
    fn commit_node_rejects_a_cell_occupied_by_a_different_node() {
        let mut ledger = SessionLedger::default();
        let mut reg = NodeRegistry::new();
        let s1 = ledger.begin_import("one.py", LanguageId::Python, None, None);
        ledger.record_node_imported("n1", "function", "n1", "n1", "print(1)", LanguageId::Python, "one.py", s1, serde_json::json!({}));
        let s2 = ledger.begin_import("two.py", LanguageId::Python, None, None);
        ledger.record_node_imported("n2", "function", "n2", "n2", "print(2)", LanguageId::Python, "two.py", s2, serde_json::json!({}));

        let slot = reg.commit_node(&ledger, "n1", Some("PYTHON"), None, None).unwrap();
        assert!(matches!(
            reg.commit_node(&ledger, "n2", Some("PYTHON"), Some(slot.position), None),
            Err(FabricError::Conflict(_))
        ));
        assert_eq!(reg.get_slot_by_node("n1").unwrap().slot_id, slot.slot_id, "original binding must survive a rejected commit");
    }

    #[test]
    fn record_execution_does_not_require_post_permission() {
        let (ledger, node) = ledger_with_node();
        let mut reg = NodeRegistry::new();
        let slot = reg.commit_node(&ledger, &node, Some("PYTHON"), None, None).unwrap();
        reg.set_slot_permissions(&slot.slot_id, Permissions { get: true, push: true, post: false, del: false });
        assert!(reg.record_execution(&slot.slot_id, true, "1", "", 0.01));
        let committed = reg.get_slot(&slot.slot_id).unwrap();
        assert_eq!(committed.executed_version, committed.committed_version);
    }

    #[test]
    fn row_full_is_reported_not_panicked() {
        let mut ledger = SessionLedger::default();
        let mut reg = NodeRegistry::new();
        // Bash row has 16 slots.
        for i in 0..16 {
            let node_id = format!("n{i}");
            let s = ledger.begin_import("f.sh", LanguageId::Bash, None, None);
            ledger.record_node_imported(&node_id, "function", &node_id, &node_id, "echo hi", LanguageId::Bash, "f.sh", s, serde_json::json!({}));
            reg.commit_node(&ledger, &node_id, Some("BASH"), None, None).unwrap();
        }
        let s = ledger.begin_import("f.sh", LanguageId::Bash, None, None);
        ledger.record_node_imported("overflow", "function", "overflow", "overflow", "echo hi", LanguageId::Bash, "f.sh", s, serde_json::json!({}));
        assert!(matches!(
            reg.commit_node(&ledger, "overflow", Some("BASH"), None, None),
            Err(FabricError::RowFull(_))
        ));
    }

    #[test]
    fn dirty_detection_does_not_mutate_committed_version() {
        let (mut ledger, node) = ledger_with_node();
        let mut reg = NodeRegistry::new();
        reg.commit_node(&ledger, &node, Some("PYTHON"), None, None).unwrap();
        assert_eq!(reg.refresh_all_from_ledger(&ledger), 0);
        ledger.record_code_edit(&node, "print(2)", None).unwrap();
        assert_eq!(reg.refresh_all_from_ledger(&ledger), 1);
        let dirty = reg.get_dirty_slots(&ledger);
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].committed_version, 1, "read-only check must not bump committed_version");
    }

    #[test]
    fn permission_denied_push_does_not_mutate_buffer() {
        let (ledger, node) = ledger_with_node();
        let mut reg = NodeRegistry::new();
        let slot = reg.commit_node(&ledger, &node, Some("PYTHON"), None, None).unwrap();
        reg.set_slot_permissions(&slot.slot_id, Permissions { get: true, push: false, post: true, del: false });
        assert!(!reg.push_to_slot(&slot.slot_id, serde_json::json!({"x":1}), None));
        assert!(reg.drain_input_buffer(&slot.slot_id).is_empty());
    }

    #[test]
    fn clear_slot_releases_node_binding() {
        let (ledger, node) = ledger_with_node();
        let mut reg = NodeRegistry::new();
        let slot = reg.commit_node(&ledger, &node, Some("PYTHON"), None, None).unwrap();
        assert!(reg.clear_slot(&slot.slot_id));
        assert!(reg.get_slot_by_node(&node).is_none());
        assert!(reg.get_slot(&slot.slot_id).unwrap().bound_node.is_none());
    }

    #[test]
    fn subscribe_requires_existing_publisher() {
        let mut reg = NodeRegistry::new();
        let sub = reg.get_slot_by_address("a1").unwrap().slot_id;
        assert!(!reg.subscribe(&sub, "slot-b999"));
        let publisher = reg.get_slot_by_address("b1").unwrap().slot_id;
        assert!(reg.subscribe(&sub, &publisher));
    }
}
