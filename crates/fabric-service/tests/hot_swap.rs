// SPDX-License-Identifier: Apache-2.0
//! A node imported, committed into the matrix, then edited live: the bound
//! slot's committed version should fall behind the ledger's, marking it
//! dirty, until an execution against the new version catches it back up.

use fabric_service::lang::LanguageId;
use fabric_service::ledger::SessionLedger;
use fabric_service::registry::NodeRegistry;

#[test]
fn editing_a_committed_node_marks_its_slot_dirty_until_re_executed() {
    let mut ledger = SessionLedger::default();
    let mut registry = NodeRegistry::new();

    let session = ledger.begin_import("adder.py", LanguageId::Python, Some("def add(a, b):\n    return a + b\n"), None);
    ledger.record_node_imported(
        "node-adder",
        "function",
        "add",
        "add",
        "def add(a, b):\n    return a + b\n",
        LanguageId::Python,
        "adder.py",
        session,
        serde_json::json!({}),
    );

    let slot = registry.commit_node(&ledger, "node-adder", None, None, None).unwrap();
    assert!(registry.get_dirty_slots(&ledger).is_empty(), "freshly committed slot should not be dirty");

    ledger.record_code_edit("node-adder", "def add(a, b):\n    return a + b + 1\n", Some("off-by-one fix")).unwrap();

    let dirty = registry.get_dirty_slots(&ledger);
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].slot_id, slot.slot_id);

    ledger.record_node_executed("node-adder", true, "4", "", 0.01, serde_json::json!({})).unwrap();
    registry.record_execution(&slot.slot_id, true, "4", "", 0.01);

    let recommitted = registry.commit_node(&ledger, "node-adder", None, Some(slot.position), None).unwrap();
    assert_eq!(recommitted.slot_id, slot.slot_id, "hot-swap should rebind the same slot, not allocate a new one");
    assert!(registry.get_dirty_slots(&ledger).is_empty(), "recommitting should clear the dirty flag");

    let snapshot = ledger.get_node_snapshot("node-adder").unwrap();
    assert_eq!(snapshot.version, 1, "a single edit should have bumped the version exactly once");
}
