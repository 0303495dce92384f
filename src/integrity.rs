// integrity.rs
// Integrity Checker (spec §4.8): scans for violations of I1-I12 and either
// reports them (`check`) or collects a deduplicated repair plan and applies
// it in one transaction (`repair`).

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Connection;

use crate::db::{StorageBackend, TxMode};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ViolationCode {
    SummaryWithoutSource,
    ContextItemMissingConversation,
    ContextItemMissingSourceMessage,
    MessageContextMissingCanonicalMessage,
    LineageEdgeMissingContextItem,
    DuplicateMessageOrdinal,
    DuplicateMessagePartOrdinal,
    OrphanMessagePart,
}

impl ViolationCode {
    pub fn fixable(&self) -> bool {
        matches!(
            self,
            ViolationCode::ContextItemMissingConversation
                | ViolationCode::LineageEdgeMissingContextItem
                | ViolationCode::ContextItemMissingSourceMessage
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub code: ViolationCode,
    pub subject_id: String,
    pub detail: String,
}

/// One deduplicated repair action, keyed by `(sql, params)` per spec §4.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairAction {
    pub sql: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone)]
pub struct RepairReport {
    pub pre_repair_violation_count: usize,
    pub applied: usize,
    pub remaining_violations: Vec<Violation>,
}

/// Runs `sql` (which must filter on `conversation_id = ?1` when `conv_clause`
/// is non-empty) with or without the bound parameter, collecting rows with
/// `row_fn`.
fn query_with_optional_conversation<T>(
    conn: &Connection,
    sql: &str,
    conversation_id: Option<&str>,
    mut row_fn: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = if let Some(cid) = conversation_id {
        stmt.query_map(rusqlite::params![cid], &mut row_fn)?
            .collect::<rusqlite::Result<Vec<T>>>()?
    } else {
        stmt.query_map([], &mut row_fn)?
            .collect::<rusqlite::Result<Vec<T>>>()?
    };
    Ok(rows)
}

fn scan_sync(conn: &Connection, conversation_id: Option<&str>) -> Result<Vec<Violation>> {
    let mut violations = Vec::new();
    let conv_clause = if conversation_id.is_some() { " AND conversation_id = ?1" } else { "" };

    // I11: every summary has >=1 incoming lineage edge.
    for item_id in query_with_optional_conversation::<String>(
        conn,
        &format!(
            "SELECT item_id FROM lcm_context_items
             WHERE item_type = 'summary'{conv_clause}
               AND item_id NOT IN (SELECT child_item_id FROM lcm_lineage_edges)"
        ),
        conversation_id,
        |r| r.get(0),
    )? {
        violations.push(Violation {
            code: ViolationCode::SummaryWithoutSource,
            subject_id: item_id.clone(),
            detail: format!("summary {item_id} has no incoming lineage edge"),
        });
    }

    // context item references a conversation row that does not exist.
    for item_id in query_with_optional_conversation::<String>(
        conn,
        &format!(
            "SELECT item_id FROM lcm_context_items ci
             WHERE 1=1{conv_clause}
               AND NOT EXISTS (SELECT 1 FROM lcm_conversations c WHERE c.conversation_id = ci.conversation_id)"
        ),
        conversation_id,
        |r| r.get(0),
    )? {
        violations.push(Violation {
            code: ViolationCode::ContextItemMissingConversation,
            subject_id: item_id.clone(),
            detail: format!("context item {item_id} references a missing conversation"),
        });
    }

    // non-message context item still carries a stale source_message_id whose row is gone.
    for item_id in query_with_optional_conversation::<String>(
        conn,
        &format!(
            "SELECT item_id FROM lcm_context_items ci
             WHERE ci.item_type != 'message' AND ci.source_message_id IS NOT NULL{conv_clause}
               AND NOT EXISTS (SELECT 1 FROM lcm_messages m WHERE m.message_id = ci.source_message_id)"
        ),
        conversation_id,
        |r| r.get(0),
    )? {
        violations.push(Violation {
            code: ViolationCode::ContextItemMissingSourceMessage,
            subject_id: item_id.clone(),
            detail: format!("non-message context item {item_id} has a dangling source_message_id"),
        });
    }

    // I6: message-type context item whose canonical message is gone.
    for item_id in query_with_optional_conversation::<String>(
        conn,
        &format!(
            "SELECT item_id FROM lcm_context_items ci
             WHERE ci.item_type = 'message'{conv_clause}
               AND (ci.source_message_id IS NULL
                    OR NOT EXISTS (SELECT 1 FROM lcm_messages m WHERE m.message_id = ci.source_message_id))"
        ),
        conversation_id,
        |r| r.get(0),
    )? {
        violations.push(Violation {
            code: ViolationCode::MessageContextMissingCanonicalMessage,
            subject_id: item_id.clone(),
            detail: format!("message context item {item_id} has no canonical message"),
        });
    }

    // I9: both lineage edge endpoints must resolve to an existing context item.
    let mut stmt = conn.prepare(
        "SELECT parent_item_id, child_item_id FROM lcm_lineage_edges e
         WHERE NOT EXISTS (SELECT 1 FROM lcm_context_items ci WHERE ci.item_id = e.parent_item_id)
            OR NOT EXISTS (SELECT 1 FROM lcm_context_items ci WHERE ci.item_id = e.child_item_id)",
    )?;
    for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))? {
        let (parent, child) = row?;
        violations.push(Violation {
            code: ViolationCode::LineageEdgeMissingContextItem,
            subject_id: format!("{parent}->{child}"),
            detail: format!("lineage edge {parent}->{child} has a missing endpoint"),
        });
    }
    drop(stmt);

    // I1/I3: duplicate (conversation_id, ordinal) pairs.
    for (conversation_id, ordinal) in query_with_optional_conversation::<(String, i64)>(
        conn,
        &format!(
            "SELECT conversation_id, ordinal, COUNT(*) c FROM lcm_messages
             WHERE 1=1{conv_clause}
             GROUP BY conversation_id, ordinal HAVING c > 1"
        ),
        conversation_id,
        |r| Ok((r.get(0)?, r.get(1)?)),
    )? {
        violations.push(Violation {
            code: ViolationCode::DuplicateMessageOrdinal,
            subject_id: format!("{conversation_id}:{ordinal}"),
            detail: format!("conversation {conversation_id} has duplicate ordinal {ordinal}"),
        });
    }

    // I5: duplicate (message_id, part_index) pairs.
    let mut stmt = conn.prepare(
        "SELECT message_id, part_index, COUNT(*) c FROM lcm_message_parts
         GROUP BY message_id, part_index HAVING c > 1",
    )?;
    for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
        let (message_id, part_index) = row?;
        violations.push(Violation {
            code: ViolationCode::DuplicateMessagePartOrdinal,
            subject_id: format!("{message_id}:{part_index}"),
            detail: format!("message {message_id} has duplicate part_index {part_index}"),
        });
    }
    drop(stmt);

    // I4: message part referencing a missing message.
    let mut stmt = conn.prepare(
        "SELECT part_id FROM lcm_message_parts p
         WHERE NOT EXISTS (SELECT 1 FROM lcm_messages m WHERE m.message_id = p.message_id)",
    )?;
    for row in stmt.query_map([], |r| r.get::<_, String>(0))? {
        let part_id = row?;
        violations.push(Violation {
            code: ViolationCode::OrphanMessagePart,
            subject_id: part_id.clone(),
            detail: format!("message part {part_id} has no owning message"),
        });
    }
    drop(stmt);

    Ok(violations)
}

fn plan_for(violation: &Violation) -> Option<RepairAction> {
    match violation.code {
        ViolationCode::ContextItemMissingConversation => Some(RepairAction {
            sql: "DELETE FROM lcm_context_items WHERE item_id = ?".into(),
            params: vec![violation.subject_id.clone()],
        }),
        ViolationCode::ContextItemMissingSourceMessage => Some(RepairAction {
            sql: "UPDATE lcm_context_items SET source_message_id = NULL WHERE item_id = ?".into(),
            params: vec![violation.subject_id.clone()],
        }),
        ViolationCode::LineageEdgeMissingContextItem => {
            let (parent, child) = violation.subject_id.split_once("->")?;
            Some(RepairAction {
                sql: "DELETE FROM lcm_lineage_edges WHERE parent_item_id = ? AND child_item_id = ?".into(),
                params: vec![parent.to_string(), child.to_string()],
            })
        }
        _ => None,
    }
}

fn apply_plan_sync(conn: &Connection, plan: &[RepairAction]) -> Result<usize> {
    for action in plan {
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            action.params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        conn.execute(&action.sql, param_refs.as_slice())?;
    }
    Ok(plan.len())
}

/// Read-only/repair scans over the conversation graph's structural
/// invariants. Every query runs with the same `conn` within one call so
/// `repair` observes a consistent pre-repair snapshot before its write
/// transaction.
pub struct IntegrityChecker {
    backend: Arc<StorageBackend>,
}

impl IntegrityChecker {
    pub fn new(backend: Arc<StorageBackend>) -> Self {
        Self { backend }
    }

    pub async fn check(&self, conversation_id: Option<&str>) -> Result<CheckReport> {
        let conversation_id = conversation_id.map(|s| s.to_string());
        let violations = self
            .backend
            .run(move |conn| scan_sync(conn, conversation_id.as_deref()))
            .await?;
        Ok(CheckReport { violations })
    }

    pub async fn repair(&self, conversation_id: Option<&str>) -> Result<RepairReport> {
        let conversation_id_for_scan = conversation_id.map(|s| s.to_string());
        let pre_violations = self
            .backend
            .run(move |conn| scan_sync(conn, conversation_id_for_scan.as_deref()))
            .await?;
        let pre_repair_violation_count = pre_violations.len();

        let mut seen: HashSet<(String, Vec<String>)> = HashSet::new();
        let mut plan = Vec::new();
        for violation in &pre_violations {
            if let Some(action) = plan_for(violation) {
                let key = (action.sql.clone(), action.params.clone());
                if seen.insert(key) {
                    plan.push(action);
                }
            }
        }

        let applied = if plan.is_empty() {
            0
        } else {
            self.backend
                .with_transaction(TxMode::Immediate, 3, move |conn| apply_plan_sync(conn, &plan))
                .await?
        };

        let conversation_id_for_rescan = conversation_id.map(|s| s.to_string());
        let remaining_violations = self
            .backend
            .run(move |conn| scan_sync(conn, conversation_id_for_rescan.as_deref()))
            .await?;

        Ok(RepairReport {
            pre_repair_violation_count,
            applied,
            remaining_violations,
        })
    }
}
