// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Each Change is one effect of a ledger statement. A transaction records its
// changes in order; on commit they are applied to the committed tables and
// written into the journal block, so replaying the journal rebuilds state.
//
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single effect recorded by a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// Create a new table
    CreateTable { table: String, table_id: String },

    /// Mark a table inactive; its documents stay in the journal history
    DropTable { table: String, table_id: String },

    /// Add an index on a top-level field
    CreateIndex { table: String, field: String },

    /// Insert a new document
    InsertDocument {
        table: String,
        document_id: String,
        data: Value,
    },

    /// Replace a document revision
    UpdateDocument {
        table: String,
        document_id: String,
        data: Value,
    },

    /// Delete a document
    DeleteDocument { table: String, document_id: String },
}

impl Change {
    /// Get the table name affected by this change
    pub fn table_name(&self) -> &str {
        match self {
            Change::CreateTable { table, .. } => table,
            Change::DropTable { table, .. } => table,
            Change::CreateIndex { table, .. } => table,
            Change::InsertDocument { table, .. } => table,
            Change::UpdateDocument { table, .. } => table,
            Change::DeleteDocument { table, .. } => table,
        }
    }

    /// Check if this is a DDL (Data Definition Language) change
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Change::CreateTable { .. } | Change::DropTable { .. } | Change::CreateIndex { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_table_name() {
        let change = Change::InsertDocument {
            table: "users".to_string(),
            document_id: "d1".to_string(),
            data: json!({"name": "alice"}),
        };
        assert_eq!(change.table_name(), "users");
        assert!(!change.is_ddl());
    }

    #[test]
    fn test_change_classification() {
        let create = Change::CreateTable {
            table: "users".to_string(),
            table_id: "t1".to_string(),
        };
        assert!(create.is_ddl());

        let index = Change::CreateIndex {
            table: "users".to_string(),
            field: "email".to_string(),
        };
        assert!(index.is_ddl());
    }
}
