//! Storage-side orchestration shared by every `ReadingBuffer` backend:
//! the `service_schema` registry row and the diff-and-apply logic
//! `create_schema` runs against it.
//!
//! Grounded in the original's `configuration_manager.cpp` diff-and-apply
//! shape, re-expressed without its process-wide singleton — here it is a
//! plain function a backend's `create_schema` calls against its own
//! registry row, not a service owned globally.

use edge_api::storage::{ColumnDefinition, SchemaDefinition, TableDefinition};

/// A backend's persisted record of the last schema it was asked to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSchemaRow {
    pub name: String,
    pub service: String,
    pub version: u32,
    pub definition: SchemaDefinition,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaDiff {
    /// Stored version already matches the requested one — no-op.
    UpToDate,
    Apply(Vec<SchemaChange>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    CreateTable(TableDefinition),
    DropTable(String),
    AddColumn { table: String, column: ColumnDefinition },
    DropColumn { table: String, column: String },
    CreateIndex { table: String, index: String },
    DropIndex { table: String, index: String },
}

/// Diff a requested schema against the last-applied row. Returns
/// `UpToDate` when versions match (callers skip the transaction entirely);
/// otherwise returns the ordered list of changes a backend should run
/// inside one transaction.
pub fn diff_schema(current: Option<&ServiceSchemaRow>, requested: &SchemaDefinition) -> SchemaDiff {
    let Some(current) = current else {
        return SchemaDiff::Apply(requested.tables.iter().cloned().map(SchemaChange::CreateTable).collect());
    };

    if current.version == requested.version {
        return SchemaDiff::UpToDate;
    }

    let mut changes = Vec::new();

    for table in &requested.tables {
        match current.definition.tables.iter().find(|t| t.name == table.name) {
            None => changes.push(SchemaChange::CreateTable(table.clone())),
            Some(existing) => {
                for column in &table.columns {
                    if !existing.columns.iter().any(|c| c.name == column.name) {
                        changes.push(SchemaChange::AddColumn { table: table.name.clone(), column: column.clone() });
                    }
                }
                for column in &existing.columns {
                    if !table.columns.iter().any(|c| c.name == column.name) {
                        changes
                            .push(SchemaChange::DropColumn { table: table.name.clone(), column: column.name.clone() });
                    }
                }
                for index in &table.indexes {
                    if !existing.indexes.contains(index) {
                        changes.push(SchemaChange::CreateIndex { table: table.name.clone(), index: index.clone() });
                    }
                }
                for index in &existing.indexes {
                    if !table.indexes.contains(index) {
                        changes.push(SchemaChange::DropIndex { table: table.name.clone(), index: index.clone() });
                    }
                }
            }
        }
    }

    for existing in &current.definition.tables {
        if !requested.tables.iter().any(|t| t.name == existing.name) {
            changes.push(SchemaChange::DropTable(existing.name.clone()));
        }
    }

    SchemaDiff::Apply(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, cols: &[&str]) -> TableDefinition {
        TableDefinition {
            name: name.to_string(),
            columns: cols.iter().map(|c| ColumnDefinition { name: c.to_string(), sql_type: "TEXT".into() }).collect(),
            indexes: vec![],
        }
    }

    #[test]
    fn matching_version_is_a_no_op() {
        let schema = SchemaDefinition { name: "readings".into(), version: 3, tables: vec![table("readings", &["id"])] };
        let current =
            ServiceSchemaRow { name: "readings".into(), service: "svc".into(), version: 3, definition: schema.clone() };
        assert_eq!(diff_schema(Some(&current), &schema), SchemaDiff::UpToDate);
    }

    #[test]
    fn new_column_produces_add_column_change() {
        let old = SchemaDefinition { name: "readings".into(), version: 1, tables: vec![table("readings", &["id"])] };
        let new =
            SchemaDefinition { name: "readings".into(), version: 2, tables: vec![table("readings", &["id", "ts"])] };
        let current = ServiceSchemaRow { name: "readings".into(), service: "svc".into(), version: 1, definition: old };

        let diff = diff_schema(Some(&current), &new);
        match diff {
            SchemaDiff::Apply(changes) => {
                assert!(changes.iter().any(|c| matches!(c, SchemaChange::AddColumn { column, .. } if column.name == "ts")));
            }
            _ => panic!("expected Apply"),
        }
    }

    #[test]
    fn no_prior_row_creates_every_table() {
        let schema = SchemaDefinition { name: "readings".into(), version: 1, tables: vec![table("readings", &["id"])] };
        let diff = diff_schema(None, &schema);
        assert_eq!(diff, SchemaDiff::Apply(vec![SchemaChange::CreateTable(table("readings", &["id"]))]));
    }
}
