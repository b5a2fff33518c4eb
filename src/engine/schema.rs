//! Static schema for the indexing store
//!
//! Five tables: a singleton `details` row carrying the instance id and
//! schema version, `files` and `locks` for the directory abstraction,
//! and the two map/reduce result tables. Rows are addressed by an
//! engine-assigned id (the primary ordering); every other access path
//! is a named secondary ordering declared here.
//!
//! Columns introduced by a later schema version are appended at the
//! end of their table with a default, so rows logged by an older
//! version decode as short rows and are padded on insert.

use super::value::{ColumnKind, Value};

/// Schema version written to the details row of newly created stores.
pub const SCHEMA_VERSION: &str = "1.1";

/// Default for a column added by a later schema version, applied to
/// rows written before the column existed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultValue {
    Int(i64),
}

impl DefaultValue {
    pub fn to_value(self) -> Value {
        match self {
            DefaultValue::Int(v) => Value::Int(v),
        }
    }
}

/// One column of a table.
#[derive(Debug)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// Default applied to rows written before this column existed.
    pub default: Option<DefaultValue>,
}

/// One component of a secondary ordering.
#[derive(Debug, Clone, Copy)]
pub struct IndexColumn {
    pub column: &'static str,
    pub descending: bool,
}

/// A named secondary ordering over a table.
#[derive(Debug)]
pub struct IndexDef {
    pub name: &'static str,
    pub columns: &'static [IndexColumn],
    pub unique: bool,
}

/// A table definition: columns in physical order plus its orderings.
#[derive(Debug)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub indexes: &'static [IndexDef],
}

impl TableDef {
    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

const fn col(name: &'static str, kind: ColumnKind) -> ColumnDef {
    ColumnDef {
        name,
        kind,
        default: None,
    }
}

const ASC: bool = false;
const DESC: bool = true;

const fn idx_col(column: &'static str, descending: bool) -> IndexColumn {
    IndexColumn { column, descending }
}

pub static DETAILS: TableDef = TableDef {
    name: "details",
    columns: &[col("id", ColumnKind::Bytes), col("schema_version", ColumnKind::Text)],
    indexes: &[],
};

pub static FILES: TableDef = TableDef {
    name: "files",
    columns: &[
        col("directory", ColumnKind::Text),
        col("name", ColumnKind::Text),
        col("modified", ColumnKind::Int),
        col("data", ColumnKind::Bytes),
    ],
    indexes: &[IndexDef {
        name: "by_path",
        columns: &[idx_col("directory", ASC), idx_col("name", ASC)],
        unique: true,
    }],
};

pub static LOCKS: TableDef = TableDef {
    name: "locks",
    columns: &[col("directory", ColumnKind::Text), col("name", ColumnKind::Text)],
    indexes: &[IndexDef {
        name: "by_path",
        columns: &[idx_col("directory", ASC), idx_col("name", ASC)],
        unique: true,
    }],
};

pub static MAPPED_RESULTS: TableDef = TableDef {
    name: "mapped_results",
    columns: &[
        col("view", ColumnKind::Text),
        col("reduce_key", ColumnKind::Text),
        col("document_key", ColumnKind::Text),
        col("data", ColumnKind::Bytes),
        col("etag", ColumnKind::Int),
        col("timestamp", ColumnKind::Int),
        col("reduce_key_and_view_hashed", ColumnKind::Bytes),
        // added by schema 1.1
        ColumnDef {
            name: "reduce_group_id",
            kind: ColumnKind::Int,
            default: Some(DefaultValue::Int(-1)),
        },
    ],
    indexes: &[
        IndexDef {
            name: "by_reduce_key_and_view_hashed",
            columns: &[idx_col("reduce_key_and_view_hashed", ASC), idx_col("reduce_group_id", ASC)],
            unique: false,
        },
        IndexDef {
            name: "by_view_and_doc_key",
            columns: &[idx_col("view", ASC), idx_col("document_key", ASC)],
            unique: false,
        },
        IndexDef {
            name: "by_view",
            columns: &[idx_col("view", ASC)],
            unique: false,
        },
        IndexDef {
            name: "by_view_and_etag",
            columns: &[idx_col("view", ASC), idx_col("etag", DESC)],
            unique: false,
        },
    ],
};

pub static REDUCE_RESULTS: TableDef = TableDef {
    name: "reduce_results",
    columns: &[
        col("view", ColumnKind::Text),
        col("reduce_key", ColumnKind::Text),
        col("data", ColumnKind::Bytes),
        col("etag", ColumnKind::Int),
        col("timestamp", ColumnKind::Int),
        col("reduce_key_and_view_hashed", ColumnKind::Bytes),
        // added by schema 1.1
        ColumnDef {
            name: "reduce_group_id",
            kind: ColumnKind::Int,
            default: Some(DefaultValue::Int(-1)),
        },
    ],
    indexes: &[
        IndexDef {
            name: "by_reduce_key_and_view_hashed",
            columns: &[idx_col("reduce_key_and_view_hashed", ASC), idx_col("reduce_group_id", ASC)],
            unique: false,
        },
        IndexDef {
            name: "by_view",
            columns: &[idx_col("view", ASC)],
            unique: false,
        },
    ],
};

/// Identifies one of the five tables, stable across the log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TableId {
    Details = 0,
    Files = 1,
    Locks = 2,
    MappedResults = 3,
    ReduceResults = 4,
}

impl TableId {
    pub const ALL: [TableId; 5] = [
        TableId::Details,
        TableId::Files,
        TableId::Locks,
        TableId::MappedResults,
        TableId::ReduceResults,
    ];

    pub fn def(self) -> &'static TableDef {
        match self {
            TableId::Details => &DETAILS,
            TableId::Files => &FILES,
            TableId::Locks => &LOCKS,
            TableId::MappedResults => &MAPPED_RESULTS,
            TableId::ReduceResults => &REDUCE_RESULTS,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<TableId> {
        match value {
            0 => Some(TableId::Details),
            1 => Some(TableId::Files),
            2 => Some(TableId::Locks),
            3 => Some(TableId::MappedResults),
            4 => Some(TableId::ReduceResults),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ids_roundtrip() {
        for id in TableId::ALL {
            assert_eq!(TableId::from_u8(id.as_u8()), Some(id));
        }
        assert_eq!(TableId::from_u8(9), None);
    }

    #[test]
    fn every_index_column_resolves() {
        for id in TableId::ALL {
            let def = id.def();
            for index in def.indexes {
                for component in index.columns {
                    assert!(
                        def.column_index(component.column).is_some(),
                        "{}.{} references unknown column {}",
                        def.name,
                        index.name,
                        component.column
                    );
                }
            }
        }
    }

    #[test]
    fn migration_added_columns_are_trailing_with_defaults() {
        for def in [&MAPPED_RESULTS, &REDUCE_RESULTS] {
            let tail = def.columns.last().unwrap();
            assert_eq!(tail.name, "reduce_group_id");
            assert_eq!(tail.default, Some(DefaultValue::Int(-1)));
        }
    }
}
