use std::collections::BTreeMap;

use crate::association::Association;

/// What a table descriptor stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableKind {
    /// A real table.
    Plain,
    /// Another name for the table `of`. Metadata is copied from it and
    /// associations are looked up on it.
    Alias { of: String },
    /// A virtual table named by polymorphic columns (`<name>Type`, `<name>Id`).
    PolymorphicTarget,
}

/// Schema-bound handle for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub(crate) name: String,
    pub(crate) kind: TableKind,
    pub(crate) columns: Vec<String>,
    pub(crate) primary_key: String,
    pub(crate) foreign_key: String,
    pub(crate) associations: BTreeMap<String, Association>,
}

impl TableDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TableKind {
        &self.kind
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Column other tables use to reference this one.
    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.kind, TableKind::Alias { .. })
    }

    pub fn alias_of(&self) -> Option<&str> {
        match &self.kind {
            TableKind::Alias { of } => Some(of),
            _ => None,
        }
    }

    pub fn is_polymorphic_target(&self) -> bool {
        self.kind == TableKind::PolymorphicTarget
    }

    /// Name rendered into SQL: the aliased table for aliases.
    pub fn sql_name(&self) -> &str {
        self.alias_of().unwrap_or(&self.name)
    }

    /// Associations recorded on this table, keyed by related table name.
    pub fn associations(&self) -> &BTreeMap<String, Association> {
        &self.associations
    }
}
