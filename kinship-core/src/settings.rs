use std::collections::BTreeMap;

use heck::{ToSnakeCase, ToUpperCamelCase};
use serde::{Deserialize, Serialize};

use crate::error::KinshipResult;

/// Naming convention used to derive foreign keys, connector tables and
/// polymorphic columns from table names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingStyle {
    /// `authors` -> `authorId`, connector `postsTags`.
    #[default]
    Camel,
    /// `authors` -> `author_id`, connector `posts_tags`.
    Snake,
}

/// Column names describing one polymorphic target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolymorphicColumns {
    /// Column holding the discriminator (which table the row points at).
    pub table_field: String,
    /// Column holding the primary key of the pointed-at row.
    pub foreign_key: String,
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Primary key used when the metadata flags none.
    pub primary_key: String,
    pub naming: NamingStyle,
    /// Emit a `debug` event (operation, table and a filter summary with raw
    /// fragments redacted) before every executor call. Rendered SQL is only
    /// logged by executors, at `trace` level.
    pub log_queries: bool,
    /// Discriminator value stored for a table in polymorphic columns, keyed by
    /// table name. Tables not listed store their own name.
    pub discriminators: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            primary_key: "id".to_owned(),
            naming: NamingStyle::Camel,
            log_queries: true,
            discriminators: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Parses settings from a JSON document. Missing keys take their defaults.
    pub fn from_json_str(json: &str) -> KinshipResult<Self> {
        let settings: Settings = serde_json::from_str(json)?;
        if settings.primary_key.trim().is_empty() {
            return Err(crate::KinshipError::Config(
                "primary_key must not be empty".to_owned(),
            ));
        }
        Ok(settings)
    }

    /// Singular form of a table name, used for single-record fields.
    pub fn singular(&self, table: &str) -> String {
        pluralizer::pluralize(table, 1, false)
    }

    /// Foreign-key column that other tables use to point at `table`.
    pub fn foreign_key(&self, table: &str) -> String {
        let singular = self.singular(table);
        match self.naming {
            NamingStyle::Camel => format!("{}Id", singular),
            NamingStyle::Snake => format!("{}_id", singular.to_snake_case()),
        }
    }

    /// Candidate connector-table names for a many-to-many between `owner` and
    /// `related`, in probing order.
    pub fn connector_candidates(&self, owner: &str, related: &str) -> Vec<String> {
        match self.naming {
            NamingStyle::Camel => vec![
                format!("{}{}", owner, related.to_upper_camel_case()),
                format!("{}{}", related, owner.to_upper_camel_case()),
            ],
            NamingStyle::Snake => vec![
                format!("{}_{}", owner, related),
                format!("{}_{}", related, owner),
            ],
        }
    }

    /// Columns used by the polymorphic target `name`.
    pub fn polymorphic(&self, name: &str) -> PolymorphicColumns {
        match self.naming {
            NamingStyle::Camel => PolymorphicColumns {
                table_field: format!("{}Type", name),
                foreign_key: format!("{}Id", name),
            },
            NamingStyle::Snake => PolymorphicColumns {
                table_field: format!("{}_type", name),
                foreign_key: format!("{}_id", name),
            },
        }
    }

    /// Discriminator value stored for `table`.
    pub fn discriminator_for(&self, table: &str) -> String {
        self.discriminators
            .get(table)
            .cloned()
            .unwrap_or_else(|| table.to_owned())
    }

    /// Table named by a stored discriminator value.
    pub fn table_for_discriminator(&self, value: &str) -> String {
        self.discriminators
            .iter()
            .find(|(_, v)| v.as_str() == value)
            .map(|(table, _)| table.clone())
            .unwrap_or_else(|| value.to_owned())
    }
}
