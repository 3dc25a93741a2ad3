use std::collections::BTreeMap;

use crate::association::{Association, AssociationKind, AssociationTarget};
use crate::error::{KinshipError, KinshipResult};
use crate::schema::{MetadataProvider, SchemaColumn, SchemaTable};
use crate::settings::Settings;
use crate::table::{TableDescriptor, TableKind};

#[derive(Debug, Clone)]
enum Declaration {
    Explicit {
        owner: String,
        kind: AssociationKind,
        target: AssociationTarget,
    },
    ManyToMany {
        owner: String,
        related: String,
    },
}

/// Collects tables and association declarations, then freezes them into a
/// [`Registry`].
///
/// Setup runs in a fixed order: aliases and polymorphic targets are
/// registered, explicit declarations are recorded, polymorphic declarations
/// hand out `ContraPolymorphic` associations, and finally every remaining
/// table pair is classified by naming convention.
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    settings: Settings,
    tables: Vec<SchemaTable>,
    primary_keys: BTreeMap<String, String>,
    aliases: Vec<(String, String)>,
    declarations: Vec<Declaration>,
    polymorphic: Vec<(String, String)>,
}

impl RegistryBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            tables: Vec::new(),
            primary_keys: BTreeMap::new(),
            aliases: Vec::new(),
            declarations: Vec::new(),
            polymorphic: Vec::new(),
        }
    }

    /// Registers every table reported by a metadata provider.
    pub async fn load(mut self, provider: &dyn MetadataProvider) -> KinshipResult<Self> {
        let tables = provider.introspect().await?;
        tracing::debug!(tables = tables.len(), "kinship schema loaded");
        self.tables.extend(tables);
        Ok(self)
    }

    /// Registers one table from its column metadata.
    pub fn table(mut self, table: SchemaTable) -> Self {
        self.tables.retain(|t| t.name != table.name);
        self.tables.push(table);
        self
    }

    /// Registers one table from plain column names. A column named like the
    /// configured default primary key is flagged as primary.
    pub fn columns<I, S>(self, name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let default_pk = self.settings.primary_key.clone();
        let columns = columns
            .into_iter()
            .map(|c| {
                let column = SchemaColumn::new(c);
                if column.name == default_pk {
                    column.primary()
                } else {
                    column
                }
            })
            .collect();
        self.table(SchemaTable {
            name: name.into(),
            columns,
        })
    }

    /// Declares the primary key of a table, overriding metadata.
    pub fn primary_key(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.primary_keys.insert(table.into(), column.into());
        self
    }

    /// Registers `aliases` as other names for `table`.
    pub fn alias<I, S>(mut self, table: impl Into<String>, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        for alias in aliases {
            self.aliases.push((alias.into(), table.clone()));
        }
        self
    }

    pub fn belongs_to<I, S>(self, owner: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets = tables.into_iter().map(AssociationTarget::new);
        self.declare(owner.into(), AssociationKind::BelongsTo, targets)
    }

    pub fn has_many<I, T>(self, owner: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AssociationTarget>,
    {
        self.declare(owner.into(), AssociationKind::HasMany, targets)
    }

    pub fn has_one<I, T>(self, owner: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AssociationTarget>,
    {
        self.declare(owner.into(), AssociationKind::HasOne, targets)
    }

    pub fn paired<I, S>(self, owner: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets = tables.into_iter().map(AssociationTarget::new);
        self.declare(owner.into(), AssociationKind::Paired, targets)
    }

    /// Declares a many-to-many through whichever connector table exists.
    pub fn has_and_belongs_to_many<I, S>(mut self, owner: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let owner = owner.into();
        for related in tables {
            self.declarations.push(Declaration::ManyToMany {
                owner: owner.clone(),
                related: related.into(),
            });
        }
        self
    }

    /// Short form of [`has_and_belongs_to_many`](Self::has_and_belongs_to_many).
    pub fn habtm<I, S>(self, owner: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.has_and_belongs_to_many(owner, tables)
    }

    /// Marks `names` as polymorphic targets pointed at by `owner`'s
    /// `<name>Type`/`<name>Id` columns.
    pub fn polymorphic<I, S>(mut self, owner: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let owner = owner.into();
        for name in names {
            self.polymorphic.push((owner.clone(), name.into()));
        }
        self
    }

    fn declare<I, T>(mut self, owner: String, kind: AssociationKind, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AssociationTarget>,
    {
        for target in targets {
            self.declarations.push(Declaration::Explicit {
                owner: owner.clone(),
                kind,
                target: target.into(),
            });
        }
        self
    }

    /// Runs the setup phase and freezes the result.
    pub fn build(self) -> KinshipResult<Registry> {
        let settings = self.settings;
        let mut tables: BTreeMap<String, TableDescriptor> = BTreeMap::new();

        for table in &self.tables {
            let primary_key = self
                .primary_keys
                .get(&table.name)
                .cloned()
                .or_else(|| table.primary_key().map(str::to_owned))
                .unwrap_or_else(|| settings.primary_key.clone());
            tables.insert(
                table.name.clone(),
                TableDescriptor {
                    name: table.name.clone(),
                    kind: TableKind::Plain,
                    columns: table.columns.iter().map(|c| c.name.clone()).collect(),
                    primary_key,
                    foreign_key: settings.foreign_key(&table.name),
                    associations: BTreeMap::new(),
                },
            );
        }

        for (alias, of) in &self.aliases {
            let target = tables
                .get(of)
                .ok_or_else(|| KinshipError::UnknownTable(of.clone()))?;
            let root = target.sql_name().to_owned();
            let descriptor = TableDescriptor {
                name: alias.clone(),
                kind: TableKind::Alias { of: root },
                columns: target.columns.clone(),
                primary_key: target.primary_key.clone(),
                foreign_key: settings.foreign_key(alias),
                associations: BTreeMap::new(),
            };
            tables.insert(alias.clone(), descriptor);
        }

        for (_, name) in &self.polymorphic {
            tables.insert(
                name.clone(),
                TableDescriptor {
                    name: name.clone(),
                    kind: TableKind::PolymorphicTarget,
                    columns: Vec::new(),
                    primary_key: settings.primary_key.clone(),
                    foreign_key: settings.polymorphic(name).foreign_key,
                    associations: BTreeMap::new(),
                },
            );
        }

        for declaration in &self.declarations {
            let (owner, related, association) = match declaration {
                Declaration::Explicit {
                    owner,
                    kind,
                    target,
                } => {
                    let association = match &target.through {
                        Some(connector) => Association::via(*kind, connector.clone()),
                        None => Association::new(*kind),
                    };
                    (owner, target.table.clone(), association)
                }
                Declaration::ManyToMany { owner, related } => {
                    let connector = settings
                        .connector_candidates(owner, related)
                        .into_iter()
                        .find(|candidate| tables.contains_key(candidate));
                    match connector {
                        Some(connector) => (
                            owner,
                            related.clone(),
                            Association::via(AssociationKind::HasMany, connector),
                        ),
                        None => {
                            tracing::warn!(
                                owner = %owner,
                                related = %related,
                                "kinship found no connector table for many-to-many declaration"
                            );
                            continue;
                        }
                    }
                }
            };
            record(&mut tables, owner, related, association)?;
        }

        for (owner, name) in &self.polymorphic {
            record(
                &mut tables,
                owner,
                name.clone(),
                Association::new(AssociationKind::Polymorphic),
            )?;
            let others: Vec<String> = tables
                .values()
                .filter(|t| {
                    t.kind == TableKind::Plain
                        && t.name != *owner
                        && !t.associations.contains_key(owner)
                })
                .map(|t| t.name.clone())
                .collect();
            for other in others {
                record(
                    &mut tables,
                    &other,
                    owner.clone(),
                    Association::via(AssociationKind::ContraPolymorphic, name.clone()),
                )?;
            }
        }

        let mut inferred = Vec::new();
        for owner in tables.values().filter(|t| t.kind == TableKind::Plain) {
            for related in tables.values() {
                if owner.associations.contains_key(&related.name) {
                    continue;
                }
                if let Some(association) = infer(&settings, &tables, owner, related) {
                    inferred.push((owner.name.clone(), related.name.clone(), association));
                }
            }
        }
        for (owner, related, association) in inferred {
            tracing::trace!(
                owner = %owner,
                related = %related,
                kind = %association.kind,
                "kinship inferred association"
            );
            record(&mut tables, &owner, related, association)?;
        }

        Ok(Registry { settings, tables })
    }
}

fn record(
    tables: &mut BTreeMap<String, TableDescriptor>,
    owner: &str,
    related: String,
    association: Association,
) -> KinshipResult<()> {
    let descriptor = tables
        .get_mut(owner)
        .ok_or_else(|| KinshipError::UnknownTable(owner.to_owned()))?;
    if descriptor.is_alias() {
        return Err(KinshipError::AliasAssociation {
            alias: owner.to_owned(),
            related,
        });
    }
    descriptor.associations.insert(related, association);
    Ok(())
}

fn infer(
    settings: &Settings,
    tables: &BTreeMap<String, TableDescriptor>,
    owner: &TableDescriptor,
    related: &TableDescriptor,
) -> Option<Association> {
    if owner.has_column(related.foreign_key()) {
        return Some(Association::new(AssociationKind::BelongsTo));
    }

    // Aliases are only reachable as belongs-to or through a connector.
    if !related.is_alias() && related.has_column(owner.foreign_key()) {
        return Some(Association::new(AssociationKind::HasMany));
    }

    settings
        .connector_candidates(owner.name(), related.name())
        .into_iter()
        .find(|candidate| tables.contains_key(candidate))
        .map(|connector| Association::via(AssociationKind::HasMany, connector))
}

/// Frozen set of table descriptors with their classified associations.
///
/// Built once by [`RegistryBuilder`] and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct Registry {
    settings: Settings,
    tables: BTreeMap<String, TableDescriptor>,
}

impl Registry {
    pub fn builder(settings: Settings) -> RegistryBuilder {
        RegistryBuilder::new(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    /// Like [`table`](Self::table) but reports unknown names as errors.
    pub fn require(&self, name: &str) -> KinshipResult<&TableDescriptor> {
        self.table(name)
            .ok_or_else(|| KinshipError::UnknownTable(name.to_owned()))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    /// Follows an alias to the table it names; other tables map to themselves.
    pub fn resolve(&self, name: &str) -> Option<&TableDescriptor> {
        let table = self.table(name)?;
        match table.alias_of() {
            Some(of) => self.table(of),
            None => Some(table),
        }
    }

    /// Relationship between `owner` and `related`, if any.
    pub fn classify(&self, owner: &str, related: &str) -> Option<Association> {
        let owner = self.resolve(owner)?;
        if !self.tables.contains_key(related) {
            return None;
        }
        owner.associations.get(related).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blog() -> RegistryBuilder {
        Registry::builder(Settings::default())
            .columns("posts", ["id", "authorId", "title"])
            .columns("authors", ["id", "name"])
            .columns("comments", ["id", "postId", "body"])
            .columns("tags", ["id", "label"])
            .columns("postsTags", ["id", "postId", "tagId"])
    }

    #[test]
    fn infers_belongs_to_and_has_many() {
        let registry = blog().build().unwrap();
        assert_eq!(
            registry.classify("posts", "authors"),
            Some(Association::new(AssociationKind::BelongsTo))
        );
        assert_eq!(
            registry.classify("authors", "posts"),
            Some(Association::new(AssociationKind::HasMany))
        );
        assert_eq!(
            registry.classify("posts", "comments"),
            Some(Association::new(AssociationKind::HasMany))
        );
    }

    #[test]
    fn infers_connector_tables() {
        let registry = blog().build().unwrap();
        assert_eq!(
            registry.classify("posts", "tags"),
            Some(Association::via(AssociationKind::HasMany, "postsTags"))
        );
        assert_eq!(
            registry.classify("tags", "posts"),
            Some(Association::via(AssociationKind::HasMany, "postsTags"))
        );
    }

    #[test]
    fn unknown_or_unrelated_tables_classify_as_none() {
        let registry = blog().build().unwrap();
        assert_eq!(registry.classify("posts", "nope"), None);
        assert_eq!(registry.classify("authors", "tags"), None);
        assert_eq!(registry.classify("nope", "posts"), None);
    }

    #[test]
    fn classification_is_idempotent() {
        let registry = blog().build().unwrap();
        let first = registry.classify("posts", "tags");
        let second = registry.classify("posts", "tags");
        assert_eq!(first, second);
    }

    #[test]
    fn removing_foreign_key_falls_through() {
        let registry = Registry::builder(Settings::default())
            .columns("posts", ["id", "title"])
            .columns("authors", ["id", "name"])
            .build()
            .unwrap();
        assert_eq!(registry.classify("posts", "authors"), None);

        let registry = Registry::builder(Settings::default())
            .columns("posts", ["id", "title"])
            .columns("authors", ["id", "name", "postId"])
            .build()
            .unwrap();
        assert_eq!(
            registry.classify("posts", "authors"),
            Some(Association::new(AssociationKind::HasMany))
        );
    }

    #[test]
    fn explicit_declarations_take_precedence() {
        let registry = blog()
            .has_one("posts", ["comments"])
            .paired("authors", ["tags"])
            .build()
            .unwrap();
        assert_eq!(
            registry.classify("posts", "comments"),
            Some(Association::new(AssociationKind::HasOne))
        );
        assert_eq!(
            registry.classify("authors", "tags"),
            Some(Association::new(AssociationKind::Paired))
        );
    }

    #[test]
    fn declarations_accept_through_suffixes() {
        let registry = blog()
            .has_many("authors", ["tags through posts"])
            .has_one(
                "comments",
                [AssociationTarget::new("tags").through("postsTags")],
            )
            .build()
            .unwrap();
        assert_eq!(
            registry.classify("authors", "tags"),
            Some(Association::via(AssociationKind::HasMany, "posts"))
        );
        assert_eq!(
            registry.classify("comments", "tags"),
            Some(Association::via(AssociationKind::HasOne, "postsTags"))
        );
    }

    #[test]
    fn habtm_finds_connectors_in_either_order() {
        let registry = Registry::builder(Settings::default())
            .columns("posts", ["id"])
            .columns("tags", ["id"])
            .columns("tagsPosts", ["id", "postId", "tagId"])
            .habtm("posts", ["tags"])
            .build()
            .unwrap();
        assert_eq!(
            registry.classify("posts", "tags"),
            Some(Association::via(AssociationKind::HasMany, "tagsPosts"))
        );
    }

    #[test]
    fn aliases_delegate_and_are_only_belongs_to_targets() {
        let registry = Registry::builder(Settings::default())
            .columns("users", ["id", "name"])
            .columns("posts", ["id", "authorId", "userId"])
            .alias("users", ["authors"])
            .build()
            .unwrap();

        let authors = registry.table("authors").unwrap();
        assert!(authors.is_alias());
        assert_eq!(authors.sql_name(), "users");
        assert_eq!(authors.foreign_key(), "authorId");
        assert_eq!(authors.columns(), registry.table("users").unwrap().columns());

        assert_eq!(
            registry.classify("posts", "authors"),
            Some(Association::new(AssociationKind::BelongsTo))
        );
        assert_eq!(
            registry.classify("authors", "posts"),
            registry.classify("users", "posts")
        );
    }

    #[test]
    fn alias_of_unknown_table_is_rejected() {
        let err = Registry::builder(Settings::default())
            .alias("users", ["authors"])
            .build()
            .unwrap_err();
        assert!(matches!(err, KinshipError::UnknownTable(name) if name == "users"));
    }

    #[test]
    fn declarations_on_aliases_are_rejected() {
        let err = Registry::builder(Settings::default())
            .columns("users", ["id"])
            .columns("posts", ["id"])
            .alias("users", ["authors"])
            .has_many("authors", ["posts"])
            .build()
            .unwrap_err();
        assert!(matches!(err, KinshipError::AliasAssociation { .. }));
    }

    #[test]
    fn polymorphic_targets_get_contra_associations() {
        let registry = Registry::builder(Settings::default())
            .columns("comments", ["id", "commentableType", "commentableId", "body"])
            .columns("photos", ["id", "url"])
            .columns("videos", ["id", "url"])
            .columns("authors", ["id"])
            .belongs_to("authors", ["comments"])
            .polymorphic("comments", ["commentable"])
            .build()
            .unwrap();

        assert!(registry.table("commentable").unwrap().is_polymorphic_target());
        assert_eq!(
            registry.classify("comments", "commentable"),
            Some(Association::new(AssociationKind::Polymorphic))
        );
        assert_eq!(
            registry.classify("photos", "comments"),
            Some(Association::via(
                AssociationKind::ContraPolymorphic,
                "commentable"
            ))
        );
        // Explicit declarations are left alone.
        assert_eq!(
            registry.classify("authors", "comments"),
            Some(Association::new(AssociationKind::BelongsTo))
        );
    }

    #[test]
    fn declared_primary_key_overrides_default() {
        let registry = Registry::builder(Settings::default())
            .columns("accounts", ["uuid", "name"])
            .primary_key("accounts", "uuid")
            .columns("posts", ["id"])
            .build()
            .unwrap();
        assert_eq!(registry.table("accounts").unwrap().primary_key(), "uuid");
        assert_eq!(registry.table("posts").unwrap().primary_key(), "id");
    }
}
