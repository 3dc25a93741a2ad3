use crate::table::TableDescriptor;

/// The kind of relationship between an owner table and a related table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationKind {
    /// The owner holds the related table's foreign key.
    BelongsTo,
    /// The related table holds the owner's foreign key.
    HasMany,
    /// `HasMany` attaching only the first related row.
    HasOne,
    /// Symmetric one-to-one sharing the primary key.
    Paired,
    /// The owner points at rows of several tables through a discriminator column.
    Polymorphic,
    /// The reverse side of a polymorphic association.
    ContraPolymorphic,
}

impl AssociationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelongsTo => "belongs_to",
            Self::HasMany => "has_many",
            Self::HasOne => "has_one",
            Self::Paired => "paired",
            Self::Polymorphic => "polymorphic",
            Self::ContraPolymorphic => "contra_polymorphic",
        }
    }
}

impl std::fmt::Display for AssociationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified relationship, as seen from the owner table.
///
/// For `ContraPolymorphic`, `through` names the polymorphic target whose
/// columns live on the related table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub kind: AssociationKind,
    pub through: Option<String>,
}

impl Association {
    pub fn new(kind: AssociationKind) -> Self {
        Self {
            kind,
            through: None,
        }
    }

    pub fn via(kind: AssociationKind, connector: impl Into<String>) -> Self {
        Self {
            kind,
            through: Some(connector.into()),
        }
    }

    /// Whether related rows are attached as one record instead of a list.
    pub fn is_single(&self) -> bool {
        self.kind == AssociationKind::HasOne
    }
}

/// Right-hand side of an association declaration: a related table, optionally
/// reached through a connector table.
///
/// Strings of the form `"tags through postsTags"` or `"tags via postsTags"`
/// (case-insensitive keyword) carry the connector inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationTarget {
    pub table: String,
    pub through: Option<String>,
}

impl AssociationTarget {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            through: None,
        }
    }

    pub fn through(mut self, connector: impl Into<String>) -> Self {
        self.through = Some(connector.into());
        self
    }

    fn parse(input: &str) -> Self {
        let tokens: Vec<&str> = input.split_whitespace().collect();
        let keyword = tokens.iter().enumerate().position(|(i, token)| {
            i > 0
                && i + 1 < tokens.len()
                && (token.eq_ignore_ascii_case("through") || token.eq_ignore_ascii_case("via"))
        });
        match keyword {
            Some(i) => Self {
                table: tokens[..i].join(" "),
                through: Some(tokens[i + 1..].join(" ")),
            },
            None => Self::new(input.trim()),
        }
    }
}

impl From<&str> for AssociationTarget {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for AssociationTarget {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&TableDescriptor> for AssociationTarget {
    fn from(value: &TableDescriptor) -> Self {
        Self::new(value.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_through_and_via_suffixes() {
        let target = AssociationTarget::from("tags through postsTags");
        assert_eq!(target.table, "tags");
        assert_eq!(target.through.as_deref(), Some("postsTags"));

        let target = AssociationTarget::from("tags VIA   postsTags");
        assert_eq!(target.table, "tags");
        assert_eq!(target.through.as_deref(), Some("postsTags"));
    }

    #[test]
    fn plain_names_have_no_connector() {
        assert_eq!(AssociationTarget::from("tags"), AssociationTarget::new("tags"));
        // A lone keyword is a table name, not a connector marker.
        assert_eq!(AssociationTarget::from("via").through, None);
        assert_eq!(AssociationTarget::from("tags via").through, None);
    }

    #[test]
    fn has_one_is_single() {
        assert!(Association::new(AssociationKind::HasOne).is_single());
        assert!(Association::via(AssociationKind::HasOne, "postsTags").is_single());
        assert!(!Association::new(AssociationKind::HasMany).is_single());
    }
}
