/// Kinship-specific error type with actionable variants.
#[derive(Debug)]
pub enum KinshipError {
    /// Underlying sqlx error.
    Sqlx(sqlx::Error),
    /// A table name that is not part of the loaded schema.
    UnknownTable(String),
    /// A membership condition (`col IN (...)`) was given an empty list.
    EmptyMembership { table: String, column: String },
    /// A where- or set-condition given as a JSON value that is neither an
    /// object nor a string.
    InvalidCondition { table: String, found: String },
    /// An update without any assignments.
    EmptyUpdate { table: String },
    /// A delete without a where-clause and without a limit.
    UnscopedDelete { table: String },
    /// A delete carrying an offset.
    OffsetDelete { table: String },
    /// A `through` association whose hops are themselves `through` associations.
    NestedThrough {
        owner: String,
        connector: String,
        related: String,
    },
    /// A `through` association with a hop that cannot be classified.
    IncompleteThrough {
        owner: String,
        connector: String,
        related: String,
    },
    /// The same association was requested twice in one prefetch call.
    DuplicatePrefetch { table: String, related: String },
    /// An association was declared on an alias table.
    AliasAssociation { alias: String, related: String },
    /// Invalid settings.
    Config(String),
    /// Error reported by an executor implementation.
    Executor(String),
    /// Generic message error.
    Message(String),
}

impl std::fmt::Display for KinshipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlx(err) => write!(f, "sqlx error: {}", err),
            Self::UnknownTable(table) => write!(f, "unknown table '{}'", table),
            Self::EmptyMembership { table, column } => write!(
                f,
                "empty value list for membership condition on {}.{}",
                table, column
            ),
            Self::InvalidCondition { table, found } => write!(
                f,
                "condition on '{}' must be an object or a string, got {}",
                table, found
            ),
            Self::EmptyUpdate { table } => {
                write!(f, "update on '{}' has no assignments", table)
            }
            Self::UnscopedDelete { table } => {
                write!(f, "refusing delete on '{}' without conditions", table)
            }
            Self::OffsetDelete { table } => {
                write!(f, "offset cannot be used for delete queries on '{}'", table)
            }
            Self::NestedThrough {
                owner,
                connector,
                related,
            } => write!(
                f,
                "nested 'through' associations are not supported ({} -> {} -> {})",
                owner, connector, related
            ),
            Self::IncompleteThrough {
                owner,
                connector,
                related,
            } => write!(
                f,
                "'through' pathway incomplete ({} -> {} -> {})",
                owner, connector, related
            ),
            Self::DuplicatePrefetch { table, related } => write!(
                f,
                "association '{}' requested twice while prefetching for '{}'",
                related, table
            ),
            Self::AliasAssociation { alias, related } => write!(
                f,
                "alias '{}' cannot declare an association with '{}'",
                alias, related
            ),
            Self::Config(message) => write!(f, "invalid settings: {}", message),
            Self::Executor(message) => write!(f, "executor error: {}", message),
            Self::Message(message) => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for KinshipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlx(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for KinshipError {
    fn from(err: sqlx::Error) -> Self {
        Self::Sqlx(err)
    }
}

impl From<serde_json::Error> for KinshipError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result alias for Kinship operations.
pub type KinshipResult<T> = Result<T, KinshipError>;

impl KinshipError {
    /// Returns true for errors caused by misuse of the API rather than by the database.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTable(_)
                | Self::EmptyMembership { .. }
                | Self::InvalidCondition { .. }
                | Self::EmptyUpdate { .. }
                | Self::UnscopedDelete { .. }
                | Self::OffsetDelete { .. }
                | Self::NestedThrough { .. }
                | Self::IncompleteThrough { .. }
                | Self::DuplicatePrefetch { .. }
                | Self::AliasAssociation { .. }
        )
    }
}
