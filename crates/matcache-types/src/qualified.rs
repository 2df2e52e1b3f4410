//! Fully-qualified backing-table names.

use std::fmt;
use std::str::FromStr;

/// Fully-qualified `catalog.schema.table` name of a backing table.
///
/// Exactly three non-empty dot-separated parts, stored lowercased so that
/// names compare the way the catalog resolves them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct QualifiedName {
    catalog: String,
    schema: String,
    table: String,
}

impl QualifiedName {
    /// Build a qualified name from its three parts.
    ///
    /// Returns [`InvalidQualifiedName`] if any part is empty or contains a
    /// dot.
    pub fn new(
        catalog: &str,
        schema: &str,
        table: &str,
    ) -> Result<Self, InvalidQualifiedName> {
        for part in [catalog, schema, table] {
            if part.is_empty() || part.contains('.') {
                return Err(InvalidQualifiedName {
                    input: format!("{catalog}.{schema}.{table}"),
                });
            }
        }
        Ok(Self {
            catalog: catalog.to_lowercase(),
            schema: schema.to_lowercase(),
            table: table.to_lowercase(),
        })
    }

    /// The catalog part.
    #[must_use]
    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    /// The schema part.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// The table part.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

impl FromStr for QualifiedName {
    type Err = InvalidQualifiedName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(catalog), Some(schema), Some(table), None) => {
                Self::new(catalog, schema, table)
            }
            _ => Err(InvalidQualifiedName {
                input: s.to_string(),
            }),
        }
    }
}

/// Error returned when a qualified name does not have the
/// `catalog.schema.table` shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidQualifiedName {
    /// The offending input.
    pub input: String,
}

impl fmt::Display for InvalidQualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "qualified name must be catalog.schema.table, got '{}'",
            self.input
        )
    }
}

impl std::error::Error for InvalidQualifiedName {}
