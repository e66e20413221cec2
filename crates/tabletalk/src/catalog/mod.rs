mod cache;
mod ddl;
mod digest;

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::config::PlatformSpec;
use crate::models::ColumnRef;
use crate::utils::text::identifier_words;

pub use cache::CatalogCache;
pub use digest::CatalogDigest;

pub const DEFAULT_ESTIMATED_ROWS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("unknown platform `{platform}`")]
    UnknownPlatform { platform: String },

    #[error("failed to load schema for platform `{platform}`: {detail}")]
    SchemaLoad { platform: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Integer,
    Real,
    Text,
    Date,
    Boolean,
}

impl SemanticType {
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Real)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
            Self::Date => "date",
            Self::Boolean => "boolean",
        }
    }

    fn infer(declared_type: Option<&str>, column_name: &str) -> Self {
        let declared = declared_type.unwrap_or_default().to_ascii_uppercase();
        if declared.contains("DATE") || declared.contains("TIME") {
            return Self::Date;
        }
        if declared.contains("BOOL") {
            return Self::Boolean;
        }
        if declared.contains("INT") {
            return Self::Integer;
        }
        if ["REAL", "FLOA", "DOUB", "DEC", "NUM"]
            .iter()
            .any(|marker| declared.contains(marker))
        {
            return Self::Real;
        }
        let last_word = identifier_words(column_name).pop().unwrap_or_default();
        if matches!(last_word.as_str(), "date" | "at" | "on") {
            return Self::Date;
        }
        Self::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub declared_type: Option<String>,

    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub primary_key: bool,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub target_table: String,
    pub target_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub foreign_keys: Vec<ForeignKey>,
    pub estimated_rows: u64,
}

impl Table {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|column| column.primary_key)
    }

    #[must_use]
    pub fn foreign_key(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.column.eq_ignore_ascii_case(column))
    }

    /// Columns a person would use to name a row: `*Name*`, else `Title`, else `*Number`.
    #[must_use]
    pub fn label_columns(&self) -> Vec<&Column> {
        let text_columns = || {
            self.columns
                .iter()
                .filter(|column| column.semantic_type == SemanticType::Text && !column.primary_key)
        };
        for marker in ["name", "title", "number"] {
            let matches = text_columns()
                .filter(|column| identifier_words(&column.name).iter().any(|word| word == marker))
                .collect::<Vec<_>>();
            if !matches.is_empty() {
                return matches;
            }
        }
        text_columns().take(1).collect()
    }

    pub fn date_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|column| column.semantic_type == SemanticType::Date)
    }

    /// Numeric columns that carry a measure rather than an identifier.
    pub fn measure_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|column| {
            column.semantic_type.is_numeric()
                && !column.primary_key
                && self.foreign_key(&column.name).is_none()
        })
    }

    pub fn enum_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|column| !column.allowed_values.is_empty())
    }
}

/// Immutable table, column and foreign-key metadata of one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Catalog {
    platform: String,
    tables: Vec<Table>,
}

impl Catalog {
    pub fn load(spec: &PlatformSpec) -> Result<Self, CatalogError> {
        let ddl = std::fs::read_to_string(&spec.ddl_path).map_err(|error| {
            CatalogError::SchemaLoad {
                platform: spec.id.clone(),
                detail: format!("failed to read {}: {error}", spec.ddl_path.display()),
            }
        })?;
        let mut catalog = Self::from_ddl(&spec.id, &ddl)?;
        catalog.refresh_row_estimates(&spec.store_path);
        tracing::info!(
            platform = %spec.id,
            tables = catalog.tables.len(),
            ddl_path = %spec.ddl_path.display(),
            "catalog_loaded"
        );
        Ok(catalog)
    }

    pub fn from_ddl(platform: &str, ddl: &str) -> Result<Self, CatalogError> {
        let tables = ddl::introspect(ddl).map_err(|error| CatalogError::SchemaLoad {
            platform: platform.to_string(),
            detail: format!("{error:#}"),
        })?;
        let catalog = Self {
            platform: platform.to_string(),
            tables,
        };
        catalog.check_foreign_keys()?;
        Ok(catalog)
    }

    /// Row counts from the live store where readable; tables it lacks keep the default.
    pub fn refresh_row_estimates(&mut self, store_path: &Path) {
        let counts = ddl::count_rows(store_path, self.tables.iter().map(|table| table.name.as_str()));
        for table in &mut self.tables {
            table.estimated_rows = counts
                .get(&table.name)
                .copied()
                .unwrap_or(DEFAULT_ESTIMATED_ROWS)
                .max(1);
        }
    }

    #[must_use]
    pub fn with_row_estimate(mut self, table: &str, rows: u64) -> Self {
        if let Some(found) = self
            .tables
            .iter_mut()
            .find(|candidate| candidate.name.eq_ignore_ascii_case(table))
        {
            found.estimated_rows = rows.max(1);
        }
        self
    }

    #[must_use]
    pub fn platform(&self) -> &str {
        &self.platform
    }

    #[must_use]
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn column(&self, reference: &ColumnRef) -> Option<&Column> {
        self.table(&reference.table)?.column(&reference.column)
    }

    /// True when `from` is a foreign-key column pointing at `to`.
    #[must_use]
    pub fn is_foreign_key_edge(&self, from: &ColumnRef, to: &ColumnRef) -> bool {
        self.table(&from.table)
            .and_then(|table| table.foreign_key(&from.column))
            .is_some_and(|fk| {
                fk.target_table.eq_ignore_ascii_case(&to.table)
                    && fk.target_column.eq_ignore_ascii_case(&to.column)
            })
    }

    /// Tables one foreign-key hop away in either direction, excluding `table` itself.
    #[must_use]
    pub fn neighbors(&self, table: &str) -> Vec<&str> {
        let mut neighbors = Vec::new();
        for candidate in &self.tables {
            let outgoing = candidate.name.eq_ignore_ascii_case(table);
            for fk in &candidate.foreign_keys {
                let other = if outgoing {
                    Some(fk.target_table.as_str())
                } else if fk.target_table.eq_ignore_ascii_case(table) {
                    Some(candidate.name.as_str())
                } else {
                    None
                };
                let Some(other) = other else {
                    continue;
                };
                if !other.eq_ignore_ascii_case(table) && !neighbors.contains(&other) {
                    neighbors.push(other);
                }
            }
        }
        neighbors
    }

    fn check_foreign_keys(&self) -> Result<(), CatalogError> {
        for table in &self.tables {
            for fk in &table.foreign_keys {
                let Some(target) = self.table(&fk.target_table) else {
                    return Err(self.load_error(format!(
                        "foreign key {}.{} references missing table `{}`",
                        table.name, fk.column, fk.target_table
                    )));
                };
                if target.column(&fk.target_column).is_none() {
                    return Err(self.load_error(format!(
                        "foreign key {}.{} references missing column `{}.{}`",
                        table.name, fk.column, fk.target_table, fk.target_column
                    )));
                }
            }
        }
        Ok(())
    }

    fn load_error(&self, detail: String) -> CatalogError {
        CatalogError::SchemaLoad {
            platform: self.platform.clone(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Catalog, CatalogError, SemanticType};
    use crate::models::ColumnRef;

    const DDL: &str = r"
        CREATE TABLE Departments (
            DepartmentID INTEGER PRIMARY KEY,
            Name TEXT NOT NULL,
            ManagerID INTEGER REFERENCES Employees (EmployeeID)
        );
        CREATE TABLE Employees (
            EmployeeID INTEGER PRIMARY KEY,
            FirstName TEXT NOT NULL,
            LastName TEXT NOT NULL,
            HireDate DATE NOT NULL,
            Salary REAL,
            DepartmentID INTEGER REFERENCES Departments,
            ManagerID INTEGER REFERENCES Employees (EmployeeID),
            Status TEXT CHECK (Status IN ('active', 'on_leave'))
        );
    ";

    #[test]
    fn introspects_tables_columns_and_keys_in_definition_order() {
        let catalog = Catalog::from_ddl("hr", DDL).expect("ddl should load");
        let names = catalog
            .tables()
            .iter()
            .map(|table| table.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Departments", "Employees"]);

        let employees = catalog.table("employees").expect("lookup is case-insensitive");
        assert_eq!(
            employees.primary_key().map(|column| column.name.as_str()),
            Some("EmployeeID")
        );
        let hire_date = employees.column("HireDate").expect("HireDate exists");
        assert_eq!(hire_date.semantic_type, SemanticType::Date);
        assert!(!hire_date.nullable);

        let status = employees.column("Status").expect("Status exists");
        assert_eq!(status.allowed_values, vec!["active", "on_leave"]);
    }

    #[test]
    fn resolves_implicit_foreign_key_target_to_primary_key() {
        let catalog = Catalog::from_ddl("hr", DDL).expect("ddl should load");
        assert!(catalog.is_foreign_key_edge(
            &ColumnRef::new("Employees", "DepartmentID"),
            &ColumnRef::new("Departments", "DepartmentID"),
        ));
        assert!(catalog.is_foreign_key_edge(
            &ColumnRef::new("Employees", "ManagerID"),
            &ColumnRef::new("Employees", "EmployeeID"),
        ));
        assert_eq!(catalog.neighbors("Employees"), vec!["Departments"]);
    }

    #[test]
    fn rejects_foreign_keys_to_missing_tables() {
        let err = Catalog::from_ddl(
            "broken",
            "CREATE TABLE A (ID INTEGER PRIMARY KEY, GhostID INTEGER REFERENCES Ghosts (ID));",
        )
        .expect_err("dangling foreign key must fail");
        assert!(matches!(
            &err,
            CatalogError::SchemaLoad { detail, .. } if detail.contains("Ghosts")
        ));
    }

    #[test]
    fn rejects_unparseable_ddl() {
        let err = Catalog::from_ddl("broken", "CREATE TABLE (").expect_err("bad ddl must fail");
        assert!(matches!(err, CatalogError::SchemaLoad { .. }));
    }

    #[test]
    fn label_columns_prefer_name_words() {
        let catalog = Catalog::from_ddl("hr", DDL).expect("ddl should load");
        let labels = catalog
            .table("Employees")
            .expect("Employees exists")
            .label_columns()
            .into_iter()
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["FirstName", "LastName"]);
    }

    #[test]
    fn unknown_store_keeps_default_row_estimates() {
        let mut catalog = Catalog::from_ddl("hr", DDL).expect("ddl should load");
        catalog.refresh_row_estimates(std::path::Path::new("/nonexistent/hr.db"));
        assert!(
            catalog
                .tables()
                .iter()
                .all(|table| table.estimated_rows == super::DEFAULT_ESTIMATED_ROWS)
        );
    }
}
