use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use rusqlite::{Connection, OpenFlags};

use super::{Column, DEFAULT_ESTIMATED_ROWS, ForeignKey, SemanticType, Table};

/// Materialises the DDL in a scratch in-memory database and reads the structure back out.
pub(super) fn introspect(ddl: &str) -> Result<Vec<Table>> {
    let connection =
        Connection::open_in_memory().context("failed to open scratch sqlite database")?;
    connection
        .execute_batch(ddl)
        .context("failed to apply schema DDL")?;

    let mut statement = connection
        .prepare("SELECT name, sql FROM sqlite_schema WHERE type = 'table'")
        .context("failed to prepare sqlite_schema introspection query")?;
    let object_rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<usize, String>(0)?,
                row.get::<usize, Option<String>>(1)?,
            ))
        })
        .context("failed to execute sqlite_schema introspection query")?;

    let mut tables = Vec::new();
    for row in object_rows {
        let (name, sql) = row.context("failed to decode sqlite_schema row")?;
        if name.starts_with("sqlite_") {
            continue;
        }
        let enums = enumerated_values(sql.as_deref().unwrap_or_default());
        let columns = load_columns(&connection, &name, &enums)?;
        let foreign_keys = load_foreign_keys(&connection, &name, &columns)?;
        tables.push(Table {
            name,
            columns,
            foreign_keys,
            estimated_rows: DEFAULT_ESTIMATED_ROWS,
        });
    }

    if tables.is_empty() {
        bail!("schema DDL defines no tables");
    }
    Ok(tables)
}

fn load_columns(
    connection: &Connection,
    table: &str,
    enums: &HashMap<String, Vec<String>>,
) -> Result<Vec<Column>> {
    let pragma_sql = format!("PRAGMA table_info({})", sqlite_single_quoted(table));
    let mut statement = connection
        .prepare(&pragma_sql)
        .with_context(|| format!("failed to prepare column introspection for `{table}`"))?;

    let column_rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<usize, String>(1)?,
                row.get::<usize, Option<String>>(2)?,
                row.get::<usize, i64>(3)?,
                row.get::<usize, i64>(5)?,
            ))
        })
        .with_context(|| format!("failed to execute column introspection for `{table}`"))?;

    let mut columns = Vec::new();
    for row in column_rows {
        let (name, declared_type, not_null, primary_key_position) =
            row.context("failed to decode schema column row")?;
        let declared_type = declared_type.filter(|declared| !declared.trim().is_empty());
        let allowed_values = enums
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default();
        columns.push(Column {
            semantic_type: SemanticType::infer(declared_type.as_deref(), &name),
            name,
            declared_type,
            nullable: not_null == 0 && primary_key_position == 0,
            primary_key: primary_key_position > 0,
            allowed_values,
        });
    }
    Ok(columns)
}

fn load_foreign_keys(
    connection: &Connection,
    table: &str,
    columns: &[Column],
) -> Result<Vec<ForeignKey>> {
    let pragma_sql = format!("PRAGMA foreign_key_list({})", sqlite_single_quoted(table));
    let mut statement = connection
        .prepare(&pragma_sql)
        .with_context(|| format!("failed to prepare foreign key introspection for `{table}`"))?;

    let fk_rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<usize, String>(2)?,
                row.get::<usize, String>(3)?,
                row.get::<usize, Option<String>>(4)?,
            ))
        })
        .with_context(|| format!("failed to execute foreign key introspection for `{table}`"))?;

    let mut foreign_keys = Vec::new();
    for row in fk_rows {
        let (target_table, column, target_column) =
            row.context("failed to decode foreign key row")?;
        let target_column = match target_column {
            Some(target_column) => target_column,
            None => implicit_target_column(connection, &target_table, table, columns)?,
        };
        foreign_keys.push(ForeignKey {
            column,
            target_table,
            target_column,
        });
    }
    // PRAGMA lists keys newest-first; keep declaration order.
    foreign_keys.reverse();
    Ok(foreign_keys)
}

/// `REFERENCES Parent` with no column list targets the parent's primary key.
fn implicit_target_column(
    connection: &Connection,
    target_table: &str,
    source_table: &str,
    source_columns: &[Column],
) -> Result<String> {
    let target_columns = if target_table.eq_ignore_ascii_case(source_table) {
        source_columns.to_vec()
    } else {
        load_columns(connection, target_table, &HashMap::new())?
    };
    target_columns
        .into_iter()
        .find(|column| column.primary_key)
        .map(|column| column.name)
        .with_context(|| {
            format!("foreign key from `{source_table}` targets `{target_table}` without a primary key")
        })
}

fn check_in_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)CHECK\s*\(\s*["`\[]?(\w+)["`\]]?\s+IN\s*\(([^)]*)\)\s*\)"#)
            .unwrap_or_else(|error| panic!("check constraint pattern must compile: {error}"))
    })
}

fn quoted_value_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"'((?:[^']|'')*)'")
            .unwrap_or_else(|error| panic!("quoted value pattern must compile: {error}"))
    })
}

/// Allowed values from `CHECK (col IN ('a', 'b'))` constraints, keyed by lowercase column name.
fn enumerated_values(table_sql: &str) -> HashMap<String, Vec<String>> {
    check_in_pattern()
        .captures_iter(table_sql)
        .filter_map(|captures| {
            let column = captures.get(1)?.as_str().to_ascii_lowercase();
            let values = quoted_value_pattern()
                .captures_iter(captures.get(2)?.as_str())
                .filter_map(|value| value.get(1).map(|m| m.as_str().replace("''", "'")))
                .collect::<Vec<_>>();
            (!values.is_empty()).then_some((column, values))
        })
        .collect()
}

/// Per-table `COUNT(*)` against the live store; unreadable stores or tables are left out.
pub(super) fn count_rows<'a>(
    store_path: &Path,
    tables: impl Iterator<Item = &'a str>,
) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    if !store_path.is_file() {
        return counts;
    }
    let connection = match Connection::open_with_flags(
        store_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ) {
        Ok(connection) => connection,
        Err(error) => {
            tracing::warn!(store = %store_path.display(), %error, "row_estimates_unavailable");
            return counts;
        }
    };

    for table in tables {
        let sql = format!(
            "SELECT COUNT(*) FROM {}",
            crate::models::plan::quote_ident(table)
        );
        match connection.query_row(&sql, [], |row| row.get::<usize, i64>(0)) {
            Ok(count) => {
                counts.insert(table.to_string(), u64::try_from(count).unwrap_or(0));
            }
            Err(error) => {
                tracing::debug!(table, %error, "row_estimate_skipped");
            }
        }
    }
    counts
}

fn sqlite_single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::enumerated_values;

    #[test]
    fn extracts_check_in_enumerations() {
        let values = enumerated_values(
            "CREATE TABLE T (Kind TEXT CHECK (Kind IN ('a', 'b''c')), \"Lang\" TEXT CHECK(\"Lang\" IN ('en')), Rating INTEGER CHECK (Rating BETWEEN 1 AND 5))",
        );
        assert_eq!(values.get("kind"), Some(&vec!["a".to_string(), "b'c".to_string()]));
        assert_eq!(values.get("lang"), Some(&vec!["en".to_string()]));
        assert!(!values.contains_key("rating"));
    }
}
