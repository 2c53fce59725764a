//! Statement builders. Null values are written as SQL literals so no untyped parameter is ever bound.

use smc_core::{NormalizedRecord, Scalar};

use crate::{ContentSpec, DimensionSpec, StorageError, TableSpec};

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Scalar>,
}

impl Statement {
    fn new() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn placeholder(&mut self, value: &Scalar) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        self.params.push(value.clone());
        format!("${}", self.params.len())
    }
}

fn check_ident(name: &str) -> Result<&str, StorageError> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(name)
    } else {
        Err(StorageError::InvalidSpec(format!("bad identifier {name:?}")))
    }
}

fn required<'a>(
    table: &str,
    record: &'a NormalizedRecord,
    column: &str,
) -> Result<&'a Scalar, StorageError> {
    record.get(column).ok_or_else(|| StorageError::MissingColumn {
        table: table.to_string(),
        column: column.to_string(),
    })
}

fn key_predicate(
    stmt: &mut Statement,
    spec: &TableSpec,
    record: &NormalizedRecord,
) -> Result<String, StorageError> {
    if spec.key_columns.is_empty() {
        return Err(StorageError::InvalidSpec(format!("{} has no key columns", spec.table)));
    }
    let mut clauses = Vec::with_capacity(spec.key_columns.len());
    for column in &spec.key_columns {
        let column = check_ident(column)?;
        let value = required(&spec.table, record, column)?;
        if value.is_null() {
            clauses.push(format!("{column} IS NULL"));
        } else {
            let slot = stmt.placeholder(value);
            clauses.push(format!("{column} = {slot}"));
        }
    }
    Ok(clauses.join(" AND "))
}

pub fn select_exists(spec: &TableSpec, record: &NormalizedRecord) -> Result<Statement, StorageError> {
    let table = check_ident(&spec.table)?;
    let mut stmt = Statement::new();
    let predicate = key_predicate(&mut stmt, spec, record)?;
    stmt.sql = format!("SELECT 1 FROM {table} WHERE {predicate} LIMIT 1");
    Ok(stmt)
}

/// Key columns are mandatory; value columns absent from the record are left to column defaults.
pub fn insert(spec: &TableSpec, record: &NormalizedRecord) -> Result<Statement, StorageError> {
    let table = check_ident(&spec.table)?;
    let mut stmt = Statement::new();
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for column in &spec.key_columns {
        let value = required(&spec.table, record, column)?;
        columns.push(check_ident(column)?);
        values.push(stmt.placeholder(value));
    }
    for column in &spec.value_columns {
        if let Some(value) = record.get(column) {
            columns.push(check_ident(column)?);
            values.push(stmt.placeholder(value));
        }
    }
    stmt.sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    );
    Ok(stmt)
}

/// Overwrites the value columns present in the record for the row matching its business key.
pub fn update(spec: &TableSpec, record: &NormalizedRecord) -> Result<Statement, StorageError> {
    let table = check_ident(&spec.table)?;
    let mut stmt = Statement::new();
    let mut assignments = Vec::new();
    for column in &spec.value_columns {
        if let Some(value) = record.get(column) {
            let column = check_ident(column)?;
            let slot = stmt.placeholder(value);
            assignments.push(format!("{column} = {slot}"));
        }
    }
    if let Some(touch) = &spec.touch_column {
        assignments.push(format!("{} = CURRENT_TIMESTAMP", check_ident(touch)?));
    }
    if assignments.is_empty() {
        return Err(StorageError::InvalidSpec(format!(
            "nothing to update in {table}"
        )));
    }
    let predicate = key_predicate(&mut stmt, spec, record)?;
    stmt.sql = format!(
        "UPDATE {table} SET {} WHERE {predicate}",
        assignments.join(", ")
    );
    Ok(stmt)
}

fn dimension_columns<'a>(
    spec: &'a DimensionSpec,
    key: &[Scalar],
) -> Result<Vec<&'a str>, StorageError> {
    if spec.key_columns.is_empty() || key.len() != spec.key_columns.len() {
        return Err(StorageError::InvalidSpec(format!(
            "{} expects {} key values, got {}",
            spec.table,
            spec.key_columns.len(),
            key.len()
        )));
    }
    // a null key part never conflicts, so every upsert would add a row
    if let Some((column, _)) = spec.key_columns.iter().zip(key).find(|(_, v)| v.is_null()) {
        return Err(StorageError::InvalidSpec(format!(
            "{} key column {column} is null",
            spec.table
        )));
    }
    spec.key_columns.iter().map(|c| check_ident(c)).collect()
}

pub fn find_dimension(spec: &DimensionSpec, key: &[Scalar]) -> Result<Statement, StorageError> {
    let table = check_ident(&spec.table)?;
    let columns = dimension_columns(spec, key)?;
    let mut stmt = Statement::new();
    let predicate = columns
        .iter()
        .zip(key)
        .map(|(column, value)| format!("{column} = {}", stmt.placeholder(value)))
        .collect::<Vec<_>>()
        .join(" AND ");
    stmt.sql = format!("SELECT id::bigint AS id FROM {table} WHERE {predicate} LIMIT 1");
    Ok(stmt)
}

/// The no-op update on conflict makes `RETURNING` yield the id of a row another writer inserted.
pub fn upsert_dimension(
    spec: &DimensionSpec,
    key: &[Scalar],
    labels: &[Scalar],
) -> Result<Statement, StorageError> {
    let table = check_ident(&spec.table)?;
    let key_columns = dimension_columns(spec, key)?;
    let label_columns = spec
        .label_columns
        .iter()
        .take(labels.len())
        .map(|c| check_ident(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = Statement::new();
    let values = key
        .iter()
        .chain(labels.iter().take(label_columns.len()))
        .map(|value| stmt.placeholder(value))
        .collect::<Vec<_>>();
    let columns = key_columns
        .iter()
        .chain(label_columns.iter())
        .copied()
        .collect::<Vec<_>>();
    let on_conflict = if label_columns.is_empty() {
        format!("{0} = EXCLUDED.{0}", key_columns[0])
    } else {
        label_columns
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    stmt.sql = format!(
        "INSERT INTO {table} AS d ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {on_conflict} RETURNING d.id::bigint AS id",
        columns.join(", "),
        values.join(", "),
        key_columns.join(", "),
    );
    Ok(stmt)
}

pub fn bump_content(spec: &ContentSpec, digest: &str) -> Result<Statement, StorageError> {
    let table = check_ident(&spec.table)?;
    Ok(Statement {
        sql: format!(
            "UPDATE {table} SET usage_count = usage_count + 1 WHERE digest = $1 RETURNING id::bigint AS id"
        ),
        params: vec![Scalar::from(digest)],
    })
}

pub fn upsert_content(
    spec: &ContentSpec,
    digest: &str,
    content: &str,
) -> Result<Statement, StorageError> {
    let table = check_ident(&spec.table)?;
    Ok(Statement {
        sql: format!(
            "INSERT INTO {table} AS c (digest, content, usage_count) VALUES ($1, $2, 1) \
             ON CONFLICT (digest) DO UPDATE SET usage_count = c.usage_count + 1 \
             RETURNING c.id::bigint AS id"
        ),
        params: vec![Scalar::from(digest), Scalar::from(content)],
    })
}
