//! Relational schema introspection over `information_schema`.
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::postgres::PgPool;
use std::collections::BTreeMap;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
}

const TABLES_SQL: &str = "SELECT table_name FROM information_schema.tables \
     WHERE table_schema = {p} AND table_type = 'BASE TABLE' ORDER BY table_name";

const COLUMNS_SQL: &str = "SELECT table_name, column_name, data_type, is_nullable, column_default \
     FROM information_schema.columns WHERE table_schema = {p} \
     ORDER BY table_name, ordinal_position";

impl Dialect {
    fn placeholder(&self) -> &'static str {
        match self {
            Dialect::Postgres => "$1",
            Dialect::MySql => "?",
        }
    }

    pub fn tables_sql(&self) -> String {
        TABLES_SQL.replace("{p}", self.placeholder())
    }

    pub fn columns_sql(&self) -> String {
        COLUMNS_SQL.replace("{p}", self.placeholder())
    }

    /// Schema to inspect when the caller names none: `public` on Postgres, the database itself on MySQL.
    pub fn default_schema(&self, database: &str) -> String {
        match self {
            Dialect::Postgres => "public".to_string(),
            Dialect::MySql => database.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

type ColumnRow = (String, String, String, String, Option<String>);

/// Attach ordered column rows to their tables; tables keep the listed order.
pub fn assemble(tables: Vec<String>, columns: Vec<ColumnRow>) -> Vec<TableInfo> {
    let mut by_table: BTreeMap<String, Vec<ColumnInfo>> = BTreeMap::new();
    for (table, name, data_type, is_nullable, default) in columns {
        by_table.entry(table).or_default().push(ColumnInfo {
            name,
            data_type,
            nullable: is_nullable.eq_ignore_ascii_case("YES"),
            default,
        });
    }
    tables
        .into_iter()
        .map(|name| {
            let columns = by_table.remove(&name).unwrap_or_default();
            TableInfo { name, columns }
        })
        .collect()
}

#[instrument(skip(pool))]
pub async fn introspect_postgres(pool: &PgPool, schema: &str) -> Result<Vec<TableInfo>> {
    let tables: Vec<(String,)> = sqlx::query_as(&Dialect::Postgres.tables_sql())
        .bind(schema)
        .fetch_all(pool)
        .await
        .context("failed to list tables")?;
    let columns: Vec<ColumnRow> = sqlx::query_as(&Dialect::Postgres.columns_sql())
        .bind(schema)
        .fetch_all(pool)
        .await
        .context("failed to list columns")?;
    let out = assemble(tables.into_iter().map(|(t,)| t).collect(), columns);
    info!(tables = out.len(), schema, "introspected schema");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialects_share_sql_shape() {
        let pg = Dialect::Postgres.columns_sql();
        let my = Dialect::MySql.columns_sql();
        assert!(pg.contains("table_schema = $1"));
        assert!(my.contains("table_schema = ?"));
        assert_eq!(pg.replace("$1", "?"), my);
        assert!(Dialect::MySql.tables_sql().ends_with("ORDER BY table_name"));
    }

    #[test]
    fn default_schema_per_dialect() {
        assert_eq!(Dialect::Postgres.default_schema("shop"), "public");
        assert_eq!(Dialect::MySql.default_schema("shop"), "shop");
    }

    #[test]
    fn assemble_groups_columns_in_order() {
        let tables = vec!["orders".to_string(), "users".to_string(), "empty".to_string()];
        let cols = vec![
            ("orders".into(), "id".into(), "integer".into(), "NO".into(), None),
            ("orders".into(), "note".into(), "text".into(), "YES".into(), Some("''::text".into())),
            ("users".into(), "email".into(), "text".into(), "NO".into(), None),
        ];
        let out = assemble(tables, cols);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].columns[1].name, "note");
        assert!(out[0].columns[1].nullable);
        assert!(!out[0].columns[0].nullable);
        assert!(out[2].columns.is_empty());
    }
}
