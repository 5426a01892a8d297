//! PostgreSQL staging store.
//!
//! Entity columns are stored as `TEXT` (extracts are untyped), next to the four
//! load-tracking columns. A partial unique index over the key columns keeps at most
//! one active row per key while soft-deleted history accumulates. The index treats null
//! key parts as equal (`NULLS NOT DISTINCT`, PostgreSQL 15+), the same way the key
//! predicates and the in-memory store do.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmd_core::{
    CompositeKey, StagingRow, StagingTarget, DELETE_REASON_COLUMN, IS_DELETED_COLUMN,
    LOAD_TIMESTAMP_COLUMN, LOAD_TYPE_COLUMN, TRACKING_COLUMNS,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;

use crate::staging::{StagingStore, UpsertOutcome};

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone)]
pub struct PgStagingStore {
    pool: PgPool,
}

impl PgStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, acquire_timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to staging database")?;
        Ok(Self { pool })
    }

    /// Pool that opens connections on first use; commands that never stage stay offline.
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .context("parsing staging database url")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn qualified_table(target: &StagingTarget) -> String {
    format!("{}.{}", quote_ident(&target.schema), quote_ident(&target.table))
}

fn entity_columns(columns: &[String]) -> impl Iterator<Item = &String> {
    columns
        .iter()
        .filter(|c| !TRACKING_COLUMNS.contains(&c.as_str()))
}

pub fn create_table_sql(target: &StagingTarget, columns: &[String]) -> String {
    let mut defs: Vec<String> = entity_columns(columns)
        .map(|c| format!("{} TEXT", quote_ident(c)))
        .collect();
    defs.push(format!("{} TIMESTAMPTZ NOT NULL", quote_ident(LOAD_TIMESTAMP_COLUMN)));
    defs.push(format!("{} TEXT NOT NULL", quote_ident(LOAD_TYPE_COLUMN)));
    defs.push(format!(
        "{} BOOLEAN NOT NULL DEFAULT FALSE",
        quote_ident(IS_DELETED_COLUMN)
    ));
    defs.push(format!("{} TEXT", quote_ident(DELETE_REASON_COLUMN)));
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_table(target),
        defs.join(", ")
    )
}

pub fn active_key_index_sql(target: &StagingTarget, key_columns: &[String]) -> String {
    let mut name = format!("{}_active_key_uq", target.table);
    if name.len() > MAX_IDENTIFIER_LEN {
        let mut cut = MAX_IDENTIFIER_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({}) NULLS NOT DISTINCT WHERE NOT {}",
        quote_ident(&name),
        qualified_table(target),
        key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        quote_ident(IS_DELETED_COLUMN)
    )
}

/// `EXISTS` predicate matching active rows whose key columns equal one of the unnested
/// key tuples bound at `$first_param..`. `IS NOT DISTINCT FROM` lets null key parts match.
pub fn active_key_predicate(key_columns: &[String], first_param: usize) -> String {
    let arrays = (0..key_columns.len())
        .map(|i| format!("${}::text[]", first_param + i))
        .collect::<Vec<_>>()
        .join(", ");
    let aliases = (0..key_columns.len())
        .map(|i| format!("k{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let matches = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("t.{} IS NOT DISTINCT FROM keys.k{i}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "NOT t.{} AND EXISTS (SELECT 1 FROM UNNEST({arrays}) AS keys({aliases}) WHERE {matches})",
        quote_ident(IS_DELETED_COLUMN)
    )
}

/// One text array per key column, in key-column order.
fn key_arrays(key_count: usize, keys: &[CompositeKey]) -> Vec<Vec<Option<String>>> {
    let mut arrays = vec![Vec::with_capacity(keys.len()); key_count];
    for key in keys {
        for (i, array) in arrays.iter_mut().enumerate() {
            array.push(key.parts().get(i).and_then(|v| v.to_text()));
        }
    }
    arrays
}

/// Sorted union of the rows' entity columns.
fn row_columns(rows: &[StagingRow]) -> Vec<String> {
    let mut columns: Vec<String> = rows
        .iter()
        .flat_map(|r| r.record.columns().map(str::to_string))
        .collect();
    columns.sort();
    columns.dedup();
    columns.retain(|c| !TRACKING_COLUMNS.contains(&c.as_str()));
    columns
}

async fn insert_batch(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    target: &StagingTarget,
    rows: &[StagingRow],
) -> anyhow::Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let columns = row_columns(rows);
    let mut column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    column_list.extend(TRACKING_COLUMNS.iter().map(|c| quote_ident(c)));
    let prefix = format!(
        "INSERT INTO {} ({}) ",
        qualified_table(target),
        column_list.join(", ")
    );

    let per_row = columns.len() + TRACKING_COLUMNS.len();
    let chunk_size = (MAX_BIND_PARAMS / per_row).max(1);
    let mut inserted = 0u64;
    for chunk in rows.chunks(chunk_size) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(prefix.clone());
        builder.push_values(chunk, |mut b, row| {
            for column in &columns {
                b.push_bind(row.record.value(column).to_text());
            }
            b.push_bind(row.load_timestamp);
            b.push_bind(row.load_type.as_str());
            b.push_bind(row.is_deleted);
            b.push_bind(row.delete_reason.clone());
        });
        let result = builder
            .build()
            .execute(&mut **tx)
            .await
            .with_context(|| format!("inserting {} rows into {target}", chunk.len()))?;
        inserted += result.rows_affected();
    }
    Ok(inserted)
}

fn bind_keys<'q>(
    mut query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    arrays: Vec<Vec<Option<String>>>,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    for array in arrays {
        query = query.bind(array);
    }
    query
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn ensure_table(
        &self,
        target: &StagingTarget,
        columns: &[String],
        key_columns: &[String],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("beginning ensure_table")?;
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&target.schema)
        ))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("creating schema {}", target.schema))?;
        sqlx::query(&create_table_sql(target, columns))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("creating table {target}"))?;
        for column in entity_columns(columns) {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} TEXT",
                qualified_table(target),
                quote_ident(column)
            ))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("adding column {column} to {target}"))?;
        }
        sqlx::query(&active_key_index_sql(target, key_columns))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("creating key index on {target}"))?;
        tx.commit().await.context("committing ensure_table")?;
        info!(%target, columns = columns.len(), "staging table ready");
        Ok(())
    }

    async fn insert_rows(
        &self,
        target: &StagingTarget,
        _key_columns: &[String],
        rows: &[StagingRow],
    ) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await.context("beginning insert")?;
        let inserted = insert_batch(&mut tx, target, rows).await?;
        tx.commit().await.context("committing insert")?;
        Ok(inserted)
    }

    async fn upsert_by_key(
        &self,
        target: &StagingTarget,
        key_columns: &[String],
        rows: &[StagingRow],
    ) -> anyhow::Result<UpsertOutcome> {
        let keys: Vec<CompositeKey> = rows.iter().map(|r| r.record.key(key_columns)).collect();
        let sql = format!(
            "DELETE FROM {} AS t WHERE {}",
            qualified_table(target),
            active_key_predicate(key_columns, 1)
        );

        let mut tx = self.pool.begin().await.context("beginning upsert")?;
        let replaced = bind_keys(sqlx::query(&sql), key_arrays(key_columns.len(), &keys))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("removing replaced rows from {target}"))?
            .rows_affected();
        let inserted = insert_batch(&mut tx, target, rows).await?;
        tx.commit().await.context("committing upsert")?;
        Ok(UpsertOutcome { replaced, inserted })
    }

    async fn soft_delete(
        &self,
        target: &StagingTarget,
        key_columns: &[String],
        keys: &[CompositeKey],
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> anyhow::Result<u64> {
        let sql = format!(
            "UPDATE {} AS t SET {} = TRUE, {} = $1, {} = 'delete', {} = $2 WHERE {}",
            qualified_table(target),
            quote_ident(IS_DELETED_COLUMN),
            quote_ident(LOAD_TIMESTAMP_COLUMN),
            quote_ident(LOAD_TYPE_COLUMN),
            quote_ident(DELETE_REASON_COLUMN),
            active_key_predicate(key_columns, 3)
        );
        let query = sqlx::query(&sql).bind(at).bind(reason.map(str::to_string));
        let result = bind_keys(query, key_arrays(key_columns.len(), keys))
            .execute(&self.pool)
            .await
            .with_context(|| format!("soft-deleting {} keys in {target}", keys.len()))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmd_core::Value;

    fn target() -> StagingTarget {
        StagingTarget::new("staging", "communications_staging")
    }

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("Communication_Record ID"), "\"Communication_Record ID\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified_table(&target()), "\"staging\".\"communications_staging\"");
    }

    #[test]
    fn create_table_appends_tracking_columns_once() {
        let sql = create_table_sql(
            &target(),
            &["Comm_CommunicationId".to_string(), "_load_type".to_string()],
        );
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"staging\".\"communications_staging\""));
        assert!(sql.contains("\"Comm_CommunicationId\" TEXT"));
        assert_eq!(sql.matches("\"_load_type\"").count(), 1);
        assert!(sql.contains("\"_is_deleted\" BOOLEAN NOT NULL DEFAULT FALSE"));
    }

    #[test]
    fn key_predicate_unnests_one_array_per_key_column() {
        let sql = active_key_predicate(&["a".to_string(), "b".to_string()], 3);
        assert_eq!(
            sql,
            "NOT t.\"_is_deleted\" AND EXISTS (SELECT 1 FROM UNNEST($3::text[], $4::text[]) \
             AS keys(k0, k1) WHERE t.\"a\" IS NOT DISTINCT FROM keys.k0 AND t.\"b\" IS NOT DISTINCT FROM keys.k1)"
        );
    }

    #[test]
    fn active_index_is_partial_and_name_is_bounded() {
        let long = StagingTarget::new("staging", "x".repeat(80));
        let sql = active_key_index_sql(&long, &["id".to_string()]);
        assert!(sql.ends_with("NULLS NOT DISTINCT WHERE NOT \"_is_deleted\""));
        let name = sql
            .split('"')
            .nth(1)
            .expect("quoted index name");
        assert_eq!(name.len(), MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn key_arrays_are_columnar_with_nulls() {
        let keys = vec![
            CompositeKey(vec![Value::text("1"), Value::Null]),
            CompositeKey(vec![Value::text("2"), Value::text("FR")]),
        ];
        let arrays = key_arrays(2, &keys);
        assert_eq!(arrays[0], vec![Some("1".to_string()), Some("2".to_string())]);
        assert_eq!(arrays[1], vec![None, Some("FR".to_string())]);
    }
}
