// sitevault/src/db/postgres.rs
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;

use super::{LiveDatabase, ROW_BATCH_SIZE};
use crate::errors::{Result, VaultError};
use crate::schema::{
    ConfigOverride, FieldDescriptor, FieldType, IndexDescriptor, SchemaChange, TableDescriptor,
};

/// Quotes an identifier for interpolation into SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(PgDatabase { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn describe_table(&self, table_name: &str) -> Result<TableDescriptor> {
        let columns = sqlx::query(
            "SELECT column_name::text AS column_name,
                    udt_name::text AS udt_name,
                    character_maximum_length::int4 AS char_length,
                    numeric_precision::int4 AS num_precision,
                    numeric_scale::int4 AS num_scale,
                    is_nullable::text AS is_nullable,
                    column_default::text AS column_default,
                    is_identity::text AS is_identity
             FROM information_schema.columns
             WHERE table_schema = 'public' AND table_name = $1
             ORDER BY ordinal_position",
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;

        let mut fields = Vec::with_capacity(columns.len());
        for row in &columns {
            let udt: String = row.try_get("udt_name")?;
            let char_length: Option<i32> = row.try_get("char_length")?;
            let precision: Option<i32> = row.try_get("num_precision")?;
            let scale: Option<i32> = row.try_get("num_scale")?;
            let is_nullable: String = row.try_get("is_nullable")?;
            let is_identity: Option<String> = row.try_get("is_identity")?;
            let default: Option<String> = row.try_get("column_default")?;

            let sequence = is_identity.as_deref() == Some("YES")
                || default.as_deref().is_some_and(|d| d.starts_with("nextval("));
            fields.push(FieldDescriptor {
                name: row.try_get("column_name")?,
                field_type: field_type_from_udt(&udt, char_length, precision, scale),
                notnull: is_nullable == "NO",
                // Sequence defaults are recreated from the `sequence` flag.
                default: if sequence { None } else { default },
                sequence,
            });
        }

        let index_rows = sqlx::query(
            "SELECT i.relname::text AS index_name,
                    ix.indisunique AS is_unique,
                    array_agg(a.attname::text ORDER BY k.ord) AS columns
             FROM pg_index ix
             JOIN pg_class t ON t.oid = ix.indrelid
             JOIN pg_class i ON i.oid = ix.indexrelid
             JOIN pg_namespace n ON n.oid = t.relnamespace
             CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
             WHERE n.nspname = 'public' AND t.relname = $1 AND NOT ix.indisprimary
             GROUP BY i.relname, ix.indisunique
             ORDER BY i.relname",
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;

        let indexes = index_rows
            .iter()
            .map(|row| {
                Ok(IndexDescriptor {
                    name: row.try_get("index_name")?,
                    unique: row.try_get("is_unique")?,
                    columns: row.try_get("columns")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        Ok(TableDescriptor {
            name: table_name.to_string(),
            fields,
            indexes,
        })
    }
}

fn field_type_from_udt(
    udt: &str,
    char_length: Option<i32>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> FieldType {
    match udt {
        "int2" => FieldType::Int { bytes: 2 },
        "int4" => FieldType::Int { bytes: 4 },
        "int8" => FieldType::Int { bytes: 8 },
        "varchar" | "bpchar" => match char_length {
            Some(len) if len > 0 => FieldType::Char { length: len as u32 },
            _ => FieldType::Text,
        },
        "text" => FieldType::Text,
        "numeric" => FieldType::Number {
            precision: precision.unwrap_or(38).max(1) as u32,
            scale: scale.unwrap_or(0).max(0) as u32,
        },
        "float4" => FieldType::Float { bytes: 4 },
        "float8" => FieldType::Float { bytes: 8 },
        "bytea" => FieldType::Binary,
        "bool" => FieldType::Boolean,
        "date" => FieldType::Date,
        "timestamp" => FieldType::Timestamp,
        "timestamptz" => FieldType::TimestampTz,
        "json" | "jsonb" => FieldType::Json,
        other => FieldType::Other { name: other.to_string() },
    }
}

fn type_sql(field_type: &FieldType) -> String {
    match field_type {
        FieldType::Int { bytes: 0..=2 } => "smallint".into(),
        FieldType::Int { bytes: 3..=4 } => "integer".into(),
        FieldType::Int { .. } => "bigint".into(),
        FieldType::Char { length } => format!("varchar({})", length),
        FieldType::Text => "text".into(),
        FieldType::Number { precision, scale } => format!("numeric({},{})", precision, scale),
        FieldType::Float { bytes: 0..=4 } => "real".into(),
        FieldType::Float { .. } => "double precision".into(),
        FieldType::Binary => "bytea".into(),
        FieldType::Boolean => "boolean".into(),
        FieldType::Date => "date".into(),
        FieldType::Timestamp => "timestamp".into(),
        FieldType::TimestampTz => "timestamptz".into(),
        FieldType::Json => "jsonb".into(),
        FieldType::Other { name } => name.clone(),
    }
}

fn column_sql(field: &FieldDescriptor) -> String {
    let mut sql = format!("{} {}", quote_ident(&field.name), type_sql(&field.field_type));
    if field.sequence {
        sql.push_str(" GENERATED BY DEFAULT AS IDENTITY");
    } else if let Some(default) = &field.default {
        sql.push_str(&format!(" DEFAULT {}", default));
    }
    if field.notnull {
        sql.push_str(" NOT NULL");
    }
    sql
}

fn index_sql(table: &str, index: &IndexDescriptor) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        quote_ident(table),
        index
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Renders a structural change as the Postgres statements that implement it.
pub(crate) fn render_change(change: &SchemaChange) -> Vec<String> {
    match change {
        SchemaChange::CreateTable { table } => {
            let mut columns: Vec<String> = table.fields.iter().map(column_sql).collect();
            if let Some(seq) = table.sequence_field() {
                columns.push(format!("PRIMARY KEY ({})", quote_ident(&seq.name)));
            }
            let mut statements = vec![format!(
                "CREATE TABLE {} (\n  {}\n)",
                quote_ident(&table.name),
                columns.join(",\n  ")
            )];
            statements.extend(table.indexes.iter().map(|idx| index_sql(&table.name, idx)));
            statements
        }
        SchemaChange::AddColumn { table, field } => vec![format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column_sql(field)
        )],
        SchemaChange::ModifyColumn { table, field } => {
            let column = quote_ident(&field.name);
            let type_name = type_sql(&field.field_type);
            let mut actions = vec![format!(
                "ALTER COLUMN {col} TYPE {ty} USING {col}::{ty}",
                col = column,
                ty = type_name
            )];
            actions.push(format!(
                "ALTER COLUMN {} {} NOT NULL",
                column,
                if field.notnull { "SET" } else { "DROP" }
            ));
            if !field.sequence {
                actions.push(match &field.default {
                    Some(default) => format!("ALTER COLUMN {} SET DEFAULT {}", column, default),
                    None => format!("ALTER COLUMN {} DROP DEFAULT", column),
                });
            }
            vec![format!("ALTER TABLE {} {}", quote_ident(table), actions.join(", "))]
        }
        SchemaChange::DropColumn { table, column } => vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(table),
            quote_ident(column)
        )],
        SchemaChange::AddIndex { table, index } => vec![index_sql(table, index)],
        SchemaChange::DropIndex { index, .. } => {
            vec![format!("DROP INDEX IF EXISTS {}", quote_ident(index))]
        }
        SchemaChange::ResetSequence { table, column, next_value } => vec![format!(
            "SELECT setval(pg_get_serial_sequence({}, {}), {}, false)",
            quote_literal(&quote_ident(table)),
            quote_literal(column),
            next_value
        )],
    }
}

const ROW_CURSOR: &str = "vault_rows";

/// Cursor over every row of `table` as a json object, sorted by its sort field.
fn cursor_sql(table: &TableDescriptor) -> String {
    let order = table
        .sort_field()
        .map(quote_ident)
        .unwrap_or_else(|| "1".to_string());
    format!(
        "DECLARE {} NO SCROLL CURSOR FOR SELECT row_to_json(t)::jsonb FROM {} t ORDER BY {}",
        ROW_CURSOR,
        quote_ident(&table.name),
        order
    )
}

/// Orders the values of a `row_to_json` object by the table's field list.
fn positional(fields: &[String], object: Value) -> Vec<Value> {
    match object {
        Value::Object(mut map) => fields
            .iter()
            .map(|f| map.remove(f).unwrap_or(Value::Null))
            .collect(),
        other => vec![other],
    }
}

#[async_trait]
impl LiveDatabase for PgDatabase {
    async fn describe_tables(&self) -> Result<BTreeMap<String, TableDescriptor>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT table_name::text FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
             ORDER BY table_name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables = BTreeMap::new();
        for name in names {
            let table = self.describe_table(&name).await?;
            tables.insert(name, table);
        }
        Ok(tables)
    }

    fn stream_rows<'a>(&'a self, table: &'a TableDescriptor) -> BoxStream<'a, Result<Vec<Value>>> {
        let fields = table.field_names();
        let declare = cursor_sql(table);
        let fetch = format!("FETCH {} FROM {}", ROW_BATCH_SIZE, ROW_CURSOR);

        // One cursor in one read-only snapshot: every row is seen exactly once
        // whatever the sort order and concurrent writes.
        stream::try_unfold(None, move |cursor: Option<Transaction<'static, Postgres>>| {
            let fields = fields.clone();
            let declare = declare.clone();
            let fetch = fetch.clone();
            async move {
                let mut tx = match cursor {
                    Some(tx) => tx,
                    None => {
                        let mut tx = self.pool.begin().await?;
                        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
                            .execute(&mut *tx)
                            .await?;
                        sqlx::query(&declare).execute(&mut *tx).await?;
                        tx
                    }
                };
                let batch = sqlx::query_scalar::<_, Value>(&fetch)
                    .fetch_all(&mut *tx)
                    .await?;
                if batch.is_empty() {
                    tx.commit().await?;
                    return Ok::<_, VaultError>(None);
                }
                let rows: Vec<Result<Vec<Value>>> = batch
                    .into_iter()
                    .map(|object| Ok(positional(&fields, object)))
                    .collect();
                Ok(Some((stream::iter(rows), Some(tx))))
            }
        })
        .try_flatten()
        .boxed()
    }

    async fn insert_raw(&self, table: &str, fields: &[String], row: &[Value]) -> Result<()> {
        if fields.len() != row.len() {
            return Err(VaultError::Integrity(format!(
                "row has {} values but table {} expects {}",
                row.len(),
                table,
                fields.len()
            )));
        }
        let record: Map<String, Value> = fields.iter().cloned().zip(row.iter().cloned()).collect();
        let columns = fields.iter().map(|f| quote_ident(f)).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "INSERT INTO {table} ({columns}) OVERRIDING SYSTEM VALUE
             SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)",
            table = quote_ident(table),
            columns = columns
        );
        sqlx::query(&sql)
            .bind(Value::Object(record))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn truncate(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("TRUNCATE TABLE {}", quote_ident(table)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_change(&self, change: &SchemaChange) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in render_change(change) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn max_id(&self, table: &TableDescriptor) -> Result<Option<i64>> {
        let Some(field) = table.sequence_field() else {
            return Ok(None);
        };
        let max: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(MAX({}), 0)::int8 FROM {}",
            quote_ident(&field.name),
            quote_ident(&table.name)
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(max))
    }

    async fn size_bytes(&self) -> Result<u64> {
        let size: i64 = sqlx::query_scalar("SELECT pg_database_size(current_database())::int8")
            .fetch_one(&self.pool)
            .await?;
        Ok(size.max(0) as u64)
    }

    async fn set_config(&self, entry: &ConfigOverride) -> Result<()> {
        let updated = match &entry.plugin {
            None => sqlx::query("UPDATE config SET value = $1 WHERE name = $2")
                .bind(&entry.value)
                .bind(&entry.name)
                .execute(&self.pool)
                .await?
                .rows_affected(),
            Some(plugin) => {
                sqlx::query("UPDATE config_plugins SET value = $1 WHERE plugin = $2 AND name = $3")
                    .bind(&entry.value)
                    .bind(plugin)
                    .bind(&entry.name)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
        };
        if updated > 0 {
            return Ok(());
        }
        match &entry.plugin {
            None => {
                sqlx::query("INSERT INTO config (name, value) VALUES ($1, $2)")
                    .bind(&entry.name)
                    .bind(&entry.value)
                    .execute(&self.pool)
                    .await?;
            }
            Some(plugin) => {
                sqlx::query("INSERT INTO config_plugins (plugin, name, value) VALUES ($1, $2, $3)")
                    .bind(plugin)
                    .bind(&entry.name)
                    .bind(&entry.value)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }
}
