use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use surrealdb::engine::local::{Db, Mem, SurrealKv};
use surrealdb::Surreal;
use tracing::debug;

use crate::store::{merge_patch, ListQuery, ResourceStore, StoreError, Table, DEFAULT_PARTITIONS};

/// SurrealDB-backed resource store.
/// Clone is cheap (Arc internally).
///
/// Every row is kept as `{ key, body }`; `body` is the engine's JSON row and
/// partitions are `DEFINE INDEX` statements over `body.<field>`.
#[derive(Clone)]
pub struct SurrealStore {
    pub db: Surreal<Db>,
    name: String,
}

/// Default database file: `<data dir>/tflineage/tflineage.db`.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tflineage")
        .join("tflineage.db")
}

impl SurrealStore {
    /// Open (or create) an on-disk database and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::DbError(format!("{}: {e}", parent.display())))?;
        }
        let db = Surreal::new::<SurrealKv>(path.to_path_buf()).await.map_err(db_err)?;
        Self::init(db, format!("surrealkv:{}", path.display())).await
    }

    /// Process-local database; contents vanish with the handle.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = Surreal::new::<Mem>(()).await.map_err(db_err)?;
        Self::init(db, format!("mem:{}", ulid::Ulid::new())).await
    }

    async fn init(db: Surreal<Db>, name: String) -> Result<Self, StoreError> {
        db.use_ns("tflineage").use_db("tflineage").await.map_err(db_err)?;
        run_migrations(&db).await?;
        Ok(Self { db, name })
    }

    async fn select_bodies(&self, sql: String, binds: Vec<(String, Value)>) -> Result<Vec<Value>, StoreError> {
        let mut query = self.db.query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let mut response = query.await.map_err(db_err)?.check().map_err(db_err)?;
        response.take::<Vec<Value>>(0).map_err(db_err)
    }
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), StoreError> {
    db.query(schema()).await.map_err(db_err)?.check().map_err(db_err)?;
    Ok(())
}

fn schema() -> String {
    let mut sql = String::new();
    for table in Table::ALL {
        let name = table.as_str();
        sql.push_str(&format!("DEFINE TABLE OVERWRITE {name} SCHEMALESS;\n"));
        sql.push_str(&format!("DEFINE INDEX OVERWRITE idx_{name}_key ON {name} FIELDS key UNIQUE;\n"));
    }
    for def in DEFAULT_PARTITIONS {
        let fields: Vec<String> = def.fields.iter().map(|f| format!("body.{f}")).collect();
        sql.push_str(&format!(
            "DEFINE INDEX OVERWRITE {} ON {} FIELDS {};\n",
            def.name,
            def.table.as_str(),
            fields.join(", ")
        ));
    }
    sql
}

fn db_err(e: surrealdb::Error) -> StoreError {
    StoreError::DbError(e.to_string())
}

/// Errors from a write into `table`; a hit on the unique key index becomes
/// [`StoreError::Conflict`].
fn write_err(table: Table, fallback_id: &str) -> impl Fn(surrealdb::Error) -> StoreError + '_ {
    move |e| {
        let message = e.to_string();
        match duplicate_key(table, &message) {
            Some(id) => StoreError::Conflict { table: table.as_str(), id: id.unwrap_or(fallback_id).to_string() },
            None => StoreError::DbError(message),
        }
    }
}

/// `Some` when `message` reports a duplicate on `idx_<table>_key`, carrying
/// the offending key when the message quotes it.
fn duplicate_key(table: Table, message: &str) -> Option<Option<&str>> {
    let index = format!("idx_{}_key", table.as_str());
    let at = message.find("already contains")?;
    if !message[..at].contains(&index) {
        return None;
    }
    let quoted = message[at + "already contains".len()..].trim_start();
    let key = quoted
        .trim_start_matches('[')
        .strip_prefix('\'')
        .and_then(|rest| rest.split_once('\''))
        .map(|(key, _)| key);
    Some(key)
}

/// Field names are interpolated into SurrealQL; only plain identifiers pass.
fn check_field(field: &str) -> Result<(), StoreError> {
    if !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::DbError(format!("invalid field name: {field}")))
    }
}

/// Pull the `FIELDS a, b` list out of a `DEFINE INDEX` statement.
fn index_fields(definition: &str) -> Vec<String> {
    let Some(start) = definition.find("FIELDS ") else {
        return Vec::new();
    };
    let rest = &definition[start + "FIELDS ".len()..];
    let end = [" UNIQUE", " SEARCH", " HNSW", " MTREE", " COMMENT", ";"]
        .iter()
        .filter_map(|kw| rest.find(kw))
        .min()
        .unwrap_or(rest.len());
    rest[..end].split(',').map(|f| f.trim().to_string()).filter(|f| !f.is_empty()).collect()
}

#[async_trait]
impl ResourceStore for SurrealStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, table: Table, id: &str) -> Result<Option<Value>, StoreError> {
        let rows = self
            .select_bodies(
                format!("SELECT VALUE body FROM {} WHERE key = $key LIMIT 1", table.as_str()),
                vec![("key".into(), Value::String(id.to_string()))],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn insert(&self, table: Table, id: &str, row: Value) -> Result<(), StoreError> {
        if !row.is_object() {
            return Err(StoreError::InvalidRow(row.to_string()));
        }
        if self.get(table, id).await?.is_some() {
            return Err(StoreError::Conflict { table: table.as_str(), id: id.to_string() });
        }
        self.db
            .query(format!("CREATE {} CONTENT {{ key: $key, body: $body }}", table.as_str()))
            .bind(("key", id.to_string()))
            .bind(("body", row))
            .await
            .map_err(write_err(table, id))?
            .check()
            .map_err(write_err(table, id))?;
        Ok(())
    }

    async fn insert_many(&self, table: Table, rows: Vec<(String, Value)>) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let first_id = rows[0].0.clone();
        let mut batch = Vec::with_capacity(rows.len());
        for (id, row) in rows {
            if !row.is_object() {
                return Err(StoreError::InvalidRow(row.to_string()));
            }
            batch.push(serde_json::json!({ "key": id, "body": row }));
        }
        debug!(table = table.as_str(), rows = batch.len(), "bulk insert");
        // The unique key index rejects the whole statement on a duplicate id.
        self.db
            .query(format!("INSERT INTO {} $rows", table.as_str()))
            .bind(("rows", Value::Array(batch)))
            .await
            .map_err(write_err(table, &first_id))?
            .check()
            .map_err(write_err(table, &first_id))?;
        Ok(())
    }

    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<(), StoreError> {
        let mut row = self
            .get(table, id)
            .await?
            .ok_or_else(|| StoreError::NotFound { table: table.as_str(), id: id.to_string() })?;
        merge_patch(&mut row, patch)?;
        self.db
            .query(format!("UPDATE {} SET body = $body WHERE key = $key", table.as_str()))
            .bind(("key", id.to_string()))
            .bind(("body", row))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        Ok(())
    }

    /// Equality filters run in the database; sort and limit are applied
    /// afterwards since `SELECT VALUE` cannot order by nested fields.
    async fn list(&self, table: Table, query: &ListQuery) -> Result<Vec<Value>, StoreError> {
        let mut sql = format!("SELECT VALUE body FROM {}", table.as_str());
        let mut binds = Vec::with_capacity(query.filter.len());
        for (i, (field, value)) in query.filter.iter().enumerate() {
            check_field(field)?;
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!("body.{field} = $p{i}"));
            binds.push((format!("p{i}"), value.clone()));
        }
        let rows = self.select_bodies(sql, binds).await?;
        let post = ListQuery { filter: Vec::new(), sort: query.sort.clone(), limit: query.limit };
        Ok(post.apply(rows))
    }

    async fn find_partition(&self, table: Table, fields: &[&str]) -> Result<Option<String>, StoreError> {
        let mut response = self
            .db
            .query(format!("INFO FOR TABLE {}", table.as_str()))
            .await
            .map_err(db_err)?
            .check()
            .map_err(db_err)?;
        let info: Option<Value> = response.take(0).map_err(db_err)?;

        let wanted: Vec<String> = fields.iter().map(|f| format!("body.{f}")).collect();
        let Some(indexes) = info.as_ref().and_then(|i| i.get("indexes")).and_then(Value::as_object) else {
            return Ok(None);
        };
        for (name, definition) in indexes {
            let text = match definition {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if index_fields(&text) == wanted {
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }

    async fn list_by_partition(
        &self,
        table: Table,
        partition: &str,
        values: &[Value],
    ) -> Result<Vec<Value>, StoreError> {
        let def = DEFAULT_PARTITIONS
            .iter()
            .find(|p| p.table == table && p.name == partition)
            .ok_or_else(|| StoreError::UnknownPartition { table: table.as_str(), partition: partition.to_string() })?;
        if def.fields.len() != values.len() {
            return Err(StoreError::PartitionArity {
                partition: partition.to_string(),
                expected: def.fields.len(),
                actual: values.len(),
            });
        }

        let conditions: Vec<String> =
            def.fields.iter().enumerate().map(|(i, f)| format!("body.{f} = $p{i}")).collect();
        let sql = format!(
            "SELECT VALUE body FROM {} WHERE {}",
            table.as_str(),
            conditions.join(" AND ")
        );
        let binds = values.iter().enumerate().map(|(i, v)| (format!("p{i}"), v.clone())).collect();
        self.select_bodies(sql, binds).await
    }
}
