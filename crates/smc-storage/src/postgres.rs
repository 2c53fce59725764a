use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use smc_core::{ConfigError, NormalizedRecord, Scalar};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row as _, TypeInfo};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::sql::{self, Statement};
use crate::{ContentSpec, DimensionSpec, PersistenceGateway, Row, StorageError, TableSpec};

#[derive(Debug, Clone)]
pub struct PgConfig {
    pub options: PgConnectOptions,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgConfig {
    pub fn new(options: PgConnectOptions) -> Self {
        Self {
            options,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    /// `DATABASE_URL` wins; otherwise the libpq-style `PG*` variables are required.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            let options = PgConnectOptions::from_str(&url).map_err(|err| ConfigError::Invalid {
                name: "DATABASE_URL".to_string(),
                reason: err.to_string(),
            })?;
            return Ok(Self::new(options));
        }

        let var = |name: &str| std::env::var(name).map_err(|_| ConfigError::Missing(name.to_string()));
        let port = match std::env::var("PGPORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|err| ConfigError::Invalid {
                name: "PGPORT".to_string(),
                reason: err.to_string(),
            })?,
            Err(_) => 5432,
        };
        let mut options = PgConnectOptions::new()
            .host(&var("PGHOST")?)
            .port(port)
            .username(&var("PGUSER")?)
            .database(&var("PGDATABASE")?);
        if let Ok(password) = std::env::var("PGPASSWORD") {
            options = options.password(&password);
        }
        Ok(Self::new(options))
    }
}

/// Postgres-backed gateway. The pool exists only between `connect` and `disconnect`.
pub struct PgGateway {
    config: PgConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PgGateway {
    pub fn new(config: PgConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<PgPool, StorageError> {
        self.pool.read().await.clone().ok_or(StorageError::NotConnected)
    }

    async fn fetch_rows(&self, stmt: &Statement) -> Result<Vec<Row>, StorageError> {
        let pool = self.pool().await?;
        let rows = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_all(&pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn fetch_id(&self, stmt: &Statement) -> Result<Option<i64>, StorageError> {
        let pool = self.pool().await?;
        let row = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .fetch_optional(&pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>("id")?)),
            None => Ok(None),
        }
    }

    async fn run(&self, stmt: &Statement) -> Result<u64, StorageError> {
        let pool = self.pool().await?;
        let done = bind_params(sqlx::query(&stmt.sql), &stmt.params)
            .execute(&pool)
            .await?;
        Ok(done.rows_affected())
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Scalar],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Scalar::Null => query.bind(None::<String>),
            Scalar::Bool(v) => query.bind(*v),
            Scalar::Int(v) => query.bind(*v),
            Scalar::Float(v) => query.bind(*v),
            Scalar::Date(v) => query.bind(*v),
            Scalar::Text(v) => query.bind(v.as_str()),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, StorageError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => Scalar::from(row.try_get::<Option<bool>, _>(idx)?),
            "INT2" => Scalar::from(row.try_get::<Option<i16>, _>(idx)?.map(i64::from)),
            "INT4" => Scalar::from(row.try_get::<Option<i32>, _>(idx)?.map(i64::from)),
            "INT8" => Scalar::from(row.try_get::<Option<i64>, _>(idx)?),
            "FLOAT4" => Scalar::from(row.try_get::<Option<f32>, _>(idx)?.map(f64::from)),
            "FLOAT8" => Scalar::from(row.try_get::<Option<f64>, _>(idx)?),
            "DATE" => Scalar::from(row.try_get::<Option<NaiveDate>, _>(idx)?),
            "TIMESTAMPTZ" => Scalar::from(
                row.try_get::<Option<DateTime<Utc>>, _>(idx)?
                    .map(|ts| ts.to_rfc3339()),
            ),
            "TIMESTAMP" => Scalar::from(
                row.try_get::<Option<NaiveDateTime>, _>(idx)?
                    .map(|ts| ts.to_string()),
            ),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                Scalar::from(row.try_get::<Option<String>, _>(idx)?)
            }
            other => {
                return Err(StorageError::Unsupported(format!(
                    "column {} has type {other}",
                    column.name()
                )))
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn connect(&self) -> Result<(), StorageError> {
        let mut slot = self.pool.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .connect_with(self.config.options.clone())
            .await?;
        info!(
            host = self.config.options.get_host(),
            database = self.config.options.get_database().unwrap_or_default(),
            "connected to postgres"
        );
        *slot = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            debug!("postgres pool closed");
        }
        Ok(())
    }

    async fn apply_schema(&self, script: &str) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        sqlx::raw_sql(script).execute(&pool).await?;
        Ok(())
    }

    async fn execute(&self, statement: &str, params: &[Scalar]) -> Result<Vec<Row>, StorageError> {
        self.fetch_rows(&Statement {
            sql: statement.to_string(),
            params: params.to_vec(),
        })
        .await
    }

    async fn record_exists(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<bool, StorageError> {
        let stmt = sql::select_exists(spec, record)?;
        Ok(!self.fetch_rows(&stmt).await?.is_empty())
    }

    async fn insert_record(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<(), StorageError> {
        self.run(&sql::insert(spec, record)?).await?;
        Ok(())
    }

    async fn update_record(
        &self,
        spec: &TableSpec,
        record: &NormalizedRecord,
    ) -> Result<u64, StorageError> {
        self.run(&sql::update(spec, record)?).await
    }

    async fn find_dimension(
        &self,
        spec: &DimensionSpec,
        key: &[Scalar],
    ) -> Result<Option<i64>, StorageError> {
        self.fetch_id(&sql::find_dimension(spec, key)?).await
    }

    async fn upsert_dimension(
        &self,
        spec: &DimensionSpec,
        key: &[Scalar],
        labels: &[Scalar],
    ) -> Result<i64, StorageError> {
        self.fetch_id(&sql::upsert_dimension(spec, key, labels)?)
            .await?
            .ok_or_else(|| StorageError::Unsupported(format!("upsert into {} returned no id", spec.table)))
    }

    async fn bump_content(
        &self,
        spec: &ContentSpec,
        digest: &str,
    ) -> Result<Option<i64>, StorageError> {
        self.fetch_id(&sql::bump_content(spec, digest)?).await
    }

    async fn upsert_content(
        &self,
        spec: &ContentSpec,
        digest: &str,
        content: &str,
    ) -> Result<i64, StorageError> {
        self.fetch_id(&sql::upsert_content(spec, digest, content)?)
            .await?
            .ok_or_else(|| StorageError::Unsupported(format!("upsert into {} returned no id", spec.table)))
    }
}
