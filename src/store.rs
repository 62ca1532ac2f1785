use crate::collectors::TelemetryRecord;
use crate::config::DatabaseConfig;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;

const UPDATE_DEVICE: &str = "UPDATE devices \
     SET uptime = $1, wired_bytes = $2, wireless_bytes = $3, last_seen = NOW() \
     WHERE label = $4";

/// Positional parameters of `UPDATE_DEVICE`, `$1` first.
fn update_binds<'a>(
    label: &'a str,
    record: &'a TelemetryRecord,
) -> (&'a str, i64, i64, &'a str) {
    (record.uptime.as_str(), record.wired, record.wireless, label)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ошибка базы данных")]
    Database(#[from] sqlx::Error),
}

/// Where device rows live. A session is held for one cycle and released
/// when it is finished or dropped.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    type Session: DeviceSession;

    /// With `transactional` set, nothing is visible until `finish` commits;
    /// dropping the session rolls back.
    async fn session(&self, transactional: bool) -> Result<Self::Session, StoreError>;
}

#[async_trait]
pub trait DeviceSession: Send {
    /// Overwrites the telemetry of the device labelled `label` and bumps its
    /// `last_seen`. Returns the number of rows affected; 0 means no such device.
    async fn update_device(
        &mut self,
        label: &str,
        record: &TelemetryRecord,
    ) -> Result<u64, StoreError>;

    async fn finish(self) -> Result<(), StoreError>;
}

pub struct PgDeviceStore {
    pool: PgPool,
}

impl PgDeviceStore {
    /// Builds the pool without connecting, so an unreachable database shows
    /// up as a failed cycle rather than a failed start.
    pub fn connect_lazy(cfg: &DatabaseConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&cfg.host)
            .port(cfg.port)
            .username(&cfg.user)
            .password(&cfg.password)
            .database(&cfg.name);
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect_lazy_with(options);
        Self { pool }
    }
}

pub enum PgSession {
    Connection(PoolConnection<Postgres>),
    Transaction(Transaction<'static, Postgres>),
}

#[async_trait]
impl DeviceStore for PgDeviceStore {
    type Session = PgSession;

    async fn session(&self, transactional: bool) -> Result<PgSession, StoreError> {
        if transactional {
            Ok(PgSession::Transaction(self.pool.begin().await?))
        } else {
            Ok(PgSession::Connection(self.pool.acquire().await?))
        }
    }
}

#[async_trait]
impl DeviceSession for PgSession {
    async fn update_device(
        &mut self,
        label: &str,
        record: &TelemetryRecord,
    ) -> Result<u64, StoreError> {
        let (uptime, wired, wireless, label) = update_binds(label, record);
        let query = sqlx::query(UPDATE_DEVICE)
            .bind(uptime)
            .bind(wired)
            .bind(wireless)
            .bind(label);
        let result = match self {
            PgSession::Connection(conn) => query.execute(&mut **conn).await?,
            PgSession::Transaction(tx) => query.execute(&mut **tx).await?,
        };
        Ok(result.rows_affected())
    }

    async fn finish(self) -> Result<(), StoreError> {
        match self {
            PgSession::Connection(_) => Ok(()),
            PgSession::Transaction(tx) => Ok(tx.commit().await?),
        }
    }
}
