use std::time::Duration;

use snafu::ResultExt;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};

use crate::config::POOL_CLOSE_DEADLINE_SECS;
use crate::error::{ConnectionSnafu, Result};

const ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Pooled async connections. One transaction per borrowed connection;
/// transient acquire failures are retried once with a fresh attempt.
#[derive(Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .connect(url)
            .await
            .context(ConnectionSnafu)?;
        info!("Connected to database, pool size {max_connections}");
        Ok(Self { pool })
    }

    /// Build the pool without touching the network; the first borrow
    /// connects. Lets the server come up before the database does.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .connect_lazy(url)
            .context(ConnectionSnafu)?;
        Ok(Self { pool })
    }

    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>> {
        match self.pool.acquire().await {
            Ok(conn) => Ok(conn),
            Err(first) if is_transient(&first) => {
                warn!("Connection acquire failed ({first}), retrying once");
                self.pool.acquire().await.context(ConnectionSnafu)
            }
            Err(other) => Err(other).context(ConnectionSnafu),
        }
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        match self.pool.begin().await {
            Ok(tx) => Ok(tx),
            Err(first) if is_transient(&first) => {
                warn!("Transaction begin failed ({first}), retrying once");
                self.pool.begin().await.context(ConnectionSnafu)
            }
            Err(other) => Err(other).context(ConnectionSnafu),
        }
    }

    /// Drain active borrows with a deadline, then force closure.
    pub async fn close(&self) {
        let deadline = Duration::from_secs(POOL_CLOSE_DEADLINE_SECS);
        if tokio::time::timeout(deadline, self.pool.close())
            .await
            .is_err()
        {
            warn!("Pool did not drain within {POOL_CLOSE_DEADLINE_SECS}s, closing anyway");
        } else {
            debug!("Pool closed cleanly");
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
}
