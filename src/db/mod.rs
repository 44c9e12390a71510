pub mod driver;
pub mod guard;
pub mod pool;

pub use driver::{PgDriver, SqlRow};
pub use guard::GuardedDriver;
pub use pool::DbPool;

use serde_json::Value;

use crate::config::AccessMode;
use crate::error::Result;

/// The driver handed to tools, selected once at startup by access mode.
/// User-supplied SQL always goes through `execute`; internal catalog
/// queries use `base()` directly since they are curated by this crate.
#[derive(Clone)]
pub enum Driver {
    Unrestricted(PgDriver),
    Restricted(GuardedDriver),
}

impl Driver {
    pub fn new(pool: DbPool, mode: AccessMode, statement_timeout_ms: u64) -> Self {
        let base = PgDriver::new(pool);
        match mode {
            AccessMode::Unrestricted => Driver::Unrestricted(base),
            AccessMode::Restricted => {
                Driver::Restricted(GuardedDriver::new(base, statement_timeout_ms))
            }
        }
    }

    pub fn access_mode(&self) -> AccessMode {
        match self {
            Driver::Unrestricted(_) => AccessMode::Unrestricted,
            Driver::Restricted(_) => AccessMode::Restricted,
        }
    }

    pub fn base(&self) -> &PgDriver {
        match self {
            Driver::Unrestricted(driver) => driver,
            Driver::Restricted(guarded) => guarded.base(),
        }
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        match self {
            Driver::Unrestricted(driver) => driver.execute(sql, params).await,
            Driver::Restricted(guarded) => guarded.execute(sql, params).await,
        }
    }
}
