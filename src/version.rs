use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::db::PgDriver;
use crate::error::{DbaError, Result};

/// Server version, detected once per pool and immutable afterwards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub server_version_num: i32,
    pub major: i32,
}

/// Answers "which PostgreSQL is this?" and "does view V have column C?",
/// caching both for the pool's lifetime. Version detection failure is
/// fatal to any caller that branches on it.
#[derive(Default)]
pub struct VersionProbe {
    info: OnceCell<ServerInfo>,
    columns: RwLock<HashMap<(String, String, String), bool>>,
}

impl VersionProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn server_info(&self, driver: &PgDriver) -> Result<ServerInfo> {
        self.info
            .get_or_try_init(|| detect_server_info(driver))
            .await
            .copied()
    }

    pub async fn has_column(
        &self,
        driver: &PgDriver,
        schema: &str,
        view: &str,
        column: &str,
    ) -> Result<bool> {
        let key = (schema.to_string(), view.to_string(), column.to_string());
        if let Ok(cache) = self.columns.read() {
            if let Some(known) = cache.get(&key) {
                return Ok(*known);
            }
        }

        let rows = driver
            .execute(
                r#"
                SELECT EXISTS (
                    SELECT 1
                    FROM information_schema.columns
                    WHERE table_schema = $1
                      AND table_name = $2
                      AND column_name = $3
                ) AS has_column
                "#,
                &[json!(schema), json!(view), json!(column)],
            )
            .await?;
        let has_column = rows
            .first()
            .and_then(|row| row.as_bool("has_column"))
            .unwrap_or(false);

        if let Ok(mut cache) = self.columns.write() {
            cache.entry(key).or_insert(has_column);
        }
        Ok(has_column)
    }

    pub async fn extension_installed(&self, driver: &PgDriver, name: &str) -> Result<bool> {
        let rows = driver
            .execute(
                "SELECT 1 AS present FROM pg_extension WHERE extname = $1 LIMIT 1",
                &[json!(name)],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Error out unless the named extension is installed.
    pub async fn require_extension(&self, driver: &PgDriver, name: &str) -> Result<()> {
        if self.extension_installed(driver, name).await? {
            Ok(())
        } else {
            Err(DbaError::ExtensionUnavailable {
                extension: name.to_string(),
            })
        }
    }
}

async fn detect_server_info(driver: &PgDriver) -> Result<ServerInfo> {
    let rows = driver.execute("SHOW server_version_num", &[]).await?;
    if let Some(version_num) = rows.first().and_then(|row| row.as_i64("server_version_num")) {
        let version_num = version_num as i32;
        let info = ServerInfo {
            server_version_num: version_num,
            major: version_num / 10_000,
        };
        debug!("Detected PostgreSQL {}", info.major);
        return Ok(info);
    }

    // Older servers or unusual proxies: fall back to the display string.
    let rows = driver.execute("SHOW server_version", &[]).await?;
    let major = rows
        .first()
        .and_then(|row| row.as_str("server_version"))
        .and_then(leading_major)
        .ok_or_else(|| DbaError::internal("could not determine PostgreSQL server version"))?;
    Ok(ServerInfo {
        server_version_num: major * 10_000,
        major,
    })
}

fn leading_major(version: &str) -> Option<i32> {
    let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_from_version_strings() {
        assert_eq!(leading_major("16.4 (Debian 16.4-1.pgdg120+1)"), Some(16));
        assert_eq!(leading_major("12.22"), Some(12));
        assert_eq!(leading_major("devel"), None);
    }
}
