use anyhow::{Context, Result};
use std::path::Path;
use tokio_rusqlite::Connection;

pub mod drives;
pub mod jobs;

pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;

    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        // Enable foreign keys (SQLite disables them by default!)
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await
    .context("Failed to apply database schema")?;

    Ok(conn)
}

#[cfg(test)]
pub async fn init_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().await?;
    conn.call(|conn| {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        Ok::<(), tokio_rusqlite::rusqlite::Error>(())
    })
    .await?;
    Ok(conn)
}
