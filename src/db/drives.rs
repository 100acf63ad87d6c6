//! Drive persistence: enough to restore dashboard visibility and
//! blacklist flags across restarts. Assignment state is never persisted;
//! a restart has no live jobs to assign.

use anyhow::{Context, Result, anyhow};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::drive::DriveClass;

#[derive(Debug, Clone)]
pub struct DriveRecord {
    pub path: String,
    pub model: String,
    pub capability: DriveClass,
    pub blacklisted: bool,
}

pub async fn upsert(conn: &Connection, record: DriveRecord) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "INSERT INTO drives (path, model, capability, blacklisted)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(path) DO UPDATE SET
                model = excluded.model,
                capability = excluded.capability,
                blacklisted = excluded.blacklisted",
            params![
                &record.path,
                &record.model,
                record.capability.as_str(),
                record.blacklisted
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to persist drive: {e}"))
}

pub async fn load_all(conn: &Connection) -> Result<Vec<DriveRecord>> {
    conn.call(|c| {
        let mut stmt = c.prepare("SELECT path, model, capability, blacklisted FROM drives")?;
        let records = stmt
            .query_map([], |row| {
                let capability_raw: String = row.get(2)?;
                Ok(DriveRecord {
                    path: row.get(0)?,
                    model: row.get(1)?,
                    capability: DriveClass::parse(&capability_raw).ok_or_else(|| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            format!("corrupt capability: {capability_raw:?}").into(),
                        )
                    })?,
                    blacklisted: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(records)
    })
    .await
    .context("Corrupted drive table")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drives_round_trip() {
        let conn = crate::db::init_in_memory().await.unwrap();
        upsert(
            &conn,
            DriveRecord {
                path: "/dev/sr0".to_string(),
                model: "BD-RE WH16NS40".to_string(),
                capability: DriveClass::Bluray,
                blacklisted: true,
            },
        )
        .await
        .unwrap();

        let records = load_all(&conn).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].capability, DriveClass::Bluray);
        assert!(records[0].blacklisted);
    }
}
