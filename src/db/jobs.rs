//! Job persistence. Every status/progress mutation is written through so
//! the dashboard survives a daemon restart.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::drive::DiscType;
use crate::core::job::{Job, JobStatus};

fn decode_err(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("corrupt {what}: {value:?}").into(),
    )
}

fn job_from_row(row: &rusqlite::Row<'_>) -> Result<Job, rusqlite::Error> {
    let disc_type_raw: String = row.get("disc_type")?;
    let status_raw: String = row.get("status")?;
    let output_path: String = row.get("output_path")?;
    let temp_path: String = row.get("temp_path")?;
    let created_at_raw: String = row.get("created_at")?;

    Ok(Job {
        id: row.get("id")?,
        drive_path: row.get("drive_path")?,
        disc_type: DiscType::parse(&disc_type_raw)
            .ok_or_else(|| decode_err("disc_type", &disc_type_raw))?,
        disc_label: row.get("disc_label")?,
        status: JobStatus::parse(&status_raw).ok_or_else(|| decode_err("status", &status_raw))?,
        step_index: row.get("step_index")?,
        step_name: row.get("step_name")?,
        step_total: row.get("step_total")?,
        progress_overall: row.get("progress_overall")?,
        progress_step: row.get("progress_step")?,
        progress_title: row.get("progress_title")?,
        output_path: PathBuf::from(output_path),
        output_locked: row.get("output_locked")?,
        output_claimed: row.get("output_claimed")?,
        extracted: row.get("extracted")?,
        temp_path: PathBuf::from(temp_path),
        imdb_id: row.get("imdb_id")?,
        season: row.get("season")?,
        created_at: DateTime::parse_from_rfc3339(&created_at_raw)
            .map_err(|_| decode_err("created_at", &created_at_raw))?
            .with_timezone(&Utc),
    })
}

pub async fn upsert(conn: &Connection, job: &Job) -> Result<()> {
    let job = job.clone();
    conn.call(move |c| {
        c.execute(
            "INSERT INTO jobs (id, drive_path, disc_type, disc_label, status,
                               step_index, step_name, step_total,
                               progress_overall, progress_step, progress_title,
                               output_path, output_locked, output_claimed,
                               extracted, temp_path, imdb_id, season, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
             ON CONFLICT(id) DO UPDATE SET
                drive_path = excluded.drive_path,
                status = excluded.status,
                step_index = excluded.step_index,
                step_name = excluded.step_name,
                step_total = excluded.step_total,
                progress_overall = excluded.progress_overall,
                progress_step = excluded.progress_step,
                progress_title = excluded.progress_title,
                output_path = excluded.output_path,
                output_locked = excluded.output_locked,
                output_claimed = excluded.output_claimed,
                extracted = excluded.extracted,
                imdb_id = excluded.imdb_id,
                season = excluded.season",
            params![
                &job.id,
                &job.drive_path,
                job.disc_type.as_str(),
                &job.disc_label,
                job.status.as_str(),
                job.step_index,
                &job.step_name,
                job.step_total,
                job.progress_overall,
                job.progress_step,
                job.progress_title,
                job.output_path.to_string_lossy(),
                job.output_locked,
                job.output_claimed,
                job.extracted,
                job.temp_path.to_string_lossy(),
                &job.imdb_id,
                &job.season,
                job.created_at.to_rfc3339(),
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .context("Failed to persist job")
}

/// Load every persisted job. Any row that fails to decode is a corrupted
/// store and aborts startup.
pub async fn load_all(conn: &Connection) -> Result<Vec<Job>> {
    conn.call(|c| {
        let mut stmt = c.prepare("SELECT * FROM jobs ORDER BY created_at")?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(jobs)
    })
    .await
    .context("Corrupted job table")
}

pub async fn delete(conn: &Connection, job_id: String) -> Result<()> {
    conn.call(move |c| {
        c.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to delete job: {e}"))
}

pub async fn append_log(conn: &Connection, job_id: String, line: String) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "INSERT INTO job_log (job_id, line) VALUES (?1, ?2)",
            params![job_id, line],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to append job log: {e}"))
}

/// Ordered full log for a job, one line per entry.
pub async fn full_log(conn: &Connection, job_id: String) -> Result<Vec<String>> {
    conn.call(move |c| {
        let mut stmt = c.prepare("SELECT line FROM job_log WHERE job_id = ?1 ORDER BY seq")?;
        let lines = stmt
            .query_map(params![job_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, rusqlite::Error>(lines)
    })
    .await
    .map_err(|e| anyhow!("Failed to read job log: {e}"))
}

/// Retry starts a fresh run: the previous run's log is discarded.
pub async fn clear_log(conn: &Connection, job_id: String) -> Result<()> {
    conn.call(move |c| {
        c.execute("DELETE FROM job_log WHERE job_id = ?1", params![job_id])?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to clear job log: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::Job;
    use std::path::Path;

    fn sample_job() -> Job {
        let mut job = Job::new(
            "job-1".to_string(),
            "/dev/sr0",
            DiscType::DvdVideo,
            "SOME MOVIE",
            Path::new("/tmp/ripd/temp"),
            PathBuf::from("/tmp/ripd/output/video/SOME MOVIE"),
        );
        job.status = JobStatus::Running;
        job.step_index = 2;
        job.step_name = "transcode".to_string();
        job.step_total = 3;
        job.progress_overall = 72;
        job.progress_step = 40;
        job.progress_title = 80;
        job.output_locked = true;
        job.output_claimed = true;
        job.extracted = true;
        job.imdb_id = Some("tt0000001".to_string());
        job.season = Some(2);
        job
    }

    #[tokio::test]
    async fn jobs_round_trip() {
        let conn = crate::db::init_in_memory().await.unwrap();
        let job = sample_job();
        upsert(&conn, &job).await.unwrap();

        let loaded = load_all(&conn).await.unwrap();
        assert_eq!(loaded.len(), 1);
        let got = &loaded[0];
        assert_eq!(got.id, job.id);
        assert_eq!(got.disc_type, job.disc_type);
        assert_eq!(got.status, job.status);
        assert_eq!(got.step_index, 2);
        assert_eq!(got.step_name, "transcode");
        assert_eq!(got.progress_overall, 72);
        assert_eq!(got.progress_title, 80);
        assert_eq!(got.output_path, job.output_path);
        assert!(got.output_locked);
        assert!(got.output_claimed);
        assert!(got.extracted);
        assert_eq!(got.imdb_id.as_deref(), Some("tt0000001"));
        assert_eq!(got.season, Some(2));
    }

    #[tokio::test]
    async fn log_is_ordered_and_clearable() {
        let conn = crate::db::init_in_memory().await.unwrap();
        upsert(&conn, &sample_job()).await.unwrap();

        for i in 0..5 {
            append_log(&conn, "job-1".to_string(), format!("line {i}"))
                .await
                .unwrap();
        }

        let lines = full_log(&conn, "job-1".to_string()).await.unwrap();
        assert_eq!(lines, vec!["line 0", "line 1", "line 2", "line 3", "line 4"]);

        clear_log(&conn, "job-1".to_string()).await.unwrap();
        assert!(full_log(&conn, "job-1".to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_a_job_cascades_its_log() {
        let conn = crate::db::init_in_memory().await.unwrap();
        upsert(&conn, &sample_job()).await.unwrap();
        append_log(&conn, "job-1".to_string(), "hello".to_string())
            .await
            .unwrap();

        delete(&conn, "job-1".to_string()).await.unwrap();
        assert!(load_all(&conn).await.unwrap().is_empty());
        assert!(full_log(&conn, "job-1".to_string()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_status_fails_load() {
        let conn = crate::db::init_in_memory().await.unwrap();
        upsert(&conn, &sample_job()).await.unwrap();

        conn.call(|c| {
            c.execute("UPDATE jobs SET status = 'Exploded'", [])?;
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .unwrap();

        assert!(load_all(&conn).await.is_err());
    }
}
