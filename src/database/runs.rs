//! Run records: creation, lifecycle transitions, reconciliation queries.
//!
//! Status transitions are monotonic; a run in a terminal state is never
//! updated again (`finalize_run` guards on the active statuses).

use anyhow::Result;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::Database;
use crate::models::{Run, RunResult, RunStatus, Target};

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<Run> {
    let status_str: String = row.get("status");
    let status = RunStatus::parse_str(&status_str)
        .ok_or_else(|| anyhow::anyhow!("unknown run status '{status_str}'"))?;
    let request: Vec<Target> = serde_json::from_str(&row.get::<String, _>("request"))?;
    let result: Option<RunResult> = match row.get::<Option<String>, _>("result") {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };

    Ok(Run {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        job_id: row
            .get::<Option<String>, _>("job_id")
            .map(|id| Uuid::parse_str(&id))
            .transpose()?,
        status,
        queued_at: row.get("queued_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        request,
        result,
        error: row.get("error"),
        worker_pid: row.get("worker_pid"),
    })
}

const RUN_COLUMNS: &str =
    "id, job_id, status, queued_at, started_at, finished_at, request, result, error, worker_pid";

impl Database {
    /// Create a queued run with an immutable snapshot of the targets.
    pub async fn create_run(&self, job_id: Option<Uuid>, targets: &[Target]) -> Result<Run> {
        let run = Run {
            id: Uuid::new_v4(),
            job_id,
            status: RunStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            request: targets.to_vec(),
            result: None,
            error: None,
            worker_pid: None,
        };

        sqlx::query(
            r#"
            INSERT INTO runs (id, job_id, status, queued_at, request)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.job_id.map(|id| id.to_string()))
        .bind(run.status.as_str())
        .bind(run.queued_at)
        .bind(serde_json::to_string(&run.request)?)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_runs(&self, limit: u32) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY queued_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }

    pub async fn delete_run(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// queued -> running: worker spawned, pid recorded.
    pub async fn mark_run_running(&self, id: Uuid, pid: i64) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET status = ?, started_at = ?, worker_pid = ? WHERE id = ? AND status = ?",
        )
        .bind(RunStatus::Running.as_str())
        .bind(Utc::now())
        .bind(pid)
        .bind(id.to_string())
        .bind(RunStatus::Queued.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// running -> canceling: stop accepted, worker not yet confirmed dead.
    pub async fn mark_run_canceling(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE runs SET status = ? WHERE id = ? AND status = ?")
            .bind(RunStatus::Canceling.as_str())
            .bind(id.to_string())
            .bind(RunStatus::Running.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Move a run into a terminal state. A no-op for runs that are already
    /// terminal, keeping transitions monotonic.
    pub async fn finalize_run(
        &self,
        id: Uuid,
        status: RunStatus,
        result: Option<&RunResult>,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        let result_json = match result {
            Some(result) => Some(serde_json::to_string(result)?),
            None => None,
        };

        sqlx::query(
            r#"
            UPDATE runs SET status = ?, finished_at = ?, result = ?, error = ?
            WHERE id = ? AND status IN ('queued', 'running', 'canceling')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(result_json)
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Runs that may still have (or believe they have) a worker process.
    pub async fn active_runs(&self) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ('queued', 'running', 'canceling')
             ORDER BY queued_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }
}
