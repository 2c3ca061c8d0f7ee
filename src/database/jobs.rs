//! Job store: CRUD plus the scheduler's due-job query and fire-and-advance.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::Database;
use crate::models::{Job, JobCreateRequest, JobUpdateRequest, Run, Target};

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let targets: Vec<Target> = serde_json::from_str(&row.get::<String, _>("targets"))?;
    Ok(Job {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        name: row.get("name"),
        targets,
        interval_seconds: row.get("interval_seconds"),
        run_at: row.get("run_at"),
        enabled: row.get("enabled"),
        next_due_at: row.get("next_due_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// First due time for a new or updated job definition.
fn initial_due(
    interval_seconds: Option<i64>,
    run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match (interval_seconds, run_at) {
        (Some(interval), _) if interval > 0 => Some(now + Duration::seconds(interval)),
        (_, Some(run_at)) => Some(run_at),
        _ => None,
    }
}

impl Database {
    pub async fn create_job(&self, request: &JobCreateRequest) -> Result<Job> {
        let _guard = self.acquire_job_update_lock().await;

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            targets: request.targets.clone(),
            interval_seconds: request.interval_seconds.filter(|i| *i > 0),
            run_at: request.run_at,
            enabled: request.enabled,
            next_due_at: initial_due(request.interval_seconds, request.run_at, now),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, targets, interval_seconds, run_at, enabled, next_due_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(serde_json::to_string(&job.targets)?)
        .bind(job.interval_seconds)
        .bind(job.run_at)
        .bind(job.enabled)
        .bind(job.next_due_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT id, name, targets, interval_seconds, run_at, enabled, next_due_at, created_at, updated_at
             FROM jobs WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, name, targets, interval_seconds, run_at, enabled, next_due_at, created_at, updated_at
             FROM jobs ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    pub async fn update_job(&self, id: Uuid, request: &JobUpdateRequest) -> Result<Option<Job>> {
        let _guard = self.acquire_job_update_lock().await;

        let now = Utc::now();
        let interval = request.interval_seconds.filter(|i| *i > 0);
        let next_due = initial_due(request.interval_seconds, request.run_at, now);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET name = ?, targets = ?, interval_seconds = ?, run_at = ?, enabled = ?, next_due_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&request.name)
        .bind(serde_json::to_string(&request.targets)?)
        .bind(interval)
        .bind(request.run_at)
        .bind(request.enabled)
        .bind(next_due)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        drop(_guard);
        self.get_job(id).await
    }

    pub async fn delete_job(&self, id: Uuid) -> Result<bool> {
        let _guard = self.acquire_job_update_lock().await;

        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Enabled jobs whose next due time has passed.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, name, targets, interval_seconds, run_at, enabled, next_due_at, created_at, updated_at
             FROM jobs
             WHERE enabled = 1 AND next_due_at IS NOT NULL AND next_due_at <= ?
             ORDER BY next_due_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    /// Fire one due job: atomically create a queued run carrying a frozen
    /// copy of the job's targets and advance the schedule. Recurring jobs
    /// are rescheduled to `now + interval`, not
    /// original-due + interval, so a lagging scheduler never produces a
    /// catch-up burst. One-shot jobs go dormant.
    pub async fn fire_job(&self, job: &Job, now: DateTime<Utc>) -> Result<Run> {
        let _guard = self.acquire_job_update_lock().await;

        let next_due = job
            .interval_seconds
            .filter(|i| *i > 0)
            .map(|interval| now + Duration::seconds(interval));

        let run = Run {
            id: Uuid::new_v4(),
            job_id: Some(job.id),
            status: crate::models::RunStatus::Queued,
            queued_at: now,
            started_at: None,
            finished_at: None,
            request: job.targets.clone(),
            result: None,
            error: None,
            worker_pid: None,
        };

        let mut transaction = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO runs (id, job_id, status, queued_at, request)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(job.id.to_string())
        .bind(run.status.as_str())
        .bind(run.queued_at)
        .bind(serde_json::to_string(&run.request)?)
        .execute(&mut *transaction)
        .await?;

        sqlx::query("UPDATE jobs SET next_due_at = ?, updated_at = ? WHERE id = ?")
            .bind(next_due)
            .bind(now)
            .bind(job.id.to_string())
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ListingSelectors, PageOrder, PaginationSpec, Recipe, Target, TargetMode,
    };

    fn target() -> Target {
        Target {
            base_url: "https://x.test".to_string(),
            page_limit: 2,
            page_order: PageOrder::Ascending,
            item_cap: None,
            filter: None,
            mode: TargetMode::ListingAndDetail,
            render_fallback: false,
            recipe: Recipe {
                pagination: PaginationSpec::Template {
                    path_template: "page/{page}/".to_string(),
                },
                listing: ListingSelectors {
                    item_selector: "a.video".to_string(),
                    title_selector: None,
                    title_attr: Some("title".to_string()),
                    link_attr: "href".to_string(),
                    image_attr: None,
                },
                detail: Default::default(),
                title_strip_patterns: Vec::new(),
            },
        }
    }

    fn create_request(interval: Option<i64>, run_at: Option<DateTime<Utc>>) -> JobCreateRequest {
        JobCreateRequest {
            name: "nightly".to_string(),
            targets: vec![target()],
            interval_seconds: interval,
            run_at,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_job_crud_roundtrip() {
        let db = Database::new_in_memory().await.unwrap();
        let job = db.create_job(&create_request(Some(3600), None)).await.unwrap();

        let fetched = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "nightly");
        assert_eq!(fetched.interval_seconds, Some(3600));
        assert_eq!(fetched.targets.len(), 1);
        assert!(fetched.next_due_at.is_some());

        let update = JobUpdateRequest {
            name: "hourly".to_string(),
            targets: vec![target()],
            interval_seconds: Some(60),
            run_at: None,
            enabled: false,
        };
        let updated = db.update_job(job.id, &update).await.unwrap().unwrap();
        assert_eq!(updated.name, "hourly");
        assert!(!updated.enabled);

        assert!(db.delete_job(job.id).await.unwrap());
        assert!(db.get_job(job.id).await.unwrap().is_none());
        assert!(!db.delete_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_one_shot_job_due_at_run_at() {
        let db = Database::new_in_memory().await.unwrap();
        let past = Utc::now() - Duration::minutes(5);
        let job = db.create_job(&create_request(None, Some(past))).await.unwrap();
        assert_eq!(job.next_due_at, Some(past));

        let due = db.due_jobs(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, job.id);
    }

    #[tokio::test]
    async fn test_fire_advances_next_due_from_fire_time_not_original_due() {
        let db = Database::new_in_memory().await.unwrap();
        let job = db.create_job(&create_request(Some(60), None)).await.unwrap();

        // Simulate a scheduler that lagged far behind the original due time.
        let fire_time = job.next_due_at.unwrap() + Duration::minutes(30);
        let run = db.fire_job(&job, fire_time).await.unwrap();
        assert_eq!(run.job_id, Some(job.id));
        assert_eq!(run.request.len(), 1);

        let advanced = db.get_job(job.id).await.unwrap().unwrap();
        // Exactly fire-time + interval: no catch-up burst.
        assert_eq!(advanced.next_due_at, Some(fire_time + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_one_shot_job_goes_dormant_after_firing() {
        let db = Database::new_in_memory().await.unwrap();
        let past = Utc::now() - Duration::minutes(1);
        let job = db.create_job(&create_request(None, Some(past))).await.unwrap();

        db.fire_job(&job, Utc::now()).await.unwrap();

        let dormant = db.get_job(job.id).await.unwrap().unwrap();
        assert!(dormant.next_due_at.is_none());
        assert!(db.due_jobs(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_jobs_are_never_due() {
        let db = Database::new_in_memory().await.unwrap();
        let mut request = create_request(Some(60), None);
        request.enabled = false;
        db.create_job(&request).await.unwrap();

        let far_future = Utc::now() + Duration::days(30);
        assert!(db.due_jobs(far_future).await.unwrap().is_empty());
    }
}
