//! Pipeline run persistence
//!
//! Runs are upserted on every state transition so status survives a restart.

use cgx_common::{Error, Result};
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{from_json, parse_timestamp, to_json, MAX_LOCK_WAIT_MS};
use crate::models::{PipelineRun, RunState, RunStatus};
use crate::utils::retry_on_lock;

const TERMINAL_STATES: &str = "('COMPLETED', 'CANCELLED', 'FAILED')";

/// Save pipeline run
pub async fn save_run(pool: &SqlitePool, run: &PipelineRun) -> Result<()> {
    // Serialize before touching the database
    let run_id = run.run_id.to_string();
    let state = run.state.as_str();
    let status = run.status.map(|s| s.as_str());
    let options = to_json(&run.options, "options")?;
    let progress = to_json(&run.progress, "progress")?;
    let counts = to_json(&run.counts, "counts")?;
    let exclusions = to_json(&run.exclusions, "exclusions")?;
    let started_at = run.started_at.to_rfc3339_opts(SecondsFormat::Micros, true);
    let ended_at = run.ended_at.map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true));

    retry_on_lock("save_run", MAX_LOCK_WAIT_MS, || async {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                run_id, state, status, options, progress, counts, exclusions,
                cluster_solution_id, error_message, started_at, ended_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                state = excluded.state,
                status = excluded.status,
                progress = excluded.progress,
                counts = excluded.counts,
                exclusions = excluded.exclusions,
                cluster_solution_id = excluded.cluster_solution_id,
                error_message = excluded.error_message,
                ended_at = excluded.ended_at
            "#,
        )
        .bind(&run_id)
        .bind(state)
        .bind(status)
        .bind(&options)
        .bind(&progress)
        .bind(&counts)
        .bind(&exclusions)
        .bind(&run.cluster_solution_id)
        .bind(&run.error_message)
        .bind(&started_at)
        .bind(&ended_at)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

pub async fn load_run(pool: &SqlitePool, run_id: Uuid) -> Result<Option<PipelineRun>> {
    let row = sqlx::query(
        r#"
        SELECT run_id, state, status, options, progress, counts, exclusions,
               cluster_solution_id, error_message, started_at, ended_at
        FROM pipeline_runs
        WHERE run_id = ?
        "#,
    )
    .bind(run_id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(run_from_row).transpose()
}

/// Most recently started run, terminal or not
pub async fn latest_run(pool: &SqlitePool) -> Result<Option<PipelineRun>> {
    let row = sqlx::query(
        r#"
        SELECT run_id, state, status, options, progress, counts, exclusions,
               cluster_solution_id, error_message, started_at, ended_at
        FROM pipeline_runs
        ORDER BY started_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(run_from_row).transpose()
}

/// Mark runs left mid-flight by a previous process as failed
///
/// Returns the number of runs updated.
pub async fn fail_interrupted_runs(pool: &SqlitePool) -> Result<u64> {
    let ended_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let query = format!(
        r#"
        UPDATE pipeline_runs
        SET state = 'FAILED', status = 'FAILED', ended_at = ?,
            error_message = 'Interrupted by service restart'
        WHERE state NOT IN {}
        "#,
        TERMINAL_STATES
    );

    let result = sqlx::query(&query).bind(&ended_at).execute(pool).await?;
    Ok(result.rows_affected())
}

fn run_from_row(row: &SqliteRow) -> Result<PipelineRun> {
    let run_id: String = row.try_get("run_id")?;
    let run_id = Uuid::parse_str(&run_id).map_err(|e| Error::Internal(format!("Failed to parse run_id: {}", e)))?;

    let state: String = row.try_get("state")?;
    let state = RunState::parse(&state).ok_or_else(|| Error::Internal(format!("Unknown run state: {}", state)))?;

    let status: Option<String> = row.try_get("status")?;
    let status = status
        .map(|s| RunStatus::parse(&s).ok_or_else(|| Error::Internal(format!("Unknown run status: {}", s))))
        .transpose()?;

    let options: String = row.try_get("options")?;
    let progress: String = row.try_get("progress")?;
    let counts: String = row.try_get("counts")?;
    let exclusions: String = row.try_get("exclusions")?;
    let started_at: String = row.try_get("started_at")?;
    let ended_at: Option<String> = row.try_get("ended_at")?;

    Ok(PipelineRun {
        run_id,
        state,
        status,
        options: from_json(&options, "options")?,
        progress: from_json(&progress, "progress")?,
        counts: from_json(&counts, "counts")?,
        exclusions: from_json(&exclusions, "exclusions")?,
        cluster_solution_id: row.try_get("cluster_solution_id")?,
        error_message: row.try_get("error_message")?,
        started_at: parse_timestamp(&started_at, "started_at")?,
        ended_at: ended_at.map(|s| parse_timestamp(&s, "ended_at")).transpose()?,
    })
}
