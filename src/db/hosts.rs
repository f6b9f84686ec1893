//! Host registry, availability flags and run locks.

use async_trait::async_trait;

use super::{Db, count, limit};
use crate::error::{Error, Result};
use crate::model::{Host, HostId, HostStatus, Stage};
use crate::store::HostStore;

#[derive(sqlx::FromRow)]
struct HostRow {
    id: i64,
    stage: String,
    name: String,
    status: String,
    queue_depth: i64,
}

impl HostRow {
    fn try_into_host(self) -> Result<Host> {
        Ok(Host {
            id: HostId(self.id),
            stage: self.stage.parse()?,
            name: self.name,
            status: self.status.parse()?,
            queue_depth: count(self.queue_depth),
        })
    }
}

const HOST_COLUMNS: &str = "id, stage, name, status, queue_depth";

fn status_texts(statuses: &[HostStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl HostStore for Db {
    async fn find_host(&self, stage: Stage, name: &str) -> Result<Option<Host>> {
        let row: Option<HostRow> = sqlx::query_as(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE stage = $1 AND name = $2"
        ))
        .bind(stage.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(HostRow::try_into_host).transpose()
    }

    async fn host(&self, id: HostId) -> Result<Host> {
        let row: Option<HostRow> =
            sqlx::query_as(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("host {id}")))?
            .try_into_host()
    }

    async fn register_host(&self, stage: Stage, name: &str, status: HostStatus) -> Result<Host> {
        // A concurrent registration of the same host keeps the first row.
        let row: HostRow = sqlx::query_as(&format!(
            "INSERT INTO hosts (stage, name, status) VALUES ($1, $2, $3)
             ON CONFLICT (stage, name) DO UPDATE SET name = EXCLUDED.name
             RETURNING {HOST_COLUMNS}"
        ))
        .bind(stage.as_str())
        .bind(name)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        row.try_into_host()
    }

    async fn transition_host(&self, id: HostId, from: HostStatus, to: HostStatus) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE hosts SET status = $1, updated_at = now() WHERE id = $2 AND status = $3",
        )
        .bind(to.as_str())
        .bind(id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn set_host_status(&self, id: HostId, to: HostStatus) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE hosts SET status = $1, updated_at = now() WHERE id = $2 AND status = ANY($3)",
        )
        .bind(to.as_str())
        .bind(id.0)
        .bind(status_texts(&HostStatus::sources_for(to)))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn clear_host(&self, id: HostId) -> Result<()> {
        let rows_affected =
            sqlx::query("UPDATE hosts SET status = 'available', updated_at = now() WHERE id = $1")
                .bind(id.0)
                .execute(&self.pool)
                .await?
                .rows_affected();
        if rows_affected == 0 {
            return Err(Error::NotFound(format!("host {id}")));
        }
        Ok(())
    }

    async fn active_hosts(&self, stage: Stage) -> Result<Vec<Host>> {
        let blocking: Vec<HostStatus> = HostStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.is_blocking())
            .collect();
        let rows: Vec<HostRow> = sqlx::query_as(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts
             WHERE stage = $1 AND status <> ALL($2)
             ORDER BY id"
        ))
        .bind(stage.as_str())
        .bind(status_texts(&blocking))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HostRow::try_into_host).collect()
    }

    async fn all_hosts(&self) -> Result<Vec<Host>> {
        let rows: Vec<HostRow> = sqlx::query_as(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts ORDER BY stage, name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HostRow::try_into_host).collect()
    }

    async fn set_queue_depth(&self, id: HostId, depth: u64) -> Result<()> {
        sqlx::query("UPDATE hosts SET queue_depth = $1 WHERE id = $2")
            .bind(limit(depth))
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn try_lock_run(&self, stage: Stage, holder: &str) -> Result<bool> {
        let rows_affected = sqlx::query(
            "INSERT INTO run_locks (stage, holder) VALUES ($1, $2) ON CONFLICT (stage) DO NOTHING",
        )
        .bind(stage.as_str())
        .bind(holder)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn unlock_run(&self, stage: Stage, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM run_locks WHERE stage = $1 AND holder = $2")
            .bind(stage.as_str())
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
