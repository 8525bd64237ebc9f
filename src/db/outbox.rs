use crate::error::StoreError;
use crate::model::{MessageKind, OutboxMessage, OutboxStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

const COLUMNS: &str = "id, type, payload, status, created_at, updated_at";

/// Outcome of a guarded status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The row was in one of the expected states and now holds the target.
    Applied(OutboxMessage),
    /// The row exists but was not in an expected state; nothing was written.
    Rejected { current: OutboxStatus },
}

/// Store for `mailer_logs` rows. Safe to share across tasks; every call checks
/// a connection out of the pool.
#[derive(Debug, Clone)]
pub struct OutboxStore {
    pool: SqlitePool,
}

impl OutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip(self, payload))]
    pub async fn insert(
        &self,
        kind: &MessageKind,
        payload: &str,
        status: OutboxStatus,
    ) -> Result<OutboxMessage, StoreError> {
        insert_with(&self.pool, kind, payload, status).await
    }

    /// Insert inside a caller-owned transaction.
    pub async fn insert_tx(
        tx: &mut Transaction<'_, Sqlite>,
        kind: &MessageKind,
        payload: &str,
        status: OutboxStatus,
    ) -> Result<OutboxMessage, StoreError> {
        insert_with(&mut **tx, kind, payload, status).await
    }

    /// Overwrite `status`, `payload` and `updated_at` of the row with the
    /// record's id. Last write wins; use [`OutboxStore::transition`] when the
    /// prior status matters.
    #[instrument(skip(self, record), fields(id = record.id, status = %record.status))]
    pub async fn update(&self, record: &OutboxMessage) -> Result<OutboxMessage, StoreError> {
        update_with(&self.pool, record).await
    }

    pub async fn update_tx(
        tx: &mut Transaction<'_, Sqlite>,
        record: &OutboxMessage,
    ) -> Result<OutboxMessage, StoreError> {
        update_with(&mut **tx, record).await
    }

    #[instrument(skip(self))]
    pub async fn find(&self, id: i64) -> Result<Option<OutboxMessage>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM mailer_logs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_row(&r)).transpose()
    }

    /// Compare-and-swap status change: writes `to` (and `payload`, when given)
    /// only if the row currently holds one of `from`.
    #[instrument(skip(self, payload))]
    pub async fn transition(
        &self,
        id: i64,
        from: &[OutboxStatus],
        to: OutboxStatus,
        payload: Option<&str>,
    ) -> Result<Transition, StoreError> {
        if from.is_empty() {
            return match self.find(id).await? {
                Some(current) => Ok(Transition::Rejected { current: current.status }),
                None => Err(StoreError::NotFound(id)),
            };
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE mailer_logs SET status = ?, payload = COALESCE(?, payload), updated_at = ? \
             WHERE id = ? AND status IN ({placeholders}) RETURNING {COLUMNS}"
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(payload)
            .bind(Utc::now())
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        if let Some(row) = query.fetch_optional(&self.pool).await? {
            return Ok(Transition::Applied(map_row(&row)?));
        }
        match self.find(id).await? {
            Some(current) => {
                debug!(id, current = %current.status, target = %to, "transition rejected");
                Ok(Transition::Rejected { current: current.status })
            }
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Rows still `processing` whose last update is older than `older_than`,
    /// oldest first.
    #[instrument(skip(self))]
    pub async fn stale_processing(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM mailer_logs \
             WHERE status = ? AND julianday(updated_at) < julianday(?) \
             ORDER BY julianday(updated_at) ASC, id ASC LIMIT ?"
        ))
        .bind(OutboxStatus::Processing.as_str())
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn count_by_status(&self, status: OutboxStatus) -> Result<i64, StoreError> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM mailer_logs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

async fn insert_with<'e, E>(
    executor: E,
    kind: &MessageKind,
    payload: &str,
    status: OutboxStatus,
) -> Result<OutboxMessage, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now();
    let row = sqlx::query(&format!(
        "INSERT INTO mailer_logs (type, payload, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING {COLUMNS}"
    ))
    .bind(kind.as_str())
    .bind(payload)
    .bind(status.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await?;
    map_row(&row)
}

async fn update_with<'e, E>(executor: E, record: &OutboxMessage) -> Result<OutboxMessage, StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "UPDATE mailer_logs SET status = ?, payload = ?, updated_at = ? WHERE id = ? RETURNING {COLUMNS}"
    ))
    .bind(record.status.as_str())
    .bind(&record.payload)
    .bind(Utc::now())
    .bind(record.id)
    .fetch_optional(executor)
    .await?;
    match row {
        Some(row) => map_row(&row),
        None => Err(StoreError::NotFound(record.id)),
    }
}

fn map_row(row: &SqliteRow) -> Result<OutboxMessage, StoreError> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = OutboxStatus::parse_status(&status).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("unknown status `{status}`"),
    })?;
    Ok(OutboxMessage {
        id,
        kind: MessageKind::from(row.try_get::<String, _>("type")?),
        payload: row.try_get("payload")?,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> OutboxStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        OutboxStore::new(pool)
    }

    #[tokio::test]
    async fn insert_assigns_id_and_timestamps() {
        let store = setup_store().await;
        let a = store
            .insert(&MessageKind::ConfirmationMail, "{}", OutboxStatus::Processing)
            .await
            .unwrap();
        let b = store
            .insert(&MessageKind::ConfirmationMail, "{}", OutboxStatus::Processing)
            .await
            .unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status, OutboxStatus::Processing);
        assert_eq!(a.created_at, a.updated_at);
        assert_eq!(store.find(a.id).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn update_overwrites_and_reports_missing_rows() {
        let store = setup_store().await;
        let mut rec = store
            .insert(&MessageKind::ConfirmationMail, "{}", OutboxStatus::Processing)
            .await
            .unwrap();
        rec.status = OutboxStatus::Queued;
        rec.payload = r#"{"tracking_id":1}"#.into();
        let updated = store.update(&rec).await.unwrap();
        assert_eq!(updated.status, OutboxStatus::Queued);
        assert_eq!(updated.payload, rec.payload);
        assert!(updated.updated_at >= rec.updated_at);

        rec.id = 999;
        assert!(matches!(store.update(&rec).await, Err(StoreError::NotFound(999))));
    }

    #[tokio::test]
    async fn transition_is_guarded_by_prior_status() {
        let store = setup_store().await;
        let rec = store
            .insert(&MessageKind::ConfirmationMail, "{}", OutboxStatus::Processing)
            .await
            .unwrap();

        let sent = store
            .transition(rec.id, &[OutboxStatus::Processing, OutboxStatus::Queued], OutboxStatus::Sent, None)
            .await
            .unwrap();
        assert!(matches!(sent, Transition::Applied(ref m) if m.status == OutboxStatus::Sent));

        // a late processing -> queued must not move the row backwards
        let late = store
            .transition(rec.id, &[OutboxStatus::Processing], OutboxStatus::Queued, Some("late"))
            .await
            .unwrap();
        assert_eq!(late, Transition::Rejected { current: OutboxStatus::Sent });
        let stored = store.find(rec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Sent);
        assert_eq!(stored.payload, "{}");

        assert!(matches!(
            store.transition(42, &[OutboxStatus::Queued], OutboxStatus::Sent, None).await,
            Err(StoreError::NotFound(42))
        ));
    }

    #[tokio::test]
    async fn stale_processing_filters_by_age_and_status() {
        let store = setup_store().await;
        let old = store
            .insert(&MessageKind::ConfirmationMail, "{}", OutboxStatus::Processing)
            .await
            .unwrap();
        let queued = store
            .insert(&MessageKind::ConfirmationMail, "{}", OutboxStatus::Queued)
            .await
            .unwrap();
        sqlx::query("UPDATE mailer_logs SET updated_at = ? WHERE id IN (?, ?)")
            .bind(Utc::now() - Duration::minutes(10))
            .bind(old.id)
            .bind(queued.id)
            .execute(store.pool())
            .await
            .unwrap();
        let _fresh = store
            .insert(&MessageKind::ConfirmationMail, "{}", OutboxStatus::Processing)
            .await
            .unwrap();

        let stale = store
            .stale_processing(Utc::now() - Duration::minutes(1), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }
}
