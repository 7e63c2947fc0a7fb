use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::queue::{DurableQueue, ItemState, LastFailure, QueueError, QueueItem};
use crate::RequestEnvelope;

/// SQLite-backed durable queue.
///
/// Each operation is a single SQL statement, which makes every write
/// transactional on its own: a crash mid-write never leaves a record
/// half-updated. The envelope and failure metadata are stored as JSON;
/// timestamps are stored as integer milliseconds so SQL ordering matches
/// the [`DurableQueue`] contract bit for bit.
#[derive(Clone)]
pub struct SqlxQueue {
    pool: SqlitePool,
}

impl SqlxQueue {
    /// Creates a new queue over an existing pool without touching the schema.
    pub fn new_uninitialized(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a new queue and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: SqlitePool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }
}

#[async_trait]
impl DurableQueue for SqlxQueue {
    #[tracing::instrument(skip_all, fields(id = %item.id))]
    async fn save(&self, item: QueueItem) -> Result<(), QueueError> {
        let envelope = serde_json::to_string(&item.envelope).map_err(boxed)?;
        let last_failure = item
            .last_failure
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(boxed)?;

        sqlx::query(
            "INSERT OR REPLACE INTO relay_queue
                (id, priority, state, attempts, next_eligible, created_at, dedupe_key, envelope, last_failure)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(item.priority)
        .bind(state_str(item.state))
        .bind(item.attempts as i64)
        .bind(item.next_eligible.timestamp_millis())
        .bind(item.created_at().timestamp_millis())
        .bind(item.envelope.dedupe_key())
        .bind(envelope)
        .bind(last_failure)
        .execute(&self.pool)
        .await
        .map_err(boxed)?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM relay_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(boxed)?;
        Ok(())
    }

    async fn load_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let rows = sqlx::query(
            "SELECT envelope, state, attempts, next_eligible, last_failure FROM relay_queue
             WHERE state IN ('pending', 'delayed') AND next_eligible <= ?
             ORDER BY priority DESC, next_eligible ASC, created_at ASC, id ASC
             LIMIT ?",
        )
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(boxed)?;

        rows.iter().map(decode_row).collect::<Result<_, Error>>().map_err(boxed)
    }

    async fn load_by_dedupe_key(&self, key: &str) -> Result<Vec<QueueItem>, QueueError> {
        let rows = sqlx::query(
            "SELECT envelope, state, attempts, next_eligible, last_failure FROM relay_queue
             WHERE dedupe_key = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(boxed)?;

        rows.iter().map(decode_row).collect::<Result<_, Error>>().map_err(boxed)
    }

    async fn load_all(&self) -> Result<Vec<QueueItem>, QueueError> {
        let rows = sqlx::query(
            "SELECT envelope, state, attempts, next_eligible, last_failure FROM relay_queue
             ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(boxed)?;

        rows.iter().map(decode_row).collect::<Result<_, Error>>().map_err(boxed)
    }

    async fn count_active(&self) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM relay_queue WHERE state IN ('pending', 'in_flight', 'delayed')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(boxed)?;
        Ok(count as usize)
    }
}

/// Ensures the queue table exists.
async fn create_table(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS relay_queue (
            id TEXT PRIMARY KEY,
            priority INTEGER NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            next_eligible INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            dedupe_key TEXT,
            envelope TEXT NOT NULL,
            last_failure TEXT
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

fn decode_row(row: &SqliteRow) -> Result<QueueItem, Error> {
    let envelope_json: String = row.try_get("envelope")?;
    let envelope: RequestEnvelope = serde_json::from_str(&envelope_json)?;

    let state: String = row.try_get("state")?;
    let state = parse_state(&state)?;

    let attempts: i64 = row.try_get("attempts")?;
    let next_eligible: i64 = row.try_get("next_eligible")?;
    let next_eligible = DateTime::<Utc>::from_timestamp_millis(next_eligible)
        .ok_or_else(|| Error::corrupt("next_eligible out of range"))?;

    let last_failure: Option<String> = row.try_get("last_failure")?;
    let last_failure: Option<LastFailure> = last_failure
        .map(|json| serde_json::from_str(&json))
        .transpose()?;

    Ok(QueueItem {
        id: envelope.id().to_string(),
        priority: envelope.priority(),
        envelope,
        state,
        attempts: attempts as u32,
        next_eligible,
        last_failure,
    })
}

fn state_str(state: ItemState) -> &'static str {
    match state {
        ItemState::Pending => "pending",
        ItemState::InFlight => "in_flight",
        ItemState::Delayed => "delayed",
        ItemState::Failed => "failed",
        ItemState::Succeeded => "succeeded",
        ItemState::Canceled => "canceled",
    }
}

fn parse_state(raw: &str) -> Result<ItemState, Error> {
    match raw {
        "pending" => Ok(ItemState::Pending),
        "in_flight" => Ok(ItemState::InFlight),
        "delayed" => Ok(ItemState::Delayed),
        "failed" => Ok(ItemState::Failed),
        "succeeded" => Ok(ItemState::Succeeded),
        "canceled" => Ok(ItemState::Canceled),
        _ => Err(Error::corrupt("unknown item state")),
    }
}

fn boxed<E: std::error::Error + Send + Sync + 'static>(err: E) -> QueueError {
    QueueError::backend(Box::new(err))
}

/// Sqlx queue errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

/// Kinds of sqlx queue errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    Database(sqlx::Error),
    Serde(serde_json::Error),
    Corrupt(&'static str),
}

impl Error {
    fn corrupt(what: &'static str) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Corrupt(what),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxDriverErrorKind::Serde(err) => writeln!(f, "Serde error: {}", err),
            SqlxDriverErrorKind::Corrupt(what) => writeln!(f, "Corrupt record: {}", what),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Serde(err) => Some(err),
            SqlxDriverErrorKind::Corrupt(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Database(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: SqlxDriverErrorKind::Serde(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Method, RequestEnvelope};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_queue() -> SqlxQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqlxQueue::try_new(pool).await.unwrap()
    }

    fn item(priority: i32) -> QueueItem {
        let envelope =
            RequestEnvelope::new(Method::Post, "https://example.com").with_priority(priority);
        QueueItem::pending(envelope, Utc::now())
    }

    #[tokio::test]
    async fn save_load_round_trip_preserves_the_record() {
        let queue = memory_queue().await;
        let mut entry = item(7);
        entry.attempts = 2;
        entry.last_failure = Some(LastFailure {
            kind: crate::FailureKind::ServerError,
            detail: "HTTP 503".to_string(),
        });

        queue.save(entry.clone()).await.unwrap();

        let all = queue.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, entry.id);
        assert_eq!(all[0].priority, 7);
        assert_eq!(all[0].attempts, 2);
        assert_eq!(all[0].last_failure, entry.last_failure);
        assert_eq!(all[0].envelope, entry.envelope);
    }

    #[tokio::test]
    async fn load_ready_applies_order_and_limit_in_sql() {
        let queue = memory_queue().await;
        let now = Utc::now();

        let low = item(1);
        let high = item(9);
        let mut future = item(5);
        future.state = ItemState::Delayed;
        future.next_eligible = now + chrono::Duration::seconds(60);

        for entry in [low.clone(), high.clone(), future] {
            queue.save(entry).await.unwrap();
        }

        let ready = queue.load_ready(10, now).await.unwrap();
        let ids: Vec<&str> = ready.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![&high.id, &low.id]);

        let truncated = queue.load_ready(1, now).await.unwrap();
        assert_eq!(truncated.len(), 1);
        assert_eq!(truncated[0].id, high.id);
    }

    #[tokio::test]
    async fn dedupe_key_lookup_and_active_count() {
        let queue = memory_queue().await;
        let now = Utc::now();

        let keyed = RequestEnvelope::new(Method::Post, "https://example.com").with_dedupe_key("x");
        queue.save(QueueItem::pending(keyed, now)).await.unwrap();

        let mut failed = item(0);
        failed.state = ItemState::Failed;
        queue.save(failed).await.unwrap();

        assert_eq!(queue.load_by_dedupe_key("x").await.unwrap().len(), 1);
        assert_eq!(queue.load_by_dedupe_key("y").await.unwrap().len(), 0);
        assert_eq!(queue.count_active().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let queue = memory_queue().await;
        let entry = item(0);
        queue.save(entry.clone()).await.unwrap();

        queue.delete(&entry.id).await.unwrap();
        assert!(queue.load_all().await.unwrap().is_empty());

        // Absent id stays a no-op.
        queue.delete(&entry.id).await.unwrap();
    }
}
