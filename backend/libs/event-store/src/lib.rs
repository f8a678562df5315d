//! # Idempotent Event Store
//!
//! Persists funnel [`Event`]s into PostgreSQL keyed by their globally unique
//! `event_id`. The primary key on `event_id` is the only concurrency guard in
//! the pipeline: duplicate deliveries, redeliveries racing a fresh attempt, and
//! several consumer instances writing the same event all collapse into a single
//! row through `INSERT ... ON CONFLICT (event_id) DO NOTHING`.
//!
//! ## Semantics
//!
//! - [`EventRepository::insert_one`] never fails on a duplicate identity; it
//!   reports [`InsertOutcome::Duplicate`] instead.
//! - [`EventRepository::insert_batch`] skips conflicting rows and reports which
//!   identities were actually inserted. It fails as a whole only for reasons
//!   other than identity conflict, in which case nothing is committed and the
//!   caller falls back to per-row inserts.
//!
//! ```ignore
//! use event_store::{create_pool, run_migrations, EventRepository, PostgresEventRepository, StoreConfig};
//!
//! let pool = create_pool(StoreConfig::from_env("events-service")?).await?;
//! run_migrations(&pool).await?;
//!
//! let repo = PostgresEventRepository::new(pool);
//! let summary = repo.insert_batch(&events).await?;
//! println!("{} inserted, {} duplicates", summary.inserted_count(), summary.duplicate_count());
//! ```

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;
use tracing::{debug, info};

mod error;
mod pool;

pub use error::{StoreError, StoreResult};
pub use event_schema::Event;
pub use pool::{create_pool, run_migrations, StoreConfig};

/// Upper bound on event IDs accepted by the store
pub const MAX_EVENT_ID_LEN: usize = 255;

/// Rows per INSERT statement; 7 binds per row keeps this well under the
/// Postgres limit of 65535 bind parameters.
const MAX_ROWS_PER_STATEMENT: usize = 1000;

/// Result of inserting a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written
    Inserted,
    /// A row with this identity already existed; nothing was written
    Duplicate,
}

/// Result of a bulk insert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchInsertSummary {
    /// Number of events passed to the call
    pub requested: usize,
    /// Identities for which a new row was written
    pub inserted_ids: HashSet<String>,
}

impl BatchInsertSummary {
    pub fn inserted_count(&self) -> usize {
        self.inserted_ids.len()
    }

    /// `requested - inserted`; includes repeats of one identity within the batch
    pub fn duplicate_count(&self) -> usize {
        self.requested.saturating_sub(self.inserted_ids.len())
    }
}

/// Idempotent persistence for funnel events.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert one event; an existing identity is a successful no-op.
    async fn insert_one(&self, event: &Event) -> StoreResult<InsertOutcome>;

    /// Insert many events with row-level conflict-ignore.
    ///
    /// Zero-length input returns an empty summary without touching storage.
    async fn insert_batch(&self, events: &[Event]) -> StoreResult<BatchInsertSummary>;
}

/// PostgreSQL-backed [`EventRepository`]
#[derive(Clone)]
pub struct PostgresEventRepository {
    pool: PgPool,
}

impl PostgresEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of stored rows for an identity (0 or 1)
    pub async fn count_by_id(&self, event_id: &str) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE event_id = $1")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl EventRepository for PostgresEventRepository {
    async fn insert_one(&self, event: &Event) -> StoreResult<InsertOutcome> {
        validate_event_id(&event.event_id)?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (
                event_id, timestamp, version, source,
                funnel_stage, event_type, data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(event.timestamp)
        .bind(&event.version)
        .bind(event.source.as_str())
        .bind(event.funnel_stage.as_str())
        .bind(&event.event_type)
        .bind(&event.data)
        .execute(&self.pool)
        .await;

        let outcome = match result {
            Ok(done) if done.rows_affected() > 0 => InsertOutcome::Inserted,
            Ok(_) => InsertOutcome::Duplicate,
            Err(e) => {
                let err = StoreError::from(e);
                if !err.is_unique_violation() {
                    return Err(err);
                }
                InsertOutcome::Duplicate
            }
        };

        debug!(
            event_id = %event.event_id,
            source = %event.source,
            outcome = ?outcome,
            "Event insert completed"
        );

        Ok(outcome)
    }

    async fn insert_batch(&self, events: &[Event]) -> StoreResult<BatchInsertSummary> {
        if events.is_empty() {
            return Ok(BatchInsertSummary::default());
        }

        for event in events {
            validate_event_id(&event.event_id)?;
        }

        let mut inserted_ids = HashSet::with_capacity(events.len());
        let mut tx = self.pool.begin().await?;

        for chunk in events.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO events (event_id, timestamp, version, source, funnel_stage, event_type, data) ",
            );
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(&event.event_id)
                    .push_bind(event.timestamp)
                    .push_bind(&event.version)
                    .push_bind(event.source.as_str())
                    .push_bind(event.funnel_stage.as_str())
                    .push_bind(&event.event_type)
                    .push_bind(&event.data);
            });
            builder.push(" ON CONFLICT (event_id) DO NOTHING RETURNING event_id");

            let ids: Vec<String> = builder
                .build_query_scalar()
                .fetch_all(&mut *tx)
                .await?;
            inserted_ids.extend(ids);
        }

        tx.commit().await?;

        let summary = BatchInsertSummary {
            requested: events.len(),
            inserted_ids,
        };

        if summary.duplicate_count() > 0 {
            info!(
                inserted = summary.inserted_count(),
                duplicates = summary.duplicate_count(),
                "Batch insert skipped duplicate events"
            );
        } else {
            debug!(inserted = summary.inserted_count(), "Batch insert completed");
        }

        Ok(summary)
    }
}

/// Validate event_id format
fn validate_event_id(event_id: &str) -> StoreResult<()> {
    if event_id.is_empty() {
        return Err(StoreError::InvalidEventId(
            "Event ID cannot be empty".to_string(),
        ));
    }

    if event_id.len() > MAX_EVENT_ID_LEN {
        return Err(StoreError::InvalidEventId(format!(
            "Event ID too long: {} characters (max {})",
            event_id.len(),
            MAX_EVENT_ID_LEN
        )));
    }

    Ok(())
}
