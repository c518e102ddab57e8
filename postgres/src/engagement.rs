//! `PostgreSQL` engagement repository.
//!
//! One relation table per kind (`book_likes`, `book_favorites`) with a unique
//! `(user_id, book_id)` constraint, plus the denormalised counters on `books`.
//! A counter only moves when a statement actually inserted or deleted a row,
//! and always in the same transaction as that row change.

use chrono::{DateTime, Utc};
use shelfmark_core::{
    BatchOutcome, EngagementAction, EngagementError, EngagementKind, EngagementRecord,
    EngagementRepository, Page, PageRequest, PendingEvent, Result, Subject, SubjectCounters,
    SubjectId, UserId,
};
use sqlx::{PgConnection, PgPool};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

fn db_err(action: &'static str) -> impl FnOnce(sqlx::Error) -> EngagementError {
    move |e| EngagementError::Database(format!("Failed to {action}: {e}"))
}

const fn relation_table(kind: EngagementKind) -> &'static str {
    match kind {
        EngagementKind::Like => "book_likes",
        EngagementKind::Favorite => "book_favorites",
    }
}

const fn counter_column(kind: EngagementKind) -> &'static str {
    match kind {
        EngagementKind::Like => "like_count",
        EngagementKind::Favorite => "favorite_count",
    }
}

fn raw_ids(subjects: &[SubjectId]) -> Vec<i64> {
    subjects.iter().map(|id| id.0).collect()
}

type SubjectRow = (i64, String, String, i64, i64);

fn subject_from_row((id, title, author, like_count, favorite_count): SubjectRow) -> Subject {
    Subject {
        id: SubjectId(id),
        title,
        author,
        like_count,
        favorite_count,
    }
}

/// `PostgreSQL` store of record for engagement relations.
///
/// # Example
///
/// ```no_run
/// use shelfmark_postgres::PostgresEngagementRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let repo = PostgresEngagementRepository::connect("postgres://localhost/library").await?;
/// repo.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresEngagementRepository {
    pool: PgPool,
}

impl PostgresEngagementRepository {
    /// Create a repository over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`EngagementError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(db_err("connect to database"))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EngagementError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ═══════════════════════════════════════════════════════════
// Row changes
// ═══════════════════════════════════════════════════════════

/// Insert the relation if absent; bump the counter only if a row was created.
async fn insert_relation(conn: &mut PgConnection, event: &PendingEvent) -> Result<bool> {
    let inserted = sqlx::query(&format!(
        "INSERT INTO {} (user_id, book_id, created_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (user_id, book_id) DO NOTHING",
        relation_table(event.kind)
    ))
    .bind(event.user_id.0)
    .bind(event.subject_id.0)
    .bind(event.timestamp)
    .execute(&mut *conn)
    .await
    .map_err(db_err("insert relation"))?
    .rows_affected()
        == 1;

    if inserted {
        let column = counter_column(event.kind);
        sqlx::query(&format!(
            "UPDATE books SET {column} = {column} + 1 WHERE id = $1"
        ))
        .bind(event.subject_id.0)
        .execute(&mut *conn)
        .await
        .map_err(db_err("increment counter"))?;
    }
    Ok(inserted)
}

/// Delete the relation if present; decrement the counter only if a row went away.
async fn delete_relation(conn: &mut PgConnection, event: &PendingEvent) -> Result<bool> {
    let deleted = sqlx::query(&format!(
        "DELETE FROM {} WHERE user_id = $1 AND book_id = $2",
        relation_table(event.kind)
    ))
    .bind(event.user_id.0)
    .bind(event.subject_id.0)
    .execute(&mut *conn)
    .await
    .map_err(db_err("delete relation"))?
    .rows_affected()
        == 1;

    if deleted {
        let column = counter_column(event.kind);
        sqlx::query(&format!(
            "UPDATE books SET {column} = GREATEST({column} - 1, 0) WHERE id = $1"
        ))
        .bind(event.subject_id.0)
        .execute(&mut *conn)
        .await
        .map_err(db_err("decrement counter"))?;
    }
    Ok(deleted)
}

fn check_kind(kind: EngagementKind, events: &[PendingEvent]) -> Result<()> {
    match events.iter().find(|event| event.kind != kind) {
        Some(event) => Err(EngagementError::Internal(format!(
            "{} event in {kind} batch",
            event.kind
        ))),
        None => Ok(()),
    }
}

impl EngagementRepository for PostgresEngagementRepository {
    // ═══════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════

    async fn relation_since(
        &self,
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(&format!(
            "SELECT created_at FROM {} WHERE user_id = $1 AND book_id = $2",
            relation_table(kind)
        ))
        .bind(user_id.0)
        .bind(subject_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("load relation"))?;

        Ok(row.map(|(created_at,)| created_at))
    }

    async fn relations_exist(
        &self,
        user_id: UserId,
        subjects: &[SubjectId],
        kind: EngagementKind,
    ) -> Result<Vec<bool>> {
        if subjects.is_empty() {
            return Ok(Vec::new());
        }
        let found: Vec<(i64,)> = sqlx::query_as(&format!(
            "SELECT book_id FROM {} WHERE user_id = $1 AND book_id = ANY($2)",
            relation_table(kind)
        ))
        .bind(user_id.0)
        .bind(raw_ids(subjects))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("check relations"))?;

        let found: HashSet<i64> = found.into_iter().map(|(id,)| id).collect();
        Ok(subjects.iter().map(|id| found.contains(&id.0)).collect())
    }

    async fn user_relations(
        &self,
        user_id: UserId,
        kind: EngagementKind,
    ) -> Result<Vec<(SubjectId, DateTime<Utc>)>> {
        let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT book_id, created_at FROM {} WHERE user_id = $1",
            relation_table(kind)
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("load user relations"))?;

        Ok(rows
            .into_iter()
            .map(|(id, created_at)| (SubjectId(id), created_at))
            .collect())
    }

    async fn count_active(&self, subject_id: SubjectId, kind: EngagementKind) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE book_id = $1",
            relation_table(kind)
        ))
        .bind(subject_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("count relations"))?;
        Ok(count)
    }

    // ═══════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════

    async fn apply_direct(&self, event: &PendingEvent) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;
        let changed = match event.action {
            EngagementAction::On => insert_relation(&mut *tx, event).await?,
            EngagementAction::Off => delete_relation(&mut *tx, event).await?,
        };
        tx.commit().await.map_err(db_err("commit transaction"))?;

        tracing::debug!(
            user_id = %event.user_id,
            book_id = %event.subject_id,
            kind = %event.kind,
            action = event.action.as_str(),
            changed,
            "Applied engagement directly"
        );
        Ok(changed)
    }

    async fn apply_batch(
        &self,
        kind: EngagementKind,
        on: &[PendingEvent],
        off: &[PendingEvent],
    ) -> Result<BatchOutcome> {
        check_kind(kind, off)?;
        check_kind(kind, on)?;

        let started = Instant::now();
        let mut outcome = BatchOutcome::default();
        let mut tx = self.pool.begin().await.map_err(db_err("begin transaction"))?;

        // Removals first: a pair in both lists was removed and then recreated.
        for event in off {
            if delete_relation(&mut *tx, event).await? {
                outcome.deleted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        for event in on {
            if insert_relation(&mut *tx, event).await? {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        // Dropping an uncommitted transaction rolls it back, so any `?` above
        // leaves the store untouched.
        tx.commit().await.map_err(db_err("commit batch"))?;

        metrics::histogram!("engagement_postgres_batch_duration_seconds", "kind" => kind.as_str())
            .record(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    // ═══════════════════════════════════════════════════════════
    // Rankings and details
    // ═══════════════════════════════════════════════════════════

    async fn count_created_between(
        &self,
        kind: EngagementKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(SubjectId, i64)>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(&format!(
            "SELECT book_id, COUNT(*) AS score
             FROM {}
             WHERE created_at >= $1 AND created_at < $2
             GROUP BY book_id
             ORDER BY score DESC, book_id ASC",
            relation_table(kind)
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("count relations in window"))?;

        Ok(rows
            .into_iter()
            .map(|(id, score)| (SubjectId(id), score))
            .collect())
    }

    async fn subjects(&self, ids: &[SubjectId]) -> Result<Vec<Subject>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<SubjectRow> = sqlx::query_as(
            r"
            SELECT id, title, author, like_count, favorite_count
            FROM books
            WHERE id = ANY($1) AND deleted_at IS NULL
            ",
        )
        .bind(raw_ids(ids))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("load books"))?;

        let mut by_id: HashMap<i64, Subject> = rows
            .into_iter()
            .map(|row| (row.0, subject_from_row(row)))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(&id.0)).collect())
    }

    async fn subject_counters(&self) -> Result<Vec<SubjectCounters>> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT id, like_count, favorite_count FROM books WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("load counters"))?;

        Ok(rows
            .into_iter()
            .map(|(id, likes, favorites)| SubjectCounters {
                subject_id: SubjectId(id),
                likes,
                favorites,
            })
            .collect())
    }

    async fn list_user_engagements(
        &self,
        user_id: UserId,
        kind: EngagementKind,
        page: PageRequest,
    ) -> Result<Page<EngagementRecord>> {
        let table = relation_table(kind);

        let (total,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM {table} WHERE user_id = $1"))
                .bind(user_id.0)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err("count user relations"))?;

        #[allow(clippy::type_complexity)]
        let rows: Vec<(
            i64,
            DateTime<Utc>,
            Option<String>,
            Option<String>,
            Option<i64>,
            Option<i64>,
        )> = sqlx::query_as(&format!(
            "SELECT r.book_id, r.created_at, b.title, b.author, b.like_count, b.favorite_count
             FROM {table} r
             LEFT JOIN books b ON b.id = r.book_id AND b.deleted_at IS NULL
             WHERE r.user_id = $1
             ORDER BY r.created_at DESC, r.book_id DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(user_id.0)
        .bind(i64::from(page.page_size))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("list user relations"))?;

        let items = rows
            .into_iter()
            .map(|(book_id, created_at, title, author, likes, favorites)| {
                let subject = match (title, author) {
                    (Some(title), Some(author)) => Some(Subject {
                        id: SubjectId(book_id),
                        title,
                        author,
                        like_count: likes.unwrap_or(0),
                        favorite_count: favorites.unwrap_or(0),
                    }),
                    _ => None,
                };
                EngagementRecord {
                    subject_id: SubjectId(book_id),
                    kind,
                    created_at,
                    subject,
                }
            })
            .collect();

        Ok(Page {
            items,
            total,
            page: page.page,
            page_size: page.page_size,
        })
    }
}
