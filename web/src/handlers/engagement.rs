//! Like and favorite endpoints.
//!
//! The `{kind}` path segment accepts `likes` or `favorites` (singular forms
//! are tolerated).

use crate::error::AppError;
use crate::extractors::CallerId;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use shelfmark_core::{
    EngagementKind, EngagementRecord, EngagementRepository, EngagementStatus, FastStore, Page,
    PageRequest, SubjectId, SubjectStatus,
};

/// Most books a single batch-status request may ask about.
pub const MAX_BATCH_STATUS: usize = 100;

const DEFAULT_PAGE_SIZE: u32 = 10;

/// `/{kind}/{book_id}/...` path parameters.
#[derive(Debug, Deserialize)]
pub struct BookPath {
    kind: String,
    book_id: i64,
}

/// `/{kind}/...` path parameters.
#[derive(Debug, Deserialize)]
pub struct KindPath {
    kind: String,
}

/// Batch status request body.
#[derive(Debug, Deserialize)]
pub struct BatchStatusRequest {
    /// Books to report on, answered in this order.
    pub book_ids: Vec<i64>,
}

/// Paging query for `mine`.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    /// 1-based page number
    pub page: Option<u32>,
    /// Items per page
    #[serde(alias = "pageSize")]
    pub page_size: Option<u32>,
}

fn parse_kind(raw: &str) -> Result<EngagementKind, AppError> {
    raw.parse::<EngagementKind>().map_err(AppError::from)
}

fn parse_book(raw: i64) -> Result<SubjectId, AppError> {
    if raw <= 0 {
        return Err(AppError::bad_request(format!("Invalid book id: {raw}")));
    }
    Ok(SubjectId(raw))
}

/// Flip the caller's like or favorite on a book.
///
/// # Endpoint
///
/// ```text
/// POST /api/v1/{kind}/{book_id}/toggle
/// X-User-Id: 42
/// ```
///
/// # Response
///
/// ```json
/// { "engaged": true, "count": 18 }
/// ```
///
/// Returns 429 when another toggle for the same book is still in flight.
pub async fn toggle<S: FastStore, R: EngagementRepository>(
    State(state): State<AppState<S, R>>,
    CallerId(user_id): CallerId,
    Path(path): Path<BookPath>,
) -> Result<Json<EngagementStatus>, AppError> {
    let kind = parse_kind(&path.kind)?;
    let book_id = parse_book(path.book_id)?;

    let status = state.toggles.toggle(user_id, book_id, kind).await?;
    tracing::info!(
        user_id = %user_id,
        book_id = %book_id,
        kind = %kind,
        engaged = status.engaged,
        count = status.count,
        "Engagement toggled"
    );
    Ok(Json(status))
}

/// The caller's state on one book.
///
/// # Endpoint
///
/// ```text
/// GET /api/v1/{kind}/{book_id}/status
/// ```
pub async fn status<S: FastStore, R: EngagementRepository>(
    State(state): State<AppState<S, R>>,
    CallerId(user_id): CallerId,
    Path(path): Path<BookPath>,
) -> Result<Json<EngagementStatus>, AppError> {
    let kind = parse_kind(&path.kind)?;
    let book_id = parse_book(path.book_id)?;
    Ok(Json(state.toggles.status(user_id, book_id, kind).await?))
}

/// The caller's state on many books.
///
/// # Endpoint
///
/// ```text
/// POST /api/v1/{kind}/batch-status
/// Content-Type: application/json
///
/// { "book_ids": [3, 7, 9] }
/// ```
///
/// # Response
///
/// ```json
/// [{ "book_id": 3, "engaged": false, "count": 0 }, ...]
/// ```
pub async fn batch_status<S: FastStore, R: EngagementRepository>(
    State(state): State<AppState<S, R>>,
    CallerId(user_id): CallerId,
    Path(path): Path<KindPath>,
    Json(request): Json<BatchStatusRequest>,
) -> Result<Json<Vec<SubjectStatus>>, AppError> {
    let kind = parse_kind(&path.kind)?;
    if request.book_ids.len() > MAX_BATCH_STATUS {
        return Err(AppError::bad_request(format!(
            "At most {MAX_BATCH_STATUS} books per request"
        )));
    }
    let books = request
        .book_ids
        .into_iter()
        .map(parse_book)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(state.toggles.batch_status(user_id, &books, kind).await?))
}

/// The caller's likes or favorites, newest first.
///
/// # Endpoint
///
/// ```text
/// GET /api/v1/{kind}/mine?page=1&page_size=10
/// ```
pub async fn mine<S: FastStore, R: EngagementRepository>(
    State(state): State<AppState<S, R>>,
    CallerId(user_id): CallerId,
    Path(path): Path<KindPath>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Page<EngagementRecord>>, AppError> {
    let kind = parse_kind(&path.kind)?;
    let page = PageRequest::new(
        query.page.unwrap_or(1),
        query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    );
    Ok(Json(
        state
            .toggles
            .list_user_engagements(user_id, kind, page)
            .await?,
    ))
}
