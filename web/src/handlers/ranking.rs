//! Leaderboard endpoints.

use crate::WebResult;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use shelfmark_core::{EngagementKind, EngagementRepository, FastStore, PeriodType};
use shelfmark_runtime::Ranking;

/// Ranking query.
#[derive(Debug, Deserialize)]
pub struct RankingQuery {
    /// `like` or `favorite`
    #[serde(rename = "type")]
    pub kind: String,
    /// `week` or `month`
    pub period: String,
    /// Number of entries, clamped to 1..=100 (default 100)
    pub limit: Option<usize>,
}

/// Current leaderboard.
///
/// # Endpoint
///
/// ```text
/// GET /api/v1/rankings?type=like&period=week&limit=10
/// ```
///
/// A board that cannot be read or rebuilt right now comes back empty rather
/// than as an error.
pub async fn ranking<S: FastStore, R: EngagementRepository>(
    State(state): State<AppState<S, R>>,
    Query(query): Query<RankingQuery>,
) -> WebResult<Json<Ranking>> {
    let kind: EngagementKind = query.kind.parse()?;
    let period_type: PeriodType = query.period.parse()?;
    Ok(Json(
        state
            .rankings
            .ranking(kind, period_type, query.limit)
            .await?,
    ))
}

/// Rebuild every current leaderboard from the relational store.
///
/// # Endpoint
///
/// ```text
/// POST /api/v1/rankings/rebuild
/// ```
///
/// # Response
///
/// ```json
/// { "ok": true }
/// ```
pub async fn rebuild<S: FastStore, R: EngagementRepository>(
    State(state): State<AppState<S, R>>,
) -> WebResult<Json<Value>> {
    state.rankings.rebuild_all().await?;
    tracing::info!("Leaderboards rebuilt on request");
    Ok(Json(json!({ "ok": true })))
}
