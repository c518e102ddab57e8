//! Custom Axum extractors.
//!
//! Authentication happens in front of this service; the gateway forwards the
//! authenticated reader as an `X-User-Id` header.

use crate::error::AppError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use shelfmark_core::UserId;

/// Header carrying the authenticated caller.
pub const USER_ID_HEADER: &str = "X-User-Id";

/// The authenticated caller.
///
/// Rejects with 401 when the header is missing and 400 when it is not a
/// positive integer.
///
/// # Example
///
/// ```ignore
/// async fn handler(CallerId(user_id): CallerId) -> String {
///     format!("Hello reader {user_id}")
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::unauthorized("Missing caller identity"))?;

        raw.to_str()
            .ok()
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(|id| Self(UserId(id)))
            .ok_or_else(|| AppError::bad_request("Invalid caller identity"))
    }
}
