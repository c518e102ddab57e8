//! Engagement identifiers, events and request-layer response types.

use crate::error::{EngagementError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a reader (the user performing the toggle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Identifier of the engaged subject (a book).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubjectId {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|e| EngagementError::Serialization(format!("Invalid subject id {s:?}: {e}")))
    }
}

/// Kind of engagement a user can toggle on a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementKind {
    /// "Like" a book.
    Like,
    /// Add a book to favorites.
    Favorite,
}

impl EngagementKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 2] = [Self::Like, Self::Favorite];

    /// Singular wire name (`like`, `favorite`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Favorite => "favorite",
        }
    }

    /// Plural name used in cache namespaces (`likes`, `favorites`).
    #[must_use]
    pub const fn plural(&self) -> &'static str {
        match self {
            Self::Like => "likes",
            Self::Favorite => "favorites",
        }
    }
}

impl fmt::Display for EngagementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngagementKind {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "like" | "likes" => Ok(Self::Like),
            "favorite" | "favorites" => Ok(Self::Favorite),
            _ => Err(EngagementError::InvalidArgument(format!(
                "Unknown engagement kind: {s}"
            ))),
        }
    }
}

/// Direction of a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementAction {
    /// The relation was created.
    On,
    /// The relation was removed.
    Off,
}

impl EngagementAction {
    /// Wire name (`on`, `off`).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }

    /// Signed change this action applies to counters and leaderboards.
    #[must_use]
    pub const fn delta(&self) -> i64 {
        match self {
            Self::On => 1,
            Self::Off => -1,
        }
    }

    /// The action that undoes this one.
    #[must_use]
    pub const fn inverse(&self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }
}

impl FromStr for EngagementAction {
    type Err = EngagementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            _ => Err(EngagementError::Serialization(format!(
                "Unknown engagement action: {s}"
            ))),
        }
    }
}

/// A toggle recorded in the event log, awaiting application to the relational store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    /// Who toggled
    pub user_id: UserId,
    /// What was toggled
    pub subject_id: SubjectId,
    /// Like or favorite
    pub kind: EngagementKind,
    /// On or off
    pub action: EngagementAction,
    /// When the toggle was applied to the fast path (millisecond precision)
    pub timestamp: DateTime<Utc>,
}

impl PendingEvent {
    /// Log field holding the user id.
    pub const FIELD_USER: &'static str = "user_id";
    /// Log field holding the subject id.
    pub const FIELD_SUBJECT: &'static str = "book_id";
    /// Log field holding the kind.
    pub const FIELD_KIND: &'static str = "kind";
    /// Log field holding the action.
    pub const FIELD_ACTION: &'static str = "action";
    /// Log field holding the timestamp (epoch milliseconds).
    pub const FIELD_TIMESTAMP: &'static str = "timestamp";

    /// Create a new event. The timestamp is truncated to milliseconds so that
    /// it survives a round trip through the log unchanged.
    #[must_use]
    pub fn new(
        user_id: UserId,
        subject_id: SubjectId,
        kind: EngagementKind,
        action: EngagementAction,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let timestamp = Utc
            .timestamp_millis_opt(timestamp.timestamp_millis())
            .single()
            .unwrap_or(timestamp);
        Self {
            user_id,
            subject_id,
            kind,
            action,
            timestamp,
        }
    }

    /// Encode as flat string fields for the event log.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (Self::FIELD_USER, self.user_id.0.to_string()),
            (Self::FIELD_SUBJECT, self.subject_id.0.to_string()),
            (Self::FIELD_KIND, self.kind.as_str().to_string()),
            (Self::FIELD_ACTION, self.action.as_str().to_string()),
            (
                Self::FIELD_TIMESTAMP,
                self.timestamp.timestamp_millis().to_string(),
            ),
        ]
    }

    /// Decode from log fields.
    ///
    /// # Errors
    ///
    /// Returns [`EngagementError::Serialization`] if a field is missing or malformed.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| EngagementError::Serialization(format!("Missing field {name}")))
        }
        fn number(fields: &HashMap<String, String>, name: &str) -> Result<i64> {
            let raw = field(fields, name)?;
            raw.parse::<i64>().map_err(|e| {
                EngagementError::Serialization(format!("Invalid {name} {raw:?}: {e}"))
            })
        }

        let kind = field(fields, Self::FIELD_KIND)?
            .parse::<EngagementKind>()
            .map_err(|e| EngagementError::Serialization(e.to_string()))?;
        let millis = number(fields, Self::FIELD_TIMESTAMP)?;
        let timestamp = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
            EngagementError::Serialization(format!("Timestamp out of range: {millis}"))
        })?;

        Ok(Self {
            user_id: UserId(number(fields, Self::FIELD_USER)?),
            subject_id: SubjectId(number(fields, Self::FIELD_SUBJECT)?),
            kind,
            action: field(fields, Self::FIELD_ACTION)?.parse()?,
            timestamp,
        })
    }
}

/// Engagement state of one user on one subject, plus the subject's aggregate count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementStatus {
    /// Whether the user currently has an active relation
    pub engaged: bool,
    /// Best-available aggregate count for the subject
    pub count: i64,
}

/// One entry of a batch status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectStatus {
    /// Subject the status refers to
    #[serde(rename = "book_id")]
    pub subject_id: SubjectId,
    /// Whether the user currently has an active relation
    pub engaged: bool,
    /// Best-available aggregate count for the subject
    pub count: i64,
}

/// Book details needed by rankings and engagement listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Book id
    pub id: SubjectId,
    /// Title
    pub title: String,
    /// Author
    pub author: String,
    /// Durable like counter
    pub like_count: i64,
    /// Durable favorite counter
    pub favorite_count: i64,
}

/// A durable engagement row as listed for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementRecord {
    /// Engaged book
    #[serde(rename = "book_id")]
    pub subject_id: SubjectId,
    /// Like or favorite
    pub kind: EngagementKind,
    /// When the relation was created
    pub created_at: DateTime<Utc>,
    /// Book details, absent if the book row is gone
    #[serde(rename = "book", skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
}

/// Pagination parameters (1-based page).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Page number, starting at 1
    pub page: u32,
    /// Items per page
    pub page_size: u32,
}

impl PageRequest {
    /// Largest page size served.
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Create a normalized page request (page ≥ 1, size in `1..=100`).
    #[must_use]
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    /// Row offset of the first item.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.page.saturating_sub(1) as u64) * self.page_size as u64
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Total number of items across all pages
    pub total: i64,
    /// Page number
    pub page: u32,
    /// Page size used
    pub page_size: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;

    fn sample_event() -> PendingEvent {
        PendingEvent::new(
            UserId(7),
            SubjectId(42),
            EngagementKind::Favorite,
            EngagementAction::Off,
            Utc.with_ymd_and_hms(2025, 11, 5, 10, 30, 0).unwrap(),
        )
    }

    #[test]
    fn test_event_fields_decode() {
        let event = sample_event();
        let fields: HashMap<String, String> = event
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(fields.get("book_id").map(String::as_str), Some("42"));
        assert_eq!(fields.get("action").map(String::as_str), Some("off"));
        assert_eq!(PendingEvent::from_fields(&fields).unwrap(), event);
    }

    #[test]
    fn test_event_missing_field_is_serialization_error() {
        let mut fields: HashMap<String, String> = sample_event()
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.remove("user_id");

        assert!(matches!(
            PendingEvent::from_fields(&fields),
            Err(EngagementError::Serialization(_))
        ));
    }

    #[test]
    fn test_event_rejects_unknown_action() {
        let mut fields: HashMap<String, String> = sample_event()
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.insert("action".into(), "unlike".into());

        assert!(PendingEvent::from_fields(&fields).is_err());
    }

    #[test]
    fn test_timestamp_truncated_to_millis() {
        let at = Utc.timestamp_nanos(1_700_000_000_123_456_789);
        let event = PendingEvent::new(
            UserId(1),
            SubjectId(1),
            EngagementKind::Like,
            EngagementAction::On,
            at,
        );
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_123);
        assert_eq!(event.timestamp.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("likes".parse::<EngagementKind>().unwrap(), EngagementKind::Like);
        assert_eq!(
            "favorite".parse::<EngagementKind>().unwrap(),
            EngagementKind::Favorite
        );
        assert!(matches!(
            "star".parse::<EngagementKind>(),
            Err(EngagementError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_action_delta_and_inverse() {
        assert_eq!(EngagementAction::On.delta(), 1);
        assert_eq!(EngagementAction::Off.delta(), -1);
        assert_eq!(EngagementAction::On.inverse(), EngagementAction::Off);
    }

    #[test]
    fn test_page_request_normalizes() {
        let page = PageRequest::new(0, 500);
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 100);
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
    }

    #[test]
    fn test_status_serializes_book_id() {
        let status = SubjectStatus {
            subject_id: SubjectId(7),
            engaged: true,
            count: 1,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["book_id"], 7);
        assert_eq!(json["engaged"], true);
    }
}
