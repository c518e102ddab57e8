//! Redis key layout.
//!
//! | Data | Key | Type |
//! |------|-----|------|
//! | Membership | `user:likes:{user}` / `user:favorites:{user}` | sorted set, score = creation epoch ms |
//! | Counters | `book:stats:{book}` fields `like_count` / `favorite_count` | hash |
//! | Leaderboard | `rank:{likes\|favorites}:{week\|month}:{period}` | sorted set |
//! | Event log | `stream:{like\|favorite}:actions` | stream |
//! | Toggle lock | `lock:{like\|favorite}:{user}:{book}` | string |
//! | Rebuild lock | `lock:rank:{likes\|favorites}:{week\|month}:{period}` | string |

use shelfmark_core::{EngagementKind, LeaderboardKey, LockKey, SubjectId, UserId};

/// Member that marks a membership set as loaded, so an empty set can be
/// told apart from one that is not cached.
pub const WARM_MARKER: &str = "__warm__";

/// Membership set of one user for one kind.
pub fn user_set(user_id: UserId, kind: EngagementKind) -> String {
    format!("user:{}:{user_id}", kind.plural())
}

/// Counter hash of one book.
pub fn stats(subject_id: SubjectId) -> String {
    format!("book:stats:{subject_id}")
}

/// Counter field of a kind inside the stats hash.
pub const fn count_field(kind: EngagementKind) -> &'static str {
    match kind {
        EngagementKind::Like => "like_count",
        EngagementKind::Favorite => "favorite_count",
    }
}

/// Leaderboard sorted set.
pub fn leaderboard(board: &LeaderboardKey) -> String {
    format!(
        "rank:{}:{}:{}",
        board.kind.plural(),
        board.period_type,
        board.period_key
    )
}

/// Event stream of a kind.
pub fn stream(kind: EngagementKind) -> String {
    format!("stream:{kind}:actions")
}

/// Lock key.
pub fn lock(key: &LockKey) -> String {
    match key {
        LockKey::Toggle {
            user_id,
            subject_id,
            kind,
        } => format!("lock:{kind}:{user_id}:{subject_id}"),
        LockKey::Rebuild(board) => format!("lock:{}", leaderboard(board)),
    }
}
