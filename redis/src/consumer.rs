//! Consumer-group reader over a Redis stream.

use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};
use shelfmark_core::{EngagementError, LogConsumer, LogEntry, Result};
use std::collections::HashMap;
use std::time::Duration;

/// One named member of a consumer group, with its own connection.
pub struct RedisLogConsumer {
    conn: ConnectionManager,
    stream: String,
    group: String,
    name: String,
}

impl RedisLogConsumer {
    pub(crate) fn new(conn: ConnectionManager, stream: String, group: &str, name: &str) -> Self {
        Self {
            conn,
            stream,
            group: group.to_string(),
            name: name.to_string(),
        }
    }
}

fn millis(duration: Duration) -> usize {
    usize::try_from(duration.as_millis()).unwrap_or(usize::MAX)
}

fn to_entry(stream_id: StreamId) -> LogEntry {
    let fields = stream_id
        .map
        .iter()
        .filter_map(|(field, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|value| (field.clone(), value))
        })
        .collect();
    LogEntry {
        id: stream_id.id,
        fields,
    }
}

impl LogConsumer for RedisLogConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_new(&mut self, count: usize, block: Duration) -> Result<Vec<LogEntry>> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.name)
            .count(count)
            .block(millis(block).max(1));

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream], &[">"], &options)
            .await
            .map_err(|e| EngagementError::FastStore(format!("Failed to read stream: {e}")))?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(to_entry)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn claim_stale(&mut self, min_idle: Duration, count: usize) -> Result<Vec<LogEntry>> {
        // Reply: [next-cursor, [[id, [field, value, ...] | nil], ...], deleted-ids]
        let reply: Vec<Value> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.name)
            .arg(millis(min_idle))
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| EngagementError::FastStore(format!("Failed to claim stale entries: {e}")))?;

        let Some(claimed) = reply.get(1) else {
            return Ok(Vec::new());
        };
        let claimed: Vec<(String, Option<HashMap<String, String>>)> =
            redis::from_redis_value(claimed).map_err(|e| {
                EngagementError::FastStore(format!("Failed to decode claimed entries: {e}"))
            })?;

        Ok(claimed
            .into_iter()
            .map(|(id, fields)| LogEntry {
                id,
                // Entries trimmed from the stream come back without fields.
                fields: fields.unwrap_or_default(),
            })
            .collect())
    }

    async fn ack(&mut self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let acked: u64 = self
            .conn
            .xack(&self.stream, &self.group, ids)
            .await
            .map_err(|e| EngagementError::FastStore(format!("Failed to acknowledge entries: {e}")))?;

        tracing::debug!(consumer = %self.name, stream = %self.stream, acked, "Acknowledged entries");
        Ok(acked)
    }
}
