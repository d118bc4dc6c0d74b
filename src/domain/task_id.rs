//! Time-ordered task identifiers.
//!
//! An ID is `YYYYMMDDHHMMSSmmm-NNNNNN`: the UTC creation instant to the
//! millisecond followed by a per-millisecond sequence. Both parts are fixed
//! width, so comparing two IDs as strings compares their creation order.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const SEQ_LIMIT: u32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the ID into (unix millis, sequence).
    ///
    /// Accepts the legacy `YYYYMMDDHHMMSS-N` form, treating its millisecond
    /// part as zero.
    pub fn position(&self) -> Option<(i64, u32)> {
        let (stamp, seq) = self.0.split_once('-')?;
        if stamp.len() < 14 || !stamp.is_ascii() {
            return None;
        }
        let (seconds, millis) = stamp.split_at(14);
        let base = NaiveDateTime::parse_from_str(seconds, STAMP_FORMAT).ok()?;
        let millis: i64 = match millis {
            "" => 0,
            m if m.len() == 3 => m.parse().ok()?,
            _ => return None,
        };
        let seq = seq.parse().ok()?;
        Some((base.and_utc().timestamp_millis() + millis, seq))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Default)]
struct Cursor {
    millis: i64,
    seq: u32,
    issued: bool,
}

/// Hands out strictly increasing [`TaskId`]s, even if the wall clock steps
/// backwards or the process restarts with older IDs already on disk.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    cursor: Mutex<Cursor>,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> TaskId {
        self.next_at(Utc::now())
    }

    pub fn next_at(&self, now: DateTime<Utc>) -> TaskId {
        let mut cursor = self.cursor.lock().unwrap_or_else(|p| p.into_inner());
        let now_ms = now.timestamp_millis();

        if !cursor.issued || now_ms > cursor.millis {
            cursor.millis = now_ms;
            cursor.seq = 0;
        } else if cursor.seq + 1 >= SEQ_LIMIT {
            cursor.millis += 1;
            cursor.seq = 0;
        } else {
            cursor.seq += 1;
        }
        cursor.issued = true;

        let stamp = DateTime::from_timestamp_millis(cursor.millis).unwrap_or(now);
        TaskId(format!(
            "{}{:03}-{:06}",
            stamp.format(STAMP_FORMAT),
            stamp.timestamp_subsec_millis(),
            cursor.seq
        ))
    }

    /// Makes sure every future ID sorts after `id`.
    pub fn observe(&self, id: &TaskId) {
        let Some((millis, seq)) = id.position() else {
            return;
        };
        let mut cursor = self.cursor.lock().unwrap_or_else(|p| p.into_inner());
        if !cursor.issued || (millis, seq) > (cursor.millis, cursor.seq) {
            cursor.millis = millis;
            cursor.seq = seq;
            cursor.issued = true;
        }
    }
}
