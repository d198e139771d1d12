//! Time-bounded exclusive claims.
//!
//! A lease is live while `now < expires_at`. Once `expires_at` passes, any other
//! member of the group may take it over; the old holder's token stops working.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LeaseToken, Offset, QueueEntry, StreamName, TaskId};

/// Identity of a consumer (or drainer) instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Exclusive claim of one queue entry by one consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub token: LeaseToken,
    pub stream: StreamName,
    pub offset: Offset,
    pub task_id: TaskId,
    pub consumer_group: String,
    pub consumer: ConsumerId,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ClaimLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Exclusive right to drain one stream and advance its checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamLease {
    pub token: LeaseToken,
    pub stream: StreamName,
    pub holder: ConsumerId,
    pub expires_at: DateTime<Utc>,
}

impl StreamLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a successful claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed {
    pub entry: QueueEntry,
    pub lease: ClaimLease,
}
