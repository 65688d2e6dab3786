use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Deletion history for one hostname. A missing record means zero deletes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictionRecord {
    pub host_or_id: String,
    pub delete_count: u32,
    /// Milliseconds since the Unix epoch.
    pub last_delete_time: i64,
}

/// Re-add restriction derived from a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restriction {
    None,
    Until(DateTime<Utc>),
    Permanent,
}

pub const FIRST_DELETE_BAN_DAYS: i64 = 30;
pub const SECOND_DELETE_BAN_DAYS: i64 = 180;
pub const PERMANENT_AFTER_DELETES: u32 = 3;

impl RestrictionRecord {
    pub fn last_deleted_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_delete_time)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn restriction_at(&self, now: DateTime<Utc>) -> Restriction {
        let days = match self.delete_count {
            0 => return Restriction::None,
            1 => FIRST_DELETE_BAN_DAYS,
            2 => SECOND_DELETE_BAN_DAYS,
            _ => return Restriction::Permanent,
        };
        let deadline = self.last_deleted_at() + Duration::days(days);
        if now < deadline {
            Restriction::Until(deadline)
        } else {
            Restriction::None
        }
    }
}

/// Persisted ledger document.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub records: Vec<RestrictionRecord>,
}
