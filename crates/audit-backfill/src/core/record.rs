//! Audit record shapes read from the source store.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Lightweight `(id, created)` projection streamed to drive fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordIdTimestamp {
    pub id: String,
    /// Creation time in epoch milliseconds.
    pub created: i64,
}

impl RecordIdTimestamp {
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            created,
        }
    }
}

/// A complete audit record as persisted in the destination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    /// Creation time in epoch milliseconds.
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string4: Option<String>,
    /// Raw attributes payload, kept as stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<String>,
}

impl AuditRecord {
    /// Record with only identity fields set.
    pub fn new(id: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            created,
            action: None,
            source: None,
            target: None,
            application: None,
            tracking_id: None,
            string1: None,
            string2: None,
            string3: None,
            string4: None,
            attributes: None,
        }
    }

    /// Creation time as a UTC timestamp; out-of-range values clamp to the epoch.
    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.created)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn id_timestamp(&self) -> RecordIdTimestamp {
        RecordIdTimestamp::new(self.id.clone(), self.created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_at_converts_millis() {
        let record = AuditRecord::new("a1", 1_600_000_000_123);
        assert_eq!(record.created_at().timestamp_millis(), 1_600_000_000_123);
    }

    #[test]
    fn test_json_omits_empty_fields() {
        let mut record = AuditRecord::new("a1", 5);
        record.action = Some("login".into());
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"id":"a1","created":5,"action":"login"}"#);
    }
}
