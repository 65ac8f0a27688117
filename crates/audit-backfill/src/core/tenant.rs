//! Tenant identity.

use crate::error::{BackfillError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the tenant being backfilled.
///
/// Supplied externally and never mutated by the engine. `org` doubles as the
/// routing key stored in the distributed queue.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDescriptor {
    /// Organization name; routing key and display name.
    pub org: String,

    /// Logical pod or cluster hosting the tenant.
    #[serde(default)]
    pub pod: String,

    /// Stable tenant identifier; prefixes every object key.
    #[serde(default)]
    pub tenant_id: Option<String>,

    /// Source database name, overriding `source.database_template`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Full source connection URL, overriding the `source` section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl TenantDescriptor {
    pub fn new(org: impl Into<String>, pod: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            pod: pod.into(),
            tenant_id: Some(tenant_id.into()),
            database: None,
            source_url: None,
        }
    }

    /// Check that the descriptor carries a tenant id and a routing key.
    pub fn validate(&self) -> Result<()> {
        match self.tenant_id.as_deref() {
            None => {
                return Err(BackfillError::invalid_tenant(format!(
                    "tenant id is missing for org '{}'",
                    self.org
                )))
            }
            Some(id) if id.trim().is_empty() => {
                return Err(BackfillError::invalid_tenant(format!(
                    "tenant id is blank for org '{}'",
                    self.org
                )))
            }
            Some(_) => {}
        }
        if self.org.trim().is_empty() {
            return Err(BackfillError::invalid_tenant("org name is blank"));
        }
        Ok(())
    }

    /// Tenant id, or an empty string when absent.
    pub fn tenant_id(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or_default()
    }

    /// Copy without connection-bearing fields, safe to log.
    pub fn redacted(&self) -> Self {
        Self {
            org: self.org.clone(),
            pod: self.pod.clone(),
            tenant_id: self.tenant_id.clone(),
            database: None,
            source_url: None,
        }
    }

    /// Redacted descriptor rendered as JSON for log lines.
    pub fn redacted_json(&self) -> String {
        serde_json::to_string(&self.redacted()).unwrap_or_else(|_| self.org.clone())
    }
}

impl fmt::Debug for TenantDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantDescriptor")
            .field("org", &self.org)
            .field("pod", &self.pod)
            .field("tenant_id", &self.tenant_id)
            .field("database", &self.database.as_ref().map(|_| "[REDACTED]"))
            .field("source_url", &self.source_url.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl fmt::Display for TenantDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.org, self.pod)
    }
}
