//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::core::TenantDescriptor;
use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Find a configured tenant by org name.
    pub fn tenant(&self, org: &str) -> Option<&TenantDescriptor> {
        self.tenants.iter().find(|t| t.org == org)
    }
}

impl SourceConfig {
    /// Schema name holding a tenant's audit tables.
    pub fn database_for(&self, tenant: &TenantDescriptor) -> String {
        if let Some(database) = &tenant.database {
            return database.clone();
        }
        self.database_template
            .replace("{org}", &tenant.org)
            .replace("{tenant_id}", tenant.tenant_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
source:
  host: db.internal
  user: backfill
  password: secret
  database_template: "audit_{org}"
sink:
  type: memory
queue:
  type: memory
backfill:
  window_minutes: 30
  stream_workers: 1
tenants:
  - org: acme
    pod: pod-1
    tenant_id: t-1
  - org: globex
    pod: pod-2
    tenant_id: t-2
    database: globex_legacy
"#;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml(YAML).unwrap();
        assert_eq!(config.source.port, 3306);
        assert_eq!(config.source.active_table, "audit_event");
        assert_eq!(config.backfill.window_minutes, 30);
        assert_eq!(config.backfill.stream_workers, Some(1));
        assert_eq!(config.backfill.poll_interval_ms, 500);
        assert_eq!(config.queue.set_key, "audit-backfill:tenants");
        assert_eq!(config.tenants.len(), 2);
    }

    #[test]
    fn test_database_for_tenant() {
        let config = Config::from_yaml(YAML).unwrap();
        let acme = config.tenant("acme").unwrap();
        let globex = config.tenant("globex").unwrap();
        assert_eq!(config.source.database_for(acme), "audit_acme");
        assert_eq!(config.source.database_for(globex), "globex_legacy");
        assert!(config.tenant("initech").is_none());
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        let yaml = YAML.replace("window_minutes: 30", "window_minutes: 7");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backfill.yaml");
        std::fs::write(&path, YAML).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.source.host, "db.internal");
    }
}
