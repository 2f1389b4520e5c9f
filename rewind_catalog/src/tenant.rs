//! The platform's view of tenants, consumed through the [`TenantDirectory`] trait.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use iox_time::Time;
use observability_deps::tracing::info;
use parking_lot::RwLock;
use rewind_id::TenantId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How to reach a tenant's database. The `Debug` output never includes the credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor(String);

impl ConnectionDescriptor {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self(dsn.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectionDescriptor(<redacted>)")
    }
}

/// Surfaced to application traffic while a tenant is unavailable
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MaintenanceIndicator {
    #[default]
    None,
    Restoring {
        since_ns: i64,
    },
    Failed {
        reason: String,
    },
}

impl MaintenanceIndicator {
    pub fn restoring(since: Time) -> Self {
        Self::Restoring {
            since_ns: since.timestamp_nanos(),
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub maintenance: MaintenanceIndicator,
    /// Overrides the global snapshot retention window
    #[serde(default, with = "humantime_serde")]
    pub retention_window: Option<Duration>,
}

impl Tenant {
    pub fn new(id: impl Into<TenantId>, connection: ConnectionDescriptor) -> Self {
        Self {
            id: id.into(),
            connection,
            maintenance: MaintenanceIndicator::None,
            retention_window: None,
        }
    }

    pub fn with_retention_window(mut self, window: Duration) -> Self {
        self.retention_window = Some(window);
        self
    }
}

#[derive(Debug, Error)]
pub enum TenantDirectoryError {
    #[error("tenant {0} not found")]
    NotFound(TenantId),

    #[error("tenant directory error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

/// Lookup and maintenance state of tenants, owned by the platform
#[async_trait]
pub trait TenantDirectory: Debug + Send + Sync + 'static {
    async fn get(&self, tenant_id: &TenantId) -> Result<Tenant, TenantDirectoryError>;

    async fn list(&self) -> Result<Vec<Tenant>, TenantDirectoryError>;

    async fn set_maintenance(
        &self,
        tenant_id: &TenantId,
        indicator: MaintenanceIndicator,
    ) -> Result<(), TenantDirectoryError>;
}

/// A [`TenantDirectory`] backed by a map, for single-process deployments and tests
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<BTreeMap<TenantId, Tenant>>,
}

impl InMemoryTenantDirectory {
    pub fn new(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        Self {
            tenants: RwLock::new(tenants.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }

    pub fn insert(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.id.clone(), tenant);
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn get(&self, tenant_id: &TenantId) -> Result<Tenant, TenantDirectoryError> {
        self.tenants
            .read()
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| TenantDirectoryError::NotFound(tenant_id.clone()))
    }

    async fn list(&self) -> Result<Vec<Tenant>, TenantDirectoryError> {
        Ok(self.tenants.read().values().cloned().collect())
    }

    async fn set_maintenance(
        &self,
        tenant_id: &TenantId,
        indicator: MaintenanceIndicator,
    ) -> Result<(), TenantDirectoryError> {
        let mut tenants = self.tenants.write();
        let tenant = tenants
            .get_mut(tenant_id)
            .ok_or_else(|| TenantDirectoryError::NotFound(tenant_id.clone()))?;
        info!(tenant = %tenant_id, ?indicator, "maintenance indicator changed");
        tenant.maintenance = indicator;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connection_is_redacted_in_debug() {
        let tenant = Tenant::new("acme", ConnectionDescriptor::new("postgres://u:secret@db/acme"));
        assert!(!format!("{tenant:?}").contains("secret"));
        assert_eq!(tenant.connection.expose(), "postgres://u:secret@db/acme");
    }

    #[test]
    fn retention_override_uses_humantime() {
        let tenant: Tenant = serde_json::from_str(
            r#"{"id": "acme", "connection": "postgres://db/acme", "retention_window": "7days"}"#,
        )
        .unwrap();
        assert_eq!(tenant.retention_window, Some(Duration::from_secs(7 * 24 * 60 * 60)));
        assert_eq!(tenant.maintenance, MaintenanceIndicator::None);
    }

    #[tokio::test]
    async fn maintenance_round_trip() {
        let dir = InMemoryTenantDirectory::new([Tenant::new(
            "acme",
            ConnectionDescriptor::new("postgres://db/acme"),
        )]);
        let acme = TenantId::from("acme");
        dir.set_maintenance(&acme, MaintenanceIndicator::restoring(Time::from_timestamp_nanos(5)))
            .await
            .unwrap();
        assert!(dir.get(&acme).await.unwrap().maintenance.is_set());
        assert!(matches!(
            dir.set_maintenance(&"nobody".into(), MaintenanceIndicator::None)
                .await,
            Err(TenantDirectoryError::NotFound(_))
        ));
    }
}
