//! Connector registry - pluggable backends selected by dialect and priority.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rowtap_core::{QueryError, Result};

use crate::{ConnectionDescriptor, Connector};

/// Builds connectors for the dialects its registration lists.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Rewrite a descriptor URI into the form `connect` expects.
    fn canonical_uri(&self, uri: &str) -> Result<String> {
        Ok(uri.to_string())
    }

    /// Connect using a descriptor whose URI is already canonical.
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connector>>;
}

#[derive(Clone)]
pub struct ConnectorRegistration {
    pub name: String,
    pub factory: Arc<dyn ConnectorFactory>,
    /// Accepted dialect name -> canonical dialect.
    pub dialects: HashMap<String, String>,
    pub default_dialect: String,
    pub priority: i32,
}

impl fmt::Debug for ConnectorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorRegistration")
            .field("name", &self.name)
            .field("dialects", &self.dialects)
            .field("default_dialect", &self.default_dialect)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Append-only table of registrations.
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    registrations: Vec<ConnectorRegistration>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration. Names are unique.
    pub fn register(&mut self, registration: ConnectorRegistration) -> Result<()> {
        if self.registrations.iter().any(|r| r.name == registration.name) {
            return Err(QueryError::resolution(format!(
                "Connector '{}' is already registered",
                registration.name
            )));
        }
        self.registrations.push(registration);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    /// Registrations serving `dialect`, highest priority first; ties keep
    /// registration order.
    pub fn candidates(&self, dialect: &str) -> Vec<&ConnectorRegistration> {
        let dialect = dialect.to_ascii_lowercase();
        let mut found: Vec<&ConnectorRegistration> = self
            .registrations
            .iter()
            .filter(|r| r.dialects.contains_key(&dialect))
            .collect();
        found.sort_by_key(|r| std::cmp::Reverse(r.priority));
        found
    }

    /// Pick the registration for a descriptor and the canonical dialect it
    /// will serve. `descriptor.dialect` may also name a registration
    /// directly, in which case its default dialect is used.
    pub fn resolve(&self, descriptor: &ConnectionDescriptor) -> Result<(&ConnectorRegistration, String)> {
        let requested = descriptor
            .dialect
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(str::to_ascii_lowercase)
            .or_else(|| descriptor.scheme_dialect())
            .ok_or_else(|| {
                QueryError::resolution(format!("Cannot determine a dialect for '{}'", descriptor.uri))
            })?;
        if let Some(registration) = self.registrations.iter().find(|r| r.name == requested) {
            return Ok((registration, registration.default_dialect.clone()));
        }
        let registration = self
            .candidates(&requested)
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::resolution(format!("No connector is registered for dialect '{}'", requested)))?;
        let dialect = registration
            .dialects
            .get(&requested)
            .cloned()
            .unwrap_or_else(|| registration.default_dialect.clone());
        Ok((registration, dialect))
    }
}

/// Registry with the built-in SQLite and PostgreSQL connectors.
pub fn default_registry(sqlite_base_dir: impl Into<PathBuf>) -> ConnectorRegistry {
    ConnectorRegistry {
        registrations: vec![
            crate::sqlite::sqlite_registration(sqlite_base_dir),
            crate::postgres::postgres_registration(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverConnects;

    #[async_trait]
    impl ConnectorFactory for NeverConnects {
        async fn connect(&self, _descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connector>> {
            Err(QueryError::resolution("unreachable backend"))
        }
    }

    fn registration(name: &str, dialects: &[&str], priority: i32) -> ConnectorRegistration {
        ConnectorRegistration {
            name: name.to_string(),
            factory: Arc::new(NeverConnects),
            dialects: dialects
                .iter()
                .map(|d| (d.to_string(), dialects[0].to_string()))
                .collect(),
            default_dialect: dialects[0].to_string(),
            priority,
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ConnectorRegistry::new();
        registry.register(registration("a", &["sqlite"], 0)).unwrap();
        let err = registry.register(registration("a", &["other"], 5)).unwrap_err();
        assert!(matches!(err, QueryError::ConnectorResolution(_)));
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[test]
    fn candidates_order_by_priority_then_registration() {
        let mut registry = ConnectorRegistry::new();
        registry.register(registration("low", &["sqlite"], 0)).unwrap();
        registry.register(registration("first_high", &["sqlite"], 10)).unwrap();
        registry.register(registration("second_high", &["sqlite"], 10)).unwrap();
        registry.register(registration("pg", &["postgresql"], 20)).unwrap();
        let names: Vec<&str> = registry.candidates("SQLite").iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first_high", "second_high", "low"]);
    }

    #[test]
    fn resolve_from_descriptor_or_scheme() {
        let registry = default_registry("/tmp");
        let (reg, dialect) = registry
            .resolve(&ConnectionDescriptor::new("sqlite:x.db", "t"))
            .unwrap();
        assert_eq!((reg.name.as_str(), dialect.as_str()), ("sqlx_sqlite", "sqlite"));

        let (reg, dialect) = registry
            .resolve(&ConnectionDescriptor::new("postgresql+psycopg2://db/x", "t"))
            .unwrap();
        assert_eq!((reg.name.as_str(), dialect.as_str()), ("sqlx_postgres", "postgresql"));

        let (reg, _) = registry
            .resolve(&ConnectionDescriptor::new("file.db", "t").with_dialect("sqlitedb"))
            .unwrap();
        assert_eq!(reg.name, "sqlx_sqlite");

        let (reg, dialect) = registry
            .resolve(&ConnectionDescriptor::new("whatever", "t").with_dialect("sqlx_postgres"))
            .unwrap();
        assert_eq!((reg.name.as_str(), dialect.as_str()), ("sqlx_postgres", "postgresql"));
    }

    #[test]
    fn unknown_dialect_is_a_resolution_error() {
        let registry = default_registry("/tmp");
        let err = registry
            .resolve(&ConnectionDescriptor::new("oracle://db/x", "t"))
            .unwrap_err();
        assert!(matches!(err, QueryError::ConnectorResolution(_)));
        assert!(registry.resolve(&ConnectionDescriptor::new("no-scheme", "t")).is_err());
    }
}
