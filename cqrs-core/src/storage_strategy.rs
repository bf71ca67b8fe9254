//! Storage-strategy selection (C14): per-aggregate-type repository type
//! overrides, and the factory wiring that turns a selected type into a
//! concrete [`Repository`].
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::aggregate::Aggregate;
use crate::error::{Error, ErrorCode, Result};
use crate::repository::Repository;

/// Which persistence strategy a repository factory should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepositoryType {
    /// Full event history, replayed (optionally from a snapshot) on load.
    EventSourced,
    /// Only the latest state, read/written directly.
    StateBased,
    /// Both, kept in sync.
    Hybrid,
}

/// Connection parameters for a Redis-backed storage configuration, used
/// only to validate a [`StorageStrategyConfig`] that names Redis as a
/// backing store.
#[derive(Debug, Clone)]
pub struct RedisStorageConfig {
    /// The Redis host name or address.
    pub host: String,
    /// The Redis port.
    pub port: u16,
}

/// The default repository type plus any per-aggregate-type overrides.
#[derive(Debug, Clone)]
pub struct StorageStrategyConfig {
    /// Used for any aggregate type without an explicit override.
    pub default_type: RepositoryType,
    /// Aggregate-type-name → repository-type overrides.
    pub overrides: HashMap<String, RepositoryType>,
    /// Present when the deployment is Redis-backed; validated by
    /// [`validate`][Self::validate].
    pub redis: Option<RedisStorageConfig>,
}

impl StorageStrategyConfig {
    /// Creates a config with no overrides and no Redis backing.
    #[must_use]
    pub fn new(default_type: RepositoryType) -> Self {
        Self {
            default_type,
            overrides: HashMap::new(),
            redis: None,
        }
    }

    /// Overrides the repository type used for `aggregate_type`.
    #[must_use]
    pub fn with_override(mut self, aggregate_type: impl Into<String>, repository_type: RepositoryType) -> Self {
        self.overrides.insert(aggregate_type.into(), repository_type);
        self
    }

    /// Resolves the repository type to use for `aggregate_type`.
    #[must_use]
    pub fn repository_type(&self, aggregate_type: &str) -> RepositoryType {
        self.overrides.get(aggregate_type).copied().unwrap_or(self.default_type)
    }

    /// Validates the configuration: a Redis backing, if present, must name
    /// a non-empty host and a port in `(0, 65535]`.
    ///
    /// # Errors
    /// Returns [`ErrorCode::RepositoryError`] if the Redis config is
    /// malformed.
    pub fn validate(&self) -> Result<()> {
        if let Some(redis) = &self.redis {
            if redis.host.trim().is_empty() {
                return Err(Error::new(ErrorCode::RepositoryError, "redis storage config requires a non-empty host"));
            }
            if redis.port == 0 {
                return Err(Error::new(ErrorCode::RepositoryError, "redis storage config requires a port in (0, 65535]"));
            }
        }
        Ok(())
    }
}

/// Builds a boxed [`Repository`] on demand for a resolved [`RepositoryType`].
pub type RepositoryFactory<A> = Arc<dyn Fn() -> Arc<dyn Repository<A>> + Send + Sync>;

/// Resolves an aggregate type name to a [`RepositoryType`] via a
/// [`StorageStrategyConfig`], then dispatches to the registered factory
/// callable for that type.
pub struct ConfigurableRepositoryFactory<A: Aggregate> {
    config: StorageStrategyConfig,
    factories: DashMap<RepositoryType, RepositoryFactory<A>>,
}

impl<A: Aggregate> ConfigurableRepositoryFactory<A> {
    /// Creates a factory over `config`. No repository-type factories are
    /// registered yet; register them with
    /// [`register_factory`][Self::register_factory].
    #[must_use]
    pub fn new(config: StorageStrategyConfig) -> Self {
        Self {
            config,
            factories: DashMap::new(),
        }
    }

    /// Registers the callable used to build a repository of `repository_type`.
    pub fn register_factory(&self, repository_type: RepositoryType, factory: RepositoryFactory<A>) {
        self.factories.insert(repository_type, factory);
    }

    /// Resolves the repository type configured for `aggregate_type`.
    #[must_use]
    pub fn repository_type(&self, aggregate_type: &str) -> RepositoryType {
        self.config.repository_type(aggregate_type)
    }

    /// Builds a repository for `aggregate_type`, using the factory
    /// registered for its resolved [`RepositoryType`].
    ///
    /// # Errors
    /// Returns [`ErrorCode::RepositoryError`] if no factory is registered
    /// for the resolved type.
    pub fn create_repository(&self, aggregate_type: &str) -> Result<Arc<dyn Repository<A>>> {
        let repository_type = self.repository_type(aggregate_type);
        self.factories
            .get(&repository_type)
            .map(|f| f())
            .ok_or_else(|| Error::new(ErrorCode::RepositoryError, format!("no factory configured for {repository_type:?}")))
    }

    /// Validates the underlying [`StorageStrategyConfig`].
    pub fn validate_configuration(&self) -> Result<()> {
        self.config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_type_falls_back_to_default() {
        let config = StorageStrategyConfig::new(RepositoryType::EventSourced).with_override("Account", RepositoryType::Hybrid);
        assert_eq!(config.repository_type("Account"), RepositoryType::Hybrid);
        assert_eq!(config.repository_type("Order"), RepositoryType::EventSourced);
    }

    #[test]
    fn validate_rejects_malformed_redis_config() {
        let config = StorageStrategyConfig {
            default_type: RepositoryType::EventSourced,
            overrides: HashMap::new(),
            redis: Some(RedisStorageConfig {
                host: String::new(),
                port: 6379,
            }),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_redis_config() {
        let config = StorageStrategyConfig {
            default_type: RepositoryType::EventSourced,
            overrides: HashMap::new(),
            redis: Some(RedisStorageConfig {
                host: "localhost".into(),
                port: 6379,
            }),
        };
        assert!(config.validate().is_ok());
    }
}
