//! Configuration
//!
//! One struct per subsystem, deserializable from the host configuration
//! file. Defaults leave both the foreign transaction manager and the
//! resolver pool disabled (capacity zero); synchronous commit defaults to
//! waiting for remote flush once standby names are configured.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "max_foreign_xact_resolvers ({resolvers}) must not exceed \
         max_prepared_foreign_xacts ({prepared})"
    )]
    ResolverPoolTooLarge { resolvers: usize, prepared: usize },
}

/// How the commit path treats foreign participants that need atomicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwophaseCommitLevel {
    /// Never use two-phase commit; fail commits that would require it.
    #[default]
    Disabled,
    /// Prepare participants that are able to, one-phase the rest.
    Prefer,
    /// Every modifying participant must support prepare.
    Required,
}

/// Synchronous commit level, selecting which replication wait mode (if
/// any) a committing backend blocks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCommitLevel {
    Off,
    Local,
    RemoteWrite,
    #[default]
    On,
}

/// Foreign transaction manager settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XactConfig {
    /// Capacity of the prepared-foreign-transaction pool. Zero disables
    /// two-phase commit towards foreign servers entirely.
    pub max_prepared_foreign_xacts: usize,
    pub foreign_twophase_commit: TwophaseCommitLevel,
}

impl Default for XactConfig {
    fn default() -> Self {
        Self {
            max_prepared_foreign_xacts: 0,
            foreign_twophase_commit: TwophaseCommitLevel::default(),
        }
    }
}

/// Resolver launcher and worker settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Capacity of the resolver slot table. Must not exceed
    /// `max_prepared_foreign_xacts`.
    pub max_foreign_xact_resolvers: usize,
    /// Launcher throttling interval in milliseconds.
    pub foreign_xact_resolution_retry_interval: u64,
    /// Idle exit for resolver workers in milliseconds; zero disables the
    /// idle timeout.
    pub foreign_xact_resolver_timeout: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_foreign_xact_resolvers: 0,
            foreign_xact_resolution_retry_interval: 60_000,
            foreign_xact_resolver_timeout: 60_000,
        }
    }
}

impl ResolverConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.foreign_xact_resolution_retry_interval)
    }

    /// None when the idle timeout is disabled.
    pub fn resolver_timeout(&self) -> Option<Duration> {
        if self.foreign_xact_resolver_timeout == 0 {
            None
        } else {
            Some(Duration::from_millis(self.foreign_xact_resolver_timeout))
        }
    }

    pub fn validate(&self, xact: &XactConfig) -> Result<(), ConfigError> {
        if self.max_foreign_xact_resolvers > xact.max_prepared_foreign_xacts {
            return Err(ConfigError::ResolverPoolTooLarge {
                resolvers: self.max_foreign_xact_resolvers,
                prepared: xact.max_prepared_foreign_xacts,
            });
        }
        Ok(())
    }
}

/// Synchronous replication settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncRepConfig {
    pub synchronous_commit: SyncCommitLevel,
    /// Standby group specification, e.g. `s1`, `2 (s1, s2, s3)` or
    /// `2 (s1, 1 (s2, s3))`. Empty disables synchronous replication.
    pub synchronous_standby_names: String,
}

impl SyncRepConfig {
    pub fn standbys_defined(&self) -> bool {
        !self.synchronous_standby_names.trim().is_empty()
    }
}
