//! Resolver error types

use fedtx_common::DatabaseId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ResolverError>;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("out of foreign transaction resolver slots; \
             increase max_foreign_xact_resolvers")]
    SlotsExhausted,

    #[error("no foreign transaction resolver is running on database {0}")]
    NoResolver(DatabaseId),

    #[error("shutting down while waiting for foreign transaction resolution")]
    ShuttingDown,
}
