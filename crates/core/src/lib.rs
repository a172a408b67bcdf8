//! IdMigrate core library.
//!
//! This crate provides the components for migrating identity data from
//! Auth0 to Descope: configuration, source loaders, record mapping, batch
//! dispatch with rate-limit resilience, association rebuilding, and run
//! accounting.

pub mod config;
pub mod destination;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod mapper;
pub mod models;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod source;

// Re-exports for convenience.
pub use config::AppConfig;
pub use dispatch::BatchDispatcher;
pub use engine::{CancelToken, MigrationEngine, MigrationOptions};
pub use mapper::IdentityMapper;
pub use models::IdMap;
pub use report::MigrationReport;
pub use resolver::AssociationResolver;
