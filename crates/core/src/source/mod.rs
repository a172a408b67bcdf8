//! Source-platform collaborator.
//!
//! [`Source`] is the narrow read-only interface the migration core pulls
//! records through. The real implementation is [`auth0::Auth0Client`];
//! export-file input bypasses it via [`export`]. Tests script their own
//! implementations.

pub mod auth0;
pub mod export;

pub use auth0::Auth0Client;

use crate::errors::SourceError;
use crate::models::{SourceOrganization, SourceRole, SourceUser};

/// Read-only interface to the source platform.
///
/// All fetches are complete: pagination happens behind this seam, and a
/// page-level failure surfaces as [`SourceError::Unavailable`] -- fatal,
/// because partial source data would make an incomplete migration
/// undetectable later.
#[allow(async_fn_in_trait)]
pub trait Source {
    /// Fetch every user record.
    async fn fetch_users(&self) -> Result<Vec<SourceUser>, SourceError>;

    /// Fetch every role, including its permission names and member list.
    async fn fetch_roles(&self) -> Result<Vec<SourceRole>, SourceError>;

    /// Fetch every organization, including its member user IDs.
    async fn fetch_organizations(&self) -> Result<Vec<SourceOrganization>, SourceError>;
}
