//! Destination-platform collaborator.
//!
//! [`Destination`] is the narrow write interface the migration core talks
//! to. The real implementation is [`descope::DescopeClient`]; dry runs swap
//! in [`dryrun::DryRunDestination`] so the full pipeline executes with no-op
//! counters instead of network writes. Tests script their own
//! implementations.

pub mod descope;
pub mod dryrun;

use serde::{Deserialize, Serialize};

use crate::errors::DestinationError;

pub use descope::DescopeClient;
pub use dryrun::DryRunDestination;

// ---------------------------------------------------------------------------
// Create-request payloads
// ---------------------------------------------------------------------------

/// Custom attributes stamped onto every migrated user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomAttributes {
    /// Joined list of source connection tags.
    pub connection: String,
    /// Marks the user as created by this migration.
    #[serde(rename = "freshlyMigrated")]
    pub freshly_migrated: bool,
    /// The source nickname, which has no first-class destination field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

/// A user create request in the destination's shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPayload {
    /// Back-reference to the originating source user. Never sent to the
    /// destination; used only for report and IdMap bookkeeping.
    pub source_user_id: String,
    /// Primary login identifier; doubles as the destination user ID in the
    /// IdMap once creation is confirmed.
    pub login_id: String,
    pub email: String,
    pub verified_email: bool,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub phone: Option<String>,
    pub verified_phone: bool,
    pub picture: Option<String>,
    pub custom_attributes: CustomAttributes,
    pub additional_login_ids: Vec<String>,
    /// Re-encoded password hash, if the source algorithm was importable.
    pub password: Option<PasswordHash>,
    /// Blocked at the source; deactivated at the destination after creation.
    pub blocked: bool,
}

/// A role create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePayload {
    /// Back-reference to the source role. Roles are name-addressed on both
    /// platforms, so this is the role name.
    pub source_id: String,
    pub name: String,
    pub description: Option<String>,
}

/// A tenant create request. The source organization ID is reused as the
/// destination tenant ID, which keeps re-runs idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPayload {
    /// Back-reference to the source organization ID.
    pub source_id: String,
    /// Requested destination tenant ID.
    pub tenant_id: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Password hash envelope
// ---------------------------------------------------------------------------

/// PBKDF2 digest variants the destination can import.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Pbkdf2Variant {
    Sha256,
    Sha512,
}

impl std::fmt::Display for Pbkdf2Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

/// A password hash re-encoded into the destination's accepted envelope:
/// algorithm tag plus parameters plus digest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase", tag = "algorithm")]
pub enum PasswordHash {
    Bcrypt {
        /// Full modular-crypt string (`$2b$10$...`).
        hash: String,
    },
    Pbkdf2 {
        variant: Pbkdf2Variant,
        iterations: u32,
        salt: Vec<u8>,
        digest: Vec<u8>,
    },
}

// ---------------------------------------------------------------------------
// Batch response
// ---------------------------------------------------------------------------

/// Outcome of creating one record within a batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { id: String },
    /// The natural key already exists. Carries the existing destination ID
    /// when the response included one.
    AlreadyExists { id: Option<String> },
    Rejected { reason: String },
}

/// Response to a batch-create call: one outcome per input payload, in input
/// order. Positional correspondence is the contract that lets the dispatcher
/// re-pair requests with responses.
#[derive(Debug, Clone, Default)]
pub struct BatchCreateResponse {
    pub outcomes: Vec<CreateOutcome>,
}

// ---------------------------------------------------------------------------
// The collaborator trait
// ---------------------------------------------------------------------------

/// Write interface to the destination platform.
///
/// Failure modes surfaced to the dispatcher are the variants of
/// [`DestinationError`]; rate limits are the only retryable kind.
#[allow(async_fn_in_trait)]
pub trait Destination {
    /// Create a batch of users in one call. The response has one outcome
    /// per payload, in input order. A whole-call error (rate limit,
    /// outage) applies to every record in the batch.
    async fn create_users_batch(
        &self,
        users: &[UserPayload],
    ) -> Result<BatchCreateResponse, DestinationError>;

    /// Create one role; returns its destination identifier.
    async fn create_role(&self, role: &RolePayload) -> Result<String, DestinationError>;

    /// Create one permission; returns its destination identifier.
    async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, DestinationError>;

    /// Attach a set of permissions to an existing role.
    async fn set_role_permissions(
        &self,
        role_id: &str,
        permission_ids: &[String],
    ) -> Result<(), DestinationError>;

    /// Create one tenant; returns its destination identifier.
    async fn create_tenant(&self, tenant: &TenantPayload) -> Result<String, DestinationError>;

    /// Grant roles to an existing user.
    async fn assign_roles(
        &self,
        user_id: &str,
        role_ids: &[String],
    ) -> Result<(), DestinationError>;

    /// Add an existing user to an existing tenant.
    async fn add_user_to_tenant(
        &self,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<(), DestinationError>;

    /// Look up an existing user by email; `None` means not found.
    async fn find_user_by_email(&self, email: &str)
        -> Result<Option<String>, DestinationError>;

    /// Deactivate a user (source-blocked users stay blocked).
    async fn deactivate_user(&self, user_id: &str) -> Result<(), DestinationError>;
}
