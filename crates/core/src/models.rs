//! Domain model types used throughout IdMigrate.
//!
//! Source records are parsed into these strictly-typed shapes at load time;
//! dynamic export JSON never travels past the loaders. Source records are
//! immutable once loaded. [`IdMap`] is the only place the source and
//! destination ID spaces meet.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Source records
// ---------------------------------------------------------------------------

/// One identity (connection) attached to a source user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceIdentity {
    /// Connection name (e.g. `Username-Password-Authentication`,
    /// `google-oauth2`, `sms`).
    pub connection: String,
    /// The user's ID within this connection.
    pub user_id: String,
    /// Provider tag (e.g. `auth0`, `google-oauth2`, `sms`).
    pub provider: String,
}

/// A user record from the source platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceUser {
    /// Source-side user identifier (e.g. `auth0|abc123`).
    pub user_id: String,
    pub email: String,
    pub email_verified: bool,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub nickname: Option<String>,
    pub picture: Option<String>,
    pub phone_number: Option<String>,
    pub phone_verified: bool,
    /// Blocked at the source; created then deactivated at the destination.
    pub blocked: bool,
    /// Identities from the API representation; empty for export-file users.
    #[serde(default)]
    pub identities: Vec<SourceIdentity>,
    /// Source role names this user holds (folded in from per-role member
    /// lists after roles are fetched).
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Source organization IDs this user belongs to.
    #[serde(default)]
    pub organizations: BTreeSet<String>,
}

/// A member of a source role, as reported by the role-membership endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMember {
    pub user_id: String,
    pub email: String,
}

/// A role record from the source platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRole {
    /// Source-side role identifier.
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Permission names attached to the role, in source order.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Users holding this role.
    #[serde(default)]
    pub members: Vec<RoleMember>,
}

/// An organization record from the source platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceOrganization {
    /// Source-side organization identifier (e.g. `org_abc123`).
    pub id: String,
    pub display_name: String,
    /// Source user identifiers of the organization's members.
    #[serde(default)]
    pub members: Vec<String>,
}

/// One record from a password export file, keyed by email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordRecord {
    pub email: String,
    /// Raw hash string as exported (e.g. `$2b$10$...`).
    pub password_hash: String,
}

// ---------------------------------------------------------------------------
// Entity kinds
// ---------------------------------------------------------------------------

/// The kinds of entities migrated between platforms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Role,
    Tenant,
    Permission,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Role => write!(f, "role"),
            Self::Tenant => write!(f, "tenant"),
            Self::Permission => write!(f, "permission"),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch outcomes
// ---------------------------------------------------------------------------

/// Final status of one dispatched record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Created fresh at the destination.
    Created { destination_id: String },
    /// An entity with the same natural key already existed; its ID was
    /// adopted instead of creating a duplicate.
    Merged { destination_id: String },
    /// Not migrated; the reason string is what lands in the report and log.
    Failed { reason: String },
}

impl RecordStatus {
    /// Destination ID if the record ended created or merged.
    pub fn destination_id(&self) -> Option<&str> {
        match self {
            Self::Created { destination_id } | Self::Merged { destination_id } => {
                Some(destination_id)
            }
            Self::Failed { .. } => None,
        }
    }
}

/// Outcome for a single record, paired with its source identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub source_id: String,
    pub status: RecordStatus,
}

/// Per-batch outcome: one entry per input record, in input order.
///
/// Order preservation is what lets callers re-pair requests with responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResult {
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Destination IDs of created-or-merged records, in input order.
    pub fn resolved_ids(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|o| o.status.destination_id())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// IdMap
// ---------------------------------------------------------------------------

/// Mapping from (entity kind, source identifier) to destination identifier.
///
/// Built incrementally as creation batches are confirmed; append-only.
/// Every destination ID in the map corresponds to a confirmed created or
/// merged entity -- entries are never added speculatively.
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    entries: HashMap<(EntityKind, String), String>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed source → destination mapping.
    pub fn insert(&mut self, kind: EntityKind, source_id: &str, destination_id: &str) {
        self.entries
            .insert((kind, source_id.to_string()), destination_id.to_string());
    }

    /// Look up the destination ID for a source identifier.
    pub fn get(&self, kind: EntityKind, source_id: &str) -> Option<&str> {
        self.entries
            .get(&(kind, source_id.to_string()))
            .map(String::as_str)
    }

    pub fn contains(&self, kind: EntityKind, source_id: &str) -> bool {
        self.entries.contains_key(&(kind, source_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries of one kind.
    pub fn count_kind(&self, kind: EntityKind) -> usize {
        self.entries.keys().filter(|(k, _)| *k == kind).count()
    }
}
