//! Migration run accounting.
//!
//! [`MigrationReport`] accumulates counts and failures across all stages and
//! produces the end-of-run summary. It is passed by `&mut` through each
//! stage -- there is no ambient global state -- and is append-only: stages
//! add outcomes, nothing ever subtracts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EntityKind, RecordOutcome, RecordStatus};

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Per-entity-kind counters.
///
/// Invariant: after a dispatch stage completes,
/// `created + merged + failed == attempted` -- no record is ever
/// unaccounted for.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindCounters {
    pub attempted: u64,
    pub created: u64,
    pub merged: u64,
    pub failed: u64,
}

impl KindCounters {
    /// Records that ended in a terminal state.
    pub fn accounted(&self) -> u64 {
        self.created + self.merged + self.failed
    }

    pub fn succeeded(&self) -> u64 {
        self.created + self.merged
    }
}

/// Counters for association edges (user-role, user-tenant, role-permission).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeCounters {
    pub attempted: u64,
    pub succeeded: u64,
    /// Edges skipped because one endpoint never made it into the IdMap.
    pub skipped: u64,
    pub failed: u64,
}

/// One failed record with its reason, in the order failures occurred.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub kind: EntityKind,
    pub source_id: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Running totals and failure list for one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Unique identifier for this run, stamped into the log file.
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether destination writes were replaced with no-op counters.
    pub dry_run: bool,

    pub users: KindCounters,
    pub roles: KindCounters,
    pub tenants: KindCounters,
    pub permissions: KindCounters,

    pub role_assignments: EdgeCounters,
    pub tenant_memberships: EdgeCounters,
    pub permission_attachments: EdgeCounters,

    /// Every failed record across all stages, in order.
    pub failures: Vec<FailureEntry>,

    /// Export lines skipped as malformed.
    pub malformed_skipped: u64,
    /// Users migrated without a password because the hash algorithm was
    /// not importable.
    pub passwordless: u64,
    /// Password export records with no matching user.
    pub unmatched_passwords: u64,
}

impl MigrationReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            users: KindCounters::default(),
            roles: KindCounters::default(),
            tenants: KindCounters::default(),
            permissions: KindCounters::default(),
            role_assignments: EdgeCounters::default(),
            tenant_memberships: EdgeCounters::default(),
            permission_attachments: EdgeCounters::default(),
            failures: Vec::new(),
            malformed_skipped: 0,
            passwordless: 0,
            unmatched_passwords: 0,
        }
    }

    /// Counters for one entity kind.
    pub fn kind(&self, kind: EntityKind) -> &KindCounters {
        match kind {
            EntityKind::User => &self.users,
            EntityKind::Role => &self.roles,
            EntityKind::Tenant => &self.tenants,
            EntityKind::Permission => &self.permissions,
        }
    }

    fn kind_mut(&mut self, kind: EntityKind) -> &mut KindCounters {
        match kind {
            EntityKind::User => &mut self.users,
            EntityKind::Role => &mut self.roles,
            EntityKind::Tenant => &mut self.tenants,
            EntityKind::Permission => &mut self.permissions,
        }
    }

    /// Note that a record is about to be dispatched.
    pub fn record_attempt(&mut self, kind: EntityKind) {
        self.kind_mut(kind).attempted += 1;
    }

    /// Record the terminal outcome of one dispatched record.
    pub fn record_outcome(&mut self, kind: EntityKind, outcome: &RecordOutcome) {
        match &outcome.status {
            RecordStatus::Created { .. } => self.kind_mut(kind).created += 1,
            RecordStatus::Merged { .. } => self.kind_mut(kind).merged += 1,
            RecordStatus::Failed { reason } => {
                self.kind_mut(kind).failed += 1;
                self.failures.push(FailureEntry {
                    kind,
                    source_id: outcome.source_id.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Plain-text end-of-run summary.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str("=== Migration Summary ===\n");
        if self.dry_run {
            out.push_str("(dry run: counts are would-create totals)\n");
        }
        for (label, c) in [
            ("Users", &self.users),
            ("Roles", &self.roles),
            ("Tenants", &self.tenants),
            ("Permissions", &self.permissions),
        ] {
            out.push_str(&format!(
                "{:<12} attempted {:<5} created {:<5} merged {:<5} failed {}\n",
                label, c.attempted, c.created, c.merged, c.failed
            ));
        }
        for (label, e) in [
            ("Role assignments", &self.role_assignments),
            ("Tenant memberships", &self.tenant_memberships),
            ("Permission attachments", &self.permission_attachments),
        ] {
            out.push_str(&format!(
                "{:<22} attempted {:<5} succeeded {:<5} skipped {:<5} failed {}\n",
                label, e.attempted, e.succeeded, e.skipped, e.failed
            ));
        }
        if self.malformed_skipped > 0 {
            out.push_str(&format!(
                "Malformed export records skipped: {}\n",
                self.malformed_skipped
            ));
        }
        if self.passwordless > 0 {
            out.push_str(&format!(
                "Users migrated without password: {}\n",
                self.passwordless
            ));
        }
        if self.unmatched_passwords > 0 {
            out.push_str(&format!(
                "Unmatched password records: {}\n",
                self.unmatched_passwords
            ));
        }
        if !self.failures.is_empty() {
            out.push_str(&format!("Failures ({}):\n", self.failures.len()));
            for f in &self.failures {
                out.push_str(&format!("  [{}] {}: {}\n", f.kind, f.source_id, f.reason));
            }
        }
        out
    }
}
