//! Migration orchestration.
//!
//! [`MigrationEngine`] sequences the stages: load all source data, map and
//! dispatch users, then roles, then tenants, then rebuild associations.
//! Stages run strictly sequentially because association resolution depends
//! on a fully-populated IdMap for all three kinds.
//!
//! The propagation rule lives here: every source fetch happens before the
//! first destination write, so a source failure is fatal while it is still
//! safe to abort; once writes begin the run favors completing with a full
//! accounting of failures over aborting.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::destination::Destination;
use crate::dispatch::BatchDispatcher;
use crate::errors::{MigrationError, SourceError};
use crate::mapper::IdentityMapper;
use crate::models::{
    EntityKind, IdMap, PasswordRecord, RecordOutcome, RecordStatus, SourceOrganization,
    SourceRole, SourceUser,
};
use crate::report::MigrationReport;
use crate::resolver::AssociationResolver;
use crate::retry::{with_retry, RetryPolicy, Sleeper};
use crate::source::{export, Source};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Operator-interrupt flag, checked between destination calls.
///
/// Cancellation never interrupts an in-flight call: an ambiguous create
/// (request sent, response lost) could otherwise be blindly retried on the
/// next run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Options and loaded data
// ---------------------------------------------------------------------------

/// Per-run behaviour switches, mirroring the CLI surface.
#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Load users from this export file instead of the source API.
    pub users_file: Option<PathBuf>,
    /// Merge password hashes from this export file.
    pub passwords_file: Option<PathBuf>,
    pub skip_roles: bool,
    pub skip_orgs: bool,
}

/// Everything read from the source platform, fetched in full before the
/// first destination write.
#[derive(Debug, Default)]
pub struct SourceData {
    pub users: Vec<SourceUser>,
    pub roles: Vec<SourceRole>,
    pub organizations: Vec<SourceOrganization>,
    /// Password records keyed by source user ID.
    pub passwords: HashMap<String, PasswordRecord>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Orchestrates one migration run against a source and a destination.
pub struct MigrationEngine<'a, Src, D, Sl> {
    source: Option<&'a Src>,
    dest: &'a D,
    mapper: IdentityMapper,
    batch_size: usize,
    policy: RetryPolicy,
    sleeper: Sl,
    options: MigrationOptions,
    cancel: CancelToken,
}

impl<'a, Src, D, Sl> MigrationEngine<'a, Src, D, Sl>
where
    Src: Source,
    D: Destination,
    Sl: Sleeper + Clone,
{
    pub fn new(
        source: Option<&'a Src>,
        dest: &'a D,
        batch_size: usize,
        policy: RetryPolicy,
        sleeper: Sl,
        options: MigrationOptions,
        cancel: CancelToken,
    ) -> Self {
        info!(batch_size, "initializing migration engine");
        Self {
            source,
            dest,
            mapper: IdentityMapper::new(),
            batch_size,
            policy,
            sleeper,
            options,
            cancel,
        }
    }

    fn source(&self) -> Result<&'a Src, MigrationError> {
        self.source.ok_or_else(|| {
            MigrationError::Source(SourceError::Unavailable(
                "no source API configured; use an export file or skip the stages that need it"
                    .into(),
            ))
        })
    }

    // -----------------------------------------------------------------------
    // Stage 0: load
    // -----------------------------------------------------------------------

    /// Fetch all source data. Any failure here is fatal -- nothing has been
    /// written yet, and migrating from partial source data would be silent
    /// data loss.
    pub async fn load(&self, report: &mut MigrationReport) -> Result<SourceData, MigrationError> {
        let mut users = match &self.options.users_file {
            Some(path) => {
                let load = export::load_users_from_file(path).map_err(MigrationError::Source)?;
                report.malformed_skipped += load.skipped_malformed;
                load.users
            }
            None => self.source()?.fetch_users().await.map_err(MigrationError::Source)?,
        };

        let passwords = match &self.options.passwords_file {
            Some(path) => {
                let load = export::load_password_export(path).map_err(MigrationError::Source)?;
                report.malformed_skipped += load.skipped_malformed;
                let (merged, unmatched) = export::merge_passwords(&users, load.records);
                report.unmatched_passwords += unmatched;
                merged
            }
            None => HashMap::new(),
        };

        let roles = if self.options.skip_roles {
            info!("skipping roles and permissions");
            Vec::new()
        } else {
            self.source()?.fetch_roles().await.map_err(MigrationError::Source)?
        };

        let organizations = if self.options.skip_orgs {
            info!("skipping organizations and tenants");
            Vec::new()
        } else {
            self.source()?
                .fetch_organizations()
                .await
                .map_err(MigrationError::Source)?
        };

        fold_associations(&mut users, &roles, &organizations);

        info!(
            users = users.len(),
            roles = roles.len(),
            organizations = organizations.len(),
            passwords = passwords.len(),
            "source data loaded"
        );
        Ok(SourceData {
            users,
            roles,
            organizations,
            passwords,
        })
    }

    // -----------------------------------------------------------------------
    // Stages 1-4: map, dispatch, associate
    // -----------------------------------------------------------------------

    /// Run the write side of the migration over already-loaded source data.
    ///
    /// Returns the IdMap; the report is accumulated through the `&mut`
    /// reference so a cancelled run still surrenders its accounting.
    pub async fn execute(
        &self,
        data: &SourceData,
        report: &mut MigrationReport,
    ) -> Result<IdMap, MigrationError> {
        let mut id_map = IdMap::new();

        // Map users, degrading unimportable passwords to passwordless.
        let mut payloads = Vec::with_capacity(data.users.len());
        for user in &data.users {
            match self
                .mapper
                .map_user(user, data.passwords.get(&user.user_id))
            {
                Ok(mapped) => {
                    if let Some(err) = mapped.password_dropped {
                        warn!(user = %user.user_id, %err, "migrating user without password");
                        report.passwordless += 1;
                    }
                    payloads.push(mapped.payload);
                }
                Err(err) => {
                    // Unmappable records still land in the accounting.
                    warn!(user = %user.user_id, %err, "cannot map user");
                    report.record_attempt(EntityKind::User);
                    report.record_outcome(
                        EntityKind::User,
                        &RecordOutcome {
                            source_id: user.user_id.clone(),
                            status: RecordStatus::Failed {
                                reason: err.to_string(),
                            },
                        },
                    );
                }
            }
        }

        let dispatcher = BatchDispatcher::new(
            self.dest,
            self.batch_size,
            self.policy.clone(),
            self.sleeper.clone(),
        );

        // Users first: every later stage references them.
        let user_result = dispatcher
            .dispatch_users(&payloads, &mut id_map, report, &self.cancel)
            .await?;
        self.deactivate_blocked(&payloads, &user_result.outcomes).await;

        // Roles, then tenants.
        let role_payloads: Vec<_> = data.roles.iter().map(|r| self.mapper.map_role(r)).collect();
        dispatcher
            .dispatch_roles(&role_payloads, &mut id_map, report, &self.cancel)
            .await?;

        let tenant_payloads: Vec<_> = data
            .organizations
            .iter()
            .map(|o| self.mapper.map_organization(o))
            .collect();
        dispatcher
            .dispatch_tenants(&tenant_payloads, &mut id_map, report, &self.cancel)
            .await?;

        // Associations last, against the now-complete IdMap.
        let resolver =
            AssociationResolver::new(self.dest, self.policy.clone(), self.sleeper.clone());
        resolver
            .resolve_role_permissions(&data.roles, &mut id_map, report, &self.cancel)
            .await?;
        resolver
            .resolve_role_assignments(&data.users, &id_map, report, &self.cancel)
            .await?;
        resolver
            .resolve_tenant_memberships(&data.organizations, &id_map, report, &self.cancel)
            .await?;

        report.finish();
        info!(
            users = report.users.succeeded(),
            roles = report.roles.succeeded(),
            tenants = report.tenants.succeeded(),
            failures = report.failures.len(),
            "migration complete"
        );
        Ok(id_map)
    }

    /// Load and execute in one call.
    pub async fn run(&self, report: &mut MigrationReport) -> Result<IdMap, MigrationError> {
        let data = self.load(report).await?;
        self.execute(&data, report).await
    }

    /// Source-blocked users are created first, then deactivated, so they
    /// exist at the destination but cannot log in.
    async fn deactivate_blocked(&self, payloads: &[crate::destination::UserPayload], outcomes: &[RecordOutcome]) {
        for (payload, outcome) in payloads.iter().zip(outcomes) {
            if !payload.blocked {
                continue;
            }
            let Some(destination_id) = outcome.status.destination_id() else {
                continue;
            };
            let result = with_retry(&self.policy, &self.sleeper, "deactivate user", || {
                self.dest.deactivate_user(destination_id)
            })
            .await;
            if let Err(err) = result {
                warn!(user = %destination_id, %err, "failed to deactivate blocked user");
            }
        }
    }
}

/// Fold per-role member lists and per-organization member lists into each
/// user's `roles` / `organizations` sets.
///
/// Role members are matched by source user ID first, then by
/// case-insensitive email (export files may carry email-keyed IDs).
fn fold_associations(
    users: &mut [SourceUser],
    roles: &[SourceRole],
    organizations: &[SourceOrganization],
) {
    let mut by_user_id: HashMap<String, usize> = HashMap::new();
    let mut by_email: HashMap<String, usize> = HashMap::new();
    for (idx, user) in users.iter().enumerate() {
        by_user_id.insert(user.user_id.clone(), idx);
        if !user.email.is_empty() {
            by_email.insert(user.email.to_lowercase(), idx);
        }
    }

    for role in roles {
        for member in &role.members {
            let idx = by_user_id
                .get(member.user_id.as_str())
                .or_else(|| by_email.get(&member.email.to_lowercase()))
                .copied();
            match idx {
                Some(idx) => {
                    users[idx].roles.insert(role.name.clone());
                }
                None => {
                    warn!(
                        role = %role.name,
                        member = %member.user_id,
                        "role member is not among loaded users"
                    );
                }
            }
        }
    }

    for org in organizations {
        for member in &org.members {
            if let Some(idx) = by_user_id.get(member.as_str()).copied() {
                users[idx].organizations.insert(org.id.clone());
            }
        }
    }
}
