//! Association rebuilding.
//!
//! After users, roles, and tenants all exist at the destination (the IdMap
//! is fully populated for those kinds), [`AssociationResolver`] builds the
//! edges between them: role↔permission, user↔role, and user↔tenant. Every
//! source-side reference is translated through the IdMap; a reference whose
//! endpoint never made it into the map is skipped with a warning, never
//! fatal -- it degrades the migrated user's effective access instead of
//! aborting the run.
//!
//! Ordering is the caller's contract: permissions are created and attached
//! before any role is assigned to a user, and tenants exist before
//! membership calls.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::destination::Destination;
use crate::engine::CancelToken;
use crate::errors::{DestinationError, MigrationError};
use crate::models::{EntityKind, IdMap, RecordOutcome, RecordStatus, SourceOrganization, SourceRole, SourceUser};
use crate::report::MigrationReport;
use crate::retry::{with_retry, RetryPolicy, Sleeper};

/// Builds destination-side edges once base entities exist.
pub struct AssociationResolver<'a, D, S> {
    dest: &'a D,
    policy: RetryPolicy,
    sleeper: S,
}

impl<'a, D: Destination, S: Sleeper> AssociationResolver<'a, D, S> {
    pub fn new(dest: &'a D, policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            dest,
            policy,
            sleeper,
        }
    }

    // -----------------------------------------------------------------------
    // Role ↔ permission
    // -----------------------------------------------------------------------

    /// Create each role's missing permissions, then attach the permission
    /// set to the destination role.
    ///
    /// Permission names are deduplicated across roles; a permission that
    /// already exists at the destination counts as merged, exactly like a
    /// conflicting user.
    pub async fn resolve_role_permissions(
        &self,
        roles: &'a [SourceRole],
        id_map: &mut IdMap,
        report: &mut MigrationReport,
        cancel: &CancelToken,
    ) -> Result<(), MigrationError> {
        let mut handled: HashSet<&str> = HashSet::new();

        for role in roles {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            // Create permissions first; roles can only reference ones that
            // exist.
            for permission in &role.permissions {
                if !handled.insert(permission.as_str()) {
                    continue;
                }
                report.record_attempt(EntityKind::Permission);
                let created =
                    with_retry(&self.policy, &self.sleeper, "create permission", || {
                        self.dest.create_permission(permission, None)
                    })
                    .await;
                let status = match created {
                    Ok(id) => RecordStatus::Created { destination_id: id },
                    Err(DestinationError::Conflict { existing_id }) => RecordStatus::Merged {
                        destination_id: existing_id.unwrap_or_else(|| permission.clone()),
                    },
                    Err(err) => RecordStatus::Failed {
                        reason: err.to_string(),
                    },
                };
                let outcome = RecordOutcome {
                    source_id: permission.clone(),
                    status,
                };
                if let Some(id) = outcome.status.destination_id() {
                    id_map.insert(EntityKind::Permission, permission, id);
                }
                report.record_outcome(EntityKind::Permission, &outcome);
            }

            let Some(role_id) = id_map.get(EntityKind::Role, &role.name).map(str::to_string)
            else {
                warn!(
                    role = %role.name,
                    permissions = role.permissions.len(),
                    "role absent from IdMap, skipping its permission attachments"
                );
                report.permission_attachments.skipped += role.permissions.len() as u64;
                continue;
            };

            // Attach only permissions that confirmed at the destination.
            let mut resolved = Vec::with_capacity(role.permissions.len());
            for permission in &role.permissions {
                match id_map.get(EntityKind::Permission, permission) {
                    Some(id) => resolved.push(id.to_string()),
                    None => {
                        warn!(
                            role = %role.name,
                            permission = %permission,
                            "permission absent from IdMap, skipping attachment"
                        );
                        report.permission_attachments.skipped += 1;
                    }
                }
            }
            if resolved.is_empty() {
                continue;
            }

            report.permission_attachments.attempted += resolved.len() as u64;
            let attach = with_retry(&self.policy, &self.sleeper, "attach permissions", || {
                self.dest.set_role_permissions(&role_id, &resolved)
            })
            .await;
            match attach {
                Ok(()) => {
                    info!(role = %role_id, count = resolved.len(), "attached permissions");
                    report.permission_attachments.succeeded += resolved.len() as u64;
                }
                Err(err) => {
                    warn!(role = %role_id, %err, "failed to attach permissions");
                    report.permission_attachments.failed += resolved.len() as u64;
                    report.failures.push(crate::report::FailureEntry {
                        kind: EntityKind::Role,
                        source_id: role.name.clone(),
                        reason: format!("permission attachment failed: {}", err),
                    });
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // User ↔ role
    // -----------------------------------------------------------------------

    /// Assign each user's source role list at the destination.
    ///
    /// A user's destination role set is the union of every role membership
    /// the source reports; nothing here overwrites an earlier grant.
    pub async fn resolve_role_assignments(
        &self,
        users: &'a [SourceUser],
        id_map: &IdMap,
        report: &mut MigrationReport,
        cancel: &CancelToken,
    ) -> Result<(), MigrationError> {
        for user in users {
            if user.roles.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let Some(user_id) = id_map.get(EntityKind::User, &user.user_id).map(str::to_string)
            else {
                warn!(
                    user = %user.user_id,
                    roles = user.roles.len(),
                    "user absent from IdMap, skipping its role assignments"
                );
                report.role_assignments.skipped += user.roles.len() as u64;
                continue;
            };

            let mut resolved = Vec::with_capacity(user.roles.len());
            for role_name in &user.roles {
                match id_map.get(EntityKind::Role, role_name) {
                    Some(id) => resolved.push(id.to_string()),
                    None => {
                        warn!(
                            user = %user.user_id,
                            role = %role_name,
                            "role absent from IdMap, skipping assignment"
                        );
                        report.role_assignments.skipped += 1;
                    }
                }
            }
            if resolved.is_empty() {
                continue;
            }

            report.role_assignments.attempted += resolved.len() as u64;
            let assigned = with_retry(&self.policy, &self.sleeper, "assign roles", || {
                self.dest.assign_roles(&user_id, &resolved)
            })
            .await;
            match assigned {
                Ok(()) => {
                    report.role_assignments.succeeded += resolved.len() as u64;
                }
                // Already holding the role is the re-run case, not a failure.
                Err(DestinationError::Conflict { .. }) => {
                    report.role_assignments.succeeded += resolved.len() as u64;
                }
                Err(err) => {
                    warn!(user = %user_id, %err, "failed to assign roles");
                    report.role_assignments.failed += resolved.len() as u64;
                    report.failures.push(crate::report::FailureEntry {
                        kind: EntityKind::User,
                        source_id: user.user_id.clone(),
                        reason: format!("role assignment failed: {}", err),
                    });
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // User ↔ tenant
    // -----------------------------------------------------------------------

    /// Add each organization's members to the corresponding tenant.
    pub async fn resolve_tenant_memberships(
        &self,
        organizations: &'a [SourceOrganization],
        id_map: &IdMap,
        report: &mut MigrationReport,
        cancel: &CancelToken,
    ) -> Result<(), MigrationError> {
        for org in organizations {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let Some(tenant_id) = id_map.get(EntityKind::Tenant, &org.id).map(str::to_string)
            else {
                warn!(
                    org = %org.id,
                    members = org.members.len(),
                    "tenant absent from IdMap, skipping its memberships"
                );
                report.tenant_memberships.skipped += org.members.len() as u64;
                continue;
            };

            let mut added = 0usize;
            for member in &org.members {
                let Some(user_id) = id_map.get(EntityKind::User, member).map(str::to_string)
                else {
                    warn!(
                        org = %org.id,
                        user = %member,
                        "member absent from IdMap, skipping tenant membership"
                    );
                    report.tenant_memberships.skipped += 1;
                    continue;
                };

                report.tenant_memberships.attempted += 1;
                let result =
                    with_retry(&self.policy, &self.sleeper, "add user to tenant", || {
                        self.dest.add_user_to_tenant(&user_id, &tenant_id)
                    })
                    .await;
                match result {
                    Ok(()) => {
                        report.tenant_memberships.succeeded += 1;
                        added += 1;
                    }
                    // Already a member: the re-run case.
                    Err(DestinationError::Conflict { .. }) => {
                        report.tenant_memberships.succeeded += 1;
                        added += 1;
                    }
                    Err(err) => {
                        warn!(user = %user_id, tenant = %tenant_id, %err, "failed to add member");
                        report.tenant_memberships.failed += 1;
                        report.failures.push(crate::report::FailureEntry {
                            kind: EntityKind::User,
                            source_id: member.clone(),
                            reason: format!(
                                "membership in tenant {} failed: {}",
                                tenant_id, err
                            ),
                        });
                    }
                }
            }
            info!(tenant = %tenant_id, added, "tenant memberships resolved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::destination::{BatchCreateResponse, RolePayload, TenantPayload, UserPayload};

    /// Fake destination that records association calls.
    #[derive(Default)]
    struct RecordingDestination {
        permissions_created: Mutex<Vec<String>>,
        /// Permission names that already exist.
        existing_permissions: Mutex<Vec<String>>,
        attachments: Mutex<Vec<(String, Vec<String>)>>,
        assignments: Mutex<Vec<(String, Vec<String>)>>,
        memberships: Mutex<Vec<(String, String)>>,
    }

    impl Destination for RecordingDestination {
        async fn create_users_batch(
            &self,
            _users: &[UserPayload],
        ) -> Result<BatchCreateResponse, DestinationError> {
            unreachable!("resolver never creates users")
        }

        async fn create_role(&self, _role: &RolePayload) -> Result<String, DestinationError> {
            unreachable!("resolver never creates roles")
        }

        async fn create_permission(
            &self,
            name: &str,
            _description: Option<&str>,
        ) -> Result<String, DestinationError> {
            if self
                .existing_permissions
                .lock()
                .unwrap()
                .iter()
                .any(|p| p == name)
            {
                return Err(DestinationError::Conflict { existing_id: None });
            }
            self.permissions_created.lock().unwrap().push(name.to_string());
            Ok(name.to_string())
        }

        async fn set_role_permissions(
            &self,
            role_id: &str,
            permission_ids: &[String],
        ) -> Result<(), DestinationError> {
            self.attachments
                .lock()
                .unwrap()
                .push((role_id.to_string(), permission_ids.to_vec()));
            Ok(())
        }

        async fn create_tenant(&self, _tenant: &TenantPayload) -> Result<String, DestinationError> {
            unreachable!("resolver never creates tenants")
        }

        async fn assign_roles(
            &self,
            user_id: &str,
            role_ids: &[String],
        ) -> Result<(), DestinationError> {
            self.assignments
                .lock()
                .unwrap()
                .push((user_id.to_string(), role_ids.to_vec()));
            Ok(())
        }

        async fn add_user_to_tenant(
            &self,
            user_id: &str,
            tenant_id: &str,
        ) -> Result<(), DestinationError> {
            self.memberships
                .lock()
                .unwrap()
                .push((user_id.to_string(), tenant_id.to_string()));
            Ok(())
        }

        async fn find_user_by_email(
            &self,
            _email: &str,
        ) -> Result<Option<String>, DestinationError> {
            Ok(None)
        }

        async fn deactivate_user(&self, _user_id: &str) -> Result<(), DestinationError> {
            Ok(())
        }
    }

    #[derive(Clone, Copy, Default)]
    struct NoopSleeper;

    impl Sleeper for NoopSleeper {
        async fn sleep(&self, _duration: Duration) {}
    }

    fn resolver(dest: &RecordingDestination) -> AssociationResolver<'_, RecordingDestination, NoopSleeper> {
        AssociationResolver::new(dest, RetryPolicy::default(), NoopSleeper)
    }

    fn role(name: &str, permissions: &[&str]) -> SourceRole {
        SourceRole {
            id: format!("rol_{}", name),
            name: name.into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    fn user_with_roles(user_id: &str, roles: &[&str]) -> SourceUser {
        SourceUser {
            user_id: user_id.into(),
            email: format!("{}@x.com", user_id),
            roles: roles.iter().map(|r| r.to_string()).collect::<BTreeSet<_>>(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_permissions_created_then_attached() {
        let dest = RecordingDestination::default();
        let roles = vec![role("Admin", &["read:users", "write:users"]), role("Viewer", &[])];
        let mut id_map = IdMap::new();
        id_map.insert(EntityKind::Role, "Admin", "Admin");
        id_map.insert(EntityKind::Role, "Viewer", "Viewer");
        let mut report = MigrationReport::new(false);

        resolver(&dest)
            .resolve_role_permissions(&roles, &mut id_map, &mut report, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(
            *dest.permissions_created.lock().unwrap(),
            vec!["read:users", "write:users"]
        );
        let attachments = dest.attachments.lock().unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].0, "Admin");
        assert_eq!(attachments[0].1.len(), 2);
        assert_eq!(report.permissions.created, 2);
        assert_eq!(report.permission_attachments.succeeded, 2);
    }

    #[tokio::test]
    async fn test_shared_permission_created_once_existing_merged() {
        let dest = RecordingDestination::default();
        dest.existing_permissions
            .lock()
            .unwrap()
            .push("read:users".to_string());
        let roles = vec![role("Admin", &["read:users"]), role("Auditor", &["read:users"])];
        let mut id_map = IdMap::new();
        id_map.insert(EntityKind::Role, "Admin", "Admin");
        id_map.insert(EntityKind::Role, "Auditor", "Auditor");
        let mut report = MigrationReport::new(false);

        resolver(&dest)
            .resolve_role_permissions(&roles, &mut id_map, &mut report, &CancelToken::new())
            .await
            .unwrap();

        // Deduplicated across roles; the existing one merges instead of failing.
        assert_eq!(report.permissions.attempted, 1);
        assert_eq!(report.permissions.merged, 1);
        assert_eq!(report.permissions.created, 0);
        // Both roles still get the attachment.
        assert_eq!(dest.attachments.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unmigrated_role_skips_attachments() {
        let dest = RecordingDestination::default();
        let roles = vec![role("Ghost", &["read:users"])];
        let mut id_map = IdMap::new(); // role absent: it failed to migrate
        let mut report = MigrationReport::new(false);

        resolver(&dest)
            .resolve_role_permissions(&roles, &mut id_map, &mut report, &CancelToken::new())
            .await
            .unwrap();

        assert!(dest.attachments.lock().unwrap().is_empty());
        assert_eq!(report.permission_attachments.skipped, 1);
    }

    #[tokio::test]
    async fn test_assignments_only_reference_idmap_entries() {
        let dest = RecordingDestination::default();
        let users = vec![
            user_with_roles("auth0|1", &["Admin", "Ghost"]),
            user_with_roles("auth0|2", &["Admin"]),
            user_with_roles("auth0|lost", &["Admin"]),
        ];
        let mut id_map = IdMap::new();
        id_map.insert(EntityKind::User, "auth0|1", "u1@x.com");
        id_map.insert(EntityKind::User, "auth0|2", "u2@x.com");
        // "auth0|lost" failed to migrate; "Ghost" role failed to migrate.
        id_map.insert(EntityKind::Role, "Admin", "Admin");
        let mut report = MigrationReport::new(false);

        resolver(&dest)
            .resolve_role_assignments(&users, &id_map, &mut report, &CancelToken::new())
            .await
            .unwrap();

        let assignments = dest.assignments.lock().unwrap();
        // Every issued assignment references only IdMap-confirmed IDs.
        for (user_id, role_ids) in assignments.iter() {
            assert!(["u1@x.com", "u2@x.com"].contains(&user_id.as_str()));
            assert_eq!(role_ids, &vec!["Admin".to_string()]);
        }
        assert_eq!(assignments.len(), 2);
        assert_eq!(report.role_assignments.succeeded, 2);
        // One skipped for the ghost role, one for the lost user.
        assert_eq!(report.role_assignments.skipped, 2);
    }

    #[tokio::test]
    async fn test_user_in_two_orgs_lands_in_both_tenants() {
        let dest = RecordingDestination::default();
        let orgs = vec![
            SourceOrganization {
                id: "org_a".into(),
                display_name: "A".into(),
                members: vec!["auth0|1".into()],
            },
            SourceOrganization {
                id: "org_b".into(),
                display_name: "B".into(),
                members: vec!["auth0|1".into(), "auth0|missing".into()],
            },
        ];
        let mut id_map = IdMap::new();
        id_map.insert(EntityKind::User, "auth0|1", "u1@x.com");
        id_map.insert(EntityKind::Tenant, "org_a", "org_a");
        id_map.insert(EntityKind::Tenant, "org_b", "org_b");
        let mut report = MigrationReport::new(false);

        resolver(&dest)
            .resolve_tenant_memberships(&orgs, &id_map, &mut report, &CancelToken::new())
            .await
            .unwrap();

        let memberships = dest.memberships.lock().unwrap();
        assert!(memberships.contains(&("u1@x.com".into(), "org_a".into())));
        assert!(memberships.contains(&("u1@x.com".into(), "org_b".into())));
        assert_eq!(memberships.len(), 2);
        assert_eq!(report.tenant_memberships.succeeded, 2);
        assert_eq!(report.tenant_memberships.skipped, 1);
    }
}
