//! End-to-end tests for the full migration pipeline.
//!
//! These tests exercise the real `MigrationEngine` with:
//! - An in-memory source (scripted users, roles, organizations)
//! - A stateful in-memory destination that behaves like the real one:
//!   duplicate emails conflict, repeated role/tenant creates conflict,
//!   selected batches rate-limit forever
//! - A no-op sleeper, so backoff paths run without real time
//!
//! No network I/O anywhere.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use idmigrate_core::destination::{
    BatchCreateResponse, CreateOutcome, Destination, DryRunDestination, RolePayload,
    TenantPayload, UserPayload,
};
use idmigrate_core::engine::{CancelToken, MigrationEngine, MigrationOptions};
use idmigrate_core::errors::DestinationError;
use idmigrate_core::models::{
    EntityKind, RoleMember, SourceOrganization, SourceRole, SourceUser,
};
use idmigrate_core::report::MigrationReport;
use idmigrate_core::retry::{RetryPolicy, Sleeper};
use idmigrate_core::source::Source;

// ===========================================================================
// Fakes
// ===========================================================================

#[derive(Default)]
struct FakeSource {
    users: Vec<SourceUser>,
    roles: Vec<SourceRole>,
    organizations: Vec<SourceOrganization>,
}

impl Source for FakeSource {
    async fn fetch_users(&self) -> Result<Vec<SourceUser>, idmigrate_core::errors::SourceError> {
        Ok(self.users.clone())
    }

    async fn fetch_roles(&self) -> Result<Vec<SourceRole>, idmigrate_core::errors::SourceError> {
        Ok(self.roles.clone())
    }

    async fn fetch_organizations(
        &self,
    ) -> Result<Vec<SourceOrganization>, idmigrate_core::errors::SourceError> {
        Ok(self.organizations.clone())
    }
}

/// Stateful in-memory destination. State survives across engine runs, which
/// is what makes the idempotence test meaningful.
#[derive(Default)]
struct FakeDestination {
    /// email (lowercase) -> login ID of the existing user.
    users: Mutex<HashMap<String, String>>,
    /// role name -> attached permission IDs.
    roles: Mutex<HashMap<String, Vec<String>>>,
    permissions: Mutex<HashSet<String>>,
    /// tenant ID -> name.
    tenants: Mutex<HashMap<String, String>>,
    /// (login ID, tenant ID) memberships, in call order.
    memberships: Mutex<Vec<(String, String)>>,
    /// (login ID, role ID) assignments, in call order.
    assignments: Mutex<Vec<(String, String)>>,
    deactivated: Mutex<Vec<String>>,
    /// Login IDs created with a password attached.
    with_password: Mutex<Vec<String>>,
    /// Any batch whose first payload has one of these login IDs is
    /// rate-limited on every attempt.
    stuck_batch_heads: Mutex<HashSet<String>>,
}

impl Destination for FakeDestination {
    async fn create_users_batch(
        &self,
        users: &[UserPayload],
    ) -> Result<BatchCreateResponse, DestinationError> {
        if let Some(head) = users.first() {
            if self.stuck_batch_heads.lock().unwrap().contains(&head.login_id) {
                return Err(DestinationError::RateLimited { retry_after: None });
            }
        }

        let mut existing = self.users.lock().unwrap();
        let outcomes = users
            .iter()
            .map(|u| {
                let key = u.email.to_lowercase();
                if existing.contains_key(&key) {
                    CreateOutcome::AlreadyExists { id: None }
                } else {
                    existing.insert(key, u.login_id.clone());
                    if u.password.is_some() {
                        self.with_password.lock().unwrap().push(u.login_id.clone());
                    }
                    CreateOutcome::Created {
                        id: u.login_id.clone(),
                    }
                }
            })
            .collect();
        Ok(BatchCreateResponse { outcomes })
    }

    async fn create_role(&self, role: &RolePayload) -> Result<String, DestinationError> {
        let mut roles = self.roles.lock().unwrap();
        if roles.contains_key(&role.name) {
            return Err(DestinationError::Conflict {
                existing_id: Some(role.name.clone()),
            });
        }
        roles.insert(role.name.clone(), Vec::new());
        Ok(role.name.clone())
    }

    async fn create_permission(
        &self,
        name: &str,
        _description: Option<&str>,
    ) -> Result<String, DestinationError> {
        let mut permissions = self.permissions.lock().unwrap();
        if !permissions.insert(name.to_string()) {
            return Err(DestinationError::Conflict { existing_id: None });
        }
        Ok(name.to_string())
    }

    async fn set_role_permissions(
        &self,
        role_id: &str,
        permission_ids: &[String],
    ) -> Result<(), DestinationError> {
        let mut roles = self.roles.lock().unwrap();
        match roles.get_mut(role_id) {
            Some(attached) => {
                *attached = permission_ids.to_vec();
                Ok(())
            }
            None => Err(DestinationError::Validation(format!(
                "unknown role '{}'",
                role_id
            ))),
        }
    }

    async fn create_tenant(&self, tenant: &TenantPayload) -> Result<String, DestinationError> {
        let mut tenants = self.tenants.lock().unwrap();
        if tenants.contains_key(&tenant.tenant_id) {
            return Err(DestinationError::Conflict {
                existing_id: Some(tenant.tenant_id.clone()),
            });
        }
        tenants.insert(tenant.tenant_id.clone(), tenant.name.clone());
        Ok(tenant.tenant_id.clone())
    }

    async fn assign_roles(
        &self,
        user_id: &str,
        role_ids: &[String],
    ) -> Result<(), DestinationError> {
        // Referencing an unknown user or role here would mean the resolver
        // leaked an identifier that never went through the IdMap.
        let users = self.users.lock().unwrap();
        if !users.values().any(|login| login == user_id) {
            return Err(DestinationError::Validation(format!(
                "unknown user '{}'",
                user_id
            )));
        }
        let roles = self.roles.lock().unwrap();
        for role_id in role_ids {
            if !roles.contains_key(role_id) {
                return Err(DestinationError::Validation(format!(
                    "unknown role '{}'",
                    role_id
                )));
            }
        }
        drop(roles);
        drop(users);
        let mut assignments = self.assignments.lock().unwrap();
        for role_id in role_ids {
            assignments.push((user_id.to_string(), role_id.clone()));
        }
        Ok(())
    }

    async fn add_user_to_tenant(
        &self,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<(), DestinationError> {
        let users = self.users.lock().unwrap();
        if !users.values().any(|login| login == user_id) {
            return Err(DestinationError::Validation(format!(
                "unknown user '{}'",
                user_id
            )));
        }
        drop(users);
        if !self.tenants.lock().unwrap().contains_key(tenant_id) {
            return Err(DestinationError::Validation(format!(
                "unknown tenant '{}'",
                tenant_id
            )));
        }
        self.memberships
            .lock()
            .unwrap()
            .push((user_id.to_string(), tenant_id.to_string()));
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<String>, DestinationError> {
        Ok(self.users.lock().unwrap().get(&email.to_lowercase()).cloned())
    }

    async fn deactivate_user(&self, user_id: &str) -> Result<(), DestinationError> {
        self.deactivated.lock().unwrap().push(user_id.to_string());
        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
struct NoopSleeper;

impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

// ===========================================================================
// Helpers
// ===========================================================================

fn user(n: usize) -> SourceUser {
    SourceUser {
        user_id: format!("auth0|{:03}", n),
        email: format!("u{:03}@example.com", n),
        email_verified: true,
        name: Some(format!("User {:03}", n)),
        ..Default::default()
    }
}

fn users(n: usize) -> Vec<SourceUser> {
    (0..n).map(user).collect()
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        jitter: false,
    }
}

fn engine<'a>(
    source: &'a FakeSource,
    dest: &'a FakeDestination,
    batch_size: usize,
    options: MigrationOptions,
) -> MigrationEngine<'a, FakeSource, FakeDestination, NoopSleeper> {
    MigrationEngine::new(
        Some(source),
        dest,
        batch_size,
        policy(),
        NoopSleeper,
        options,
        CancelToken::new(),
    )
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn full_pipeline_builds_entities_and_associations() {
    let mut source = FakeSource {
        users: users(4),
        ..Default::default()
    };
    source.users[2].blocked = true;
    source.roles = vec![
        SourceRole {
            id: "rol_new".into(),
            name: "MyNewRole".into(),
            permissions: vec!["perm:read".into(), "perm:write".into()],
            members: vec![RoleMember {
                user_id: "auth0|000".into(),
                email: "u000@example.com".into(),
            }],
            ..Default::default()
        },
        SourceRole {
            id: "rol_plain".into(),
            name: "Role".into(),
            permissions: vec![],
            members: vec![],
            ..Default::default()
        },
    ];
    source.organizations = vec![
        SourceOrganization {
            id: "org_a".into(),
            display_name: "Acme".into(),
            members: vec!["auth0|000".into(), "auth0|001".into()],
        },
        SourceOrganization {
            id: "org_b".into(),
            display_name: "Beta".into(),
            members: vec!["auth0|000".into()],
        },
    ];

    let dest = FakeDestination::default();
    let mut report = MigrationReport::new(false);
    let id_map = engine(&source, &dest, 50, MigrationOptions::default())
        .run(&mut report)
        .await
        .unwrap();

    // Every record accounted for exactly once, per kind.
    assert_eq!(report.users.attempted, 4);
    assert_eq!(report.users.accounted(), 4);
    assert_eq!(report.roles.accounted(), 2);
    assert_eq!(report.tenants.accounted(), 2);

    // Two roles at the destination with matching permission counts.
    let roles = dest.roles.lock().unwrap();
    assert_eq!(roles.len(), 2);
    assert_eq!(roles["MyNewRole"].len(), 2);
    assert_eq!(roles["Role"].len(), 0);
    drop(roles);

    // The user in two organizations appears in both membership lists.
    let memberships = dest.memberships.lock().unwrap();
    assert!(memberships.contains(&("u000@example.com".into(), "org_a".into())));
    assert!(memberships.contains(&("u000@example.com".into(), "org_b".into())));
    assert!(memberships.contains(&("u001@example.com".into(), "org_a".into())));
    assert_eq!(memberships.len(), 3);
    drop(memberships);

    // Role membership became a destination assignment.
    let assignments = dest.assignments.lock().unwrap();
    assert_eq!(
        *assignments,
        vec![("u000@example.com".to_string(), "MyNewRole".to_string())]
    );
    drop(assignments);

    // The blocked user was created, then deactivated.
    assert_eq!(
        *dest.deactivated.lock().unwrap(),
        vec!["u002@example.com".to_string()]
    );

    // IdMap covers every created entity.
    assert_eq!(id_map.count_kind(EntityKind::User), 4);
    assert_eq!(id_map.count_kind(EntityKind::Role), 2);
    assert_eq!(id_map.count_kind(EntityKind::Tenant), 2);
    assert_eq!(id_map.count_kind(EntityKind::Permission), 2);
}

#[tokio::test]
async fn stuck_middle_batch_fails_alone_and_later_batches_run() {
    // 112 users, batch size 50 -> batches of 50, 50, 12. The second batch
    // (head u050) rate-limits on every attempt.
    let source = FakeSource {
        users: users(112),
        ..Default::default()
    };
    let dest = FakeDestination::default();
    dest.stuck_batch_heads
        .lock()
        .unwrap()
        .insert("u050@example.com".to_string());

    let mut report = MigrationReport::new(false);
    let options = MigrationOptions {
        skip_roles: true,
        skip_orgs: true,
        ..Default::default()
    };
    let id_map = engine(&source, &dest, 50, options)
        .run(&mut report)
        .await
        .unwrap();

    assert_eq!(report.users.attempted, 112);
    assert_eq!(report.users.succeeded(), 62);
    assert_eq!(report.users.failed, 50);
    assert_eq!(report.failures.len(), 50);
    assert!(report.failures[0].reason.contains("rate limit exceeded"));

    // Batch 3 still executed.
    assert!(id_map.contains(EntityKind::User, "auth0|111"));
    // IdMap holds an entry iff the outcome was created-or-merged.
    assert_eq!(id_map.count_kind(EntityKind::User), 62);
    assert!(!id_map.contains(EntityKind::User, "auth0|050"));
    assert!(!id_map.contains(EntityKind::User, "auth0|099"));
}

#[tokio::test]
async fn second_run_merges_everything_and_creates_no_duplicates() {
    let source = FakeSource {
        users: users(7),
        roles: vec![SourceRole {
            id: "rol_1".into(),
            name: "Admin".into(),
            permissions: vec!["perm:read".into()],
            members: vec![],
            ..Default::default()
        }],
        organizations: vec![SourceOrganization {
            id: "org_1".into(),
            display_name: "Acme".into(),
            members: vec!["auth0|000".into()],
        }],
    };
    let dest = FakeDestination::default();

    let mut first = MigrationReport::new(false);
    engine(&source, &dest, 3, MigrationOptions::default())
        .run(&mut first)
        .await
        .unwrap();
    assert_eq!(first.users.created, 7);
    assert_eq!(dest.users.lock().unwrap().len(), 7);

    let mut second = MigrationReport::new(false);
    let id_map = engine(&source, &dest, 3, MigrationOptions::default())
        .run(&mut second)
        .await
        .unwrap();

    // Zero duplicate destination users; every user merged by email.
    assert_eq!(dest.users.lock().unwrap().len(), 7);
    assert_eq!(second.users.created, 0);
    assert_eq!(second.users.merged, 7);
    assert_eq!(second.users.failed, 0);
    assert_eq!(second.roles.merged, 1);
    assert_eq!(second.tenants.merged, 1);
    // IdMap coverage stays complete on the re-run.
    assert_eq!(id_map.count_kind(EntityKind::User), 7);
}

#[tokio::test]
async fn export_file_with_passwords_degrades_unsupported_hashes() {
    let dir = tempfile::tempdir().unwrap();

    let users_path = dir.path().join("users.json");
    let mut f = std::fs::File::create(&users_path).unwrap();
    writeln!(f, r#"{{"user_id":"auth0|1","email":"a@x.com","name":"A"}}"#).unwrap();
    writeln!(f, r#"{{"Id":"auth0|2","Email":"b@x.com","Name":"B"}}"#).unwrap();
    writeln!(f, r#"{{"user_id":"auth0|3","name":"no email"}}"#).unwrap();

    let passwords_path = dir.path().join("passwords.json");
    let mut f = std::fs::File::create(&passwords_path).unwrap();
    writeln!(
        f,
        r#"{{"email":"a@x.com","passwordHash":"$2b$10${}"}}"#,
        "a".repeat(53)
    )
    .unwrap();
    writeln!(
        f,
        r#"{{"email":"b@x.com","passwordHash":"$argon2id$v=19$m=65536$abc"}}"#
    )
    .unwrap();
    writeln!(
        f,
        r#"{{"email":"nobody@x.com","passwordHash":"$2b$10${}"}}"#,
        "b".repeat(53)
    )
    .unwrap();

    let source = FakeSource::default();
    let dest = FakeDestination::default();
    let options = MigrationOptions {
        users_file: Some(users_path),
        passwords_file: Some(passwords_path),
        skip_roles: true,
        skip_orgs: true,
    };

    let mut report = MigrationReport::new(false);
    engine(&source, &dest, 50, options)
        .run(&mut report)
        .await
        .unwrap();

    // The record without an email was skipped at load, not failed.
    assert_eq!(report.malformed_skipped, 1);
    assert_eq!(report.users.attempted, 2);
    assert_eq!(report.users.created, 2);
    // One user carried a password; the argon2 one was degraded, not dropped.
    assert_eq!(*dest.with_password.lock().unwrap(), vec!["a@x.com".to_string()]);
    assert_eq!(report.passwordless, 1);
    assert_eq!(report.unmatched_passwords, 1);
}

#[tokio::test]
async fn dry_run_counts_without_writing() {
    let source = FakeSource {
        users: users(5),
        roles: vec![SourceRole {
            id: "rol_1".into(),
            name: "Admin".into(),
            permissions: vec!["perm:read".into()],
            members: vec![RoleMember {
                user_id: "auth0|000".into(),
                email: "u000@example.com".into(),
            }],
            ..Default::default()
        }],
        organizations: vec![SourceOrganization {
            id: "org_1".into(),
            display_name: "Acme".into(),
            members: vec!["auth0|000".into()],
        }],
    };
    let dest = DryRunDestination::new();

    let eng: MigrationEngine<'_, FakeSource, DryRunDestination, NoopSleeper> =
        MigrationEngine::new(
            Some(&source),
            &dest,
            2,
            policy(),
            NoopSleeper,
            MigrationOptions::default(),
            CancelToken::new(),
        );

    let mut report = MigrationReport::new(true);
    let id_map = eng.run(&mut report).await.unwrap();

    // The full pipeline executed against no-op counters.
    assert_eq!(dest.would_create_users(), 5);
    assert_eq!(dest.would_create_roles(), 1);
    assert_eq!(dest.would_create_tenants(), 1);
    assert_eq!(dest.would_create_permissions(), 1);
    assert_eq!(dest.would_assign_roles(), 1);
    assert_eq!(dest.would_add_memberships(), 1);
    // Synthetic IDs keep the IdMap and associations flowing.
    assert_eq!(id_map.count_kind(EntityKind::User), 5);
    assert!(report.dry_run);
    assert_eq!(report.users.created, 5);
}
