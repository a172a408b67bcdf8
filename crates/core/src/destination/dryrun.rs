//! No-op destination for dry runs.
//!
//! Implements [`Destination`] with counters and synthetic IDs so the full
//! pipeline -- batching, retry paths, IdMap population, association
//! resolution -- executes exactly as in a live run, with no writes leaving
//! the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::{
    BatchCreateResponse, CreateOutcome, Destination, RolePayload, TenantPayload, UserPayload,
};
use crate::errors::DestinationError;

/// Would-create counters and name lists gathered during a dry run.
#[derive(Debug, Default)]
pub struct DryRunDestination {
    users: AtomicU64,
    roles: AtomicU64,
    permissions: AtomicU64,
    tenants: AtomicU64,
    role_assignments: AtomicU64,
    tenant_memberships: AtomicU64,
    /// Names seen, for verbose listings.
    user_logins: Mutex<Vec<String>>,
    role_names: Mutex<Vec<String>>,
    tenant_names: Mutex<Vec<String>>,
}

impl DryRunDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn would_create_users(&self) -> u64 {
        self.users.load(Ordering::Relaxed)
    }

    pub fn would_create_roles(&self) -> u64 {
        self.roles.load(Ordering::Relaxed)
    }

    pub fn would_create_permissions(&self) -> u64 {
        self.permissions.load(Ordering::Relaxed)
    }

    pub fn would_create_tenants(&self) -> u64 {
        self.tenants.load(Ordering::Relaxed)
    }

    pub fn would_assign_roles(&self) -> u64 {
        self.role_assignments.load(Ordering::Relaxed)
    }

    pub fn would_add_memberships(&self) -> u64 {
        self.tenant_memberships.load(Ordering::Relaxed)
    }

    pub fn user_logins(&self) -> Vec<String> {
        self.user_logins.lock().unwrap().clone()
    }

    pub fn role_names(&self) -> Vec<String> {
        self.role_names.lock().unwrap().clone()
    }

    pub fn tenant_names(&self) -> Vec<String> {
        self.tenant_names.lock().unwrap().clone()
    }
}

impl Destination for DryRunDestination {
    async fn create_users_batch(
        &self,
        users: &[UserPayload],
    ) -> Result<BatchCreateResponse, DestinationError> {
        self.users.fetch_add(users.len() as u64, Ordering::Relaxed);
        let mut logins = self.user_logins.lock().unwrap();
        logins.extend(users.iter().map(|u| u.login_id.clone()));
        debug!(count = users.len(), "dry run: would create users");
        Ok(BatchCreateResponse {
            outcomes: users
                .iter()
                .map(|u| CreateOutcome::Created {
                    id: u.login_id.clone(),
                })
                .collect(),
        })
    }

    async fn create_role(&self, role: &RolePayload) -> Result<String, DestinationError> {
        self.roles.fetch_add(1, Ordering::Relaxed);
        self.role_names.lock().unwrap().push(role.name.clone());
        debug!(name = %role.name, "dry run: would create role");
        Ok(role.name.clone())
    }

    async fn create_permission(
        &self,
        name: &str,
        _description: Option<&str>,
    ) -> Result<String, DestinationError> {
        self.permissions.fetch_add(1, Ordering::Relaxed);
        debug!(name, "dry run: would create permission");
        Ok(name.to_string())
    }

    async fn set_role_permissions(
        &self,
        role_id: &str,
        permission_ids: &[String],
    ) -> Result<(), DestinationError> {
        debug!(
            role_id,
            count = permission_ids.len(),
            "dry run: would attach permissions"
        );
        Ok(())
    }

    async fn create_tenant(&self, tenant: &TenantPayload) -> Result<String, DestinationError> {
        self.tenants.fetch_add(1, Ordering::Relaxed);
        self.tenant_names.lock().unwrap().push(tenant.name.clone());
        debug!(name = %tenant.name, "dry run: would create tenant");
        Ok(tenant.tenant_id.clone())
    }

    async fn assign_roles(
        &self,
        user_id: &str,
        role_ids: &[String],
    ) -> Result<(), DestinationError> {
        self.role_assignments
            .fetch_add(role_ids.len() as u64, Ordering::Relaxed);
        debug!(user_id, count = role_ids.len(), "dry run: would assign roles");
        Ok(())
    }

    async fn add_user_to_tenant(
        &self,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<(), DestinationError> {
        self.tenant_memberships.fetch_add(1, Ordering::Relaxed);
        debug!(user_id, tenant_id, "dry run: would add user to tenant");
        Ok(())
    }

    async fn find_user_by_email(
        &self,
        _email: &str,
    ) -> Result<Option<String>, DestinationError> {
        // Nothing exists in a dry run; every user is a would-create.
        Ok(None)
    }

    async fn deactivate_user(&self, user_id: &str) -> Result<(), DestinationError> {
        debug!(user_id, "dry run: would deactivate user");
        Ok(())
    }
}
