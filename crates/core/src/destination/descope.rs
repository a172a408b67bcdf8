//! Descope Management API client.

use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::DestinationError;

use super::{
    BatchCreateResponse, CreateOutcome, Destination, PasswordHash, RolePayload, TenantPayload,
    UserPayload,
};

/// Destination error codes that mean "already exists".
const CONFLICT_CODES: &[&str] = &["E024104", "E024209"];

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorDescription")]
    error_description: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchUsersBody {
    #[serde(rename = "createdUsers", default)]
    created_users: Vec<CreatedUser>,
    #[serde(rename = "failedUsers", default)]
    failed_users: Vec<FailedUser>,
}

#[derive(Debug, Clone, Deserialize)]
struct CreatedUser {
    #[serde(rename = "loginIds", default)]
    login_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FailedUser {
    failure: String,
    user: FailedUserRef,
}

#[derive(Debug, Clone, Deserialize)]
struct FailedUserRef {
    #[serde(rename = "loginIds", default)]
    login_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TenantCreated {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchUsersBody {
    #[serde(default)]
    users: Vec<CreatedUser>,
}

#[derive(Debug, Clone, Serialize)]
struct HashedPassword<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    bcrypt: Option<BcryptHash<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pbkdf2: Option<Pbkdf2Hash<'a>>,
}

#[derive(Debug, Clone, Serialize)]
struct BcryptHash<'a> {
    hash: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct Pbkdf2Hash<'a> {
    hash: String,
    salt: String,
    iterations: u32,
    #[serde(rename = "type")]
    variant: &'a str,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Asynchronous Descope Management API client.
#[derive(Clone)]
pub struct DescopeClient {
    http: reqwest::Client,
    api_url: String,
    /// Management calls authenticate as `projectId:managementKey`.
    bearer: String,
}

impl DescopeClient {
    pub fn new(
        api_url: impl Into<String>,
        project_id: impl Into<String>,
        management_key: impl Into<String>,
    ) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let bearer = format!("{}:{}", project_id.into(), management_key.into());
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("idmigrate/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build reqwest client");
        info!(api_url = %api_url, "created DescopeClient");
        Self {
            http,
            api_url,
            bearer,
        }
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, DestinationError> {
        let url = format!("{}{}", self.api_url, path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer)
            .json(&body)
            .send()
            .await?;
        check_response(resp).await
    }

    fn user_json(user: &UserPayload) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "loginId": user.login_id,
            "email": user.email,
            "verifiedEmail": user.verified_email,
            "displayName": user.display_name,
            "givenName": user.given_name,
            "familyName": user.family_name,
            "phone": user.phone,
            "verifiedPhone": user.verified_phone,
            "picture": user.picture,
            "customAttributes": user.custom_attributes,
            "additionalLoginIds": user.additional_login_ids,
        });
        if let Some(hash) = &user.password {
            obj["hashedPassword"] = serde_json::to_value(hashed_password(hash))
                .expect("password envelope serializes");
        }
        obj
    }
}

fn hashed_password(hash: &PasswordHash) -> HashedPassword<'_> {
    use base64::Engine as _;
    let b64 = base64::engine::general_purpose::STANDARD;
    match hash {
        PasswordHash::Bcrypt { hash } => HashedPassword {
            bcrypt: Some(BcryptHash { hash }),
            pbkdf2: None,
        },
        PasswordHash::Pbkdf2 {
            variant,
            iterations,
            salt,
            digest,
        } => HashedPassword {
            bcrypt: None,
            pbkdf2: Some(Pbkdf2Hash {
                hash: b64.encode(digest),
                salt: b64.encode(salt),
                iterations: *iterations,
                variant: match variant {
                    super::Pbkdf2Variant::Sha256 => "sha256",
                    super::Pbkdf2Variant::Sha512 => "sha512",
                },
            }),
        },
    }
}

// ---------------------------------------------------------------------------
// Response handling
// ---------------------------------------------------------------------------

/// Map a non-success response onto the dispatcher-facing error taxonomy.
async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, DestinationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(DestinationError::RateLimited { retry_after });
    }
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(DestinationError::AuthenticationFailed(format!(
            "HTTP {}",
            status
        )));
    }

    let body = resp.text().await.unwrap_or_default();
    Err(classify_error_body(status.as_u16(), &body))
}

/// Classify an error body by destination error code and message text.
fn classify_error_body(status: u16, body: &str) -> DestinationError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let code = parsed.as_ref().and_then(|b| b.error_code.clone());
    let message = parsed
        .as_ref()
        .and_then(|b| b.error_description.clone().or_else(|| b.error_message.clone()))
        .unwrap_or_else(|| format!("HTTP {}", status));

    let is_conflict = status == 409
        || code
            .as_deref()
            .map(|c| CONFLICT_CODES.contains(&c))
            .unwrap_or(false)
        || message.to_ascii_lowercase().contains("already exist");

    if is_conflict {
        return DestinationError::Conflict { existing_id: None };
    }
    if status >= 500 {
        return DestinationError::Unavailable(message);
    }
    DestinationError::Validation(message)
}

/// Pair a batch response back onto the input payloads, in input order.
///
/// Records the destination reported in neither list are marked rejected so
/// the accounting never loses a record.
fn pair_batch_outcomes(
    payloads: &[UserPayload],
    body: &BatchUsersBody,
) -> Vec<CreateOutcome> {
    let created: HashMap<&str, ()> = body
        .created_users
        .iter()
        .flat_map(|u| u.login_ids.iter().map(|l| (l.as_str(), ())))
        .collect();
    let failed: HashMap<&str, &str> = body
        .failed_users
        .iter()
        .flat_map(|f| {
            f.user
                .login_ids
                .iter()
                .map(move |l| (l.as_str(), f.failure.as_str()))
        })
        .collect();

    payloads
        .iter()
        .map(|p| {
            if created.contains_key(p.login_id.as_str()) {
                CreateOutcome::Created {
                    id: p.login_id.clone(),
                }
            } else if let Some(reason) = failed.get(p.login_id.as_str()) {
                if reason.to_ascii_lowercase().contains("already exist") {
                    CreateOutcome::AlreadyExists { id: None }
                } else {
                    CreateOutcome::Rejected {
                        reason: (*reason).to_string(),
                    }
                }
            } else {
                CreateOutcome::Rejected {
                    reason: "no outcome reported for record".into(),
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Destination impl
// ---------------------------------------------------------------------------

impl Destination for DescopeClient {
    #[instrument(skip(self, users), fields(count = users.len()))]
    async fn create_users_batch(
        &self,
        users: &[UserPayload],
    ) -> Result<BatchCreateResponse, DestinationError> {
        let payload = serde_json::json!({
            "users": users.iter().map(Self::user_json).collect::<Vec<_>>(),
            "invite": false,
        });
        let resp = self.post("/v1/mgmt/user/create/batch", payload).await?;
        let body: BatchUsersBody = resp
            .json()
            .await
            .map_err(|e| DestinationError::ParseError(e.to_string()))?;
        let outcomes = pair_batch_outcomes(users, &body);
        debug!(
            created = body.created_users.len(),
            failed = body.failed_users.len(),
            "batch create returned"
        );
        Ok(BatchCreateResponse { outcomes })
    }

    #[instrument(skip(self, role), fields(name = %role.name))]
    async fn create_role(&self, role: &RolePayload) -> Result<String, DestinationError> {
        let payload = serde_json::json!({
            "name": role.name,
            "description": role.description.as_deref().unwrap_or(""),
            "permissionNames": [],
        });
        self.post("/v1/mgmt/role/create", payload).await?;
        debug!("created role");
        Ok(role.name.clone())
    }

    #[instrument(skip(self))]
    async fn create_permission(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<String, DestinationError> {
        let payload = serde_json::json!({
            "name": name,
            "description": description.unwrap_or(""),
        });
        self.post("/v1/mgmt/permission/create", payload).await?;
        debug!("created permission");
        Ok(name.to_string())
    }

    #[instrument(skip(self, permission_ids), fields(count = permission_ids.len()))]
    async fn set_role_permissions(
        &self,
        role_id: &str,
        permission_ids: &[String],
    ) -> Result<(), DestinationError> {
        let payload = serde_json::json!({
            "name": role_id,
            "newName": role_id,
            "permissionNames": permission_ids,
        });
        self.post("/v1/mgmt/role/update", payload).await?;
        debug!("attached permissions to role");
        Ok(())
    }

    #[instrument(skip(self, tenant), fields(name = %tenant.name))]
    async fn create_tenant(&self, tenant: &TenantPayload) -> Result<String, DestinationError> {
        let payload = serde_json::json!({
            "name": tenant.name,
            "id": tenant.tenant_id,
        });
        let resp = self.post("/v1/mgmt/tenant/create", payload).await?;
        let created: TenantCreated = resp.json().await.unwrap_or(TenantCreated {
            id: tenant.tenant_id.clone(),
        });
        debug!(id = %created.id, "created tenant");
        Ok(created.id)
    }

    #[instrument(skip(self, role_ids), fields(count = role_ids.len()))]
    async fn assign_roles(
        &self,
        user_id: &str,
        role_ids: &[String],
    ) -> Result<(), DestinationError> {
        let payload = serde_json::json!({
            "loginId": user_id,
            "roleNames": role_ids,
        });
        self.post("/v1/mgmt/user/update/role/add", payload).await?;
        debug!("assigned roles to user");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn add_user_to_tenant(
        &self,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<(), DestinationError> {
        let payload = serde_json::json!({
            "loginId": user_id,
            "tenantId": tenant_id,
        });
        self.post("/v1/mgmt/user/update/tenant/add", payload).await?;
        debug!("added user to tenant");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<String>, DestinationError> {
        let payload = serde_json::json!({ "emails": [email] });
        let resp = self.post("/v1/mgmt/user/search", payload).await?;
        let body: SearchUsersBody = resp
            .json()
            .await
            .map_err(|e| DestinationError::ParseError(e.to_string()))?;
        let found = body
            .users
            .into_iter()
            .next()
            .and_then(|u| u.login_ids.into_iter().next());
        if found.is_none() {
            debug!("no existing user for email");
        }
        Ok(found)
    }

    #[instrument(skip(self))]
    async fn deactivate_user(&self, user_id: &str) -> Result<(), DestinationError> {
        let payload = serde_json::json!({ "loginId": user_id });
        self.post("/v1/mgmt/user/deactivate", payload).await?;
        warn!(user_id, "deactivated user (blocked at source)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(login_id: &str) -> UserPayload {
        UserPayload {
            source_user_id: format!("auth0|{}", login_id),
            login_id: login_id.into(),
            email: login_id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_conflict_by_code() {
        let body = r#"{"errorCode":"E024104","errorDescription":"permission exists"}"#;
        let err = classify_error_body(400, body);
        assert!(matches!(err, DestinationError::Conflict { .. }));
    }

    #[test]
    fn test_classify_conflict_by_message() {
        let body = r#"{"errorCode":"E011111","errorDescription":"role already exists"}"#;
        let err = classify_error_body(400, body);
        assert!(matches!(err, DestinationError::Conflict { .. }));
    }

    #[test]
    fn test_classify_validation_and_unavailable() {
        let body = r#"{"errorCode":"E011001","errorDescription":"bad email"}"#;
        assert!(matches!(
            classify_error_body(400, body),
            DestinationError::Validation(msg) if msg == "bad email"
        ));
        assert!(matches!(
            classify_error_body(503, "{}"),
            DestinationError::Unavailable(_)
        ));
    }

    #[test]
    fn test_pair_batch_outcomes_positional() {
        let payloads = vec![payload("a@x.com"), payload("b@x.com"), payload("c@x.com")];
        let body = BatchUsersBody {
            created_users: vec![CreatedUser {
                login_ids: vec!["a@x.com".into()],
            }],
            failed_users: vec![
                FailedUser {
                    failure: "user already exists".into(),
                    user: FailedUserRef {
                        login_ids: vec!["b@x.com".into()],
                    },
                },
                FailedUser {
                    failure: "invalid phone".into(),
                    user: FailedUserRef {
                        login_ids: vec!["c@x.com".into()],
                    },
                },
            ],
        };

        let outcomes = pair_batch_outcomes(&payloads, &body);
        assert_eq!(
            outcomes[0],
            CreateOutcome::Created {
                id: "a@x.com".into()
            }
        );
        assert_eq!(outcomes[1], CreateOutcome::AlreadyExists { id: None });
        assert_eq!(
            outcomes[2],
            CreateOutcome::Rejected {
                reason: "invalid phone".into()
            }
        );
    }

    #[test]
    fn test_pair_batch_outcomes_missing_record_is_rejected() {
        let payloads = vec![payload("a@x.com")];
        let body = BatchUsersBody {
            created_users: vec![],
            failed_users: vec![],
        };
        let outcomes = pair_batch_outcomes(&payloads, &body);
        assert!(matches!(outcomes[0], CreateOutcome::Rejected { .. }));
    }

    #[test]
    fn test_password_envelope_serialization() {
        let bcrypt = PasswordHash::Bcrypt {
            hash: "$2b$10$abcdef".into(),
        };
        let json = serde_json::to_value(hashed_password(&bcrypt)).unwrap();
        assert_eq!(json["bcrypt"]["hash"], "$2b$10$abcdef");
        assert!(json.get("pbkdf2").is_none());

        let pbkdf2 = PasswordHash::Pbkdf2 {
            variant: super::super::Pbkdf2Variant::Sha256,
            iterations: 10_000,
            salt: vec![1, 2, 3],
            digest: vec![4, 5, 6],
        };
        let json = serde_json::to_value(hashed_password(&pbkdf2)).unwrap();
        assert_eq!(json["pbkdf2"]["iterations"], 10_000);
        assert_eq!(json["pbkdf2"]["type"], "sha256");
    }
}
