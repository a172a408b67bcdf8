//! Auth0 Management API client.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::errors::SourceError;
use crate::models::{RoleMember, SourceIdentity, SourceOrganization, SourceRole, SourceUser};

use super::Source;

/// Hard page-count cap: the Management API stops serving plain pagination
/// past the first 1000 records, so `page_size * MAX_PAGES` is pinned there.
const MAX_PAGES: u32 = 50;

/// Transient-failure retries per page fetch (timeouts, 429s). Reads that
/// still fail after this are a fatal [`SourceError::Unavailable`].
const FETCH_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct ApiIdentity {
    connection: String,
    user_id: String,
    #[serde(default)]
    provider: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUser {
    user_id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    picture: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
    #[serde(default)]
    phone_verified: bool,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    identities: Vec<ApiIdentity>,
}

impl From<ApiUser> for SourceUser {
    fn from(u: ApiUser) -> Self {
        SourceUser {
            user_id: u.user_id,
            email: u.email,
            email_verified: u.email_verified,
            name: u.name,
            given_name: u.given_name,
            family_name: u.family_name,
            nickname: u.nickname,
            picture: u.picture,
            phone_number: u.phone_number,
            phone_verified: u.phone_verified,
            blocked: u.blocked,
            identities: u
                .identities
                .into_iter()
                .map(|i| SourceIdentity {
                    connection: i.connection,
                    user_id: i.user_id,
                    provider: i.provider,
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApiRole {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiPermission {
    permission_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiRoleUser {
    user_id: String,
    #[serde(default)]
    email: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiOrganization {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiOrgMember {
    user_id: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Asynchronous Auth0 Management API client.
#[derive(Clone)]
pub struct Auth0Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
    page_size: u32,
}

impl Auth0Client {
    pub fn new(domain: impl AsRef<str>, token: impl Into<String>, page_size: u32) -> Self {
        let base_url = format!("https://{}/api/v2", domain.as_ref().trim_end_matches('/'));
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("idmigrate/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        info!(base_url = %base_url, "created Auth0Client");
        Self {
            http,
            base_url,
            token: token.into(),
            page_size,
        }
    }

    /// Fetch one page, retrying transient failures (timeouts, 429s) a few
    /// times before giving up.
    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        page: u32,
    ) -> Result<Vec<T>, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .query(&[("page", page.to_string()), ("per_page", self.page_size.to_string())])
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<Vec<T>>().await.map_err(|e| {
                            SourceError::Unavailable(format!("unparseable page body: {}", e))
                        });
                    }
                    if status.as_u16() == 429 && attempt <= FETCH_RETRIES {
                        let wait = Duration::from_secs(2u64.saturating_pow(attempt));
                        warn!(path, page, attempt, "source rate limited, retrying page fetch");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(SourceError::AuthenticationFailed(format!(
                            "HTTP {}",
                            status
                        )));
                    }
                    return Err(SourceError::Unavailable(format!(
                        "{} returned HTTP {}",
                        path, status
                    )));
                }
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt <= FETCH_RETRIES => {
                    let wait = Duration::from_secs(2u64.saturating_pow(attempt));
                    warn!(path, page, attempt, error = %e, "transient fetch error, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(SourceError::HttpError(e)),
            }
        }
    }

    /// Paginate a listing endpoint to completion (or the page cap).
    async fn get_all<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, SourceError> {
        let mut all = Vec::new();
        for page in 0..MAX_PAGES {
            let records: Vec<T> = self.get_page(path, page).await?;
            if records.is_empty() {
                return Ok(all);
            }
            all.extend(records);
        }
        warn!(path, cap = MAX_PAGES, "hit page cap, listing may be truncated upstream");
        Ok(all)
    }
}

impl Source for Auth0Client {
    #[instrument(skip(self))]
    async fn fetch_users(&self) -> Result<Vec<SourceUser>, SourceError> {
        let users: Vec<ApiUser> = self.get_all("/users").await?;
        debug!(count = users.len(), "fetched users");
        Ok(users.into_iter().map(SourceUser::from).collect())
    }

    #[instrument(skip(self))]
    async fn fetch_roles(&self) -> Result<Vec<SourceRole>, SourceError> {
        let roles: Vec<ApiRole> = self.get_all("/roles").await?;
        debug!(count = roles.len(), "fetched roles");

        let mut out = Vec::with_capacity(roles.len());
        for role in roles {
            let permissions: Vec<ApiPermission> = self
                .get_all(&format!("/roles/{}/permissions", role.id))
                .await?;
            let members: Vec<ApiRoleUser> =
                self.get_all(&format!("/roles/{}/users", role.id)).await?;
            debug!(
                role = %role.name,
                permissions = permissions.len(),
                members = members.len(),
                "fetched role detail"
            );
            out.push(SourceRole {
                id: role.id,
                name: role.name,
                description: role.description,
                permissions: permissions.into_iter().map(|p| p.permission_name).collect(),
                members: members
                    .into_iter()
                    .map(|m| RoleMember {
                        user_id: m.user_id,
                        email: m.email,
                    })
                    .collect(),
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn fetch_organizations(&self) -> Result<Vec<SourceOrganization>, SourceError> {
        let orgs: Vec<ApiOrganization> = self.get_all("/organizations").await?;
        debug!(count = orgs.len(), "fetched organizations");

        let mut out = Vec::with_capacity(orgs.len());
        for org in orgs {
            let members: Vec<ApiOrgMember> = self
                .get_all(&format!("/organizations/{}/members", org.id))
                .await?;
            let display_name = org
                .display_name
                .or(org.name)
                .unwrap_or_else(|| org.id.clone());
            debug!(org = %display_name, members = members.len(), "fetched org members");
            out.push(SourceOrganization {
                id: org.id,
                display_name,
                members: members.into_iter().map(|m| m.user_id).collect(),
            });
        }
        Ok(out)
    }
}
