//! Source-to-destination record translation.
//!
//! [`IdentityMapper`] is a pure function layer: given a [`SourceUser`] (plus
//! an optional password record) it produces the destination's create-request
//! payload. No network I/O, fully deterministic for the same input.
//!
//! Login-identifier derivation follows the source's connection semantics:
//! database connections log in by email, SMS connections by phone number,
//! and social connections by a `provider-subject` composite so the same
//! person arriving through two providers keeps distinct login handles.

use tracing::debug;

use crate::destination::{
    CustomAttributes, PasswordHash, Pbkdf2Variant, RolePayload, TenantPayload, UserPayload,
};
use crate::errors::MapError;
use crate::models::{PasswordRecord, SourceOrganization, SourceRole, SourceUser};

/// Connection tag applied to users loaded from an export file, which carries
/// no identity block.
const FILE_IMPORT_CONNECTION: &str = "imported-from-json";

/// A mapped user: the payload to send, plus the reason its password was
/// dropped if the source hash could not be re-encoded. Such users are still
/// migrated -- just passwordless -- never dropped from the run.
#[derive(Debug)]
pub struct MappedUser {
    pub payload: UserPayload,
    pub password_dropped: Option<MapError>,
}

/// Translates source records into destination create-request payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl IdentityMapper {
    pub fn new() -> Self {
        Self
    }

    /// Map a source user (and optional password record) to a destination
    /// user payload.
    ///
    /// Fails only when no login identifier can be derived at all; password
    /// problems degrade to a passwordless payload with the cause attached.
    pub fn map_user(
        &self,
        user: &SourceUser,
        password: Option<&PasswordRecord>,
    ) -> Result<MappedUser, MapError> {
        let (login_ids, connections) = derive_login_ids(user);

        let login_id = login_ids
            .first()
            .cloned()
            .ok_or_else(|| MapError::NoLoginId(user.user_id.clone()))?;

        // Phone is carried only when an SMS identity vouches for it.
        let phone = user
            .identities
            .iter()
            .any(|i| i.provider == "sms")
            .then(|| user.phone_number.clone())
            .flatten();

        let mut password_dropped = None;
        let password_hash = match password {
            Some(record) => match parse_password_hash(&login_id, &record.password_hash) {
                Ok(hash) => Some(hash),
                Err(err) => {
                    debug!(login_id = %login_id, %err, "dropping unimportable password");
                    password_dropped = Some(err);
                    None
                }
            },
            None => None,
        };

        let display_name = user
            .name
            .clone()
            .or_else(|| user.nickname.clone())
            .or_else(|| Some(user.email.clone()));

        let payload = UserPayload {
            source_user_id: user.user_id.clone(),
            login_id,
            email: user.email.clone(),
            verified_email: user.email_verified,
            display_name,
            given_name: user.given_name.clone(),
            family_name: user.family_name.clone(),
            verified_phone: phone.is_some() && user.phone_verified,
            phone,
            picture: user.picture.clone(),
            custom_attributes: CustomAttributes {
                connection: connections.join(","),
                freshly_migrated: true,
                nickname: user.nickname.clone(),
            },
            additional_login_ids: login_ids[1..].to_vec(),
            password: password_hash,
            blocked: user.blocked,
        };

        Ok(MappedUser {
            payload,
            password_dropped,
        })
    }

    /// Map a source role to a destination role payload.
    ///
    /// The role name is the cross-platform identifier: both platforms
    /// address roles by name, and user role lists arrive as names, so the
    /// IdMap keys roles by name rather than by the source's opaque role ID.
    pub fn map_role(&self, role: &SourceRole) -> RolePayload {
        RolePayload {
            source_id: role.name.clone(),
            name: role.name.clone(),
            description: role.description.clone(),
        }
    }

    /// Map a source organization to a destination tenant payload. The source
    /// organization ID is reused as the tenant ID.
    pub fn map_organization(&self, org: &SourceOrganization) -> TenantPayload {
        TenantPayload {
            source_id: org.id.clone(),
            tenant_id: org.id.clone(),
            name: org.display_name.clone(),
        }
    }
}

/// Derive the ordered login identifiers and connection tags for a user.
///
/// The first login ID is the primary; the rest become additional login IDs.
fn derive_login_ids(user: &SourceUser) -> (Vec<String>, Vec<String>) {
    let mut login_ids = Vec::new();
    let mut connections = Vec::new();

    if user.identities.is_empty() {
        let fallback = if !user.email.is_empty() {
            Some(user.email.clone())
        } else if !user.user_id.is_empty() {
            Some(user.user_id.clone())
        } else {
            None
        };
        if let Some(id) = fallback {
            login_ids.push(id);
            connections.push(FILE_IMPORT_CONNECTION.to_string());
        }
        return (login_ids, connections);
    }

    for identity in &user.identities {
        let conn = identity.connection.as_str();
        let login = if conn.contains("Username") {
            Some(user.email.clone()).filter(|e| !e.is_empty())
        } else if conn.contains("sms") {
            user.phone_number.clone()
        } else if let Some(prefix) = conn.split('-').next().filter(|_| conn.contains('-')) {
            Some(format!("{}-{}", prefix, identity.user_id))
        } else {
            Some(format!("{}-{}", conn, identity.user_id))
        };
        if let Some(login) = login {
            login_ids.push(login);
            connections.push(identity.connection.clone());
        }
    }

    (login_ids, connections)
}

// ---------------------------------------------------------------------------
// Password hash parsing
// ---------------------------------------------------------------------------

/// Re-encode a source password hash string into the destination envelope.
///
/// Supported schemes: bcrypt modular-crypt (`$2a$`/`$2b$`/`$2y$`) and
/// passlib-style PBKDF2 (`$pbkdf2-sha256$`/`$pbkdf2-sha512$`). Anything else
/// is [`MapError::UnsupportedHashAlgorithm`].
pub fn parse_password_hash(login_id: &str, raw: &str) -> Result<PasswordHash, MapError> {
    if raw.starts_with("$2a$") || raw.starts_with("$2b$") || raw.starts_with("$2y$") {
        return parse_bcrypt(login_id, raw);
    }
    if let Some(rest) = raw.strip_prefix("$pbkdf2-sha256$") {
        return parse_pbkdf2(login_id, Pbkdf2Variant::Sha256, rest);
    }
    if let Some(rest) = raw.strip_prefix("$pbkdf2-sha512$") {
        return parse_pbkdf2(login_id, Pbkdf2Variant::Sha512, rest);
    }

    let scheme = raw
        .strip_prefix('$')
        .and_then(|r| r.split('$').next())
        .unwrap_or("unknown")
        .to_string();
    Err(MapError::UnsupportedHashAlgorithm {
        login_id: login_id.to_string(),
        scheme,
    })
}

fn parse_bcrypt(login_id: &str, raw: &str) -> Result<PasswordHash, MapError> {
    // $2b$<cost>$<22-char salt><31-char digest>
    let parts: Vec<&str> = raw.split('$').collect();
    let valid = parts.len() == 4
        && parts[2].parse::<u32>().is_ok()
        && parts[3].len() == 53;
    if !valid {
        return Err(MapError::InvalidHash {
            login_id: login_id.to_string(),
            detail: "malformed bcrypt modular-crypt string".into(),
        });
    }
    Ok(PasswordHash::Bcrypt {
        hash: raw.to_string(),
    })
}

fn parse_pbkdf2(
    login_id: &str,
    variant: Pbkdf2Variant,
    rest: &str,
) -> Result<PasswordHash, MapError> {
    // passlib layout: <params>$<salt>$<checksum>, params either `i=N,l=M`
    // or a bare round count.
    let mut segments = rest.split('$');
    let params = segments.next().unwrap_or_default();
    let salt_seg = segments.next();
    let digest_seg = segments.next();

    let (salt_seg, digest_seg) = match (salt_seg, digest_seg) {
        (Some(s), Some(d)) if !s.is_empty() && !d.is_empty() => (s, d),
        _ => {
            return Err(MapError::InvalidHash {
                login_id: login_id.to_string(),
                detail: "pbkdf2 hash missing salt or checksum segment".into(),
            })
        }
    };

    let iterations = params
        .split(',')
        .find_map(|p| p.strip_prefix("i="))
        .unwrap_or(params)
        .parse::<u32>()
        .map_err(|_| MapError::InvalidHash {
            login_id: login_id.to_string(),
            detail: format!("unparseable pbkdf2 round count '{}'", params),
        })?;

    let salt = decode_ab64(salt_seg).ok_or_else(|| MapError::InvalidHash {
        login_id: login_id.to_string(),
        detail: "undecodable pbkdf2 salt".into(),
    })?;
    let digest = decode_ab64(digest_seg).ok_or_else(|| MapError::InvalidHash {
        login_id: login_id.to_string(),
        detail: "undecodable pbkdf2 checksum".into(),
    })?;

    Ok(PasswordHash::Pbkdf2 {
        variant,
        iterations,
        salt,
        digest,
    })
}

/// Decode passlib's adapted base64 (`.` for `+`, no padding).
fn decode_ab64(input: &str) -> Option<Vec<u8>> {
    use base64::Engine as _;
    let mut s: String = input.replace('.', "+");
    while s.len() % 4 != 0 {
        s.push('=');
    }
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceIdentity;

    fn user_with_identities(identities: Vec<SourceIdentity>) -> SourceUser {
        SourceUser {
            user_id: "auth0|u1".into(),
            email: "jdoe@example.com".into(),
            email_verified: true,
            name: Some("John Doe".into()),
            nickname: Some("jd".into()),
            phone_number: Some("+15551234567".into()),
            identities,
            ..Default::default()
        }
    }

    fn identity(connection: &str, user_id: &str, provider: &str) -> SourceIdentity {
        SourceIdentity {
            connection: connection.into(),
            user_id: user_id.into(),
            provider: provider.into(),
        }
    }

    #[test]
    fn test_database_connection_logs_in_by_email() {
        let user =
            user_with_identities(vec![identity("Username-Password-Authentication", "u1", "auth0")]);
        let mapped = IdentityMapper::new().map_user(&user, None).unwrap();
        assert_eq!(mapped.payload.login_id, "jdoe@example.com");
        assert_eq!(
            mapped.payload.custom_attributes.connection,
            "Username-Password-Authentication"
        );
        assert!(mapped.payload.custom_attributes.freshly_migrated);
    }

    #[test]
    fn test_sms_connection_logs_in_by_phone() {
        let user = user_with_identities(vec![identity("sms", "u1", "sms")]);
        let mapped = IdentityMapper::new().map_user(&user, None).unwrap();
        assert_eq!(mapped.payload.login_id, "+15551234567");
        assert_eq!(mapped.payload.phone.as_deref(), Some("+15551234567"));
    }

    #[test]
    fn test_social_connection_builds_composite_login() {
        let user = user_with_identities(vec![identity("google-oauth2", "108234", "google-oauth2")]);
        let mapped = IdentityMapper::new().map_user(&user, None).unwrap();
        assert_eq!(mapped.payload.login_id, "google-108234");
    }

    #[test]
    fn test_plain_connection_builds_composite_login() {
        let user = user_with_identities(vec![identity("github", "9001", "github")]);
        let mapped = IdentityMapper::new().map_user(&user, None).unwrap();
        assert_eq!(mapped.payload.login_id, "github-9001");
    }

    #[test]
    fn test_multiple_identities_join_connections() {
        let user = user_with_identities(vec![
            identity("Username-Password-Authentication", "u1", "auth0"),
            identity("google-oauth2", "108234", "google-oauth2"),
        ]);
        let mapped = IdentityMapper::new().map_user(&user, None).unwrap();
        assert_eq!(mapped.payload.login_id, "jdoe@example.com");
        assert_eq!(mapped.payload.additional_login_ids, vec!["google-108234"]);
        assert_eq!(
            mapped.payload.custom_attributes.connection,
            "Username-Password-Authentication,google-oauth2"
        );
    }

    #[test]
    fn test_export_user_without_identities() {
        let user = user_with_identities(vec![]);
        let mapped = IdentityMapper::new().map_user(&user, None).unwrap();
        assert_eq!(mapped.payload.login_id, "jdoe@example.com");
        assert_eq!(mapped.payload.custom_attributes.connection, "imported-from-json");
        // Nickname rides along as a custom attribute.
        assert_eq!(
            mapped.payload.custom_attributes.nickname.as_deref(),
            Some("jd")
        );
    }

    #[test]
    fn test_no_login_id_at_all() {
        let user = SourceUser::default();
        let result = IdentityMapper::new().map_user(&user, None);
        assert!(matches!(result, Err(MapError::NoLoginId(_))));
    }

    #[test]
    fn test_bcrypt_password_passes_through() {
        let user = user_with_identities(vec![]);
        let record = PasswordRecord {
            email: "jdoe@example.com".into(),
            password_hash: format!("$2b$10${}", "a".repeat(53)),
        };
        let mapped = IdentityMapper::new().map_user(&user, Some(&record)).unwrap();
        assert!(mapped.password_dropped.is_none());
        assert!(matches!(
            mapped.payload.password,
            Some(PasswordHash::Bcrypt { .. })
        ));
    }

    #[test]
    fn test_unsupported_hash_degrades_to_passwordless() {
        let user = user_with_identities(vec![]);
        let record = PasswordRecord {
            email: "jdoe@example.com".into(),
            password_hash: "$argon2id$v=19$m=65536,t=3,p=4$c29tZXNhbHQ$xyz".into(),
        };
        let mapped = IdentityMapper::new().map_user(&user, Some(&record)).unwrap();
        assert!(mapped.payload.password.is_none());
        assert!(matches!(
            mapped.password_dropped,
            Some(MapError::UnsupportedHashAlgorithm { ref scheme, .. }) if scheme == "argon2id"
        ));
    }

    #[test]
    fn test_malformed_bcrypt_is_invalid_not_unsupported() {
        let result = parse_password_hash("x", "$2b$10$tooshort");
        assert!(matches!(result, Err(MapError::InvalidHash { .. })));
    }

    #[test]
    fn test_pbkdf2_with_keyed_params() {
        let hash = parse_password_hash(
            "x",
            "$pbkdf2-sha512$i=25000,l=64$c2FsdHNhbHQ$aGFzaGhhc2g",
        )
        .unwrap();
        match hash {
            PasswordHash::Pbkdf2 {
                variant,
                iterations,
                salt,
                digest,
            } => {
                assert_eq!(variant, Pbkdf2Variant::Sha512);
                assert_eq!(iterations, 25_000);
                assert_eq!(salt, b"saltsalt");
                assert_eq!(digest, b"hashhash");
            }
            other => panic!("expected pbkdf2, got {:?}", other),
        }
    }

    #[test]
    fn test_pbkdf2_with_bare_round_count() {
        let hash = parse_password_hash("x", "$pbkdf2-sha256$29000$c2FsdHNhbHQ$aGFzaGhhc2g").unwrap();
        match hash {
            PasswordHash::Pbkdf2 {
                variant, iterations, ..
            } => {
                assert_eq!(variant, Pbkdf2Variant::Sha256);
                assert_eq!(iterations, 29_000);
            }
            other => panic!("expected pbkdf2, got {:?}", other),
        }
    }

    #[test]
    fn test_pbkdf2_adapted_base64() {
        // Passlib writes '.' where standard base64 writes '+'.
        assert_eq!(decode_ab64("c2FsdHNhbHQ"), Some(b"saltsalt".to_vec()));
        let with_dot = decode_ab64("api.").unwrap();
        let with_plus = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.decode("api+").unwrap()
        };
        assert_eq!(with_dot, with_plus);
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let user = user_with_identities(vec![
            identity("Username-Password-Authentication", "u1", "auth0"),
            identity("google-oauth2", "108234", "google-oauth2"),
        ]);
        let mapper = IdentityMapper::new();
        let a = mapper.map_user(&user, None).unwrap();
        let b = mapper.map_user(&user, None).unwrap();
        assert_eq!(a.payload.login_id, b.payload.login_id);
        assert_eq!(a.payload.additional_login_ids, b.payload.additional_login_ids);
        assert_eq!(a.payload.custom_attributes, b.payload.custom_attributes);
    }
}
