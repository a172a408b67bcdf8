//! Export-file loaders.
//!
//! The source platform's user export is NDJSON: one JSON object per line.
//! Two header dialects exist in the wild -- the bulk-export API writes
//! `user_id` / `email`, the dashboard CSV-to-JSON path writes `Id` /
//! `Email` -- so every field is normalized through both spellings here and
//! dynamic JSON never travels past this module.
//!
//! A line missing a usable email is a malformed record: skipped, logged,
//! counted, never fatal. I/O failures are fatal -- they happen before any
//! destination write.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use crate::errors::SourceError;
use crate::models::{PasswordRecord, SourceUser};

/// Users parsed from an export file, plus the count of lines skipped as
/// malformed.
#[derive(Debug, Default)]
pub struct ExportLoad {
    pub users: Vec<SourceUser>,
    pub skipped_malformed: u64,
}

/// Password records parsed from a password export, plus the count of lines
/// skipped as malformed.
#[derive(Debug, Default)]
pub struct PasswordLoad {
    pub records: Vec<PasswordRecord>,
    pub skipped_malformed: u64,
}

/// Load and normalize a user export file.
pub fn load_users_from_file<P: AsRef<Path>>(path: P) -> Result<ExportLoad, SourceError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;

    let mut load = ExportLoad::default();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_user_line(line, idx + 1) {
            Ok(user) => load.users.push(user),
            Err(err) => {
                warn!(%err, "skipping malformed export record");
                load.skipped_malformed += 1;
            }
        }
    }

    info!(
        path = %path.display(),
        users = load.users.len(),
        skipped = load.skipped_malformed,
        "loaded users from export file"
    );
    Ok(load)
}

/// Load a password export file (NDJSON with `passwordHash` per record).
pub fn load_password_export<P: AsRef<Path>>(path: P) -> Result<PasswordLoad, SourceError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;

    let mut load = PasswordLoad::default();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = idx + 1;
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping unparseable password record");
                load.skipped_malformed += 1;
                continue;
            }
        };
        let email = get_str(&value, &["email", "Email"]);
        let hash = get_str(&value, &["passwordHash", "password_hash"]);
        match (email, hash) {
            (Some(email), Some(password_hash)) if !email.is_empty() => {
                load.records.push(PasswordRecord {
                    email,
                    password_hash,
                });
            }
            _ => {
                warn!(line = line_no, "skipping password record without email or hash");
                load.skipped_malformed += 1;
            }
        }
    }

    info!(
        path = %path.display(),
        records = load.records.len(),
        skipped = load.skipped_malformed,
        "loaded password export file"
    );
    Ok(load)
}

/// Pair password records with users by case-insensitive email equality.
///
/// Returns a map keyed by source user ID, plus the count of password records
/// that matched no user (ignored, not fatal).
pub fn merge_passwords(
    users: &[SourceUser],
    records: Vec<PasswordRecord>,
) -> (HashMap<String, PasswordRecord>, u64) {
    let by_email: HashMap<String, &str> = users
        .iter()
        .filter(|u| !u.email.is_empty())
        .map(|u| (u.email.to_lowercase(), u.user_id.as_str()))
        .collect();

    let mut merged = HashMap::new();
    let mut unmatched = 0u64;
    for record in records {
        match by_email.get(&record.email.to_lowercase()) {
            Some(user_id) => {
                merged.insert((*user_id).to_string(), record);
            }
            None => {
                warn!(email = %record.email, "password record matches no user");
                unmatched += 1;
            }
        }
    }
    (merged, unmatched)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn parse_user_line(line: &str, line_no: usize) -> Result<SourceUser, SourceError> {
    let value: Value = serde_json::from_str(line).map_err(|e| SourceError::MalformedRecord {
        line: line_no,
        detail: format!("not valid JSON: {}", e),
    })?;

    let email = get_str(&value, &["email", "Email"])
        .filter(|e| !e.is_empty())
        .ok_or_else(|| SourceError::MalformedRecord {
            line: line_no,
            detail: "missing required email field".into(),
        })?;

    let user_id =
        get_str(&value, &["user_id", "Id"]).filter(|v| !v.is_empty()).unwrap_or_else(|| email.clone());

    Ok(SourceUser {
        user_id,
        email,
        email_verified: get_bool(&value, &["email_verified", "Email Verified"]),
        name: get_str(&value, &["name", "Name"]),
        given_name: get_str(&value, &["given_name", "Given Name"]),
        family_name: get_str(&value, &["family_name", "Family Name"]),
        nickname: get_str(&value, &["nickname", "Nickname"]),
        picture: get_str(&value, &["picture", "Picture"]),
        phone_number: get_str(&value, &["phone_number", "Phone Number"]),
        phone_verified: get_bool(&value, &["phone_verified", "Phone Verified"]),
        blocked: get_bool(&value, &["blocked", "Blocked"]),
        ..Default::default()
    })
}

fn get_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(k))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn get_bool(value: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|k| value.get(k))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}
