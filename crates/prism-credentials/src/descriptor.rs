//! Credential descriptor files: one JSON file per domain in the credentials
//! directory, named `<domain>.credentials.json` (the domain part may include
//! a `:port`). Pool descriptors reference sibling files by `account_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CredentialError;

/// Kind of upstream credential. Unknown kinds fail deserialization, which
/// rejects the whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Oauth,
    Pool,
}

/// OAuth token set as stored on disk. `expires_at` is unix milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Member list for a `pool` descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMembers {
    pub pool_id: String,
    pub account_ids: Vec<String>,
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

fn default_strategy() -> String {
    "least_used".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialDescriptor {
    pub kind: CredentialKind,
    /// Key the client must present as `Authorization: Bearer <key>`.
    pub client_api_key: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolMembers>,
    /// Unknown keys ride along untouched so a rewrite never loses fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl CredentialDescriptor {
    /// Parse and cross-check a descriptor file's contents.
    pub fn parse(path: &str, data: &str) -> Result<Self, CredentialError> {
        let descriptor: CredentialDescriptor =
            serde_json::from_str(data).map_err(|e| CredentialError::Invalid {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        descriptor.validate(path)?;
        Ok(descriptor)
    }

    fn validate(&self, path: &str) -> Result<(), CredentialError> {
        let missing = match self.kind {
            CredentialKind::ApiKey if self.api_key.is_none() => Some("api_key"),
            CredentialKind::Oauth if self.oauth.is_none() => Some("oauth"),
            CredentialKind::Pool if self.pool.is_none() => Some("pool"),
            _ => None,
        };
        if let Some(field) = missing {
            return Err(CredentialError::Invalid {
                path: path.to_string(),
                reason: format!("kind requires the `{field}` field"),
            });
        }
        if self.client_api_key.is_empty() {
            return Err(CredentialError::Invalid {
                path: path.to_string(),
                reason: "client_api_key must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// File name for a lookup key (domain or account id).
pub fn file_name(key: &str) -> String {
    format!("{key}.credentials.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_api_key_descriptor() {
        let d = CredentialDescriptor::parse(
            "example.com.credentials.json",
            r#"{
                "kind": "api_key",
                "client_api_key": "ck-1",
                "account_id": "acct-1",
                "api_key": "sk-ant-xxxx"
            }"#,
        )
        .unwrap();
        assert_eq!(d.kind, CredentialKind::ApiKey);
        assert_eq!(d.account_id, "acct-1");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = CredentialDescriptor::parse(
            "x.credentials.json",
            r#"{"kind": "kerberos", "client_api_key": "c", "account_id": "a"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CredentialError::Invalid { .. }));
    }

    #[test]
    fn kind_without_matching_section_is_rejected() {
        let err = CredentialDescriptor::parse(
            "x.credentials.json",
            r#"{"kind": "oauth", "client_api_key": "c", "account_id": "a"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("oauth"));
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let raw = r#"{
            "kind": "oauth",
            "client_api_key": "c",
            "account_id": "a",
            "oauth": {"access_token": "t", "refresh_token": "r", "expires_at": 1},
            "notes": "rotated 2026-07-01"
        }"#;
        let d = CredentialDescriptor::parse("x.credentials.json", raw).unwrap();
        assert_eq!(d.extra["notes"], "rotated 2026-07-01");
        let back = serde_json::to_value(&d).unwrap();
        assert_eq!(back["notes"], "rotated 2026-07-01");
    }

    #[test]
    fn file_name_keeps_port_suffix() {
        assert_eq!(file_name("example.com:8443"), "example.com:8443.credentials.json");
    }
}
