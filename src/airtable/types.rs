//! Wire types for the Airtable OAuth and meta endpoints.

use serde::{Deserialize, Serialize};

/// Token endpoint response for both code exchange and refresh.
#[derive(Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    /// Airtable rotates refresh tokens; absent when the grant did not issue one
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Seconds until the access token expires
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Space-separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenSet {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// `GET /meta/whoami`
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AccountInfo {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteWorkspace {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub permission_level: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BasesPage {
    #[serde(default)]
    pub bases: Vec<RemoteBase>,
    #[serde(default)]
    pub offset: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WorkspacesPage {
    #[serde(default)]
    pub workspaces: Vec<RemoteWorkspace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_set_parses_scope_list_and_hides_tokens() {
        let tokens: TokenSet = serde_json::from_str(
            r#"{"access_token":"at-secret","refresh_token":"rt-secret","token_type":"Bearer","expires_in":3600,"scope":"schema.bases:read user.email:read"}"#,
        )
        .unwrap();

        assert_eq!(tokens.scopes(), vec!["schema.bases:read", "user.email:read"]);
        let debug = format!("{:?}", tokens);
        assert!(!debug.contains("at-secret"));
        assert!(!debug.contains("rt-secret"));
    }

    #[test]
    fn base_accepts_missing_workspace_id() {
        let base: RemoteBase =
            serde_json::from_str(r#"{"id":"app1","name":"CRM","permissionLevel":"create"}"#)
                .unwrap();

        assert_eq!(base.workspace_id, None);
        assert_eq!(base.permission_level.as_deref(), Some("create"));
    }
}
