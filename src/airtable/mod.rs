//! Airtable API client
//!
//! Typed wrapper over the Airtable OAuth token endpoint and the `/meta`
//! endpoints used by the connection lifecycle. Token calls authenticate with
//! HTTP Basic client credentials; everything else uses the bearer access
//! token. Requests carry a timeout and are never retried here: authorization
//! codes and refresh tokens are single-use.

pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AirtableConfig;

pub use types::{AccountInfo, RemoteBase, RemoteWorkspace, TokenSet};
use types::{BasesPage, WorkspacesPage};

/// Upper bound on `/meta/bases` pages followed in one listing
const MAX_BASE_PAGES: usize = 50;
const MAX_ERROR_BODY_LEN: usize = 512;

/// Airtable client errors
#[derive(Debug, Error)]
pub enum AirtableError {
    #[error("authorization code exchange rejected with status {status}")]
    TokenExchange { status: u16, body: String },

    #[error("token refresh rejected with status {status}")]
    TokenRefresh { status: u16, body: String },

    #[error("access token rejected by Airtable")]
    Unauthorized,

    #[error("Airtable API request failed with status {status}")]
    Api { status: u16, body: String },

    #[error("network error talking to Airtable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected Airtable response: {0}")]
    Decode(String),

    #[error("Airtable base listing did not finish within {pages} pages")]
    TooManyPages { pages: usize },

    #[error("Airtable OAuth client credentials are not configured")]
    MissingCredentials,
}

impl AirtableError {
    /// True when Airtable rejected the bearer token itself.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, AirtableError::Unauthorized)
    }

    /// HTTP status reported by Airtable, if the request got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            AirtableError::TokenExchange { status, .. }
            | AirtableError::TokenRefresh { status, .. }
            | AirtableError::Api { status, .. } => Some(*status),
            AirtableError::Unauthorized => Some(401),
            AirtableError::Transport(err) => err.status().map(|s| s.as_u16()),
            AirtableError::Decode(_)
            | AirtableError::TooManyPages { .. }
            | AirtableError::MissingCredentials => None,
        }
    }
}

/// Operations the connection lifecycle needs from Airtable.
#[async_trait]
pub trait AirtableApi: Send + Sync {
    /// Exchange a single-use authorization code (with its PKCE verifier) for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, AirtableError>;

    /// Trade a refresh token for a new token set.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, AirtableError>;

    /// Identity of the account behind `access_token`.
    async fn account_info(&self, access_token: &str) -> Result<AccountInfo, AirtableError>;

    /// All bases visible to the account, following pagination.
    async fn list_bases(&self, access_token: &str) -> Result<Vec<RemoteBase>, AirtableError>;

    /// Workspaces of the account. Plans without the workspace API (403/404)
    /// yield an empty list rather than an error.
    async fn list_workspaces(
        &self,
        access_token: &str,
    ) -> Result<Vec<RemoteWorkspace>, AirtableError>;
}

/// reqwest-backed [`AirtableApi`] implementation.
#[derive(Clone)]
pub struct AirtableClient {
    http: Client,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_url: String,
    api_base: String,
}

impl AirtableClient {
    pub fn new(config: &AirtableConfig) -> Result<Self, AirtableError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .user_agent(concat!("basewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_url: config.token_url.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn credentials(&self) -> Result<(&str, &str), AirtableError> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => Err(AirtableError::MissingCredentials),
        }
    }

    async fn post_token_form(&self, form: &[(&str, &str)]) -> Result<Response, AirtableError> {
        let (client_id, client_secret) = self.credentials()?;

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(client_id, Some(client_secret))
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;

        Ok(response)
    }

    async fn get_meta(&self, path: &str, access_token: &str) -> Result<Response, AirtableError> {
        let response = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(access_token)
            .send()
            .await?;

        Ok(response)
    }
}

#[async_trait]
impl AirtableApi for AirtableClient {
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, AirtableError> {
        let response = self
            .post_token_form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("code_verifier", code_verifier),
            ])
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = truncated_body(response).await;
            warn!(status, "Airtable rejected authorization code exchange");
            return Err(AirtableError::TokenExchange { status, body });
        }

        decode(response).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, AirtableError> {
        let response = self
            .post_token_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = truncated_body(response).await;
            warn!(status, "Airtable rejected token refresh");
            return Err(AirtableError::TokenRefresh { status, body });
        }

        decode(response).await
    }

    async fn account_info(&self, access_token: &str) -> Result<AccountInfo, AirtableError> {
        let response = self.get_meta("/meta/whoami", access_token).await?;
        let response = ensure_success(response).await?;
        decode(response).await
    }

    async fn list_bases(&self, access_token: &str) -> Result<Vec<RemoteBase>, AirtableError> {
        let mut bases = Vec::new();
        let mut offset: Option<String> = None;

        for _ in 0..MAX_BASE_PAGES {
            let path = match &offset {
                Some(offset) => format!("/meta/bases?offset={}", urlencode(offset)),
                None => "/meta/bases".to_string(),
            };

            let response = self.get_meta(&path, access_token).await?;
            let response = ensure_success(response).await?;
            let page: BasesPage = decode(response).await?;

            bases.extend(page.bases);
            match page.offset {
                Some(next) if !next.is_empty() => offset = Some(next),
                _ => return Ok(bases),
            }
        }

        // A partial listing must never replace the cached catalog
        warn!(
            pages = MAX_BASE_PAGES,
            fetched = bases.len(),
            "Airtable base pagination did not terminate"
        );
        Err(AirtableError::TooManyPages {
            pages: MAX_BASE_PAGES,
        })
    }

    async fn list_workspaces(
        &self,
        access_token: &str,
    ) -> Result<Vec<RemoteWorkspace>, AirtableError> {
        let response = self.get_meta("/meta/workspaces", access_token).await?;

        if matches!(
            response.status(),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            debug!(
                status = response.status().as_u16(),
                "Workspace API unavailable for this Airtable plan"
            );
            return Ok(Vec::new());
        }

        let response = ensure_success(response).await?;
        let page: WorkspacesPage = decode(response).await?;
        Ok(page.workspaces)
    }
}

async fn ensure_success(response: Response) -> Result<Response, AirtableError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED {
        return Err(AirtableError::Unauthorized);
    }

    let body = truncated_body(response).await;
    Err(AirtableError::Api {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, AirtableError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| AirtableError::Decode(err.to_string()))
}

async fn truncated_body(response: Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY_LEN {
        let mut cut = MAX_ERROR_BODY_LEN;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> AirtableClient {
        let config = AirtableConfig {
            client_id: Some("client-id".to_string()),
            client_secret: Some("client-secret".to_string()),
            redirect_uri: Some("https://app.example.com/callback".to_string()),
            token_url: format!("{}/oauth2/v1/token", server.uri()),
            api_base: format!("{}/v0", server.uri()),
            ..AirtableConfig::default()
        };
        AirtableClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn exchange_code_uses_basic_auth_and_pkce_verifier() {
        let server = MockServer::start().await;
        // base64("client-id:client-secret")
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/token"))
            .and(header(
                "authorization",
                "Basic Y2xpZW50LWlkOmNsaWVudC1zZWNyZXQ=",
            ))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code_verifier=verifier-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "token_type": "Bearer",
                "expires_in": 3600,
                "scope": "schema.bases:read"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = client_for(&server)
            .exchange_code("code-1", "https://app.example.com/callback", "verifier-1")
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(tokens.expires_in, Some(3600));
    }

    #[tokio::test]
    async fn rejected_exchange_is_a_token_exchange_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .exchange_code("used-code", "https://app.example.com/callback", "v")
            .await
            .unwrap_err();

        assert!(matches!(err, AirtableError::TokenExchange { status: 400, .. }));
        assert!(!err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn rejected_refresh_is_a_token_refresh_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/v1/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client_for(&server).refresh_token("rt-old").await.unwrap_err();

        assert!(matches!(err, AirtableError::TokenRefresh { status: 401, .. }));
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_request() {
        let client = AirtableClient::new(&AirtableConfig::default()).unwrap();

        let err = client.refresh_token("rt").await.unwrap_err();

        assert!(matches!(err, AirtableError::MissingCredentials));
    }

    #[tokio::test]
    async fn workspace_listing_treats_403_and_404_as_empty() {
        for status in [403, 404] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/v0/meta/workspaces"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let workspaces = client_for(&server).list_workspaces("at").await.unwrap();
            assert!(workspaces.is_empty(), "status {status}");
        }
    }

    #[tokio::test]
    async fn list_bases_distinguishes_unauthorized_from_other_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/meta/bases"))
            .and(header("authorization", "Bearer revoked"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/meta/bases"))
            .and(header("authorization", "Bearer flaky"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);

        assert!(client.list_bases("revoked").await.unwrap_err().is_unauthorized());
        let err = client.list_bases("flaky").await.unwrap_err();
        assert!(matches!(err, AirtableError::Api { status: 503, .. }));
    }

    #[tokio::test]
    async fn list_bases_follows_offset_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/meta/bases"))
            .and(query_param("offset", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bases": [{"id": "app2", "name": "Second", "permissionLevel": "read"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v0/meta/bases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bases": [{"id": "app1", "name": "First", "permissionLevel": "create"}],
                "offset": "page2"
            })))
            .mount(&server)
            .await;

        let bases = client_for(&server).list_bases("at").await.unwrap();

        let ids: Vec<_> = bases.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["app1", "app2"]);
    }

    #[tokio::test]
    async fn list_bases_fails_when_pagination_never_ends() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/meta/bases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "bases": [{"id": "appLoop", "name": "Loop", "permissionLevel": "read"}],
                "offset": "again"
            })))
            .expect(MAX_BASE_PAGES as u64)
            .mount(&server)
            .await;

        let err = client_for(&server).list_bases("at").await.unwrap_err();

        assert!(matches!(err, AirtableError::TooManyPages { pages } if pages == MAX_BASE_PAGES));
        assert!(!err.is_unauthorized());
    }

    #[tokio::test]
    async fn whoami_returns_account_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v0/meta/whoami"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "usrABC",
                "email": "owner@example.com",
                "scopes": ["user.email:read"]
            })))
            .mount(&server)
            .await;

        let account = client_for(&server).account_info("at").await.unwrap();

        assert_eq!(account.id, "usrABC");
        assert_eq!(account.email.as_deref(), Some("owner@example.com"));
    }
}
