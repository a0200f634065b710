//! Test utilities shared by the integration tests.
//!
//! In-memory SQLite with migrations applied, organization/member/connection
//! fixtures and a wiremock stand-in for the Airtable OAuth and meta APIs.

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use basewatch::config::{AirtableConfig, AppConfig};
use basewatch::connection_state::ConnectionStatus;
use basewatch::models::connection;
use basewatch::oauth_flow::OAuthFlow;
use basewatch::repositories::{
    ConnectionPatch, ConnectionRepository, NewConnection, OrganizationRepository,
};
use basewatch::server::{AppState, create_app};
use basewatch::vault::{InMemoryVault, SecretVault, TokenType};
use basewatch::airtable::AirtableClient;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value, json};
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const OPERATOR_TOKEN: &str = "test-operator-token";
pub const TOKEN_PATH: &str = "/oauth2/v1/token";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<Arc<DatabaseConnection>> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(Arc::new(db))
}

/// Configuration pointing every Airtable endpoint at `server_uri`.
pub fn test_config(server_uri: &str) -> AppConfig {
    AppConfig {
        profile: "test".to_string(),
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(vec![7u8; 32]),
        settings_url: "http://localhost:3000/settings/connections".to_string(),
        airtable: AirtableConfig {
            client_id: Some("client-id".to_string()),
            client_secret: Some("client-secret".to_string()),
            redirect_uri: Some("http://localhost:8080/callback".to_string()),
            token_url: format!("{server_uri}{TOKEN_PATH}"),
            api_base: format!("{server_uri}/v0"),
            ..AirtableConfig::default()
        },
        ..AppConfig::default()
    }
}

/// Everything an integration test needs: database, vault, mock Airtable and
/// the wired application state.
pub struct TestContext {
    pub db: Arc<DatabaseConnection>,
    pub vault: Arc<InMemoryVault>,
    pub airtable: MockServer,
    pub config: Arc<AppConfig>,
    pub state: AppState,
}

impl TestContext {
    pub async fn new() -> Result<Self> {
        let db = setup_test_db().await?;
        let airtable = MockServer::start().await;
        let config = Arc::new(test_config(&airtable.uri()));
        let vault = Arc::new(InMemoryVault::new());
        let client = Arc::new(AirtableClient::new(&config.airtable)?);

        let state = AppState::new(config.clone(), db.clone(), vault.clone(), client);

        Ok(Self {
            db,
            vault,
            airtable,
            config,
            state,
        })
    }

    pub fn flow(&self) -> &OAuthFlow {
        &self.state.flow
    }

    pub fn router(&self) -> Router {
        create_app(self.state.clone())
    }

    pub fn connections(&self) -> ConnectionRepository {
        ConnectionRepository::new(self.db.clone())
    }

    pub async fn connection(&self, id: Uuid) -> Result<connection::Model> {
        self.connections()
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection {id} not found"))
    }
}

/// Creates an organization on `plan` and returns its id.
pub async fn seed_org(db: &Arc<DatabaseConnection>, plan: &str) -> Result<Uuid> {
    let org = OrganizationRepository::new(db.clone())
        .create("Test Organization", plan)
        .await?;
    Ok(org.id)
}

/// Adds a fresh user with `role` to the organization and returns the user id.
pub async fn add_member(db: &Arc<DatabaseConnection>, organization_id: Uuid, role: &str) -> Result<Uuid> {
    let user_id = Uuid::new_v4();
    OrganizationRepository::new(db.clone())
        .add_member(organization_id, user_id, role)
        .await?;
    Ok(user_id)
}

/// Token and status setup for a seeded connection.
pub struct SeedTokens<'a> {
    pub access: Option<&'a str>,
    pub refresh: Option<&'a str>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
}

impl Default for SeedTokens<'_> {
    fn default() -> Self {
        Self {
            access: Some("at-seeded"),
            refresh: Some("rt-seeded"),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            status: ConnectionStatus::Active,
        }
    }
}

/// Inserts a connection with its tokens stored in the test vault.
pub async fn seed_connection(
    ctx: &TestContext,
    organization_id: Uuid,
    user_id: Uuid,
    airtable_user_id: &str,
    tokens: SeedTokens<'_>,
) -> Result<connection::Model> {
    let repo = ctx.connections();
    let created = repo
        .create(NewConnection {
            organization_id,
            user_id,
            airtable_user_id: airtable_user_id.to_string(),
            airtable_email: Some(format!("{airtable_user_id}@example.com")),
            token_expires_at: tokens.expires_at,
            scopes: vec!["schema.bases:read".to_string()],
        })
        .await?;

    let access_id = match tokens.access {
        Some(token) => Some(ctx.vault.store(created.id, TokenType::Access, token).await?),
        None => None,
    };
    let refresh_id = match tokens.refresh {
        Some(token) => Some(ctx.vault.store(created.id, TokenType::Refresh, token).await?),
        None => None,
    };

    let updated = repo
        .update(
            created.id,
            ConnectionPatch {
                status: Some(tokens.status),
                access_token_secret_id: Some(access_id),
                refresh_token_secret_id: Some(refresh_id),
                ..Default::default()
            },
        )
        .await?;
    Ok(updated)
}

pub fn token_body(access: &str, refresh: Option<&str>, expires_in: i64) -> Value {
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "scope": "data.records:read schema.bases:read user.email:read"
    });
    if let Some(refresh) = refresh {
        body["refresh_token"] = json!(refresh);
    }
    body
}

pub async fn mock_code_exchange(server: &MockServer, access: &str, refresh: &str) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(access, Some(refresh), 3600)))
        .mount(server)
        .await;
}

pub async fn mock_refresh(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(response)
        .mount(server)
        .await;
}

pub async fn mock_whoami(server: &MockServer, access: &str, airtable_user_id: &str) {
    Mock::given(method("GET"))
        .and(path("/v0/meta/whoami"))
        .and(header("authorization", format!("Bearer {access}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": airtable_user_id,
            "email": format!("{airtable_user_id}@example.com")
        })))
        .mount(server)
        .await;
}

pub async fn mock_workspaces(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/v0/meta/workspaces"))
        .respond_with(response)
        .mount(server)
        .await;
}

pub async fn mock_bases(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/v0/meta/bases"))
        .respond_with(response)
        .mount(server)
        .await;
}

pub fn workspaces_body(workspaces: &[(&str, &str)]) -> Value {
    let workspaces: Vec<Value> = workspaces
        .iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect();
    json!({ "workspaces": workspaces })
}

/// `(id, name, workspace_id)` triples as a single `/meta/bases` page.
pub fn bases_body(bases: &[(&str, &str, Option<&str>)]) -> Value {
    let bases: Vec<Value> = bases
        .iter()
        .map(|(id, name, workspace_id)| {
            let mut base = json!({ "id": id, "name": name, "permissionLevel": "create" });
            if let Some(workspace_id) = workspace_id {
                base["workspaceId"] = json!(workspace_id);
            }
            base
        })
        .collect();
    json!({ "bases": bases })
}

/// Mounts an empty workspace listing and `bases`.
pub async fn mock_catalog(server: &MockServer, bases: &[(&str, &str, Option<&str>)]) {
    mock_workspaces(server, ResponseTemplate::new(200).set_body_json(workspaces_body(&[]))).await;
    mock_bases(server, ResponseTemplate::new(200).set_body_json(bases_body(bases))).await;
}

/// `state` query parameter of an authorization URL.
pub fn state_param(url: &Url) -> String {
    url.query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}
