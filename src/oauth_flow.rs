//! # Airtable connection lifecycle
//!
//! [`OAuthFlow`] drives every operation that changes a connection: starting
//! the PKCE authorization, completing the callback, manual sync and refresh,
//! and disconnect. It checks roles and plan caps before mutating anything,
//! routes status changes through [`crate::connection_state::transition`] and
//! keeps raw tokens inside the vault.

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::DatabaseConnection;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::access::{PlanLimits, PlanLimitsLookup, Role, RoleLookup};
use crate::airtable::{AirtableApi, AirtableError, TokenSet};
use crate::config::AppConfig;
use crate::connection_state::{
    ACCESS_REVOKED_MESSAGE, ConnectionEvent, ConnectionStatus, TransitionError, transition,
};
use crate::error::ApiError;
use crate::models::{base, connection, workspace};
use crate::pkce::{CodeVerifier, generate_state};
use crate::repositories::connection::is_duplicate_connection;
use crate::repositories::{
    ConnectionPatch, ConnectionRepository, NewConnection, OAuthStateRepository,
    WorkspaceRepository,
};
use crate::sync::{ConnectionLocks, SyncCounts, SyncError, Synchronizer};
use crate::vault::{SecretVault, TokenType, VaultError};

const MAX_AUTHORIZE_URL_LEN: usize = 2048;

/// Errors surfaced by lifecycle operations. Each maps to one HTTP status and a
/// user-facing message that never contains provider payloads.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("permission denied: {0}")]
    Permission(&'static str),
    #[error("connection limit of {max} reached on plan {plan}")]
    PlanLimit { plan: String, max: u32 },
    #[error("OAuth state is missing, expired or already used")]
    InvalidState,
    #[error("OAuth callback is missing code or state")]
    InvalidCallback,
    #[error("Airtable authorization was not granted: {error}")]
    AuthorizationDenied { error: String },
    #[error("authorization code exchange failed")]
    TokenExchange(#[source] AirtableError),
    #[error("Airtable account lookup failed")]
    AccountLookup(#[source] AirtableError),
    #[error("token refresh failed")]
    TokenRefresh(#[source] AirtableError),
    #[error("Airtable rejected the access token")]
    AccessRevoked,
    #[error("no access token available")]
    MissingAccessToken,
    #[error("no refresh token stored for the connection")]
    MissingRefreshToken,
    #[error("connection not found")]
    NotFound,
    #[error("connection is disconnected")]
    Disconnected,
    #[error("Airtable request failed")]
    Provider(#[source] AirtableError),
    #[error("vault failure")]
    Vault(#[from] VaultError),
    #[error("Airtable OAuth is not configured: {0}")]
    MissingConfiguration(&'static str),
    #[error("authorization URL rejected: {0}")]
    InvalidAuthorizeUrl(String),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl From<sea_orm::DbErr> for FlowError {
    fn from(error: sea_orm::DbErr) -> Self {
        FlowError::Database(error.into())
    }
}

impl FlowError {
    pub fn status(&self) -> StatusCode {
        match self {
            FlowError::Permission(_) | FlowError::PlanLimit { .. } => StatusCode::FORBIDDEN,
            FlowError::InvalidState
            | FlowError::InvalidCallback
            | FlowError::AuthorizationDenied { .. }
            | FlowError::MissingRefreshToken
            | FlowError::Disconnected => StatusCode::BAD_REQUEST,
            FlowError::TokenExchange(_) | FlowError::AccountLookup(_) => StatusCode::BAD_GATEWAY,
            FlowError::TokenRefresh(_)
            | FlowError::AccessRevoked
            | FlowError::MissingAccessToken => StatusCode::UNAUTHORIZED,
            FlowError::NotFound => StatusCode::NOT_FOUND,
            FlowError::InvalidTransition(_) => StatusCode::CONFLICT,
            FlowError::Provider(_)
            | FlowError::Vault(_)
            | FlowError::MissingConfiguration(_)
            | FlowError::InvalidAuthorizeUrl(_)
            | FlowError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FlowError::Permission(_) => "FORBIDDEN",
            FlowError::PlanLimit { .. } => "PLAN_LIMIT_REACHED",
            FlowError::InvalidState => "INVALID_STATE",
            FlowError::InvalidCallback => "INVALID_CALLBACK",
            FlowError::AuthorizationDenied { .. } => "AUTHORIZATION_DENIED",
            FlowError::TokenExchange(_) => "TOKEN_EXCHANGE_FAILED",
            FlowError::AccountLookup(_) => "ACCOUNT_LOOKUP_FAILED",
            FlowError::TokenRefresh(_) => "TOKEN_REFRESH_FAILED",
            FlowError::AccessRevoked => "ACCESS_REVOKED",
            FlowError::MissingAccessToken => "MISSING_ACCESS_TOKEN",
            FlowError::MissingRefreshToken => "MISSING_REFRESH_TOKEN",
            FlowError::NotFound => "NOT_FOUND",
            FlowError::Disconnected => "CONNECTION_DISCONNECTED",
            FlowError::Provider(_) => "PROVIDER_ERROR",
            FlowError::Vault(_) => "VAULT_ERROR",
            FlowError::MissingConfiguration(_) | FlowError::InvalidAuthorizeUrl(_) => {
                "NOT_CONFIGURED"
            }
            FlowError::InvalidTransition(_) => "INVALID_TRANSITION",
            FlowError::Database(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Message safe to show to the end user.
    pub fn user_message(&self) -> String {
        match self {
            FlowError::Permission(message) => (*message).to_string(),
            FlowError::PlanLimit { plan, .. } => format!(
                "Connection limit reached for the {plan} plan. Upgrade to add more connections."
            ),
            FlowError::InvalidState => "OAuth session expired. Please try again.".to_string(),
            FlowError::InvalidCallback => "Invalid OAuth response".to_string(),
            FlowError::AuthorizationDenied { error } if error == "access_denied" => {
                "Connection cancelled. You can try again at any time.".to_string()
            }
            FlowError::AuthorizationDenied { .. } => "Airtable authorization failed".to_string(),
            FlowError::TokenExchange(_) => {
                "Could not complete the Airtable authorization. Please try again.".to_string()
            }
            FlowError::AccountLookup(_) => {
                "Could not read your Airtable account. Please try connecting again.".to_string()
            }
            FlowError::TokenRefresh(_) => {
                "Token could not be refreshed. Please reconnect.".to_string()
            }
            FlowError::AccessRevoked => ACCESS_REVOKED_MESSAGE.to_string(),
            FlowError::MissingAccessToken => "No valid access token available".to_string(),
            FlowError::MissingRefreshToken => "No refresh token available".to_string(),
            FlowError::NotFound => "Connection not found".to_string(),
            FlowError::Disconnected => "Connection is disconnected. Please reconnect.".to_string(),
            FlowError::Provider(_) => "Sync failed".to_string(),
            FlowError::Vault(_) => "Token could not be read".to_string(),
            FlowError::MissingConfiguration(_) | FlowError::InvalidAuthorizeUrl(_) => {
                "Airtable OAuth is not configured".to_string()
            }
            FlowError::InvalidTransition(_) => {
                "The connection is in a state that does not allow this operation".to_string()
            }
            FlowError::Database(_) => "Internal server error".to_string(),
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(error: FlowError) -> Self {
        let status = error.status();
        if status.is_server_error() {
            error!(error = ?error, "Connection lifecycle operation failed");
        } else {
            debug!(error = %error, "Connection lifecycle operation rejected");
        }
        ApiError::new(status, error.code(), error.user_message())
    }
}

/// Redirect target produced by [`OAuthFlow::initiate_connect`].
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: Url,
    pub expires_at: DateTime<Utc>,
}

/// Query parameters Airtable sends to the callback.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// A new connection was linked; `synced` tells whether the initial sync completed
    Created { connection_id: Uuid, synced: bool },
    /// The Airtable account was already linked; only its tokens were replaced
    Updated { connection_id: Uuid },
}

impl CallbackOutcome {
    pub fn connection_id(&self) -> Uuid {
        match self {
            CallbackOutcome::Created { connection_id, .. }
            | CallbackOutcome::Updated { connection_id } => *connection_id,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            CallbackOutcome::Created { .. } => "Airtable connected successfully",
            CallbackOutcome::Updated { .. } => "Connection updated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub connection: connection::Model,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub connection: connection::Model,
    pub counts: SyncCounts,
}

/// Connections of an organization with the caller's view of the plan caps.
#[derive(Debug, Clone)]
pub struct ConnectionOverview {
    pub connections: Vec<connection::Model>,
    pub limits: Option<PlanLimits>,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct ConnectionDetail {
    pub connection: connection::Model,
    pub workspaces: Vec<workspace::Model>,
    pub bases: Vec<base::Model>,
}

pub struct OAuthFlow {
    config: Arc<AppConfig>,
    connections: ConnectionRepository,
    states: OAuthStateRepository,
    catalog: WorkspaceRepository,
    vault: Arc<dyn SecretVault>,
    airtable: Arc<dyn AirtableApi>,
    roles: Arc<dyn RoleLookup>,
    plans: Option<Arc<dyn PlanLimitsLookup>>,
    synchronizer: Synchronizer,
    locks: ConnectionLocks,
}

impl OAuthFlow {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        vault: Arc<dyn SecretVault>,
        airtable: Arc<dyn AirtableApi>,
        roles: Arc<dyn RoleLookup>,
    ) -> Self {
        Self {
            config,
            connections: ConnectionRepository::new(db.clone()),
            states: OAuthStateRepository::new(db.clone()),
            catalog: WorkspaceRepository::new(db.clone()),
            vault,
            synchronizer: Synchronizer::new(db, airtable.clone()),
            airtable,
            roles,
            plans: None,
            locks: ConnectionLocks::new(),
        }
    }

    /// Enables the connection-cap check on connect.
    pub fn with_plan_limits(mut self, plans: Arc<dyn PlanLimitsLookup>) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn locks(&self) -> &ConnectionLocks {
        &self.locks
    }

    /// Start a PKCE authorization for `organization_id`.
    ///
    /// Only owners and admins may connect. The plan cap is checked when it can
    /// be determined, except when `reconnect` names an existing connection of
    /// the organization: re-authorizing it does not add a connection. Nothing
    /// is written unless both checks pass.
    #[instrument(skip(self))]
    pub async fn initiate_connect(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
        reconnect: Option<Uuid>,
    ) -> Result<AuthorizationRedirect, FlowError> {
        let role = self.roles.role_of(organization_id, user_id).await?;
        match role {
            None => return Err(FlowError::Permission("You are not a member of this organization")),
            Some(role) if !role.can_manage_connections() => {
                return Err(FlowError::Permission(
                    "Only owners or admins can create connections",
                ));
            }
            Some(_) => {}
        }

        if !self.is_reconnect(organization_id, reconnect).await? {
            self.check_connection_cap(organization_id).await?;
        }

        let airtable = &self.config.airtable;
        let client_id = airtable
            .client_id
            .as_deref()
            .ok_or(FlowError::MissingConfiguration("AIRTABLE_CLIENT_ID"))?;
        let redirect_uri = airtable
            .redirect_uri
            .as_deref()
            .ok_or(FlowError::MissingConfiguration("AIRTABLE_REDIRECT_URI"))?;

        let state = generate_state();
        let verifier = CodeVerifier::generate();

        let mut url = Url::parse(&airtable.authorize_url)
            .map_err(|err| FlowError::InvalidAuthorizeUrl(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("state", &state)
            .append_pair("scope", &airtable.scope_param())
            .append_pair("code_challenge", &verifier.challenge())
            .append_pair("code_challenge_method", "S256");
        validate_authorize_url(&url)?;

        let stored = self
            .states
            .create(
                organization_id,
                user_id,
                &state,
                verifier.as_str(),
                self.config.oauth_state.ttl_minutes,
            )
            .await?;

        info!(%organization_id, %user_id, "Started Airtable authorization");
        Ok(AuthorizationRedirect {
            url,
            expires_at: stored.expires_at,
        })
    }

    async fn is_reconnect(
        &self,
        organization_id: Uuid,
        reconnect: Option<Uuid>,
    ) -> Result<bool, FlowError> {
        let Some(connection_id) = reconnect else {
            return Ok(false);
        };

        let existing = self
            .connections
            .find_by_id(connection_id)
            .await
            .map_err(FlowError::Database)?;
        match existing {
            Some(connection) if connection.organization_id == organization_id => {
                debug!(%organization_id, %connection_id, "Reconnecting existing connection");
                Ok(true)
            }
            _ => {
                debug!(%organization_id, %connection_id, "Reconnect target not in organization");
                Ok(false)
            }
        }
    }

    async fn check_connection_cap(&self, organization_id: Uuid) -> Result<(), FlowError> {
        let Some(plans) = &self.plans else {
            return Ok(());
        };

        let limits = match plans.limits_for(organization_id).await {
            Ok(Some(limits)) => limits,
            Ok(None) => {
                debug!(%organization_id, "Plan limits undeterminable, skipping cap check");
                return Ok(());
            }
            Err(err) => {
                warn!(%organization_id, error = %err, "Plan limit lookup failed, skipping cap check");
                return Ok(());
            }
        };

        let Some(max) = limits.max_connections else {
            return Ok(());
        };

        let current = match self.connections.count_by_org(organization_id).await {
            Ok(current) => current,
            Err(err) => {
                warn!(%organization_id, error = %err, "Connection count failed, skipping cap check");
                return Ok(());
            }
        };

        if limits.can_add_connection(current) {
            Ok(())
        } else {
            Err(FlowError::PlanLimit {
                plan: limits.plan,
                max,
            })
        }
    }

    /// Complete the authorization: consume the state, exchange the code,
    /// identify the account and create or update its connection.
    #[instrument(skip_all)]
    pub async fn handle_callback(
        &self,
        params: CallbackParams,
    ) -> Result<CallbackOutcome, FlowError> {
        let result = self.complete_callback(params).await;

        let outcome = match &result {
            Ok(CallbackOutcome::Created { .. }) => "created",
            Ok(CallbackOutcome::Updated { .. }) => "updated",
            Err(_) => "failed",
        };
        counter!("airtable_oauth_callbacks_total", "outcome" => outcome).increment(1);

        result
    }

    async fn complete_callback(
        &self,
        params: CallbackParams,
    ) -> Result<CallbackOutcome, FlowError> {
        if let Some(error) = params.error {
            // The attempt is over either way; drop its state row
            if let Some(state) = params.state.as_deref() {
                self.states.consume(state).await?;
            }
            warn!(
                error = %error,
                description = params.error_description.as_deref().unwrap_or_default(),
                "Airtable returned an authorization error"
            );
            return Err(FlowError::AuthorizationDenied { error });
        }

        let (Some(code), Some(state)) = (params.code, params.state) else {
            return Err(FlowError::InvalidCallback);
        };

        let oauth_state = self
            .states
            .consume(&state)
            .await?
            .ok_or(FlowError::InvalidState)?;

        let redirect_uri = self
            .config
            .airtable
            .redirect_uri
            .as_deref()
            .ok_or(FlowError::MissingConfiguration("AIRTABLE_REDIRECT_URI"))?;

        let tokens = self
            .airtable
            .exchange_code(&code, redirect_uri, &oauth_state.code_verifier)
            .await
            .map_err(|err| match err {
                AirtableError::MissingCredentials => {
                    FlowError::MissingConfiguration("AIRTABLE_CLIENT_ID/AIRTABLE_CLIENT_SECRET")
                }
                other => FlowError::TokenExchange(other),
            })?;

        let account = self
            .airtable
            .account_info(&tokens.access_token)
            .await
            .map_err(FlowError::AccountLookup)?;

        let organization_id = oauth_state.organization_id;

        if let Some(existing) = self
            .connections
            .find_by_org_and_airtable_user(organization_id, &account.id)
            .await
            .map_err(FlowError::Database)?
        {
            return self.relink(existing, &tokens, account.email).await;
        }

        let created = self
            .connections
            .create(NewConnection {
                organization_id,
                user_id: oauth_state.user_id,
                airtable_user_id: account.id.clone(),
                airtable_email: account.email.clone(),
                token_expires_at: expiry_from(&tokens),
                scopes: self.granted_scopes(&tokens),
            })
            .await;

        let connection = match created {
            Ok(connection) => connection,
            Err(err) if is_duplicate_connection(&err) => {
                // Another callback for the same account won the insert
                let existing = self
                    .connections
                    .find_by_org_and_airtable_user(organization_id, &account.id)
                    .await
                    .map_err(FlowError::Database)?
                    .ok_or(FlowError::Database(err))?;
                return self.relink(existing, &tokens, account.email).await;
            }
            Err(err) => return Err(FlowError::Database(err)),
        };

        info!(
            connection_id = %connection.id,
            %organization_id,
            status = %connection.status,
            "Created Airtable connection"
        );

        let _guard = self.locks.acquire(connection.id).await;

        let patch = match self.store_tokens(connection.id, &tokens, None).await {
            Ok(patch) => patch,
            Err(err) => {
                return Err(self
                    .record_failure(&connection, ConnectionEvent::VaultFailed, err.into())
                    .await);
            }
        };
        let connection = self
            .connections
            .update(connection.id, patch)
            .await
            .map_err(FlowError::Database)?;

        let synced = match self
            .synchronizer
            .sync(connection.id, &tokens.access_token)
            .await
        {
            Ok(counts) => {
                self.apply_event(&connection, ConnectionEvent::SyncSucceeded)
                    .await?;
                counter!("airtable_sync_total", "outcome" => "success").increment(1);
                debug!(
                    connection_id = %connection.id,
                    workspace_count = counts.workspace_count,
                    base_count = counts.base_count,
                    "Initial sync completed"
                );
                true
            }
            Err(err) => {
                warn!(connection_id = %connection.id, error = %err, "Initial sync failed, connection stays pending");
                counter!("airtable_sync_total", "outcome" => "initial_failed").increment(1);
                self.apply_event(&connection, ConnectionEvent::InitialSyncFailed)
                    .await?;
                false
            }
        };

        Ok(CallbackOutcome::Created {
            connection_id: connection.id,
            synced,
        })
    }

    /// Duplicate path: replace the tokens of an already linked account and
    /// mark it active. Workspaces and bases are left for the next sync.
    async fn relink(
        &self,
        existing: connection::Model,
        tokens: &TokenSet,
        email: Option<String>,
    ) -> Result<CallbackOutcome, FlowError> {
        let _guard = self.locks.acquire(existing.id).await;

        let from = parse_status(&existing)?;
        let next = transition(from, ConnectionEvent::Relinked)?;

        let mut patch = match self.store_tokens(existing.id, tokens, None).await {
            Ok(patch) => patch,
            Err(err) => {
                return Err(self
                    .record_failure(&existing, ConnectionEvent::VaultFailed, err.into())
                    .await);
            }
        };
        patch.status = Some(next.status);
        patch.error_message = Some(next.error_message.map(str::to_string));
        if email.is_some() {
            patch.airtable_email = Some(email);
        }

        let updated = self
            .connections
            .update(existing.id, patch)
            .await
            .map_err(FlowError::Database)?;

        info!(
            connection_id = %updated.id,
            organization_id = %updated.organization_id,
            from = %from,
            status = %updated.status,
            "Updated tokens of existing Airtable connection"
        );

        Ok(CallbackOutcome::Updated {
            connection_id: updated.id,
        })
    }

    /// Replace workspaces and bases from Airtable, refreshing an expired token first.
    #[instrument(skip(self))]
    pub async fn sync(&self, user_id: Uuid, connection_id: Uuid) -> Result<SyncOutcome, FlowError> {
        let _guard = self.locks.acquire(connection_id).await;
        let (connection, _role) = self.load_for_member(user_id, connection_id).await?;

        let result = self.sync_locked(connection).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(FlowError::AccessRevoked) | Err(FlowError::TokenRefresh(_)) => "disconnected",
            Err(_) => "failed",
        };
        counter!("airtable_sync_total", "outcome" => outcome).increment(1);

        result
    }

    async fn sync_locked(&self, mut connection: connection::Model) -> Result<SyncOutcome, FlowError> {
        if !parse_status(&connection)?.can_sync() {
            return Err(FlowError::Disconnected);
        }

        let mut access_token = match connection.access_token_secret_id {
            Some(secret_id) => match self.vault.retrieve(secret_id).await {
                Ok(token) => token.map(|token| token.expose().to_string()),
                Err(err) => {
                    return Err(self
                        .record_failure(&connection, ConnectionEvent::VaultFailed, err.into())
                        .await);
                }
            },
            None => None,
        };

        let expired = connection
            .token_expires_at
            .is_none_or(|expires_at| expires_at < Utc::now());

        if expired && let Some(refresh_secret_id) = connection.refresh_token_secret_id {
            let refresh_token = match self.vault.retrieve(refresh_secret_id).await {
                Ok(token) => token,
                Err(err) => {
                    return Err(self
                        .record_failure(&connection, ConnectionEvent::VaultFailed, err.into())
                        .await);
                }
            };

            if let Some(refresh_token) = refresh_token {
                debug!(connection_id = %connection.id, "Access token expired, refreshing before sync");
                let tokens = match self.airtable.refresh_token(refresh_token.expose()).await {
                    Ok(tokens) => tokens,
                    Err(AirtableError::MissingCredentials) => {
                        return Err(FlowError::MissingConfiguration(
                            "AIRTABLE_CLIENT_ID/AIRTABLE_CLIENT_SECRET",
                        ));
                    }
                    Err(err) => {
                        counter!("airtable_token_refresh_total", "outcome" => "failed").increment(1);
                        return Err(self
                            .record_failure(
                                &connection,
                                ConnectionEvent::RefreshFailed,
                                FlowError::TokenRefresh(err),
                            )
                            .await);
                    }
                };
                counter!("airtable_token_refresh_total", "outcome" => "success").increment(1);

                let patch = match self
                    .store_tokens(connection.id, &tokens, Some(refresh_token.expose()))
                    .await
                {
                    Ok(patch) => patch,
                    Err(err) => {
                        return Err(self
                            .record_failure(&connection, ConnectionEvent::VaultFailed, err.into())
                            .await);
                    }
                };
                connection = self
                    .connections
                    .update(connection.id, patch)
                    .await
                    .map_err(FlowError::Database)?;
                access_token = Some(tokens.access_token);
            }
        }

        let Some(access_token) = access_token else {
            return Err(self
                .record_failure(
                    &connection,
                    ConnectionEvent::AccessTokenMissing,
                    FlowError::MissingAccessToken,
                )
                .await);
        };

        match self.synchronizer.sync(connection.id, &access_token).await {
            Ok(counts) => {
                let connection = self
                    .apply_event(&connection, ConnectionEvent::SyncSucceeded)
                    .await?;
                Ok(SyncOutcome { connection, counts })
            }
            Err(err) if err.is_unauthorized() => Err(self
                .record_failure(&connection, ConnectionEvent::AccessRevoked, FlowError::AccessRevoked)
                .await),
            Err(SyncError::Airtable(err)) => Err(self
                .record_failure(&connection, ConnectionEvent::ProviderFailed, FlowError::Provider(err))
                .await),
            Err(SyncError::Database(err)) => Err(err.into()),
            Err(SyncError::Persistence(err)) => Err(FlowError::Database(err)),
        }
    }

    /// Trade the stored refresh token for new tokens.
    #[instrument(skip(self))]
    pub async fn refresh(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> Result<RefreshOutcome, FlowError> {
        let _guard = self.locks.acquire(connection_id).await;
        let (connection, _role) = self.load_for_member(user_id, connection_id).await?;

        let refresh_secret_id = connection
            .refresh_token_secret_id
            .ok_or(FlowError::MissingRefreshToken)?;

        let refresh_token = match self.vault.retrieve(refresh_secret_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                let err = VaultError::Corrupt("refresh token secret is missing".to_string());
                return Err(self
                    .record_failure(&connection, ConnectionEvent::VaultFailed, err.into())
                    .await);
            }
            Err(err) => {
                return Err(self
                    .record_failure(&connection, ConnectionEvent::VaultFailed, err.into())
                    .await);
            }
        };

        let tokens = match self.airtable.refresh_token(refresh_token.expose()).await {
            Ok(tokens) => tokens,
            Err(AirtableError::MissingCredentials) => {
                return Err(FlowError::MissingConfiguration(
                    "AIRTABLE_CLIENT_ID/AIRTABLE_CLIENT_SECRET",
                ));
            }
            Err(err) => {
                counter!("airtable_token_refresh_total", "outcome" => "failed").increment(1);
                return Err(self
                    .record_failure(
                        &connection,
                        ConnectionEvent::RefreshFailed,
                        FlowError::TokenRefresh(err),
                    )
                    .await);
            }
        };
        counter!("airtable_token_refresh_total", "outcome" => "success").increment(1);

        let from = parse_status(&connection)?;
        let next = transition(from, ConnectionEvent::RefreshSucceeded)?;

        let mut patch = match self
            .store_tokens(connection.id, &tokens, Some(refresh_token.expose()))
            .await
        {
            Ok(patch) => patch,
            Err(err) => {
                return Err(self
                    .record_failure(&connection, ConnectionEvent::VaultFailed, err.into())
                    .await);
            }
        };
        let expires_at = patch.token_expires_at.flatten();
        patch.status = Some(next.status);
        patch.error_message = Some(next.error_message.map(str::to_string));

        let connection = self
            .connections
            .update(connection.id, patch)
            .await
            .map_err(FlowError::Database)?;

        info!(
            connection_id = %connection.id,
            organization_id = %connection.organization_id,
            from = %from,
            status = %connection.status,
            "Refreshed Airtable tokens"
        );

        Ok(RefreshOutcome {
            connection,
            expires_at,
        })
    }

    /// Remove a connection, its secrets and (through the cascade) its cached catalog.
    #[instrument(skip(self))]
    pub async fn disconnect(&self, user_id: Uuid, connection_id: Uuid) -> Result<(), FlowError> {
        let _guard = self.locks.acquire(connection_id).await;
        let (connection, role) = self.load_for_member(user_id, connection_id).await?;

        if !role.can_manage_connections() {
            return Err(FlowError::Permission(
                "Only owners or admins can delete connections",
            ));
        }

        let removed = self.vault.delete_all(connection.id).await?;
        self.connections
            .delete(connection.id)
            .await
            .map_err(FlowError::Database)?;

        info!(
            connection_id = %connection.id,
            organization_id = %connection.organization_id,
            secrets_removed = removed,
            "Disconnected Airtable connection"
        );
        Ok(())
    }

    /// Connections of an organization plus its plan caps.
    pub async fn list_connections(
        &self,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> Result<ConnectionOverview, FlowError> {
        let role = self
            .roles
            .role_of(organization_id, user_id)
            .await?
            .ok_or(FlowError::Permission("You are not a member of this organization"))?;

        let connections = self
            .connections
            .list_by_org(organization_id)
            .await
            .map_err(FlowError::Database)?;

        let limits = match &self.plans {
            Some(plans) => plans.limits_for(organization_id).await.unwrap_or_else(|err| {
                warn!(%organization_id, error = %err, "Plan limit lookup failed");
                None
            }),
            None => None,
        };

        Ok(ConnectionOverview {
            connections,
            limits,
            role,
        })
    }

    /// One connection with its cached workspaces and bases.
    pub async fn connection_detail(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> Result<ConnectionDetail, FlowError> {
        let (connection, _role) = self.load_for_member(user_id, connection_id).await?;
        let workspaces = self.catalog.list_workspaces(connection.id).await?;
        let bases = self.catalog.list_bases(connection.id).await?;

        Ok(ConnectionDetail {
            connection,
            workspaces,
            bases,
        })
    }

    /// Load a connection visible to `user_id`; non-members see not found.
    async fn load_for_member(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
    ) -> Result<(connection::Model, Role), FlowError> {
        let connection = self
            .connections
            .find_by_id(connection_id)
            .await
            .map_err(FlowError::Database)?
            .ok_or(FlowError::NotFound)?;

        let role = self
            .roles
            .role_of(connection.organization_id, user_id)
            .await?
            .ok_or(FlowError::NotFound)?;

        Ok((connection, role))
    }

    /// Purge old secrets and store the new pair, returning the patch that
    /// points the connection at them. A token set without a refresh token
    /// keeps `previous_refresh`.
    async fn store_tokens(
        &self,
        connection_id: Uuid,
        tokens: &TokenSet,
        previous_refresh: Option<&str>,
    ) -> Result<ConnectionPatch, VaultError> {
        self.vault.delete_all(connection_id).await?;

        let access_id = self
            .vault
            .store(connection_id, TokenType::Access, &tokens.access_token)
            .await?;

        let refresh_token = tokens.refresh_token.as_deref().or(previous_refresh);
        let refresh_id = match refresh_token {
            Some(token) => Some(
                self.vault
                    .store(connection_id, TokenType::Refresh, token)
                    .await?,
            ),
            None => None,
        };

        Ok(ConnectionPatch {
            access_token_secret_id: Some(Some(access_id)),
            refresh_token_secret_id: Some(refresh_id),
            token_expires_at: Some(expiry_from(tokens)),
            scopes: Some(self.granted_scopes(tokens)),
            ..Default::default()
        })
    }

    fn granted_scopes(&self, tokens: &TokenSet) -> Vec<String> {
        let granted = tokens.scopes();
        if granted.is_empty() {
            self.config.airtable.scopes.clone()
        } else {
            granted
        }
    }

    async fn apply_event(
        &self,
        connection: &connection::Model,
        event: ConnectionEvent,
    ) -> Result<connection::Model, FlowError> {
        let from = parse_status(connection)?;
        let next = transition(from, event)?;

        let updated = self
            .connections
            .update(
                connection.id,
                ConnectionPatch::status(next.status, next.error_message),
            )
            .await
            .map_err(FlowError::Database)?;

        if from != next.status {
            info!(
                connection_id = %connection.id,
                organization_id = %connection.organization_id,
                from = %from,
                status = %next.status,
                event = ?event,
                "Connection status changed"
            );
        }

        Ok(updated)
    }

    /// Record a failure event on the connection and hand back `error`.
    async fn record_failure(
        &self,
        connection: &connection::Model,
        event: ConnectionEvent,
        error: FlowError,
    ) -> FlowError {
        if let Err(status_err) = self.apply_event(connection, event).await {
            error!(
                connection_id = %connection.id,
                event = ?event,
                error = %status_err,
                "Failed to record connection failure"
            );
        }
        error
    }
}

fn parse_status(connection: &connection::Model) -> Result<ConnectionStatus, FlowError> {
    connection
        .status
        .parse()
        .map_err(|err| FlowError::Database(anyhow::Error::new(err)))
}

fn expiry_from(tokens: &TokenSet) -> Option<DateTime<Utc>> {
    tokens
        .expires_in
        .map(|seconds| Utc::now() + Duration::seconds(seconds))
}

/// Authorization URLs must be https (plain http only for loopback hosts),
/// carry no fragment and stay within common browser limits.
fn validate_authorize_url(url: &Url) -> Result<(), FlowError> {
    let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    if url.scheme() != "https" && !(url.scheme() == "http" && loopback) {
        return Err(FlowError::InvalidAuthorizeUrl(format!(
            "scheme '{}' is not allowed",
            url.scheme()
        )));
    }
    if url.fragment().is_some() {
        return Err(FlowError::InvalidAuthorizeUrl(
            "fragment is not allowed".to_string(),
        ));
    }
    if url.as_str().len() > MAX_AUTHORIZE_URL_LEN {
        return Err(FlowError::InvalidAuthorizeUrl(format!(
            "length {} exceeds {}",
            url.as_str().len(),
            MAX_AUTHORIZE_URL_LEN
        )));
    }
    Ok(())
}
