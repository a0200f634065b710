//! Integration tests for the OAuth connect and callback flow
//!
//! Covers role and plan checks before any state is written, single-use
//! states, the new-connection and duplicate-account paths, and the non-fatal
//! initial sync.

use anyhow::Result;
use basewatch::connection_state::{ConnectionStatus, PENDING_SYNC_MESSAGE};
use basewatch::oauth_flow::{CallbackOutcome, CallbackParams, FlowError};
use basewatch::pkce::code_challenge;
use basewatch::repositories::{OAuthStateRepository, WorkspaceRepository};
use basewatch::sync::DEFAULT_WORKSPACE_NAME;
use uuid::Uuid;
use wiremock::ResponseTemplate;

#[path = "test_utils/mod.rs"]
mod test_utils;

use test_utils::*;

fn callback(code: &str, state: &str) -> CallbackParams {
    CallbackParams {
        code: Some(code.to_string()),
        state: Some(state.to_string()),
        ..Default::default()
    }
}

async fn start(ctx: &TestContext, org: Uuid, user: Uuid) -> Result<String> {
    let redirect = ctx.flow().initiate_connect(user, org, None).await?;
    Ok(state_param(&redirect.url))
}

#[tokio::test]
async fn connect_builds_pkce_authorization_url() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;

    let redirect = ctx.flow().initiate_connect(owner, org, None).await?;
    let url = redirect.url;

    assert_eq!(url.scheme(), "https");
    assert_eq!(url.host_str(), Some("airtable.com"));
    let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
    assert_eq!(pairs["client_id"], "client-id");
    assert_eq!(pairs["response_type"], "code");
    assert_eq!(pairs["code_challenge_method"], "S256");
    assert_eq!(pairs["redirect_uri"], "http://localhost:8080/callback");
    assert_eq!(pairs["state"].len(), 43);

    // The challenge on the URL derives from the verifier kept server-side
    let states = OAuthStateRepository::new(ctx.db.clone());
    let stored = states.consume(&pairs["state"]).await?.expect("state row");
    assert_eq!(stored.organization_id, org);
    assert_eq!(stored.user_id, owner);
    assert_eq!(pairs["code_challenge"], code_challenge(&stored.code_verifier));
    assert!(stored.expires_at > chrono::Utc::now());

    Ok(())
}

#[tokio::test]
async fn members_and_viewers_cannot_connect() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let states = OAuthStateRepository::new(ctx.db.clone());

    for role in ["member", "viewer"] {
        let user = add_member(&ctx.db, org, role).await?;
        let err = ctx.flow().initiate_connect(user, org, None).await.unwrap_err();
        assert!(matches!(err, FlowError::Permission(_)), "{role}: {err:?}");
    }

    let stranger = Uuid::new_v4();
    let err = ctx.flow().initiate_connect(stranger, org, None).await.unwrap_err();
    assert!(matches!(err, FlowError::Permission(_)));

    assert_eq!(states.count_by_organization(org).await?, 0);
    Ok(())
}

#[tokio::test]
async fn plan_limit_blocks_connect_before_state_is_written() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "free").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    seed_connection(&ctx, org, owner, "usrExisting", SeedTokens::default()).await?;

    let err = ctx.flow().initiate_connect(owner, org, None).await.unwrap_err();

    match err {
        FlowError::PlanLimit { plan, max } => {
            assert_eq!(plan, "free");
            assert_eq!(max, 1);
        }
        other => panic!("expected plan limit, got {other:?}"),
    }
    let states = OAuthStateRepository::new(ctx.db.clone());
    assert_eq!(states.count_by_organization(org).await?, 0);
    Ok(())
}

#[tokio::test]
async fn callback_creates_and_syncs_new_connection() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let admin = add_member(&ctx.db, org, "admin").await?;
    mock_code_exchange(&ctx.airtable, "at-1", "rt-1").await;
    mock_whoami(&ctx.airtable, "at-1", "usrAda").await;
    mock_catalog(&ctx.airtable, &[("app1", "CRM", None), ("app2", "Roadmap", None)]).await;

    let state = start(&ctx, org, admin).await?;
    let outcome = ctx.flow().handle_callback(callback("code-1", &state)).await?;

    let CallbackOutcome::Created { connection_id, synced } = outcome else {
        panic!("expected a new connection, got {outcome:?}");
    };
    assert!(synced);

    let connection = ctx.connection(connection_id).await?;
    assert_eq!(connection.organization_id, org);
    assert_eq!(connection.user_id, admin);
    assert_eq!(connection.airtable_user_id, "usrAda");
    assert_eq!(connection.status, ConnectionStatus::Active.as_str());
    assert_eq!(connection.error_message, None);
    assert_eq!(connection.workspace_count, 1);
    assert_eq!(connection.base_count, 2);
    assert!(connection.last_sync_at.is_some());
    assert!(connection.token_expires_at.is_some());
    assert!(connection.scope_list().contains(&"schema.bases:read".to_string()));

    // Tokens live in the vault; the row only references them
    assert_eq!(ctx.vault.count_for(connection_id).await, 2);
    assert!(connection.access_token_secret_id.is_some());
    assert!(connection.refresh_token_secret_id.is_some());
    let row = format!("{connection:?}");
    assert!(!row.contains("at-1"));
    assert!(!row.contains("rt-1"));

    let workspaces = WorkspaceRepository::new(ctx.db.clone())
        .list_workspaces(connection_id)
        .await?;
    assert_eq!(workspaces.len(), 1);
    assert_eq!(workspaces[0].name, DEFAULT_WORKSPACE_NAME);
    Ok(())
}

#[tokio::test]
async fn state_is_single_use() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    mock_code_exchange(&ctx.airtable, "at-1", "rt-1").await;
    mock_whoami(&ctx.airtable, "at-1", "usrAda").await;
    mock_catalog(&ctx.airtable, &[]).await;

    let state = start(&ctx, org, owner).await?;
    ctx.flow().handle_callback(callback("code-1", &state)).await?;

    let replay = ctx.flow().handle_callback(callback("code-1", &state)).await;
    assert!(matches!(replay, Err(FlowError::InvalidState)));
    Ok(())
}

#[tokio::test]
async fn expired_state_is_rejected() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    OAuthStateRepository::new(ctx.db.clone())
        .create(org, owner, "stale-state", "verifier", -1)
        .await?;

    let err = ctx
        .flow()
        .handle_callback(callback("code-1", "stale-state"))
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::InvalidState));
    assert!(err.user_message().contains("expired"));
    Ok(())
}

#[tokio::test]
async fn duplicate_account_updates_tokens_without_resync() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    let existing = seed_connection(
        &ctx,
        org,
        owner,
        "usrAda",
        SeedTokens {
            status: ConnectionStatus::Disconnected,
            ..Default::default()
        },
    )
    .await?;
    let old_access = existing.access_token_secret_id;

    mock_code_exchange(&ctx.airtable, "at-2", "rt-2").await;
    mock_whoami(&ctx.airtable, "at-2", "usrAda").await;

    let state = start(&ctx, org, owner).await?;
    let outcome = ctx.flow().handle_callback(callback("code-2", &state)).await?;

    assert_eq!(
        outcome,
        CallbackOutcome::Updated {
            connection_id: existing.id
        }
    );
    assert_eq!(outcome.user_message(), "Connection updated");

    let connection = ctx.connection(existing.id).await?;
    assert_eq!(connection.status, "active");
    assert_eq!(connection.error_message, None);
    assert_ne!(connection.access_token_secret_id, old_access);
    // Old secrets purged, only the new pair remains
    assert_eq!(ctx.vault.count_for(existing.id).await, 2);
    assert_eq!(ctx.connections().count_by_org(org).await?, 1);

    // No listing call happened on the duplicate path
    let requests = ctx.airtable.received_requests().await.unwrap_or_default();
    assert!(requests.iter().all(|r| !r.url.path().ends_with("/meta/bases")));
    Ok(())
}

#[tokio::test]
async fn initial_sync_failure_keeps_connection_pending() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    mock_code_exchange(&ctx.airtable, "at-1", "rt-1").await;
    mock_whoami(&ctx.airtable, "at-1", "usrAda").await;
    mock_workspaces(&ctx.airtable, ResponseTemplate::new(500)).await;
    mock_bases(&ctx.airtable, ResponseTemplate::new(500)).await;

    let state = start(&ctx, org, owner).await?;
    let outcome = ctx.flow().handle_callback(callback("code-1", &state)).await?;

    let CallbackOutcome::Created { connection_id, synced } = outcome else {
        panic!("expected a new connection, got {outcome:?}");
    };
    assert!(!synced);
    assert_eq!(outcome.user_message(), "Airtable connected successfully");

    let connection = ctx.connection(connection_id).await?;
    assert_eq!(connection.status, "pending_sync");
    assert_eq!(connection.error_message.as_deref(), Some(PENDING_SYNC_MESSAGE));
    assert_eq!(connection.base_count, 0);
    assert!(connection.access_token_secret_id.is_some());
    Ok(())
}

#[tokio::test]
async fn denied_authorization_consumes_state() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    let state = start(&ctx, org, owner).await?;

    let err = ctx
        .flow()
        .handle_callback(CallbackParams {
            state: Some(state.clone()),
            error: Some("access_denied".to_string()),
            error_description: Some("The user denied access".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::AuthorizationDenied { .. }));
    assert!(err.user_message().contains("cancelled"));
    let states = OAuthStateRepository::new(ctx.db.clone());
    assert_eq!(states.count_by_organization(org).await?, 0);
    Ok(())
}

#[tokio::test]
async fn token_exchange_failure_creates_nothing() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "code already used"
        })))
        .mount(&ctx.airtable)
        .await;

    let state = start(&ctx, org, owner).await?;
    let err = ctx
        .flow()
        .handle_callback(callback("code-1", &state))
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::TokenExchange(_)));
    assert!(!err.user_message().contains("invalid_grant"));
    assert_eq!(ctx.connections().count_by_org(org).await?, 0);
    Ok(())
}

#[tokio::test]
async fn callback_without_code_is_invalid() -> Result<()> {
    let ctx = TestContext::new().await?;

    let err = ctx
        .flow()
        .handle_callback(CallbackParams {
            state: Some("whatever".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::InvalidCallback));
    Ok(())
}

#[tokio::test]
async fn reconnect_of_existing_connection_skips_plan_cap() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "free").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    let existing = seed_connection(
        &ctx,
        org,
        owner,
        "usrAda",
        SeedTokens {
            status: ConnectionStatus::Disconnected,
            ..Default::default()
        },
    )
    .await?;

    let err = ctx.flow().initiate_connect(owner, org, None).await.unwrap_err();
    assert!(matches!(err, FlowError::PlanLimit { .. }));

    let redirect = ctx
        .flow()
        .initiate_connect(owner, org, Some(existing.id))
        .await?;
    let state = state_param(&redirect.url);

    mock_code_exchange(&ctx.airtable, "at-2", "rt-2").await;
    mock_whoami(&ctx.airtable, "at-2", "usrAda").await;
    let outcome = ctx.flow().handle_callback(callback("code-2", &state)).await?;

    assert_eq!(
        outcome,
        CallbackOutcome::Updated {
            connection_id: existing.id
        }
    );
    assert_eq!(ctx.connection(existing.id).await?.status, "active");
    assert_eq!(ctx.connections().count_by_org(org).await?, 1);
    Ok(())
}

#[tokio::test]
async fn reconnect_of_foreign_connection_still_counts_against_cap() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "free").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    seed_connection(&ctx, org, owner, "usrAda", SeedTokens::default()).await?;

    let other_org = seed_org(&ctx.db, "free").await?;
    let other_owner = add_member(&ctx.db, other_org, "owner").await?;
    let foreign = seed_connection(&ctx, other_org, other_owner, "usrBob", SeedTokens::default()).await?;

    for reconnect in [Some(foreign.id), Some(Uuid::new_v4())] {
        let err = ctx
            .flow()
            .initiate_connect(owner, org, reconnect)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::PlanLimit { .. }), "{reconnect:?}");
    }
    let states = OAuthStateRepository::new(ctx.db.clone());
    assert_eq!(states.count_by_organization(org).await?, 0);
    Ok(())
}

#[tokio::test]
async fn account_lookup_failure_is_reported_as_authorization_error() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    mock_code_exchange(&ctx.airtable, "at-1", "rt-1").await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/v0/meta/whoami"))
        .respond_with(ResponseTemplate::new(500).set_body_string("whoami exploded"))
        .mount(&ctx.airtable)
        .await;

    let state = start(&ctx, org, owner).await?;
    let err = ctx
        .flow()
        .handle_callback(callback("code-1", &state))
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::AccountLookup(_)));
    assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    assert_ne!(err.user_message(), "Sync failed");
    assert!(err.user_message().contains("Airtable account"));
    assert!(!err.user_message().contains("exploded"));
    assert_eq!(ctx.connections().count_by_org(org).await?, 0);
    Ok(())
}

#[tokio::test]
async fn racing_callbacks_for_one_account_share_a_connection() -> Result<()> {
    let ctx = TestContext::new().await?;
    let org = seed_org(&ctx.db, "pro").await?;
    let owner = add_member(&ctx.db, org, "owner").await?;
    mock_code_exchange(&ctx.airtable, "at-1", "rt-1").await;
    // Both callbacks identify the account at about the same moment, so both
    // look for an existing connection before either inserts one
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/v0/meta/whoami"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "id": "usrAda", "email": "ada@example.com" }))
                .set_delay(std::time::Duration::from_millis(100)),
        )
        .mount(&ctx.airtable)
        .await;
    mock_catalog(&ctx.airtable, &[("app1", "CRM", None)]).await;

    let first_state = start(&ctx, org, owner).await?;
    let second_state = start(&ctx, org, owner).await?;

    let (first, second) = tokio::join!(
        ctx.flow().handle_callback(callback("code-a", &first_state)),
        ctx.flow().handle_callback(callback("code-b", &second_state)),
    );
    let (first, second) = (first?, second?);

    assert_eq!(first.connection_id(), second.connection_id());
    let created = [first, second]
        .iter()
        .filter(|outcome| matches!(outcome, CallbackOutcome::Created { .. }))
        .count();
    assert_eq!(created, 1);

    assert_eq!(ctx.connections().count_by_org(org).await?, 1);
    let connection = ctx.connection(first.connection_id()).await?;
    assert_eq!(connection.status, "active");
    assert_eq!(ctx.vault.count_for(connection.id).await, 2);
    Ok(())
}
