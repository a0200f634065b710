//! # Basewatch
//!
//! Airtable OAuth connection lifecycle for multi-tenant organizations: PKCE
//! authorization, vault-backed token storage, refresh, and a cached copy of
//! each connection's workspaces and bases.

pub mod access;
pub mod airtable;
pub mod auth;
pub mod config;
pub mod connection_state;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod housekeeping;
pub mod models;
pub mod oauth_flow;
pub mod pkce;
pub mod repositories;
pub mod server;
pub mod sync;
pub mod telemetry;
pub mod vault;
pub use migration;
