//! # Connection status state machine
//!
//! Owns the `status` column of an Airtable connection. Every status change
//! in the service goes through [`transition`], which also decides the
//! `error_message` written alongside the new status.
//!
//! ```text
//!   callback (new account) ──► pending_sync ──sync ok──► active
//!                                   │ initial sync fails (stays)
//!   callback (known account) ─────────────────────────► active
//!   active | pending_sync | error ──sync ok──► active
//!   any ──401 / refresh failed / vault failed──► disconnected
//!   active | pending_sync | error ──provider failure──► error
//!   any ──refresh ok──► active
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Message recorded when the first sync after linking did not complete.
pub const PENDING_SYNC_MESSAGE: &str = "Synchronisation ausstehend";
pub const REFRESH_FAILED_MESSAGE: &str = "refresh failed, reconnect";
pub const ACCESS_REVOKED_MESSAGE: &str = "Airtable access was revoked, reconnect";
pub const ACCESS_TOKEN_MISSING_MESSAGE: &str = "no valid access token available, reconnect";
pub const VAULT_FAILED_MESSAGE: &str = "stored token is no longer available, reconnect";
pub const SYNC_FAILED_MESSAGE: &str = "sync failed, try again later";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    PendingSync,
    Active,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::PendingSync => "pending_sync",
            ConnectionStatus::Active => "active",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    /// Status of a connection created by a first-time OAuth completion.
    pub fn initial() -> Self {
        ConnectionStatus::PendingSync
    }

    /// Whether a manual sync may start from this status.
    pub fn can_sync(&self) -> bool {
        !matches!(self, ConnectionStatus::Disconnected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown connection status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ConnectionStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending_sync" => Ok(ConnectionStatus::PendingSync),
            "active" => Ok(ConnectionStatus::Active),
            "error" => Ok(ConnectionStatus::Error),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Things that happen to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// OAuth completed again for an account already linked to the organization
    Relinked,
    /// Workspaces and bases were replaced from a fresh listing
    SyncSucceeded,
    /// The sync right after first linking failed
    InitialSyncFailed,
    /// Airtable answered 401 to a meta call
    AccessRevoked,
    /// No access token could be read for the connection
    AccessTokenMissing,
    /// Airtable failed with anything other than 401
    ProviderFailed,
    RefreshSucceeded,
    RefreshFailed,
    /// The vault could not read or write the connection's secrets
    VaultFailed,
}

/// Outcome of a valid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub status: ConnectionStatus,
    /// `None` clears any stored error message
    pub error_message: Option<&'static str>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot apply {event:?} to a connection in status {from}")]
pub struct TransitionError {
    pub from: ConnectionStatus,
    pub event: ConnectionEvent,
}

/// Resolve the status and error message that follow `event` in status `from`.
pub fn transition(
    from: ConnectionStatus,
    event: ConnectionEvent,
) -> Result<Transition, TransitionError> {
    use ConnectionEvent::*;
    use ConnectionStatus::*;

    let next = |status, error_message| Ok(Transition { status, error_message });
    let invalid = || Err(TransitionError { from, event });

    match (from, event) {
        (_, Relinked) | (_, RefreshSucceeded) => next(Active, None),

        (Disconnected, SyncSucceeded) => invalid(),
        (_, SyncSucceeded) => next(Active, None),

        (PendingSync, InitialSyncFailed) => next(PendingSync, Some(PENDING_SYNC_MESSAGE)),
        (_, InitialSyncFailed) => invalid(),

        (_, AccessRevoked) => next(Disconnected, Some(ACCESS_REVOKED_MESSAGE)),
        (_, AccessTokenMissing) => next(Disconnected, Some(ACCESS_TOKEN_MISSING_MESSAGE)),
        (_, RefreshFailed) => next(Disconnected, Some(REFRESH_FAILED_MESSAGE)),
        (_, VaultFailed) => next(Disconnected, Some(VAULT_FAILED_MESSAGE)),

        (Disconnected, ProviderFailed) => invalid(),
        (_, ProviderFailed) => next(Error, Some(SYNC_FAILED_MESSAGE)),
    }
}
