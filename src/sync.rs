//! # Workspace/base synchronizer
//!
//! Replaces the cached workspaces and bases of one connection with a fresh
//! listing from Airtable. Both listings are fetched before anything is
//! written; the delete-then-insert swap and the count update then run in one
//! transaction, so a failed fetch leaves the previous rows untouched.
//!
//! Local row ids are UUID v5 values derived from the connection id and the
//! external id, which keeps them stable across resyncs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::histogram;
use sea_orm::{DatabaseConnection, DbErr, TransactionTrait};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::airtable::{AirtableApi, AirtableError, RemoteBase, RemoteWorkspace};
use crate::repositories::connection::{ConnectionPatch, apply_patch};
use crate::repositories::workspace::{BaseRecord, WorkspaceRecord, replace_for_connection};

/// External id of the synthetic workspace used when Airtable reports none
pub const DEFAULT_WORKSPACE_ID: &str = "default";
pub const DEFAULT_WORKSPACE_NAME: &str = "My Bases";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Airtable(#[from] AirtableError),
    #[error("database error during sync: {0}")]
    Database(#[from] DbErr),
    #[error("failed to record sync results: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl SyncError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SyncError::Airtable(err) if err.is_unauthorized())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCounts {
    pub workspace_count: usize,
    /// Bases written; bases whose workspace could not be resolved are excluded
    pub base_count: usize,
    pub skipped_bases: usize,
}

/// Rows a sync will write, derived purely from the remote listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogPlan {
    pub workspaces: Vec<WorkspaceRecord>,
    pub bases: Vec<BaseRecord>,
    pub skipped_bases: usize,
}

pub fn local_workspace_id(connection_id: Uuid, airtable_workspace_id: &str) -> Uuid {
    Uuid::new_v5(
        &connection_id,
        format!("workspace:{airtable_workspace_id}").as_bytes(),
    )
}

pub fn local_base_id(connection_id: Uuid, airtable_base_id: &str) -> Uuid {
    Uuid::new_v5(&connection_id, format!("base:{airtable_base_id}").as_bytes())
}

/// Map remote listings to local rows.
///
/// An empty workspace list becomes the single synthetic default workspace.
/// A base goes to `workspaceId` when present, otherwise to the default
/// workspace; bases whose target does not exist are skipped. Repeated
/// external ids keep their first occurrence.
pub fn plan_catalog(
    connection_id: Uuid,
    workspaces: Vec<RemoteWorkspace>,
    bases: Vec<RemoteBase>,
) -> CatalogPlan {
    let workspaces = if workspaces.is_empty() {
        vec![RemoteWorkspace {
            id: DEFAULT_WORKSPACE_ID.to_string(),
            name: DEFAULT_WORKSPACE_NAME.to_string(),
        }]
    } else {
        workspaces
    };

    let mut local_ids: HashMap<String, Uuid> = HashMap::new();
    let mut workspace_records = Vec::with_capacity(workspaces.len());
    for workspace in workspaces {
        if local_ids.contains_key(&workspace.id) {
            continue;
        }
        let id = local_workspace_id(connection_id, &workspace.id);
        local_ids.insert(workspace.id.clone(), id);
        workspace_records.push(WorkspaceRecord {
            id,
            airtable_workspace_id: workspace.id,
            name: workspace.name,
        });
    }

    let mut seen_bases = HashSet::new();
    let mut base_records = Vec::with_capacity(bases.len());
    let mut skipped_bases = 0;
    for base in bases {
        let target = base.workspace_id.as_deref().unwrap_or(DEFAULT_WORKSPACE_ID);
        let Some(&workspace_id) = local_ids.get(target) else {
            skipped_bases += 1;
            continue;
        };
        if !seen_bases.insert(base.id.clone()) {
            continue;
        }
        base_records.push(BaseRecord {
            id: local_base_id(connection_id, &base.id),
            workspace_id,
            airtable_base_id: base.id,
            name: base.name,
            permission_level: base.permission_level,
        });
    }

    CatalogPlan {
        workspaces: workspace_records,
        bases: base_records,
        skipped_bases,
    }
}

pub struct Synchronizer {
    db: Arc<DatabaseConnection>,
    airtable: Arc<dyn AirtableApi>,
}

impl Synchronizer {
    pub fn new(db: Arc<DatabaseConnection>, airtable: Arc<dyn AirtableApi>) -> Self {
        Self { db, airtable }
    }

    /// Fetch, swap and count. Writes `workspace_count`, `base_count` and
    /// `last_sync_at` on the connection; the status is left to the caller.
    #[instrument(skip_all, fields(connection_id = %connection_id))]
    pub async fn sync(&self, connection_id: Uuid, access_token: &str) -> Result<SyncCounts, SyncError> {
        let started = Instant::now();

        let (workspaces, bases) = tokio::join!(
            self.airtable.list_workspaces(access_token),
            self.airtable.list_bases(access_token),
        );
        let (workspaces, bases) = (workspaces?, bases?);
        debug!(
            workspaces = workspaces.len(),
            bases = bases.len(),
            "Fetched Airtable catalog"
        );

        let plan = plan_catalog(connection_id, workspaces, bases);
        let counts = SyncCounts {
            workspace_count: plan.workspaces.len(),
            base_count: plan.bases.len(),
            skipped_bases: plan.skipped_bases,
        };

        let txn = self.db.begin().await?;
        replace_for_connection(&txn, connection_id, &plan.workspaces, &plan.bases).await?;
        apply_patch(
            &txn,
            connection_id,
            ConnectionPatch {
                workspace_count: Some(counts.workspace_count as i32),
                base_count: Some(counts.base_count as i32),
                last_sync_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
        .map_err(SyncError::Persistence)?;
        txn.commit().await?;

        histogram!("airtable_sync_duration_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        info!(
            workspace_count = counts.workspace_count,
            base_count = counts.base_count,
            skipped_bases = counts.skipped_bases,
            "Replaced cached workspaces and bases"
        );

        Ok(counts)
    }
}

/// Per-connection async locks serializing sync and refresh inside one process.
#[derive(Clone, Default)]
pub struct ConnectionLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl ConnectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a connection.
    pub async fn acquire(&self, connection_id: Uuid) -> ConnectionGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(connection_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        ConnectionGuard {
            _guard: lock.lock_owned().await,
        }
    }

    /// Drop map entries nobody holds or waits on.
    pub async fn prune(&self) {
        self.locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

pub struct ConnectionGuard {
    _guard: OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn workspace(id: &str) -> RemoteWorkspace {
        RemoteWorkspace {
            id: id.to_string(),
            name: format!("Workspace {id}"),
        }
    }

    fn base(id: &str, workspace_id: Option<&str>) -> RemoteBase {
        RemoteBase {
            id: id.to_string(),
            name: format!("Base {id}"),
            permission_level: Some("create".to_string()),
            workspace_id: workspace_id.map(str::to_string),
        }
    }

    #[test]
    fn empty_workspace_list_materializes_default() {
        let connection_id = Uuid::new_v4();

        let plan = plan_catalog(
            connection_id,
            vec![],
            vec![base("app1", None), base("app2", None), base("app3", None)],
        );

        assert_eq!(plan.workspaces.len(), 1);
        assert_eq!(plan.workspaces[0].airtable_workspace_id, DEFAULT_WORKSPACE_ID);
        assert_eq!(plan.workspaces[0].name, DEFAULT_WORKSPACE_NAME);
        assert_eq!(plan.bases.len(), 3);
        assert!(plan.bases.iter().all(|b| b.workspace_id == plan.workspaces[0].id));
    }

    #[test]
    fn unresolvable_bases_are_skipped() {
        let plan = plan_catalog(
            Uuid::new_v4(),
            vec![workspace("wsp1")],
            vec![base("app1", Some("wsp1")), base("app2", Some("wspX")), base("app3", None)],
        );

        assert_eq!(plan.bases.len(), 1);
        assert_eq!(plan.bases[0].airtable_base_id, "app1");
        assert_eq!(plan.skipped_bases, 2);
    }

    #[test]
    fn local_ids_are_stable_per_connection() {
        let connection_id = Uuid::new_v4();
        let first = plan_catalog(connection_id, vec![], vec![base("app1", None)]);
        let second = plan_catalog(connection_id, vec![], vec![base("app1", None)]);
        let other = plan_catalog(Uuid::new_v4(), vec![], vec![base("app1", None)]);

        assert_eq!(first, second);
        assert_ne!(first.bases[0].id, other.bases[0].id);
        assert_ne!(
            local_workspace_id(connection_id, "x"),
            local_base_id(connection_id, "x")
        );
    }

    #[test]
    fn repeated_external_ids_keep_first_occurrence() {
        let plan = plan_catalog(
            Uuid::new_v4(),
            vec![workspace("wsp1"), workspace("wsp1")],
            vec![base("app1", Some("wsp1")), base("app1", Some("wsp1"))],
        );

        assert_eq!(plan.workspaces.len(), 1);
        assert_eq!(plan.bases.len(), 1);
    }

    #[tokio::test]
    async fn connection_locks_serialize_same_connection() {
        let locks = ConnectionLocks::new();
        let id = Uuid::new_v4();

        let guard = locks.acquire(id).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        // A different connection is not blocked
        let other = locks.acquire(Uuid::new_v4()).await;
        drop(other);

        drop(guard);
        contender.await.unwrap();

        locks.prune().await;
        assert!(locks.locks.lock().await.is_empty());
    }
}
