//! Offline operation queue.
//!
//! Mutations captured while the remote is unreachable are kept in an
//! append-only, status-tagged log and replayed by the sync runner once the
//! remote is back. Operations on the same record replay strictly in
//! enqueue order; independent records replay concurrently.

use crate::connection::ConnectionManager;
use crate::error::{EngineError, EngineResult};
use crate::executor::CacheExecutor;
use crate::types::{
    ExecuteOptions, NewOperation, OfflineOperation, OperationStats, OperationStatus, SyncReport,
};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct QueueInner {
    connection: ConnectionManager,
    executor: CacheExecutor,
    operations: Mutex<Vec<OfflineOperation>>,
    pending_tx: watch::Sender<usize>,
    sync_lock: tokio::sync::Mutex<()>,
    default_max_retries: u32,
}

/// Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

#[derive(Default)]
struct GroupReport {
    attempted: usize,
    completed: usize,
    requeued: usize,
    failed: usize,
}

impl OfflineQueue {
    pub fn new(
        connection: ConnectionManager,
        executor: CacheExecutor,
        default_max_retries: u32,
    ) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                connection,
                executor,
                operations: Mutex::new(Vec::new()),
                pending_tx,
                sync_lock: tokio::sync::Mutex::new(()),
                default_max_retries,
            }),
        }
    }

    fn operations_lock(&self) -> MutexGuard<'_, Vec<OfflineOperation>> {
        self.inner
            .operations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn broadcast_pending(&self) {
        let pending = self
            .operations_lock()
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .count();
        self.inner.pending_tx.send_replace(pending);
    }

    /// Queue a mutation for later replay. Always succeeds; journaling to
    /// the local database is best-effort.
    pub async fn queue_offline_operation(&self, new: NewOperation) -> String {
        let op = OfflineOperation {
            id: Uuid::now_v7().to_string(),
            kind: new.kind,
            table: new.table,
            record_id: new.record_id,
            payload: new.payload,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(self.inner.default_max_retries),
            status: OperationStatus::Pending,
            tenant_code: self.inner.connection.tenant(),
            queued_at: Utc::now(),
            last_error: None,
        };
        let id = op.id.clone();
        debug!("queued offline {} on {}", op.kind.as_str(), op.table);

        self.operations_lock().push(op.clone());
        self.broadcast_pending();
        self.journal_save(op).await;
        id
    }

    /// Replay pending operations of the current tenant. No-op while
    /// offline or while another sync is running.
    pub async fn start_auto_sync(&self) -> SyncReport {
        let Ok(_guard) = self.inner.sync_lock.try_lock() else {
            debug!("offline sync already running");
            return SyncReport::skipped();
        };
        if self.inner.connection.online_remote().is_none() {
            return SyncReport::skipped();
        }

        let groups = self.pending_groups();
        if groups.is_empty() {
            return SyncReport::default();
        }
        debug!("offline sync: {} record group(s)", groups.len());

        let reports = join_all(groups.into_iter().map(|ids| self.sync_group(ids))).await;
        let mut report = SyncReport::default();
        for group in reports {
            report.attempted += group.attempted;
            report.completed += group.completed;
            report.requeued += group.requeued;
            report.failed += group.failed;
        }
        self.broadcast_pending();
        info!(
            "offline sync: {} completed, {} requeued, {} failed",
            report.completed, report.requeued, report.failed
        );
        report
    }

    /// Pending operation ids of the current tenant, grouped by record in
    /// first-seen order. Operations without a record id stand alone.
    fn pending_groups(&self) -> Vec<Vec<String>> {
        let tenant = self.inner.connection.tenant();
        let ops = self.operations_lock();

        let mut index: HashMap<(String, String), usize> = HashMap::new();
        let mut groups: Vec<Vec<String>> = Vec::new();
        for op in ops.iter() {
            if op.status != OperationStatus::Pending || op.tenant_code != tenant {
                continue;
            }
            match &op.record_id {
                Some(record_id) => {
                    let key = (op.table.clone(), record_id.clone());
                    match index.get(&key) {
                        Some(&slot) => groups[slot].push(op.id.clone()),
                        None => {
                            index.insert(key, groups.len());
                            groups.push(vec![op.id.clone()]);
                        }
                    }
                }
                None => groups.push(vec![op.id.clone()]),
            }
        }
        groups
    }

    /// Replay one record's operations in order, stopping at the first
    /// failure so later operations never overtake it.
    async fn sync_group(&self, ids: Vec<String>) -> GroupReport {
        let mut report = GroupReport::default();
        for id in ids {
            let Some(op) = self.update(&id, |op| op.status = OperationStatus::InFlight) else {
                continue;
            };
            report.attempted += 1;

            match self
                .inner
                .executor
                .execute_rpc(op.to_call(), ExecuteOptions::default())
                .await
            {
                Ok(_) => {
                    if let Some(done) = self.update(&id, |op| {
                        op.status = OperationStatus::Completed;
                        op.last_error = None;
                    }) {
                        self.journal_update(&done).await;
                    }
                    report.completed += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    let updated = self.update(&id, |op| {
                        op.retry_count += 1;
                        op.last_error = Some(message.clone());
                        op.status = if op.retry_count >= op.max_retries {
                            OperationStatus::Failed
                        } else {
                            OperationStatus::Pending
                        };
                    });
                    if let Some(failed) = updated {
                        if failed.status == OperationStatus::Failed {
                            warn!(
                                "offline {} on {} failed permanently after {} attempt(s): {message}",
                                failed.kind.as_str(),
                                failed.table,
                                failed.retry_count
                            );
                            report.failed += 1;
                        } else {
                            debug!("offline operation {id} requeued: {message}");
                            report.requeued += 1;
                        }
                        self.journal_update(&failed).await;
                    }
                    break;
                }
            }
        }
        report
    }

    /// Mutate one operation by id and return its new state.
    fn update(
        &self,
        id: &str,
        apply: impl FnOnce(&mut OfflineOperation),
    ) -> Option<OfflineOperation> {
        let mut ops = self.operations_lock();
        let op = ops.iter_mut().find(|op| op.id == id)?;
        apply(op);
        Some(op.clone())
    }

    /// Drop completed and failed operations. Returns how many were removed.
    pub async fn clear_completed_operations(&self) -> usize {
        let removed: Vec<String> = {
            let mut ops = self.operations_lock();
            let removed = ops
                .iter()
                .filter(|op| op.status.is_terminal())
                .map(|op| op.id.clone())
                .collect();
            ops.retain(|op| !op.status.is_terminal());
            removed
        };
        if removed.is_empty() {
            return 0;
        }

        let count = removed.len();
        if let Ok(store) = self.inner.connection.local() {
            let result =
                tokio::task::spawn_blocking(move || store.delete_journal_entries(&removed)).await;
            if !matches!(result, Ok(Ok(_))) {
                warn!("failed to prune offline journal");
            }
        }
        self.broadcast_pending();
        count
    }

    pub fn get_operation_stats(&self) -> OperationStats {
        let ops = self.operations_lock();
        let mut stats = OperationStats {
            total: ops.len(),
            ..OperationStats::default()
        };
        for op in ops.iter() {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::InFlight => stats.in_flight += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Snapshot of every operation, in enqueue order.
    pub fn operations(&self) -> Vec<OfflineOperation> {
        self.operations_lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        *self.inner.pending_tx.borrow()
    }

    pub fn subscribe_pending_count(&self) -> watch::Receiver<usize> {
        self.inner.pending_tx.subscribe()
    }

    /// Load journaled operations from the local database. Operations
    /// interrupted mid-flight go back to pending. Returns how many were
    /// added.
    pub async fn restore_from_journal(&self) -> EngineResult<usize> {
        let store = self.inner.connection.local()?;
        let entries = tokio::task::spawn_blocking(move || store.load_journal()).await??;

        let mut restored = 0;
        {
            let mut ops = self.operations_lock();
            for entry in entries {
                if ops.iter().any(|op| op.id == entry.id) {
                    continue;
                }
                let mut op = match OfflineOperation::try_from(entry) {
                    Ok(op) => op,
                    Err(e) => {
                        warn!("skipping unreadable journal entry: {e}");
                        continue;
                    }
                };
                if op.status == OperationStatus::InFlight {
                    op.status = OperationStatus::Pending;
                }
                ops.push(op);
                restored += 1;
            }
        }
        if restored > 0 {
            info!("restored {restored} offline operation(s) from journal");
        }
        self.broadcast_pending();
        Ok(restored)
    }

    async fn journal_save(&self, op: OfflineOperation) {
        let Ok(store) = self.inner.connection.local() else {
            return;
        };
        let entry = op.to_journal_entry();
        let result = tokio::task::spawn_blocking(move || store.save_journal_entry(&entry)).await;
        log_journal_result(&op.id, result);
    }

    async fn journal_update(&self, op: &OfflineOperation) {
        let Ok(store) = self.inner.connection.local() else {
            return;
        };
        let id = op.id.clone();
        let status = op.status.as_str();
        let retry_count = op.retry_count;
        let last_error = op.last_error.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.update_journal_status(&id, status, retry_count, last_error.as_deref())
        })
        .await;
        log_journal_result(&op.id, result);
    }
}

fn log_journal_result<T>(
    id: &str,
    result: Result<dualtier_storage::StorageResult<T>, tokio::task::JoinError>,
) {
    let error = match result {
        Ok(Ok(_)) => return,
        Ok(Err(e)) => EngineError::from(e),
        Err(e) => EngineError::from(e),
    };
    warn!("offline journal write for {id} failed: {error}");
}
