//! Push phase: drains the outbox in dependency order.

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::dispatch::{DispatchOutcome, SyncDispatcher};
use crate::error::SyncResult;
use crate::flight::SingleFlight;
use crate::remap::IdRemapper;
use fieldsync_core::{MutationRecord, OutboxStatus, Store};
use serde::Serialize;
use std::sync::Arc;

/// Tally of one push pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    /// Records dispatched.
    pub attempted: usize,
    /// Records that reached success.
    pub succeeded: usize,
    /// Successes that carried an id remap.
    pub remapped: usize,
    /// Records that ended in conflict.
    pub conflicts: usize,
    /// Records that failed and stay pending.
    pub failed: usize,
    /// Records skipped because their backoff has not elapsed.
    pub deferred: usize,
    /// Records edited locally while in flight; pushed again next pass.
    pub requeued: usize,
}

impl QueueReport {
    /// True when every loaded record ended in success.
    pub fn fully_successful(&self) -> bool {
        self.conflicts == 0 && self.failed == 0 && self.deferred == 0 && self.requeued == 0
    }
}

/// Pushes pending outbox entries for an actor.
pub struct QueueProcessor {
    store: Arc<Store>,
    dispatcher: SyncDispatcher,
    remapper: Arc<IdRemapper>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    flight: SingleFlight<QueueReport>,
}

impl QueueProcessor {
    /// Creates a queue processor.
    pub fn new(
        store: Arc<Store>,
        dispatcher: SyncDispatcher,
        remapper: Arc<IdRemapper>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            dispatcher,
            remapper,
            clock,
            retry,
            flight: SingleFlight::new(),
        }
    }

    /// Returns true while a pass is running.
    pub fn is_running(&self) -> bool {
        self.flight.is_running()
    }

    /// Runs one push pass for `actor_id`.
    ///
    /// Only one pass runs at a time; a caller arriving mid-pass gets the
    /// in-flight pass's report.
    pub async fn process_queue(&self, actor_id: &str) -> SyncResult<QueueReport> {
        let (result, joined) = self.flight.run(self.drain(actor_id)).await;
        if joined {
            tracing::debug!(actor_id, "joined in-flight push pass");
        }
        result
    }

    async fn drain(&self, actor_id: &str) -> SyncResult<QueueReport> {
        let records = self.store.pending_outbox_entries(actor_id);
        let mut report = QueueReport::default();
        if records.is_empty() {
            return Ok(report);
        }
        tracing::debug!(actor_id, count = records.len(), "draining outbox");

        for loaded in records {
            // Earlier records in this pass may have rewritten this one.
            let Some(record) = self.store.outbox_entry(&loaded.sync_id) else {
                continue;
            };
            if record.status != OutboxStatus::Pending {
                continue;
            }
            if !self.retry.is_due(&record, self.clock.now()) {
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            let outcome = self
                .dispatcher
                .dispatch(record.entity_type, &record.entity_id)
                .await;
            self.apply_outcome(&record, outcome, &mut report)?;
        }

        tracing::info!(
            actor_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            conflicts = report.conflicts,
            failed = report.failed,
            deferred = report.deferred,
            "push pass finished"
        );
        Ok(report)
    }

    fn apply_outcome(
        &self,
        record: &MutationRecord,
        outcome: DispatchOutcome,
        report: &mut QueueReport,
    ) -> SyncResult<()> {
        let now = self.clock.now();
        match outcome {
            DispatchOutcome::Success { remap } => {
                let mut entity_id = record.entity_id.clone();
                if let Some(remap) = remap {
                    match self
                        .remapper
                        .remap(remap.entity_type, &remap.client_id, &remap.server_id)
                    {
                        Ok(true) => {
                            report.remapped += 1;
                            entity_id = remap.server_id;
                        }
                        Ok(false) => {
                            // The server has the row; leave the record
                            // pending so the next pass can confirm it.
                            self.store.mark_outbox_failed(&record.sync_id, now)?;
                            report.failed += 1;
                            return Ok(());
                        }
                        Err(err) => {
                            tracing::warn!(sync_id = %record.sync_id, error = %err, "remap failed");
                            self.store.mark_outbox_failed(&record.sync_id, now)?;
                            report.failed += 1;
                            return Ok(());
                        }
                    }
                }

                let confirmed = self.store.transaction(|txn| {
                    let edited = txn
                        .outbox_entry(&record.sync_id)
                        .map_or(true, |current| current.revision != record.revision);
                    if edited {
                        return Ok(false);
                    }
                    txn.mark_outbox_success(&record.sync_id, now)?;
                    if txn.get_row(record.entity_type, &entity_id).is_some() {
                        txn.mark_entity_synced(record.entity_type, &entity_id)?;
                    }
                    Ok(true)
                })?;
                if confirmed {
                    report.succeeded += 1;
                } else {
                    tracing::debug!(sync_id = %record.sync_id, "entity edited during push; requeued");
                    report.requeued += 1;
                }
            }
            DispatchOutcome::Conflict { .. } => {
                let details = outcome.conflict_details();
                self.store.transaction(|txn| {
                    if let Some(details) = details {
                        let message = format!("Conflict on {}", details.conflict_field);
                        txn.mark_outbox_conflict(&record.sync_id, details, now)?;
                        if txn.get_row(record.entity_type, &record.entity_id).is_some() {
                            txn.set_sync_status(record.entity_type, &record.entity_id, Some(&message))?;
                        }
                    }
                    Ok(())
                })?;
                tracing::info!(
                    sync_id = %record.sync_id,
                    entity_type = %record.entity_type,
                    entity_id = %record.entity_id,
                    "push conflict recorded"
                );
                report.conflicts += 1;
            }
            DispatchOutcome::Failure { cause } => {
                let retries = self.store.transaction(|txn| {
                    let retries = txn.mark_outbox_failed(&record.sync_id, now)?;
                    if txn.get_row(record.entity_type, &record.entity_id).is_some() {
                        txn.set_sync_status(
                            record.entity_type,
                            &record.entity_id,
                            Some(&cause.to_string()),
                        )?;
                    }
                    Ok(retries)
                })?;
                tracing::debug!(
                    sync_id = %record.sync_id,
                    retries,
                    retryable = cause.is_retryable(),
                    error = %cause,
                    "push failed"
                );
                report.failed += 1;
            }
        }
        Ok(())
    }
}
