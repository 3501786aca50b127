//! Duplicate result consolidation.
//!
//! A run scans a bounded window of one provider's results, re-fetches the
//! full duplicate group for every distinct prompt it saw, and folds groups of
//! `min_group_size` or more into their earliest record.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::TallyError;
use crate::store::{
    BatchRange, GroupKey, RecordFilter, RecordPatch, RecordStore, ResultRecord, SharedStore,
};

mod merge;

pub use merge::{plan_merge, Loser, MergePlan, DEFAULT_MIN_GROUP_SIZE};

/// Lease row shared by every process consolidating the same store.
pub const LEASE_NAME: &str = "consolidate-results";
/// Extra lease lifetime past the run deadline.
const LEASE_GRACE: Duration = Duration::from_secs(60);
pub const MAX_BATCH_LIMIT: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ConsolidateOptions {
    pub min_group_size: usize,
    /// Applied to every individual store call.
    pub op_timeout: Duration,
    /// No new group is started after this much time.
    pub run_deadline: Duration,
    /// Duplicate groups in flight at once. Writes inside a group stay ordered.
    pub concurrency: usize,
    pub dry_run: bool,
}

impl Default for ConsolidateOptions {
    fn default() -> Self {
        Self {
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
            op_timeout: Duration::from_secs(15),
            run_deadline: Duration::from_secs(600),
            concurrency: 1,
            dry_run: false,
        }
    }
}

/// Per-call overrides for a run. Missing fields use the consolidator's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsolidateRequest {
    pub provider: Option<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub dry_run: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Fetch,
    Parse,
    Delete,
    Update,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    pub fetch: usize,
    pub parse: usize,
    pub delete: usize,
    pub update: usize,
}

impl ErrorCounts {
    fn record(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Fetch => self.fetch += 1,
            FailureKind::Parse => self.parse += 1,
            FailureKind::Delete => self.delete += 1,
            FailureKind::Update => self.update += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.fetch + self.parse + self.delete + self.update
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupFailure {
    pub key: GroupKey,
    pub kind: FailureKind,
    /// Some writes landed before the failure; the group needs a look.
    pub partial: bool,
    pub deleted: usize,
    pub updated: bool,
    pub error: String,
}

impl GroupFailure {
    fn new(key: &GroupKey, kind: FailureKind, err: &TallyError) -> Self {
        Self {
            key: key.clone(),
            kind,
            partial: false,
            deleted: 0,
            updated: false,
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub provider: String,
    pub candidates_scanned: usize,
    pub groups_processed: usize,
    pub groups_merged: usize,
    pub groups_skipped: usize,
    pub records_deleted: usize,
    pub records_updated: usize,
    pub partial_groups: usize,
    pub errors: ErrorCounts,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<GroupFailure>,
    pub deadline_exceeded: bool,
    /// Shutdown was requested; remaining groups were left for the next run.
    pub cancelled: bool,
    pub dry_run: bool,
    /// What a dry run would have written.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<MergePlan>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunOutcome {
    fn new(provider: &str, dry_run: bool) -> Self {
        Self {
            provider: provider.to_string(),
            candidates_scanned: 0,
            groups_processed: 0,
            groups_merged: 0,
            groups_skipped: 0,
            records_deleted: 0,
            records_updated: 0,
            partial_groups: 0,
            errors: ErrorCounts::default(),
            failures: Vec::new(),
            deadline_exceeded: false,
            cancelled: false,
            dry_run,
            planned: Vec::new(),
            started_at: Utc::now(),
            elapsed_ms: 0,
        }
    }

    fn absorb(&mut self, result: GroupResult) {
        self.groups_processed += 1;
        match result {
            GroupResult::Skipped => self.groups_skipped += 1,
            GroupResult::Planned(plan) => self.planned.push(plan),
            GroupResult::Merged { deleted } => {
                self.groups_merged += 1;
                self.records_deleted += deleted;
                self.records_updated += 1;
            }
            GroupResult::Failed(f) => {
                self.errors.record(f.kind);
                self.records_deleted += f.deleted;
                if f.updated {
                    self.records_updated += 1;
                }
                if f.partial {
                    self.partial_groups += 1;
                }
                self.failures.push(f);
            }
        }
    }
}

/// Why a group was never started.
enum NotStarted {
    Deadline,
    Cancelled,
}

enum GroupResult {
    Skipped,
    Planned(MergePlan),
    Merged { deleted: usize },
    Failed(GroupFailure),
}

async fn with_timeout<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, TallyError>
where
    F: Future<Output = Result<T, TallyError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(TallyError::Timeout(op)))
}

/// One consolidation pass over `provider`'s results in `range`.
///
/// Only a failed candidate scan is returned as `Err`; every per-group failure
/// is recorded in the outcome and the run moves on to the next group.
pub async fn consolidate(
    store: &dyn RecordStore,
    provider: &str,
    range: BatchRange,
    opts: &ConsolidateOptions,
) -> Result<RunOutcome, TallyError> {
    consolidate_cancellable(store, provider, range, opts, None).await
}

/// [`consolidate`] that stops at the next group boundary once `cancel_flag`
/// is set. A group that has started always runs to the end of its writes.
pub async fn consolidate_cancellable(
    store: &dyn RecordStore,
    provider: &str,
    range: BatchRange,
    opts: &ConsolidateOptions,
    cancel_flag: Option<&AtomicBool>,
) -> Result<RunOutcome, TallyError> {
    let started = Instant::now();
    let deadline = started + opts.run_deadline;
    let mut outcome = RunOutcome::new(provider, opts.dry_run);

    let candidates = with_timeout(
        opts.op_timeout,
        "candidate scan",
        store.select(&RecordFilter::provider(provider), Some(range)),
    )
    .await?;
    outcome.candidates_scanned = candidates.len();

    let mut seen = HashSet::new();
    let keys: Vec<GroupKey> = candidates
        .iter()
        .map(ResultRecord::key)
        .filter(|k| seen.insert(k.clone()))
        .collect();
    debug!(
        provider,
        candidates = candidates.len(),
        keys = keys.len(),
        offset = range.offset,
        limit = range.limit,
        "candidate window loaded"
    );

    let results: Vec<Result<GroupResult, NotStarted>> = stream::iter(keys)
        .map(move |key| async move {
            if cancel_flag.map_or(false, |c| c.load(Ordering::SeqCst)) {
                return Err(NotStarted::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(NotStarted::Deadline);
            }
            Ok(process_group(store, &key, opts).await)
        })
        .buffered(opts.concurrency.max(1))
        .collect()
        .await;

    for result in results {
        match result {
            Ok(r) => outcome.absorb(r),
            Err(NotStarted::Deadline) => outcome.deadline_exceeded = true,
            Err(NotStarted::Cancelled) => outcome.cancelled = true,
        }
    }
    outcome.elapsed_ms = started.elapsed().as_millis() as u64;

    if outcome.cancelled {
        info!(
            provider,
            processed = outcome.groups_processed,
            "shutdown requested, stopped at a group boundary"
        );
    }
    if outcome.deadline_exceeded {
        warn!(
            provider,
            processed = outcome.groups_processed,
            "run deadline reached, remaining groups left for the next run"
        );
    }
    info!(
        provider,
        scanned = outcome.candidates_scanned,
        groups = outcome.groups_processed,
        merged = outcome.groups_merged,
        deleted = outcome.records_deleted,
        updated = outcome.records_updated,
        partial = outcome.partial_groups,
        errors = outcome.errors.total(),
        dry_run = outcome.dry_run,
        elapsed_ms = outcome.elapsed_ms,
        "consolidation complete"
    );
    Ok(outcome)
}

async fn process_group(
    store: &dyn RecordStore,
    key: &GroupKey,
    opts: &ConsolidateOptions,
) -> GroupResult {
    // Fresh, unranged lookup: members outside the scan window count too.
    let group = match with_timeout(
        opts.op_timeout,
        "group select",
        store.select(&RecordFilter::key(key), None),
    )
    .await
    {
        Ok(g) => g,
        Err(e) => {
            let kind = if e.is_parse_failure() { FailureKind::Parse } else { FailureKind::Fetch };
            warn!(key = %key, error = %e, "group lookup failed");
            return GroupResult::Failed(GroupFailure::new(key, kind, &e));
        }
    };

    let plan = match plan_merge(&group, opts.min_group_size.max(2)) {
        Ok(Some(p)) if !p.losers.is_empty() => p,
        Ok(_) => {
            debug!(key = %key, size = group.len(), "group below threshold");
            return GroupResult::Skipped;
        }
        Err(e) => {
            warn!(key = %key, error = %e, "unparsable group left untouched");
            return GroupResult::Failed(GroupFailure::new(key, FailureKind::Parse, &e));
        }
    };

    if opts.dry_run {
        info!(
            key = %key,
            winner = %plan.winner_id,
            losers = plan.losers.len(),
            total = plan.total_uses,
            "dry run: would merge"
        );
        return GroupResult::Planned(plan);
    }

    if store.is_transactional() {
        apply_atomic(store, plan, opts).await
    } else {
        apply_sequential(store, plan, opts).await
    }
}

async fn apply_atomic(store: &dyn RecordStore, plan: MergePlan, opts: &ConsolidateOptions) -> GroupResult {
    match with_timeout(opts.op_timeout, "merge", store.merge_atomic(&plan)).await {
        Ok(()) => {
            for loser in &plan.losers {
                info!(id = %loser.id, winner = %plan.winner_id, "deleted duplicate");
            }
            info!(
                key = %plan.key,
                winner = %plan.winner_id,
                deleted = plan.losers.len(),
                total = plan.total_uses,
                "group merged"
            );
            GroupResult::Merged { deleted: plan.losers.len() }
        }
        Err(e) => {
            let unknown = matches!(e, TallyError::Timeout(_));
            if unknown {
                error!(key = %plan.key, winner = %plan.winner_id, "merge timed out, commit state unknown");
            } else {
                warn!(key = %plan.key, error = %e, "merge rolled back, group unchanged");
            }
            GroupResult::Failed(GroupFailure {
                partial: unknown,
                ..GroupFailure::new(&plan.key, FailureKind::Update, &e)
            })
        }
    }
}

/// Losers still planned for deletion that the store no longer returns.
async fn confirm_deleted<'a>(
    store: &dyn RecordStore,
    plan: &'a MergePlan,
    opts: &ConsolidateOptions,
) -> Result<Vec<&'a Loser>, TallyError> {
    let rows = with_timeout(
        opts.op_timeout,
        "group recheck",
        store.select(&RecordFilter::key(&plan.key), None),
    )
    .await?;
    let present: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    Ok(plan
        .losers
        .iter()
        .filter(|l| !present.contains(l.id.as_str()))
        .collect())
}

/// Losers go first, one by one, then the winner. If a delete fails the
/// remaining losers are kept and the winner only absorbs the ones that are
/// gone, so the stored rows still sum to the group's original total. A failed
/// delete may still have committed (a timeout says nothing either way), so
/// the group is re-read to learn which losers are really gone.
async fn apply_sequential(store: &dyn RecordStore, plan: MergePlan, opts: &ConsolidateOptions) -> GroupResult {
    let mut deleted: Vec<&Loser> = Vec::with_capacity(plan.losers.len());
    let mut delete_err = None;
    for loser in &plan.losers {
        match with_timeout(opts.op_timeout, "delete", store.delete_by_id(&loser.id)).await {
            Ok(()) => {
                info!(id = %loser.id, winner = %plan.winner_id, "deleted duplicate");
                deleted.push(loser);
            }
            Err(e) => {
                warn!(id = %loser.id, key = %plan.key, error = %e, "delete failed, stopping group");
                delete_err = Some(e);
                break;
            }
        }
    }

    if let Some(ref e) = delete_err {
        let mut unverified = false;
        match confirm_deleted(store, &plan, opts).await {
            Ok(gone) => {
                if gone.len() != deleted.len() {
                    warn!(
                        key = %plan.key,
                        reported = deleted.len(),
                        gone = gone.len(),
                        "failed delete had committed"
                    );
                }
                deleted = gone;
            }
            Err(check_err) => {
                unverified = matches!(e, TallyError::Timeout(_));
                error!(
                    key = %plan.key,
                    error = %check_err,
                    "could not re-read group after failed delete, reconcile manually"
                );
            }
        }
        if deleted.is_empty() {
            return GroupResult::Failed(GroupFailure {
                partial: unverified,
                ..GroupFailure::new(&plan.key, FailureKind::Delete, e)
            });
        }
    }
    if delete_err.is_some() && deleted.len() == plan.losers.len() {
        delete_err = None;
    }

    let total = match delete_err {
        None => plan.total_uses,
        Some(_) => plan.total_for(&deleted),
    };

    let update = with_timeout(
        opts.op_timeout,
        "update",
        store.update_by_id(&plan.winner_id, &RecordPatch::uses(total)),
    )
    .await;

    match (delete_err, update) {
        (None, Ok(())) => {
            info!(
                key = %plan.key,
                winner = %plan.winner_id,
                deleted = deleted.len(),
                total,
                "group merged"
            );
            GroupResult::Merged { deleted: deleted.len() }
        }
        (None, Err(e)) => {
            error!(
                key = %plan.key,
                winner = %plan.winner_id,
                intended_total = total,
                deleted = deleted.len(),
                error = %e,
                "winner update failed after deletes, reconcile manually"
            );
            GroupResult::Failed(GroupFailure {
                partial: !deleted.is_empty(),
                deleted: deleted.len(),
                ..GroupFailure::new(&plan.key, FailureKind::Update, &e)
            })
        }
        (Some(e), Ok(())) => {
            warn!(
                key = %plan.key,
                winner = %plan.winner_id,
                deleted = deleted.len(),
                remaining = plan.losers.len() - deleted.len(),
                total,
                "partial merge: winner absorbed deleted duplicates only"
            );
            GroupResult::Failed(GroupFailure {
                partial: true,
                deleted: deleted.len(),
                updated: true,
                ..GroupFailure::new(&plan.key, FailureKind::Delete, &e)
            })
        }
        (Some(e), Err(update_err)) => {
            error!(
                key = %plan.key,
                winner = %plan.winner_id,
                intended_total = total,
                deleted = deleted.len(),
                error = %e,
                update_error = %update_err,
                "partial merge and winner update failed, reconcile manually"
            );
            GroupResult::Failed(GroupFailure {
                partial: true,
                deleted: deleted.len(),
                ..GroupFailure::new(&plan.key, FailureKind::Delete, &e)
            })
        }
    }
}

/// Owns the store handle and run defaults, and makes sure only one run is in
/// flight: an in-process guard first, then the store's lease for other
/// processes.
pub struct Consolidator {
    store: SharedStore,
    provider: String,
    range: BatchRange,
    opts: ConsolidateOptions,
    running: tokio::sync::Mutex<()>,
    stopping: AtomicBool,
    last: parking_lot::Mutex<Option<RunOutcome>>,
}

impl Consolidator {
    pub fn new(store: SharedStore, provider: impl Into<String>) -> Self {
        Self {
            store,
            provider: provider.into(),
            range: BatchRange::default(),
            opts: ConsolidateOptions::default(),
            running: tokio::sync::Mutex::new(()),
            stopping: AtomicBool::new(false),
            last: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_range(mut self, range: BatchRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_options(mut self, opts: ConsolidateOptions) -> Self {
        self.opts = opts;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Refuse new runs and make the current one stop at its next group
    /// boundary.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Resolves once no run is in flight.
    pub async fn wait_idle(&self) {
        drop(self.running.lock().await);
    }

    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.last.lock().clone()
    }

    fn resolve(&self, req: &ConsolidateRequest) -> Result<(String, BatchRange, ConsolidateOptions), TallyError> {
        let provider = req.provider.clone().unwrap_or_else(|| self.provider.clone());
        if provider.trim().is_empty() {
            return Err(TallyError::Validation("provider must not be empty".into()));
        }
        let range = BatchRange::new(
            req.offset.unwrap_or(self.range.offset),
            req.limit.unwrap_or(self.range.limit),
        );
        if range.limit == 0 || range.limit > MAX_BATCH_LIMIT {
            return Err(TallyError::Validation(format!(
                "limit must be between 1 and {MAX_BATCH_LIMIT}"
            )));
        }
        let mut opts = self.opts.clone();
        if let Some(d) = req.dry_run {
            opts.dry_run = d;
        }
        Ok((provider, range, opts))
    }

    /// Run one consolidation pass. Returns `AlreadyRunning` instead of
    /// waiting when another run holds the guard or the lease.
    ///
    /// Dropping this future mid-group can leave losers deleted and the winner
    /// not yet updated on non-transactional stores. Callers that may be
    /// cancelled (request handlers) should drive it from a spawned task.
    pub async fn run(&self, req: ConsolidateRequest) -> Result<RunOutcome, TallyError> {
        let (provider, range, opts) = self.resolve(&req)?;
        if self.is_stopping() {
            return Err(TallyError::ShuttingDown);
        }
        let _guard = self.running.try_lock().map_err(|_| TallyError::AlreadyRunning)?;

        let holder = uuid::Uuid::new_v4().to_string();
        let ttl = opts.run_deadline + LEASE_GRACE;
        let acquired = with_timeout(
            opts.op_timeout,
            "lease acquire",
            self.store.try_acquire_lease(LEASE_NAME, &holder, ttl),
        )
        .await?;
        if !acquired {
            info!(lease = LEASE_NAME, "lease held by another process, skipping run");
            return Err(TallyError::AlreadyRunning);
        }

        let result = consolidate_cancellable(
            self.store.as_ref(),
            &provider,
            range,
            &opts,
            Some(&self.stopping),
        )
        .await;

        if let Err(e) = with_timeout(
            opts.op_timeout,
            "lease release",
            self.store.release_lease(LEASE_NAME, &holder),
        )
        .await
        {
            warn!(lease = LEASE_NAME, error = %e, "failed to release lease, it will expire");
        }

        match &result {
            Ok(outcome) => *self.last.lock() = Some(outcome.clone()),
            Err(e) => warn!(provider = %provider, error = %e, "consolidation aborted"),
        }
        result
    }
}
