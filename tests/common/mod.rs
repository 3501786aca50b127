#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use tally::consolidate::MergePlan;
use tally::error::TallyError;
use tally::store::{BatchRange, RecordFilter, RecordPatch, RecordStore, ResultRecord};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn rec(id: &str, provider: &str, prompt: &str, uses: &str, secs: i64) -> ResultRecord {
    ResultRecord {
        id: id.into(),
        provider: provider.into(),
        prompt: prompt.into(),
        uses: uses.into(),
        created_at: at(secs),
    }
}

/// The A/B/C/D fixture: three "x" duplicates and a lone "y".
pub fn abcd() -> Vec<ResultRecord> {
    vec![
        rec("A", "chatgpt", "x", "2", 1),
        rec("B", "chatgpt", "x", "3", 2),
        rec("C", "chatgpt", "x", "1", 3),
        rec("D", "chatgpt", "y", "5", 4),
    ]
}

/// Plain non-transactional store kept in a Vec.
#[derive(Default)]
pub struct MemStore {
    rows: Mutex<Vec<ResultRecord>>,
}

impl MemStore {
    pub fn with(records: Vec<ResultRecord>) -> Self {
        Self { rows: Mutex::new(records) }
    }

    pub fn get(&self, id: &str) -> Option<ResultRecord> {
        self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    /// Sum of parsed `uses` over one prompt's rows.
    pub fn total(&self, prompt: &str) -> i64 {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.prompt == prompt)
            .map(|r| r.parse_uses().unwrap())
            .sum()
    }

    pub fn snapshot(&self) -> Vec<ResultRecord> {
        let mut rows = self.rows.lock().unwrap().clone();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }
}

#[async_trait]
impl RecordStore for MemStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn select(
        &self,
        filter: &RecordFilter,
        range: Option<BatchRange>,
    ) -> Result<Vec<ResultRecord>, TallyError> {
        let mut rows: Vec<ResultRecord> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| filter.provider.as_ref().map_or(true, |p| *p == r.provider))
            .filter(|r| filter.prompt.as_ref().map_or(true, |p| *p == r.prompt))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(match range {
            Some(r) => rows.into_iter().skip(r.offset).take(r.limit).collect(),
            None => rows,
        })
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), TallyError> {
        self.rows.lock().unwrap().retain(|r| r.id != id);
        Ok(())
    }

    async fn update_by_id(&self, id: &str, patch: &RecordPatch) -> Result<(), TallyError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.iter_mut().find(|r| r.id == id).ok_or(TallyError::NotFound)?;
        if let Some(n) = patch.uses {
            row.uses = n.to_string();
        }
        Ok(())
    }
}

/// Wraps a store and fails chosen operations on demand.
pub struct FaultyStore<S> {
    pub inner: S,
    pub fail_batch_select: AtomicBool,
    pub fail_group_prompts: Mutex<HashSet<String>>,
    pub fail_delete_ids: Mutex<HashSet<String>>,
    pub fail_update_ids: Mutex<HashSet<String>>,
    pub fail_merge: AtomicBool,
    pub deny_lease: AtomicBool,
    pub select_delay: Duration,
    pub update_delay: Duration,
    /// Deletes for these ids land in the store, then the call stalls.
    pub late_delete_ids: Mutex<HashSet<String>>,
    pub late_delay: Duration,
    pub selects: AtomicUsize,
    pub deletes: AtomicUsize,
    pub updates: AtomicUsize,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_batch_select: AtomicBool::new(false),
            fail_group_prompts: Mutex::new(HashSet::new()),
            fail_delete_ids: Mutex::new(HashSet::new()),
            fail_update_ids: Mutex::new(HashSet::new()),
            fail_merge: AtomicBool::new(false),
            deny_lease: AtomicBool::new(false),
            select_delay: Duration::ZERO,
            update_delay: Duration::ZERO,
            late_delete_ids: Mutex::new(HashSet::new()),
            late_delay: Duration::from_millis(200),
            selects: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn with_select_delay(mut self, d: Duration) -> Self {
        self.select_delay = d;
        self
    }

    pub fn with_update_delay(mut self, d: Duration) -> Self {
        self.update_delay = d;
        self
    }

    pub fn answer_late_on_delete(&self, id: &str) {
        self.late_delete_ids.lock().unwrap().insert(id.into());
    }

    pub fn fail_group(&self, prompt: &str) {
        self.fail_group_prompts.lock().unwrap().insert(prompt.into());
    }

    pub fn fail_delete(&self, id: &str) {
        self.fail_delete_ids.lock().unwrap().insert(id.into());
    }

    pub fn fail_update(&self, id: &str) {
        self.fail_update_ids.lock().unwrap().insert(id.into());
    }

    pub fn writes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
    }
}

fn injected() -> TallyError {
    TallyError::Remote { status: 503, message: "injected failure".into() }
}

#[async_trait]
impl<S: RecordStore> RecordStore for FaultyStore<S> {
    fn kind(&self) -> &'static str {
        "faulty"
    }

    async fn select(
        &self,
        filter: &RecordFilter,
        range: Option<BatchRange>,
    ) -> Result<Vec<ResultRecord>, TallyError> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        if !self.select_delay.is_zero() {
            tokio::time::sleep(self.select_delay).await;
        }
        if range.is_some() && self.fail_batch_select.load(Ordering::SeqCst) {
            return Err(injected());
        }
        if range.is_none() {
            if let Some(ref p) = filter.prompt {
                if self.fail_group_prompts.lock().unwrap().contains(p) {
                    return Err(injected());
                }
            }
        }
        self.inner.select(filter, range).await
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), TallyError> {
        if self.fail_delete_ids.lock().unwrap().contains(id) {
            return Err(injected());
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_by_id(id).await?;
        let late = self.late_delete_ids.lock().unwrap().contains(id);
        if late {
            tokio::time::sleep(self.late_delay).await;
        }
        Ok(())
    }

    async fn update_by_id(&self, id: &str, patch: &RecordPatch) -> Result<(), TallyError> {
        if self.fail_update_ids.lock().unwrap().contains(id) {
            return Err(injected());
        }
        if !self.update_delay.is_zero() {
            tokio::time::sleep(self.update_delay).await;
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_by_id(id, patch).await
    }

    fn is_transactional(&self) -> bool {
        self.inner.is_transactional()
    }

    async fn merge_atomic(&self, plan: &MergePlan) -> Result<(), TallyError> {
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.deletes.fetch_add(plan.losers.len(), Ordering::SeqCst);
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.merge_atomic(plan).await
    }

    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool, TallyError> {
        if self.deny_lease.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.try_acquire_lease(name, holder, ttl).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), TallyError> {
        self.inner.release_lease(name, holder).await
    }
}
