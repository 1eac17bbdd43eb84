//! Prepared statement management and caching.
//!
//! This module provides:
//! - `NormalizedStatementKey`: SQL text plus the session context it runs under
//! - `StatementCacheEntry`: a server-side prepared statement and its codecs
//! - `PreparedStatementCache`: LRU cache of handles with batched deallocation

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lru::LruCache;
use tracing::{debug, trace};

use super::channel::{Request, WireChannel, WireResponse};
use super::error::PgResult;
use super::pending::PendingOperationQueue;
use super::protocol::FieldDescription;
use super::types::{Oid, TypeDescriptor};

/// Shared column descriptions - wrapped in Arc to avoid cloning on every query.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Cache key: the same SQL under a different `search_path` is a different
/// statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedStatementKey {
    pub search_path: String,
    pub sql: String,
}

impl NormalizedStatementKey {
    pub fn new(search_path: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            search_path: search_path.into(),
            sql: sql.into(),
        }
    }
}

impl fmt::Display for NormalizedStatementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.search_path, self.sql)
    }
}

// ============================================================================
// Cache Entry
// ============================================================================

/// A statement the server holds under `handle`.
#[derive(Debug, Clone)]
pub struct StatementCacheEntry {
    /// Server-side name (`a1`, `a2`, ...)
    pub handle: String,
    pub sql: String,
    /// Encoder per positional parameter; `None` falls back to the value's own
    /// wire form.
    pub parameter_encoders: Vec<Option<Arc<TypeDescriptor>>>,
    /// Parameter types declared on Parse, refined by ParameterDescription.
    pub param_types: Vec<Oid>,
    /// Result columns (from RowDescription)
    pub fields: SharedColumns,
}

impl StatementCacheEntry {
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn field_types(&self) -> Vec<Oid> {
        self.fields.iter().map(|f| f.type_oid).collect()
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// What to do once a deferred statement operation has been answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Prepared {
        key: NormalizedStatementKey,
        handle: String,
    },
    Deallocated {
        handles: Vec<String>,
    },
}

/// Which partition of the cache the current process owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOwner {
    /// Partition by `std::process::id()`, re-read on every access so a forked
    /// child starts from an empty partition.
    Process,
    Fixed(u32),
}

impl CacheOwner {
    fn id(self) -> u32 {
        match self {
            CacheOwner::Process => std::process::id(),
            CacheOwner::Fixed(id) => id,
        }
    }
}

// ============================================================================
// Prepared Statement Cache (LRU)
// ============================================================================

/// LRU cache of prepared statement handles for one connection.
///
/// Preparing and deallocating go through the cache's own
/// [`PendingOperationQueue`], so they ride along with regular traffic instead
/// of costing a dedicated round trip. Entries are removed in the same step
/// that queues their deallocation.
pub struct PreparedStatementCache {
    partitions: HashMap<u32, LruCache<NormalizedStatementKey, Arc<StatementCacheEntry>>>,
    pending: PendingOperationQueue<Completion>,
    owner: CacheOwner,
    capacity: usize,
    eviction_percent: usize,
    /// Counter for generating unique statement names
    next_id: u64,
}

impl PreparedStatementCache {
    pub fn new(capacity: usize, eviction_percent: usize) -> Self {
        Self::with_owner(capacity, eviction_percent, CacheOwner::Process)
    }

    pub fn with_owner(capacity: usize, eviction_percent: usize, owner: CacheOwner) -> Self {
        Self {
            partitions: HashMap::new(),
            pending: PendingOperationQueue::new(),
            owner,
            capacity: capacity.max(1),
            eviction_percent: eviction_percent.clamp(1, 100),
            next_id: 0,
        }
    }

    pub fn set_owner(&mut self, owner: CacheOwner) {
        self.owner = owner;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn partition(&mut self) -> &mut LruCache<NormalizedStatementKey, Arc<StatementCacheEntry>> {
        self.partitions
            .entry(self.owner.id())
            .or_insert_with(LruCache::unbounded)
    }

    fn current(&self) -> Option<&LruCache<NormalizedStatementKey, Arc<StatementCacheEntry>>> {
        self.partitions.get(&self.owner.id())
    }

    /// Get the entry and mark it most recently used.
    pub fn lookup(&mut self, key: &NormalizedStatementKey) -> Option<Arc<StatementCacheEntry>> {
        self.partition().get(key).map(Arc::clone)
    }

    /// Get the entry without touching LRU order.
    pub fn peek(&self, key: &NormalizedStatementKey) -> Option<Arc<StatementCacheEntry>> {
        self.current()?.peek(key).map(Arc::clone)
    }

    pub fn contains(&self, key: &NormalizedStatementKey) -> bool {
        self.current().is_some_and(|c| c.contains(key))
    }

    /// Number of entries in the current owner's partition.
    pub fn len(&self) -> usize {
        self.current().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles from least to most recently used.
    pub fn handles(&self) -> Vec<String> {
        self.current()
            .map(|c| c.iter().rev().map(|(_, e)| e.handle.clone()).collect())
            .unwrap_or_default()
    }

    fn next_handle(&mut self) -> String {
        self.next_id += 1;
        format!("a{}", self.next_id)
    }

    /// Allocate a handle, queue its prepare and insert the entry as most
    /// recently used.
    ///
    /// The prepare must be drained before the handle is first executed.
    pub fn add(
        &mut self,
        key: NormalizedStatementKey,
        parameter_encoders: Vec<Option<Arc<TypeDescriptor>>>,
        param_types: Vec<Oid>,
    ) -> PgResult<Arc<StatementCacheEntry>> {
        let handle = self.next_handle();
        let request = Request::Prepare {
            name: handle.clone(),
            sql: key.sql.clone(),
            param_types: param_types.clone(),
        };
        self.pending.issue(
            request,
            Completion::Prepared {
                key: key.clone(),
                handle: handle.clone(),
            },
        )?;

        let entry = Arc::new(StatementCacheEntry {
            handle,
            sql: key.sql.clone(),
            parameter_encoders,
            param_types,
            fields: Arc::new(Vec::new()),
        });
        debug!(handle = %entry.handle, sql = %entry.sql, "preparing statement");
        self.partition().put(key, Arc::clone(&entry));
        Ok(entry)
    }

    /// Once the cache is full, drop the least recently used share of it and
    /// queue one deallocation naming every dropped handle.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_oversized(&mut self) -> PgResult<usize> {
        let len = self.len();
        if len < self.capacity {
            return Ok(0);
        }
        let keep = self.capacity * (100 - self.eviction_percent) / 100;
        let count = (len + 1).saturating_sub(keep).min(len);
        let handles: Vec<String> = self
            .partition()
            .iter()
            .rev()
            .take(count)
            .map(|(_, entry)| entry.handle.clone())
            .collect();

        self.deallocate(handles)?;
        let partition = self.partition();
        for _ in 0..count {
            partition.pop_lru();
        }
        debug!(evicted = count, remaining = len - count, "evicted prepared statements");
        Ok(count)
    }

    /// Remove the entry and queue deallocation of its handle.
    pub fn remove(
        &mut self,
        key: &NormalizedStatementKey,
    ) -> PgResult<Option<Arc<StatementCacheEntry>>> {
        let Some(handle) = self.peek(key).map(|e| e.handle.clone()) else {
            return Ok(None);
        };
        self.deallocate(vec![handle])?;
        Ok(self.partition().pop(key))
    }

    /// Remove the entry without telling the server; for handles whose prepare
    /// never succeeded.
    pub fn remove_without_deallocation(
        &mut self,
        key: &NormalizedStatementKey,
    ) -> Option<Arc<StatementCacheEntry>> {
        let removed = self.partition().pop(key);
        if let Some(entry) = &removed {
            trace!(handle = %entry.handle, "dropped statement without deallocation");
        }
        removed
    }

    /// Remove every entry of the current owner and queue one deallocation for
    /// all of them.
    pub fn clear(&mut self) -> PgResult<usize> {
        let handles = self.handles();
        let count = handles.len();
        self.deallocate(handles)?;
        self.partition().clear();
        Ok(count)
    }

    fn deallocate(&mut self, handles: Vec<String>) -> PgResult<()> {
        if handles.is_empty() {
            return Ok(());
        }
        self.pending.issue(
            Request::Deallocate {
                names: handles.clone(),
            },
            Completion::Deallocated { handles },
        )
    }

    /// Record what the server reported about a prepared statement.
    pub fn record_description(
        &mut self,
        key: &NormalizedStatementKey,
        fields: Vec<FieldDescription>,
        param_types: Vec<Oid>,
    ) {
        if let Some(entry) = self.partition().peek_mut(key) {
            let entry = Arc::make_mut(entry);
            if !fields.is_empty() || entry.fields.is_empty() {
                entry.fields = Arc::new(fields);
            }
            if !param_types.is_empty() {
                entry.param_types = param_types;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pending operation
    // ------------------------------------------------------------------------

    /// The queued prepare or deallocation, if any.
    pub fn pending_request(&self) -> Option<&Request> {
        self.pending.request()
    }

    pub fn pending_in_flight(&self) -> bool {
        self.pending.in_flight()
    }

    /// Write the queued operation so its response can be collected later.
    pub async fn send_pending<C: WireChannel>(&mut self, channel: &mut C) -> PgResult<()> {
        match self.pending.send(channel).await {
            Ok(_) => Ok(()),
            Err((completion, e)) => self.complete(completion, Err(e)),
        }
    }

    /// Wait for the queued operation and apply its outcome.
    pub async fn finish_pending<C: WireChannel>(&mut self, channel: &mut C) -> PgResult<()> {
        match self.pending.drain(channel).await? {
            Some((completion, outcome)) => self.complete(completion, outcome),
            None => Ok(()),
        }
    }

    /// Abandon the queued operation.
    pub fn discard_pending(&mut self) -> Option<Request> {
        self.pending.discard()
    }

    fn complete(&mut self, completion: Completion, outcome: PgResult<WireResponse>) -> PgResult<()> {
        match (completion, outcome) {
            (Completion::Prepared { key, handle }, Ok(response)) => {
                trace!(handle = %handle, "statement prepared");
                self.record_description(&key, response.fields, response.param_types);
                Ok(())
            }
            (Completion::Prepared { key, handle }, Err(e)) => {
                debug!(handle = %handle, error = %e, "prepare failed");
                if self.peek(&key).is_some_and(|entry| entry.handle == handle) {
                    self.remove_without_deallocation(&key);
                }
                Err(e)
            }
            (Completion::Deallocated { handles }, Ok(_)) => {
                trace!(handles = ?handles, "statements deallocated");
                Ok(())
            }
            (Completion::Deallocated { .. }, Err(e)) => Err(e),
        }
    }
}
