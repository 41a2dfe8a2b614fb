//! Distributed-reference-counted export table.
//!
//! OIDs are 32-bit and partitioned by parity between the two sides of a
//! channel so that neither side ever mints an OID the other could also
//! mint. Pin and reference counts use saturating arithmetic throughout:
//! a historical overflow bug in the system this is modeled on caused
//! premature release once a counter wrapped negative, so every increment
//! here saturates instead.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::class_filter::ClassFilter;
use crate::command::Oid;
use crate::error::{Error, Result, UnexportHistory};

/// Which side of a channel this table belongs to; determines OID parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Allocates even OIDs.
    Initiator,
    /// Allocates odd OIDs.
    Acceptor,
}

pub struct ExportEntry {
    pub oid: Oid,
    pub object: Arc<dyn Any + Send + Sync>,
    pub pin: AtomicU64,
    pub refcount: AtomicU64,
    pub allocation_trace: String,
}

impl ExportEntry {
    fn is_garbage(&self) -> bool {
        self.pin.load(Ordering::SeqCst) == 0 && self.refcount.load(Ordering::SeqCst) == 0
    }
}

struct UnexportRecord {
    oid: Oid,
    allocation_trace: String,
    reason: &'static str,
}

pub struct ExportTable {
    side: Side,
    next_oid: AtomicU32,
    entries: DashMap<Oid, Arc<ExportEntry>>,
    /// Objects that are already exported, keyed by their `Arc` pointer
    /// identity, so re-exporting the same object returns the existing OID
    /// instead of allocating a second one.
    identity_index: DashMap<usize, Oid>,
    unexport_log: Mutex<VecDeque<UnexportRecord>>,
    unexport_log_capacity: usize,
    class_filter: Arc<dyn ClassFilter>,
    /// Entries whose counters reached zero but have not yet been finalized
    /// by `sweep`; kept separate so in-flight commands referring to the OID
    /// can still resolve via `get` until the sweep actually removes them.
    pending_removal: Mutex<Vec<Oid>>,
}

impl ExportTable {
    pub fn new(side: Side, class_filter: Arc<dyn ClassFilter>, unexport_log_capacity: usize) -> Self {
        let first = match side {
            Side::Initiator => 0,
            Side::Acceptor => 1,
        };
        Self {
            side,
            next_oid: AtomicU32::new(first),
            entries: DashMap::new(),
            identity_index: DashMap::new(),
            unexport_log: Mutex::new(VecDeque::new()),
            unexport_log_capacity,
            class_filter,
            pending_removal: Mutex::new(Vec::new()),
        }
    }

    fn allocate_oid(&self) -> Oid {
        // step by 2 to preserve parity with this side
        self.next_oid.fetch_add(2, Ordering::SeqCst)
    }

    /// Export `object`, screening `class_name` against this table's
    /// `ClassFilter` first; a matched (blacklisted) class is rejected and
    /// never reaches the export table at all. If `pinned`, the pin count
    /// starts at 1 so the object is retained regardless of remote
    /// references until unpinned. If the object was already exported (by
    /// `Arc` pointer identity), the existing OID is returned and the
    /// appropriate counter is incremented instead of creating a duplicate
    /// entry.
    pub fn export(
        &self,
        class_name: &str,
        object: Arc<dyn Any + Send + Sync>,
        pinned: bool,
        allocation_trace: impl Into<String>,
    ) -> Result<Oid> {
        if self.class_filter.matches(class_name) {
            return Err(Error::class_filtered(class_name));
        }
        let identity = Arc::as_ptr(&object) as *const () as usize;
        if let Some(existing) = self.identity_index.get(&identity) {
            let oid = *existing;
            if let Some(entry) = self.entries.get(&oid) {
                if pinned {
                    entry.pin.fetch_add(1, Ordering::SeqCst);
                } else {
                    saturating_increment(&entry.refcount, 1);
                }
                return Ok(oid);
            }
        }
        let oid = self.allocate_oid();
        let entry = Arc::new(ExportEntry {
            oid,
            object,
            pin: AtomicU64::new(if pinned { 1 } else { 0 }),
            refcount: AtomicU64::new(if pinned { 0 } else { 1 }),
            allocation_trace: allocation_trace.into(),
        });
        self.identity_index.insert(identity, oid);
        self.entries.insert(oid, entry);
        Ok(oid)
    }

    pub fn get(&self, oid: Oid) -> Result<Arc<dyn Any + Send + Sync>> {
        match self.entries.get(&oid) {
            Some(entry) => Ok(entry.object.clone()),
            None => Err(Error::invalid_oid(oid, self.recent_unexport_history())),
        }
    }

    /// Called from an inbound `DgcRequest::AddRef`.
    pub fn add_ref(&self, oid: Oid, count: u64) {
        if let Some(entry) = self.entries.get(&oid) {
            saturating_increment(&entry.refcount, count);
        }
        // Unknown OID: does not require surfacing an error for a
        // peer-driven DGC message against an already-removed entry.
    }

    /// Called from an inbound `DgcRequest::Release`. When both counters hit
    /// zero, the entry is marked for removal; `sweep` performs the actual
    /// finalization so in-flight commands still referring to the OID can
    /// resolve in the meantime.
    pub fn release(&self, oid: Oid, count: u64) {
        if let Some(entry) = self.entries.get(&oid) {
            saturating_decrement(&entry.refcount, count);
            if entry.is_garbage() {
                self.pending_removal.lock().push(oid);
            }
        }
    }

    pub fn unpin(&self, oid: Oid) {
        if let Some(entry) = self.entries.get(&oid) {
            saturating_decrement(&entry.pin, 1);
            if entry.is_garbage() {
                self.pending_removal.lock().push(oid);
            }
        }
    }

    /// Finalize entries whose refcount and pin are both zero. Makes forward
    /// progress on every call: a panic-free failure path for one entry
    /// (e.g. the class filter rejects its cleanup callback) never blocks the
    /// rest — a `sweep` call drains everything it safely can and re-queues
    /// whatever it could not finish.
    pub fn sweep(&self) {
        let candidates: Vec<Oid> = {
            let mut pending = self.pending_removal.lock();
            std::mem::take(&mut *pending)
        };
        for oid in candidates {
            match self.entries.get(&oid) {
                Some(entry) if entry.is_garbage() => {
                    let trace = entry.allocation_trace.clone();
                    drop(entry);
                    self.entries.remove(&oid);
                    self.record_unexport(oid, trace, "sweep");
                }
                Some(_) => {
                    // counters moved again (a new addRef raced the release);
                    // leave it in place.
                }
                None => {
                    // already removed by a concurrent sweep
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn class_filter(&self) -> &dyn ClassFilter {
        self.class_filter.as_ref()
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Drop all entries, breaking any cycles between the channel and objects
    /// it exported that close over the channel. Called exactly
    /// once, during channel close.
    pub fn clear(&self) {
        self.entries.clear();
        self.identity_index.clear();
        self.pending_removal.lock().clear();
    }

    fn record_unexport(&self, oid: Oid, allocation_trace: String, reason: &'static str) {
        let mut log = self.unexport_log.lock();
        if log.len() >= self.unexport_log_capacity {
            log.pop_front();
        }
        log.push_back(UnexportRecord {
            oid,
            allocation_trace,
            reason,
        });
    }

    fn recent_unexport_history(&self) -> UnexportHistory {
        let log = self.unexport_log.lock();
        UnexportHistory(
            log.iter()
                .map(|r| format!("oid={} reason={} allocated_at={}", r.oid, r.reason, r.allocation_trace))
                .collect(),
        )
    }
}

fn saturating_increment(counter: &AtomicU64, by: u64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        Some(current.saturating_add(by))
    });
}

fn saturating_decrement(counter: &AtomicU64, by: u64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        Some(current.saturating_sub(by))
    });
}
