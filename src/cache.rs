//! Persistent DNS record cache.
//!
//! Records are kept in an embedded sled database so answers survive
//! restarts. Two trees are used:
//!
//! - `records`: domain -> JSON `{address, timestamp}`
//! - `by_address`: address octets ++ domain -> empty, for reverse lookup
//!
//! Every operation holds the cache's own lock, so the UDP loop, tunnel
//! completions and the reverse lookup server can share one handle. Storage
//! failures are logged and degrade to a miss; they are never returned.
//!
//! Callers use the cache directly from async tasks: sled serves reads from
//! its page cache and buffers writes for its background flusher, so each
//! call is a short in-memory operation that does not wait on disk.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Records older than this are removed at startup.
pub const RECORD_MAX_AGE: Duration = Duration::from_secs(10 * 24 * 60 * 60);

const RECORDS_TREE: &str = "records";
const BY_ADDRESS_TREE: &str = "by_address";

/// A resolved domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
    pub domain: String,
    pub address: Ipv4Addr,
    /// Milliseconds since the Unix epoch of the last write or hit.
    pub timestamp: u64,
}

impl CachedRecord {
    pub fn new(domain: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            domain: domain.into(),
            address,
            timestamp: now_millis(),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp) > RECORD_MAX_AGE.as_millis() as u64
    }
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    address: Ipv4Addr,
    timestamp: u64,
}

/// Durable domain -> address cache with a reverse index.
pub struct DnsCache {
    db: sled::Db,
    records: sled::Tree,
    by_address: sled::Tree,
    lock: Mutex<()>,
}

impl DnsCache {
    /// Open (or create) the cache at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::Config::default().path(path.as_ref()).open()?;
        info!("Opened DNS cache at {:?}", path.as_ref());
        Self::from_db(db)
    }

    /// Cache backed by a throwaway database, removed on drop.
    pub fn temporary() -> Result<Self> {
        Self::from_db(sled::Config::default().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let records = db.open_tree(RECORDS_TREE)?;
        let by_address = db.open_tree(BY_ADDRESS_TREE)?;

        Ok(Self {
            db,
            records,
            by_address,
            lock: Mutex::new(()),
        })
    }

    /// Look up the record for `domain`.
    pub fn get(&self, domain: &str) -> Option<CachedRecord> {
        let _guard = self.guard();
        match self.read_record(domain) {
            Ok(record) => record,
            Err(e) => {
                error!("Cache read for {} failed: {}", domain, e);
                None
            }
        }
    }

    /// Insert or overwrite the record for `domain`, stamped now.
    pub fn put(&self, domain: &str, address: Ipv4Addr) {
        self.store(&CachedRecord::new(domain, address));
    }

    /// Refresh the timestamp of an existing record, keeping its address.
    pub fn touch(&self, record: &CachedRecord) {
        self.store(&CachedRecord::new(record.domain.clone(), record.address));
    }

    /// Write `record` as given, timestamp included.
    pub fn store(&self, record: &CachedRecord) {
        let _guard = self.guard();
        if let Err(e) = self.write_record(record) {
            error!("Cache write for {} failed: {}", record.domain, e);
        }
    }

    /// Domain most recently associated with `address`.
    pub fn reverse_lookup(&self, address: Ipv4Addr) -> Option<String> {
        let _guard = self.guard();
        match self.newest_for_address(address) {
            Ok(domain) => domain,
            Err(e) => {
                error!("Reverse lookup for {} failed: {}", address, e);
                None
            }
        }
    }

    /// Delete every record older than [`RECORD_MAX_AGE`].
    ///
    /// Returns the number of records removed.
    pub fn prune_expired(&self) -> usize {
        let _guard = self.guard();
        match self.remove_expired(now_millis()) {
            Ok(removed) => removed,
            Err(e) => {
                error!("Cache pruning failed: {}", e);
                0
            }
        }
    }

    /// Number of cached records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) {
        if let Err(e) = self.db.flush() {
            error!("Cache flush failed: {}", e);
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The lock protects no data of its own, a panicked holder leaves nothing torn.
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_record(&self, domain: &str) -> Result<Option<CachedRecord>> {
        let Some(value) = self.records.get(domain.as_bytes())? else {
            return Ok(None);
        };
        let stored: StoredRecord = serde_json::from_slice(&value)?;

        Ok(Some(CachedRecord {
            domain: domain.to_string(),
            address: stored.address,
            timestamp: stored.timestamp,
        }))
    }

    fn write_record(&self, record: &CachedRecord) -> Result<()> {
        if let Some(previous) = self.read_record(&record.domain)? {
            if previous.address != record.address {
                self.by_address
                    .remove(index_key(previous.address, &previous.domain))?;
            }
        }

        let value = serde_json::to_vec(&StoredRecord {
            address: record.address,
            timestamp: record.timestamp,
        })?;
        self.records.insert(record.domain.as_bytes(), value)?;
        self.by_address
            .insert(index_key(record.address, &record.domain), Vec::new())?;

        Ok(())
    }

    fn newest_for_address(&self, address: Ipv4Addr) -> Result<Option<String>> {
        let mut newest: Option<CachedRecord> = None;

        for key in self.by_address.scan_prefix(address.octets()).keys() {
            let key = key?;
            let Ok(domain) = std::str::from_utf8(&key[4..]) else {
                continue;
            };
            let Some(record) = self.read_record(domain)? else {
                continue;
            };
            if record.address != address {
                continue;
            }
            if newest
                .as_ref()
                .is_none_or(|best| record.timestamp >= best.timestamp)
            {
                newest = Some(record);
            }
        }

        Ok(newest.map(|record| record.domain))
    }

    fn remove_expired(&self, now: u64) -> Result<usize> {
        let mut removed = 0;

        for item in self.records.iter() {
            let (key, value) = item?;
            let domain = String::from_utf8_lossy(&key).into_owned();

            match serde_json::from_slice::<StoredRecord>(&value) {
                Ok(stored) => {
                    let record = CachedRecord {
                        domain,
                        address: stored.address,
                        timestamp: stored.timestamp,
                    };
                    if !record.is_expired(now) {
                        continue;
                    }
                    debug!("Deleted expired record: {}", record.domain);
                    self.by_address
                        .remove(index_key(record.address, &record.domain))?;
                }
                Err(e) => {
                    warn!("Deleted unreadable record {}: {}", domain, e);
                }
            }

            self.records.remove(&key)?;
            removed += 1;
        }

        Ok(removed)
    }
}

fn index_key(address: Ipv4Addr, domain: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + domain.len());
    key.extend_from_slice(&address.octets());
    key.extend_from_slice(domain.as_bytes());
    key
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
