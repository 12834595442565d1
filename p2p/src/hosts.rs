//! The known-hosts pool.

use bitcoin_network_channel::{Authority, Error};
use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

struct Inner {
    order: VecDeque<Authority>,
    index: HashSet<Authority>,
}

/// A bounded pool of known peer endpoints, persisted between runs.
///
/// Entries are unique by (address, port). When the pool overflows, the least
/// recently stored entry is evicted. The pool persists as a newline-delimited
/// list of authority strings; a missing file is an empty pool.
///
/// All operations are atomic with respect to each other, so sessions may
/// store and fetch concurrently.
pub struct Hosts {
    capacity: usize,
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl Hosts {
    /// Create an empty pool bounded by `capacity`, persisted at `path`.
    pub fn new(capacity: usize, path: PathBuf) -> Self {
        Hosts {
            capacity,
            path,
            inner: Mutex::new(Inner {
                order: VecDeque::with_capacity(capacity),
                index: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Number of entries in the pool.
    pub fn count(&self) -> usize {
        self.inner.lock().expect("hosts lock").order.len()
    }

    /// Store one endpoint. Duplicates and unusable endpoints (no port or
    /// unspecified address) are ignored.
    pub fn store(&self, authority: Authority) {
        let mut inner = self.inner.lock().expect("hosts lock");
        self.store_locked(&mut inner, authority);
    }

    /// Store a batch of endpoints.
    pub fn store_many(&self, authorities: impl IntoIterator<Item = Authority>) {
        let mut inner = self.inner.lock().expect("hosts lock");
        for authority in authorities {
            self.store_locked(&mut inner, authority);
        }
    }

    fn store_locked(&self, inner: &mut Inner, authority: Authority) {
        if self.capacity == 0 {
            return;
        }
        if authority.port() == 0 || authority.ip().is_unspecified() {
            return;
        }
        if !inner.index.insert(authority) {
            return;
        }
        if inner.order.len() == self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.index.remove(&evicted);
            }
        }
        inner.order.push_back(authority);
    }

    /// Remove one endpoint, if present.
    pub fn remove(&self, authority: &Authority) {
        let mut inner = self.inner.lock().expect("hosts lock");
        if inner.index.remove(authority) {
            inner.order.retain(|entry| entry != authority);
        }
    }

    /// Whether the pool holds `authority`.
    pub fn contains(&self, authority: &Authority) -> bool {
        self.inner.lock().expect("hosts lock").index.contains(authority)
    }

    /// Fetch a pseudo-random entry.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the pool is empty.
    pub fn fetch(&self) -> Result<Authority, Error> {
        let inner = self.inner.lock().expect("hosts lock");
        if inner.order.is_empty() {
            return Err(Error::NotFound);
        }
        let index = clock_mix() as usize % inner.order.len();
        Ok(inner.order[index])
    }

    /// Up to `limit` entries, most recently stored first.
    pub fn snapshot(&self, limit: usize) -> Vec<Authority> {
        let inner = self.inner.lock().expect("hosts lock");
        inner.order.iter().rev().take(limit).copied().collect()
    }

    /// Load the pool from its file. A missing file leaves the pool empty;
    /// unparseable lines are skipped.
    pub fn load(&self) -> Result<(), Error> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no hosts file at {}", self.path.display());
                return Ok(());
            }
            Err(e) => return Err(Error::FileSystem(e.kind())),
        };

        let mut inner = self.inner.lock().expect("hosts lock");
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<Authority>() {
                Ok(authority) => self.store_locked(&mut inner, authority),
                Err(_) => warn!("skipping malformed hosts entry: {line}"),
            }
        }
        debug!(
            "loaded {} hosts from {}",
            inner.order.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Save the pool to its file, atomically (write-temp-then-rename).
    pub fn save(&self) -> Result<(), Error> {
        let entries: Vec<String> = {
            let inner = self.inner.lock().expect("hosts lock");
            inner.order.iter().map(|a| a.to_string()).collect()
        };

        let temp = self.path.with_extension(format!("tmp.{}", process::id()));
        let write = |path: &PathBuf| -> std::io::Result<()> {
            let mut file = fs::File::create(path)?;
            for entry in &entries {
                writeln!(file, "{entry}")?;
            }
            file.sync_all()
        };

        write(&temp).map_err(|e| Error::FileSystem(e.kind()))?;
        fs::rename(&temp, &self.path).map_err(|e| Error::FileSystem(e.kind()))?;
        debug!("saved {} hosts to {}", entries.len(), self.path.display());
        Ok(())
    }
}

impl std::fmt::Debug for Hosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hosts")
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .field("path", &self.path)
            .finish()
    }
}

/// A pseudo-random value from the wall clock, the process id, and a call
/// sequence. Spreads fetches over the pool without pulling in a random
/// number generator; the Fibonacci-hashed sequence keeps back-to-back calls
/// spread even on coarse clocks.
fn clock_mix() -> u64 {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before the unix epoch")
        .as_nanos() as u64;
    let sequence = SEQUENCE
        .fetch_add(1, Ordering::Relaxed)
        .wrapping_mul(0x9e37_79b9_7f4a_7c15);
    now ^ (process::id() as u64).rotate_left(32) ^ sequence
}
