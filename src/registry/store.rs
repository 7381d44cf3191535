//! Lock-free identity cache.
//!
//! The snapshot and its index travel together as one immutable
//! [`Generation`].  Readers load the current generation through `ArcSwap`
//! without blocking; an install publishes a fully built replacement with a
//! single pointer store.  A reader that loaded the previous generation keeps
//! it alive until it is done, so no reader ever sees a half-built index.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::info;

use super::{build_index, IdentityRecord, KeyMode, RegistrySnapshot, SecondaryIndex};

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// One published registry state.
#[derive(Debug, Default)]
pub struct Generation {
    pub snapshot: Arc<RegistrySnapshot>,
    pub index: Arc<SecondaryIndex>,
    /// Starts at 0 ("never loaded") and increases by one per install.
    pub version: u64,
    pub loaded_at: Option<DateTime<Utc>>,
    /// File path or URL the snapshot came from.
    pub source: Option<String>,
}

impl Generation {
    pub fn is_loaded(&self) -> bool {
        self.version > 0
    }
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Shared handle to the current registry generation.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    mode: KeyMode,
    current: ArcSwap<Generation>,
    installs: AtomicU64,
}

impl CacheStore {
    pub fn new(mode: KeyMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                current: ArcSwap::from_pointee(Generation::default()),
                installs: AtomicU64::new(0),
            }),
        }
    }

    pub fn key_mode(&self) -> KeyMode {
        self.inner.mode
    }

    /// Look up a token in the current index.
    pub fn lookup(&self, token: &str) -> Option<Arc<IdentityRecord>> {
        self.inner.current.load().index.get(token).cloned()
    }

    /// Return the first candidate that resolves, with the matching token.
    pub fn lookup_any<'a, I>(&self, candidates: I) -> Option<(&'a str, Arc<IdentityRecord>)>
    where
        I: IntoIterator<Item = &'a str>,
    {
        // Resolve every candidate against the same generation.
        let generation = self.inner.current.load();
        candidates
            .into_iter()
            .find_map(|token| generation.index.get(token).map(|r| (token, Arc::clone(r))))
    }

    /// The current generation.  Holding it pins that version.
    pub fn generation(&self) -> Arc<Generation> {
        self.inner.current.load_full()
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.inner.current.load().snapshot)
    }

    /// Number of records in the current snapshot.
    pub fn len(&self) -> usize {
        self.inner.current.load().snapshot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_len(&self) -> usize {
        self.inner.current.load().index.len()
    }

    pub fn version(&self) -> u64 {
        self.inner.current.load().version
    }

    /// Publish an already built snapshot/index pair.
    pub fn install(
        &self,
        snapshot: RegistrySnapshot,
        index: SecondaryIndex,
        source: Option<String>,
    ) -> u64 {
        // Only the refresher installs, so a plain counter orders versions.
        let version = self.inner.installs.fetch_add(1, Ordering::AcqRel) + 1;
        let records = snapshot.len();
        let tokens = index.len();
        self.inner.current.store(Arc::new(Generation {
            snapshot: Arc::new(snapshot),
            index: Arc::new(index),
            version,
            loaded_at: Some(Utc::now()),
            source,
        }));
        info!(version, records, tokens, mode = %self.inner.mode, "installed registry generation");
        version
    }

    /// Build the index for `snapshot` under this store's key mode and
    /// install both.
    pub fn rebuild(&self, snapshot: RegistrySnapshot, source: Option<String>) -> u64 {
        let index = build_index(&snapshot, self.inner.mode);
        self.install(snapshot, index, source)
    }
}
