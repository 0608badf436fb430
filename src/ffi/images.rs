//! Process-wide image table
//!
//! The platform loader reference-counts images per path and shares one
//! mapping between every `dlopen` of the same file. This table mirrors that
//! global state explicitly: which handles are live against which image, and
//! how many loads an image has seen since it was first mapped.
//!
//! A record exists while at least one handle references its image. Removing
//! the last handle only drops the bridge's reference; the platform decides
//! when the mapping actually goes away.
//!
//! Each record also owns the call lock for its image. Every handle to the
//! same image gets the same lock, since they all run the same code.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

static IMAGES: Lazy<Mutex<ImageTable>> = Lazy::new(|| Mutex::new(ImageTable::default()));

/// Process-unique identifier of one successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point-in-time view of one image in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Resolved path (or platform name for loads resolved by the system loader)
    pub path: PathBuf,
    /// Handles currently referencing the image, oldest first
    pub live_handles: Vec<HandleId>,
    /// Loads since the image entered the table
    pub total_loads: u64,
}

#[derive(Default)]
struct ImageTable {
    images: HashMap<PathBuf, ImageRecord>,
}

#[derive(Default)]
struct ImageRecord {
    live: Vec<HandleId>,
    loads: u64,
    call_lock: Arc<Mutex<()>>,
}

/// Record a new handle against `path`, returning its id and the image's
/// call lock.
pub(crate) fn register(path: &Path) -> (HandleId, Arc<Mutex<()>>) {
    let id = HandleId(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed));
    let mut table = IMAGES.lock();
    let record = table.images.entry(path.to_path_buf()).or_default();
    record.live.push(id);
    record.loads += 1;
    tracing::debug!(
        handle = %id,
        path = %path.display(),
        live = record.live.len(),
        "registered image handle"
    );
    (id, Arc::clone(&record.call_lock))
}

/// Drop `id`'s reference to `path`. Unknown ids are ignored.
pub(crate) fn deregister(id: HandleId, path: &Path) {
    let mut table = IMAGES.lock();
    let Some(record) = table.images.get_mut(path) else {
        return;
    };
    record.live.retain(|live| *live != id);
    let remaining = record.live.len();
    if remaining == 0 {
        table.images.remove(path);
    }
    tracing::debug!(
        handle = %id,
        path = %path.display(),
        live = remaining,
        "released image handle"
    );
}

/// All images currently referenced by at least one handle, sorted by path.
pub fn snapshot() -> Vec<ImageInfo> {
    let table = IMAGES.lock();
    let mut images: Vec<ImageInfo> = table
        .images
        .iter()
        .map(|(path, record)| ImageInfo {
            path: path.clone(),
            live_handles: record.live.clone(),
            total_loads: record.loads,
        })
        .collect();
    images.sort_by(|a, b| a.path.cmp(&b.path));
    images
}

/// Number of live handles referencing the image at `path`.
///
/// `path` is canonicalized when it exists, matching how the loader keys
/// file-backed images.
pub fn live_handles(path: impl AsRef<Path>) -> usize {
    let path = path.as_ref();
    let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    IMAGES
        .lock()
        .images
        .get(&key)
        .map_or(0, |record| record.live.len())
}

/// Whether `id` still refers to a live handle.
pub fn is_live(id: HandleId) -> bool {
    IMAGES
        .lock()
        .images
        .values()
        .any(|record| record.live.contains(&id))
}
